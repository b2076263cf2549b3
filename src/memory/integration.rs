#[cfg(all(test, not(loom)))]
mod tests {
    use crate::memory::arena_pool::ArenaPool;
    use crate::memory::config::PoolConfig;
    use crate::memory::linear_alloc::{ALIGNMENT, LinearAlloc};
    use crate::memory::stats;
    use crate::memory::tracked_arena::Arena;
    use crate::memory::vm::{PlatformVmOps, VmOps};
    use crate::sync::Arc;
    use crate::sync::thread;
    use std::collections::BTreeSet;

    fn small_pool(name: &str, pages: usize) -> ArenaPool {
        ArenaPool::new(
            PoolConfig::default()
                .with_name(name)
                .with_mapping_size(pages * PlatformVmOps::page_size()),
        )
    }

    /// Allocate an object whose first word holds its own size.
    fn alloc_object(la: &LinearAlloc<'_>, size: usize) -> usize {
        debug_assert!(size >= 8 && size.is_multiple_of(ALIGNMENT));
        let p = la.alloc(size, ALIGNMENT);
        // Safety: Test code; p is a fresh block of `size` bytes.
        unsafe { p.as_ptr().cast::<u64>().write(size as u64) };
        p.as_ptr() as usize
    }

    /// Find every object through page roots alone, walking object headers
    /// from each page's first object to the end of that page.
    fn walk_objects(pool: &ArenaPool) -> BTreeSet<usize> {
        let page = pool.page_size();
        let mut seen = BTreeSet::new();
        let guard = pool.lock();
        guard.visit_roots(|page_begin, first| {
            let page_begin = page_begin.as_ptr() as usize;
            let page_end = page_begin + page;
            let mut obj = first.as_ptr() as usize;
            while obj < page_end {
                // Safety: Test code; obj is an object start inside a live arena.
                let size = unsafe { (obj as *const u64).read() } as usize;
                if size == 0 {
                    break;
                }
                if obj >= page_begin {
                    seen.insert(obj);
                }
                obj += size;
            }
        });
        seen
    }

    #[test]
    fn test_integration_roots_find_every_object() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = small_pool("gcarena-walk", 256);
        let page = pool.page_size();
        let la = LinearAlloc::new(&pool);

        let mut expected = BTreeSet::new();
        for i in 0..300usize {
            // Mostly small objects, with some spanning several pages.
            let size = if i % 37 == 0 { 3 * page - 8 } else { 16 + (i % 11) * 8 };
            expected.insert(alloc_object(&la, size));
        }
        assert!(la.arena_count() > 1);

        assert_eq!(walk_objects(&pool), expected);
        pool.assert_consistent();
    }

    #[test]
    fn test_integration_collector_cycle() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = small_pool("gcarena-cycle", 64);

        let boot = LinearAlloc::new(&pool);
        let mut boot_objects = BTreeSet::new();
        for _ in 0..20 {
            boot_objects.insert(alloc_object(&boot, 48));
        }

        // A loader that goes away before the next collection.
        {
            let transient = LinearAlloc::new(&pool);
            for _ in 0..20 {
                alloc_object(&transient, 64);
            }
            assert_eq!(walk_objects(&pool).len(), 40);
        }
        assert!(pool.are_arenas_freed());
        assert_eq!(pool.bytes_allocated(), 20 * 64);

        // Collector pass: pick up the freed state, then reset the flag.
        {
            let mut guard = pool.lock();
            assert!(guard.are_arenas_freed());
            guard.clear_arenas_freed();
        }
        assert_eq!(walk_objects(&pool), boot_objects);

        pool.transition_post_fork();
        let app = LinearAlloc::new(&pool);
        let app_object = alloc_object(&app, 32);
        {
            let guard = pool.lock();
            let arena = guard.arena_containing(app_object as *const u8).unwrap();
            assert!(!arena.is_pre_fork());
            let boot_first = *boot_objects.first().unwrap();
            let arena = guard.arena_containing(boot_first as *const u8).unwrap();
            assert!(arena.is_pre_fork());
        }

        let all = walk_objects(&pool);
        assert!(all.is_superset(&boot_objects));
        assert!(all.contains(&app_object));
        assert!(!pool.are_arenas_freed());

        drop(app);
        drop(boot);
        assert_eq!(pool.allocated_arena_count(), 0);
        pool.assert_consistent();
    }

    #[test]
    fn test_integration_thread_contention() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = Arc::new(small_pool("gcarena-contention", 32));
        let num_threads = 6u8;
        let iters = 150usize;
        let barrier = Arc::new(crate::sync::barrier::Barrier::new(num_threads as usize + 1));

        let workers: Vec<_> = (0..num_threads)
            .map(|t| {
                let pool = pool.clone();
                let b = barrier.clone();
                thread::spawn(move || {
                    let la = LinearAlloc::new(&pool);
                    b.wait();

                    let mut blocks = Vec::with_capacity(iters);
                    for i in 0..iters {
                        let size = 8 << (i % 6);
                        let p = la.alloc(size, ALIGNMENT);
                        // Safety: Test code; p is a fresh block of `size` bytes.
                        unsafe { p.as_ptr().write_bytes(t, size) };
                        blocks.push((p, size));
                    }

                    for (p, size) in &blocks {
                        // Safety: Test code; the block is still owned by la.
                        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), *size) };
                        assert!(
                            bytes.iter().all(|&x| x == t),
                            "contention corrupted a block in thread {t}"
                        );
                        assert!(la.contains(p.as_ptr()));
                    }
                })
            })
            .collect();

        let collector = {
            let pool = pool.clone();
            let b = barrier.clone();
            thread::spawn(move || {
                b.wait();
                for _ in 0..40 {
                    let guard = pool.lock();
                    guard.visit_roots(|page_begin, first| {
                        assert!(guard.contains(page_begin.as_ptr()));
                        assert!(guard.contains(first.as_ptr()));
                    });
                    guard.for_each_allocated_arena(|arena| {
                        assert!(arena.bytes_allocated() <= arena.size());
                    });
                    drop(guard);
                    thread::yield_now();
                }
            })
        };

        for w in workers {
            w.join().unwrap();
        }
        collector.join().unwrap();

        assert_eq!(pool.allocated_arena_count(), 0);
        assert!(pool.are_arenas_freed());
        pool.assert_consistent();
    }

    #[test]
    fn test_integration_leak_check() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let baseline = stats::snapshot();

        {
            let pool = small_pool("gcarena-leak", 16);
            let la = LinearAlloc::new(&pool);
            for i in 0..100usize {
                la.alloc(8 + i * 8, ALIGNMENT);
            }
            let during = stats::snapshot();
            assert!(during.mapped_bytes > baseline.mapped_bytes);
            assert!(during.live_arenas > baseline.live_arenas);
            drop(la);

            let after_free = stats::snapshot();
            assert_eq!(after_free.live_arenas, baseline.live_arenas);
            assert_eq!(after_free.live_arena_bytes, baseline.live_arena_bytes);
            assert!(after_free.released_bytes > baseline.released_bytes);
        }

        let end = stats::snapshot();
        assert_eq!(end.mapped_bytes, baseline.mapped_bytes);
        assert_eq!(end.live_arenas, baseline.live_arenas);
    }
}
