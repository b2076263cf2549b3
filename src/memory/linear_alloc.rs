use super::arena_pool::ArenaPool;
use super::tracked_arena::{Arena, ArenaChain, TrackedArena};
use crate::sync::{Arc, Mutex};
use std::ptr::NonNull;

/// Minimum alignment of every allocation, and the granule sizes round to.
pub const ALIGNMENT: usize = 8;

/// Pages per arena when a request does not need more.
pub const DEFAULT_ARENA_PAGES: usize = 4;

struct Bump {
    chain: ArenaChain,
    cursor: usize,
    end: usize,
    used_bytes: usize,
}

impl Bump {
    fn current(&self) -> Option<&Arc<TrackedArena>> {
        self.chain.last()
    }
}

/// Bump allocator for long-lived runtime data whose objects the collector
/// must visit.
///
/// Memory comes from pool arenas. Every allocation is recorded as the first
/// object of the pages it starts on or spans, so
/// [`ArenaPool::visit_roots`] can find it. Nothing is freed individually;
/// dropping the allocator hands every arena back to the pool.
pub struct LinearAlloc<'p> {
    pool: &'p ArenaPool,
    bump: Mutex<Bump>,
}

impl<'p> LinearAlloc<'p> {
    #[must_use]
    pub fn new(pool: &'p ArenaPool) -> Self {
        Self {
            pool,
            bump: Mutex::new(Bump {
                chain: ArenaChain::new(),
                cursor: 0,
                end: 0,
                used_bytes: 0,
            }),
        }
    }

    #[must_use]
    pub fn pool(&self) -> &'p ArenaPool {
        self.pool
    }

    /// Allocate `size` zeroed bytes aligned to `align` (at least
    /// [`ALIGNMENT`]).
    ///
    /// Never fails; a new arena is taken from the pool when the current one
    /// is full.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two or exceeds the page size
    /// (debug builds only), or if the allocator lock is poisoned.
    pub fn alloc(&self, size: usize, align: usize) -> NonNull<u8> {
        debug_assert!(align.is_power_of_two(), "alignment {align} is not a power of two");
        debug_assert!(align <= self.pool.page_size(), "alignment {align} exceeds a page");
        let align = align.max(ALIGNMENT);
        let size = size.max(1).next_multiple_of(ALIGNMENT);

        let mut bump = self.bump.lock().unwrap();
        let mut start = bump.cursor.next_multiple_of(align);
        if bump.current().is_none() || start + size > bump.end {
            let arena_size = size.max(DEFAULT_ARENA_PAGES * self.pool.page_size());
            let arena = self.pool.alloc_arena(arena_size);
            bump.cursor = arena.begin() as usize;
            bump.end = arena.end() as usize;
            bump.chain.push(arena);
            start = bump.cursor;
        }

        let new_cursor = start + size;
        bump.cursor = new_cursor;
        bump.used_bytes += size;
        if let Some(arena) = bump.current() {
            arena.set_first_object(start as *const u8, new_cursor as *const u8);
            arena.set_bytes_allocated(new_cursor - arena.begin() as usize);
        }
        // Safety: start lies inside a live arena, which is never at address 0.
        unsafe { NonNull::new_unchecked(start as *mut u8) }
    }

    /// Grow an allocation to `new_size` bytes.
    ///
    /// The block is extended in place when it is the most recent allocation
    /// and the arena has room. Otherwise a new block is allocated and the old
    /// contents copied; the old block is not freed. Shrinking returns `ptr`
    /// unchanged.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this allocator with size `old_size`, and
    /// must be aligned to `align`.
    pub unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> NonNull<u8> {
        debug_assert!(self.contains(ptr.as_ptr()), "realloc of foreign pointer {ptr:p}");
        let old_rounded = old_size.max(1).next_multiple_of(ALIGNMENT);
        let new_rounded = new_size.max(1).next_multiple_of(ALIGNMENT);
        if new_rounded <= old_rounded {
            return ptr;
        }

        {
            let mut bump = self.bump.lock().unwrap();
            let begin = ptr.as_ptr() as usize;
            if begin + old_rounded == bump.cursor && begin + new_rounded <= bump.end {
                bump.cursor = begin + new_rounded;
                bump.used_bytes += new_rounded - old_rounded;
                if let Some(arena) = bump.current() {
                    arena.set_first_object(ptr.as_ptr(), (begin + new_rounded) as *const u8);
                    arena.set_bytes_allocated(begin + new_rounded - arena.begin() as usize);
                }
                return ptr;
            }
        }

        let new_ptr = self.alloc(new_size, align);
        // Safety: the caller guarantees ptr is valid for old_size bytes; the
        // new block is fresh and at least that large.
        unsafe { std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size) };
        new_ptr
    }

    /// Allocate a value in the arena.
    ///
    /// `T` must be `Copy`: arena memory is released without running
    /// destructors.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_val<T: Copy>(&self, val: T) -> &mut T {
        let layout = std::alloc::Layout::new::<T>();
        let ptr = self.alloc(layout.size(), layout.align()).cast::<T>();
        // Safety: ptr is fresh, aligned and large enough for T.
        unsafe {
            ptr.as_ptr().write(val);
            &mut *ptr.as_ptr()
        }
    }

    /// Copy a slice into the arena.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_slice_copy<T: Copy>(&self, src: &[T]) -> &mut [T] {
        let layout = std::alloc::Layout::for_value(src);
        let ptr = self.alloc(layout.size(), layout.align()).cast::<T>();
        // Safety: ptr is fresh, aligned and sized for src.len() elements.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), ptr.as_ptr(), src.len());
            std::slice::from_raw_parts_mut(ptr.as_ptr(), src.len())
        }
    }

    /// Bytes handed out so far, excluding alignment padding.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.bump.lock().unwrap().used_bytes
    }

    #[must_use]
    pub fn arena_count(&self) -> usize {
        self.bump.lock().unwrap().chain.len()
    }

    /// True if `ptr` lies in one of this allocator's arenas.
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.bump.lock().unwrap().chain.iter().any(|a| a.contains(ptr))
    }
}

impl Drop for LinearAlloc<'_> {
    fn drop(&mut self) {
        let mut bump = match self.bump.lock() {
            Ok(bump) => bump,
            Err(poisoned) => poisoned.into_inner(),
        };
        let chain = std::mem::take(&mut bump.chain);
        if !chain.is_empty() {
            tracing::trace!(arenas = chain.len(), used = bump.used_bytes, "linear alloc returning arenas");
            self.pool.free_arena_chain(chain);
        }
    }
}

impl std::fmt::Debug for LinearAlloc<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinearAlloc")
            .field("pool", &self.pool.config().name)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::config::PoolConfig;
    use crate::memory::vm::{PlatformVmOps, VmOps};

    fn pool() -> ArenaPool {
        ArenaPool::new(
            PoolConfig::default()
                .with_name("gcarena-linear-test")
                .with_mapping_size(64 * PlatformVmOps::page_size()),
        )
    }

    #[test]
    fn test_alloc_aligned_zeroed_and_distinct() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = pool();
        let la = LinearAlloc::new(&pool);

        let a = la.alloc(3, 1);
        let b = la.alloc(24, 16);
        assert!((a.as_ptr() as usize).is_multiple_of(ALIGNMENT));
        assert!((b.as_ptr() as usize).is_multiple_of(16));
        assert!(b.as_ptr() as usize >= a.as_ptr() as usize + ALIGNMENT);
        // Safety: Test code; b is a live 24-byte block.
        let bytes = unsafe { std::slice::from_raw_parts(b.as_ptr(), 24) };
        assert!(bytes.iter().all(|&x| x == 0));
        assert!(pool.contains(a.as_ptr()));
        assert!(la.contains(b.as_ptr()));
        assert_eq!(la.used_bytes(), 8 + 24);
        assert_eq!(la.arena_count(), 1);
    }

    #[test]
    fn test_allocations_are_visited() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = pool();
        let page = pool.page_size();
        let la = LinearAlloc::new(&pool);

        let first = la.alloc(64, ALIGNMENT);
        // Spans from page 0 across all of page 1 into page 2.
        let big = la.alloc(2 * page, ALIGNMENT);

        let mut seen = Vec::new();
        pool.visit_roots(|page_begin, obj| seen.push((page_begin.as_ptr() as usize, obj)));
        let base = first.as_ptr() as usize;
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], (base, first));
        assert_eq!(seen[1], (base + page, big));
        assert_eq!(seen[2], (base + 2 * page, big));
    }

    #[test]
    fn test_grows_into_new_arena() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = pool();
        let page = pool.page_size();
        let la = LinearAlloc::new(&pool);

        let small = la.alloc(16, ALIGNMENT);
        let huge = la.alloc(DEFAULT_ARENA_PAGES * page + 8, ALIGNMENT);
        assert_eq!(la.arena_count(), 2);
        assert!(la.contains(small.as_ptr()));
        assert!(la.contains(huge.as_ptr()));
        assert!((huge.as_ptr() as usize).is_multiple_of(page));

        let mut sizes = Vec::new();
        pool.for_each_allocated_arena(|a| sizes.push(a.size()));
        sizes.sort_unstable();
        assert_eq!(sizes[0], DEFAULT_ARENA_PAGES * page);
        assert!(sizes[1] >= DEFAULT_ARENA_PAGES * page + page);
    }

    #[test]
    fn test_realloc_in_place_then_copy() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = pool();
        let la = LinearAlloc::new(&pool);

        let p = la.alloc(16, ALIGNMENT);
        // Safety: Test code; p is a live 16-byte block.
        unsafe { p.as_ptr().write_bytes(0x5A, 16) };
        // Safety: p came from la with size 16.
        let grown = unsafe { la.realloc(p, 16, 48, ALIGNMENT) };
        assert_eq!(grown, p);
        assert_eq!(la.used_bytes(), 48);

        let _blocker = la.alloc(8, ALIGNMENT);
        // Safety: grown came from la with size 48.
        let moved = unsafe { la.realloc(grown, 48, 96, ALIGNMENT) };
        assert_ne!(moved, grown);
        // Safety: Test code; moved is a live 96-byte block.
        let bytes = unsafe { std::slice::from_raw_parts(moved.as_ptr(), 96) };
        assert!(bytes[..16].iter().all(|&x| x == 0x5A));
        assert!(bytes[48..].iter().all(|&x| x == 0));

        // Safety: moved came from la with size 96.
        let same = unsafe { la.realloc(moved, 96, 10, ALIGNMENT) };
        assert_eq!(same, moved);
    }

    #[test]
    fn test_typed_helpers() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = pool();
        let la = LinearAlloc::new(&pool);

        let v = la.alloc_val(0xDEAD_BEEF_u64);
        *v += 1;
        assert_eq!(*v, 0xDEAD_BEF0);

        let s = la.alloc_slice_copy(&[1u32, 2, 3]);
        s[1] = 20;
        assert_eq!(s, &[1, 20, 3]);
    }

    #[test]
    fn test_drop_returns_arenas() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = pool();
        {
            let la = LinearAlloc::new(&pool);
            la.alloc(40, ALIGNMENT);
            la.alloc(pool.page_size() * 8, ALIGNMENT);
            assert_eq!(pool.allocated_arena_count(), 2);
        }
        assert_eq!(pool.allocated_arena_count(), 0);
        assert!(pool.are_arenas_freed());
        assert_eq!(pool.bytes_allocated(), 40 + pool.page_size() * 8);
        pool.assert_consistent();
    }

    #[test]
    fn test_drop_without_allocations_frees_nothing() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = pool();
        drop(LinearAlloc::new(&pool));
        assert!(!pool.are_arenas_freed());
        assert_eq!(pool.mapped_bytes(), 0);
    }

    #[test]
    fn test_shared_across_threads() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = pool();
        let la = LinearAlloc::new(&pool);

        let blocks: Vec<Vec<usize>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4u8)
                .map(|t| {
                    let la = &la;
                    s.spawn(move || {
                        (0..200)
                            .map(|i| {
                                let p = la.alloc(8 + (i % 5) * 8, ALIGNMENT);
                                // Safety: Test code; p is a fresh block of at least 8 bytes.
                                unsafe { p.as_ptr().write_bytes(t, 8) };
                                p.as_ptr() as usize
                            })
                            .collect()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut all: Vec<usize> = blocks.into_iter().flatten().collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);
        pool.assert_consistent();
    }
}
