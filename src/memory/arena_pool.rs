use super::config::PoolConfig;
use super::free_index::{Chunk, FreeIndex};
use super::mapping::{Mapping, MappingKind};
use super::stats;
use super::tracked_arena::{Arena, ArenaChain, TrackedArena};
use super::vm::{PlatformVmOps, VmError, VmOps};
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::{Arc, Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::ffi::CString;
use std::fmt;
use std::ptr::NonNull;

crate::sync::static_atomic! {
    static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);
}

/// Everything the pool lock protects.
struct PoolState {
    mappings: Vec<Mapping>,
    pre_fork_free: FreeIndex,
    post_fork_free: FreeIndex,
    /// Live arenas keyed by start address.
    allocated: BTreeMap<usize, Arc<TrackedArena>>,
    /// Live bytes of every arena freed so far. Diagnostic only.
    bytes_allocated: usize,
    /// Set whenever an arena is freed; cleared by the collector.
    arenas_freed: bool,
    pre_fork: bool,
}

impl PoolState {
    #[inline]
    fn phase(&self) -> MappingKind {
        if self.pre_fork {
            MappingKind::PreFork
        } else {
            MappingKind::PostFork
        }
    }

    #[inline]
    fn free(&self, kind: MappingKind) -> &FreeIndex {
        match kind {
            MappingKind::PreFork => &self.pre_fork_free,
            MappingKind::PostFork => &self.post_fork_free,
        }
    }

    #[inline]
    fn free_mut(&mut self, kind: MappingKind) -> &mut FreeIndex {
        match kind {
            MappingKind::PreFork => &mut self.pre_fork_free,
            MappingKind::PostFork => &mut self.post_fork_free,
        }
    }
}

/// Arena pool whose arenas the garbage collector can visit.
///
/// Arenas are carved best-fit out of a few large anonymous mappings. Each
/// arena tracks, per page, the first object placed on it so a collector can
/// walk the roots stored in arena memory via [`visit_roots`](Self::visit_roots)
/// without parsing arenas from the start.
///
/// Free space is kept per lifecycle phase: arenas handed out before
/// [`transition_post_fork`](Self::transition_post_fork) come from pre-fork
/// mappings, arenas handed out afterwards from post-fork mappings, and the
/// two never mix.
///
/// All structural state sits behind one mutex. [`lock`](Self::lock) exposes
/// it so a collector phase can hold it across several steps.
pub struct ArenaPool {
    state: Mutex<PoolState>,
    config: PoolConfig,
    page_size: usize,
    mapping_size: usize,
    pre_fork_label: CString,
    post_fork_label: CString,
    id: usize,
}

impl ArenaPool {
    /// Create an empty pool. No memory is mapped until the first
    /// [`alloc_arena`](Self::alloc_arena).
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        let page_size = PlatformVmOps::page_size();
        let mapping_size = config.resolved_mapping_size(page_size);
        let clean_name = config.name.replace('\0', "");
        let pre_fork_label = CString::new(format!("{clean_name} (pre-fork)")).unwrap_or_default();
        let post_fork_label = CString::new(clean_name).unwrap_or_default();

        Self {
            state: Mutex::new(PoolState {
                mappings: Vec::with_capacity(1),
                pre_fork_free: FreeIndex::new(),
                post_fork_free: FreeIndex::new(),
                allocated: BTreeMap::new(),
                bytes_allocated: 0,
                arenas_freed: false,
                pre_fork: true,
            }),
            config,
            page_size,
            mapping_size,
            pre_fork_label,
            post_fork_label,
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap()
    }

    /// Hand out an arena of at least `size` bytes.
    ///
    /// The size is rounded up to whole pages and the smallest free chunk that
    /// fits is used. A chunk smaller than twice the request is handed out
    /// whole, so the arena may be larger than asked for. When nothing fits a
    /// new mapping is added. The memory is zero-filled and the arena has no
    /// recorded objects.
    ///
    /// Never fails: if the OS refuses a new mapping the failure is logged and
    /// the process aborts.
    ///
    /// # Panics
    ///
    /// Panics if the pool lock is poisoned.
    pub fn alloc_arena(&self, size: usize) -> Arc<TrackedArena> {
        let size = size.max(1).next_multiple_of(self.page_size);
        let mut state = self.lock_state();
        let kind = state.phase();

        let found = state.free_mut(kind).take_best_fit(size);
        let chunk = match found {
            Some(chunk) => chunk,
            None => {
                tracing::trace!(
                    pool = %self.config.name,
                    size,
                    largest_free = state.free(kind).largest().map_or(0, |c| c.size),
                    "no free chunk fits; growing"
                );
                self.add_mapping(&mut state, size, kind);
                let Some(chunk) = state.free_mut(kind).take_best_fit(size) else {
                    fatal(&self.config.name, size, "fresh mapping cannot hold the request");
                };
                chunk
            }
        };

        // Safety: chunk addresses come from non-null mappings.
        let memory = unsafe { NonNull::new_unchecked(chunk.addr as *mut u8) };
        let arena = Arc::new(TrackedArena::new(
            memory,
            chunk.size,
            self.page_size,
            kind.is_pre_fork(),
            self.id,
        ));
        let previous = state.allocated.insert(chunk.addr, arena.clone());
        debug_assert!(previous.is_none(), "arena {:#x} handed out twice", chunk.addr);
        drop(state);

        stats::POOL_LIVE_ARENAS.add(1);
        stats::POOL_LIVE_ARENA_BYTES.add(chunk.size);
        tracing::trace!(pool = %self.config.name, addr = chunk.addr, size = chunk.size, ?kind, "arena allocated");
        arena
    }

    /// Map a new region of at least `min_size` bytes and add it to the free
    /// space of `kind`.
    fn add_mapping(&self, state: &mut PoolState, min_size: usize, kind: MappingKind) {
        let size = min_size.max(self.mapping_size);
        let label = match kind {
            MappingKind::PreFork => &self.pre_fork_label,
            MappingKind::PostFork => &self.post_fork_label,
        };
        let mapping = match Mapping::new(size, kind, self.config.low_address_space, label) {
            Ok(mapping) => mapping,
            Err(e) => fatal_mapping(&self.config.name, size, &e),
        };

        tracing::debug!(
            pool = %self.config.name,
            addr = mapping.begin(),
            size,
            ?kind,
            mappings = state.mappings.len() + 1,
            free_chunks = state.free(kind).len(),
            "arena pool mapping added"
        );
        state.free_mut(kind).insert(mapping.begin(), mapping.size());
        state.mappings.push(mapping);
    }

    /// Return a chain of arenas to the pool.
    ///
    /// Pages are released before the pool lock is taken; the caller must
    /// already have made the chain unreachable from every allocation path.
    /// Each range is then coalesced back into the free space it came from.
    ///
    /// # Panics
    ///
    /// Panics (debug builds only) if an arena was already freed or belongs to
    /// another pool. Panics if the pool lock is poisoned.
    pub fn free_arena_chain(&self, chain: ArenaChain) {
        let mut returning = Vec::with_capacity(chain.len());
        for arena in chain {
            let ours = arena.pool_id() == self.id;
            debug_assert!(ours, "arena {:p} freed into a pool it did not come from", arena.begin());
            if !ours {
                continue;
            }
            let live_bytes = arena.bytes_allocated();
            // A no-op for an arena that was already freed.
            arena.release();
            let was_live = arena.mark_freed();
            debug_assert!(was_live, "arena {:p} freed twice", arena.begin());
            if !was_live {
                continue;
            }
            returning.push((arena, live_bytes));
        }
        if returning.is_empty() {
            return;
        }

        let mut state = self.lock_state();
        for (arena, live_bytes) in &returning {
            let addr = arena.begin() as usize;
            let removed = state.allocated.remove(&addr);
            debug_assert!(
                removed.as_ref().is_some_and(|r| Arc::ptr_eq(r, arena)),
                "arena {addr:#x} is not registered with this pool"
            );
            let kind = if arena.is_pre_fork() {
                MappingKind::PreFork
            } else {
                MappingKind::PostFork
            };
            state.free_mut(kind).insert(addr, arena.size());
            state.bytes_allocated += live_bytes;
        }
        state.arenas_freed = true;
        drop(state);

        for (arena, _) in &returning {
            stats::sub_saturating(&stats::POOL_LIVE_ARENAS, 1);
            stats::sub_saturating(&stats::POOL_LIVE_ARENA_BYTES, arena.size());
        }
        tracing::trace!(pool = %self.config.name, count = returning.len(), "arena chain freed");
    }

    /// Acquire the pool lock for a multi-step collector operation.
    ///
    /// # Panics
    ///
    /// Panics if the pool lock is poisoned.
    pub fn lock(&self) -> PoolGuard<'_> {
        PoolGuard {
            state: self.lock_state(),
            page_size: self.page_size,
        }
    }

    /// Call `visitor(page_begin, first_object)` for every page of every live
    /// arena that has a recorded object. See [`PoolGuard::visit_roots`].
    pub fn visit_roots<F>(&self, visitor: F)
    where
        F: FnMut(NonNull<u8>, NonNull<u8>),
    {
        self.lock().visit_roots(visitor);
    }

    /// Call `f` on every live arena in address order.
    pub fn for_each_allocated_arena<F>(&self, f: F)
    where
        F: FnMut(&TrackedArena),
    {
        self.lock().for_each_allocated_arena(f);
    }

    /// True if `ptr` lies in memory mapped by this pool.
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.lock().contains(ptr)
    }

    /// Stop serving arenas from pre-fork mappings. Takes effect once and for
    /// good; every later arena comes from post-fork mappings.
    ///
    /// # Panics
    ///
    /// Panics (debug builds only) if called twice.
    pub fn transition_post_fork(&self) {
        let mut state = self.lock_state();
        debug_assert!(state.pre_fork, "post-fork transition requested twice");
        if state.pre_fork {
            state.pre_fork = false;
            tracing::debug!(
                pool = %self.config.name,
                pre_fork_arenas = state.allocated.values().filter(|a| a.is_pre_fork()).count(),
                "arena pool switched to post-fork mappings"
            );
        }
    }

    #[must_use]
    pub fn is_pre_fork(&self) -> bool {
        self.lock_state().pre_fork
    }

    /// True if an arena was freed since the last
    /// [`clear_arenas_freed`](Self::clear_arenas_freed).
    #[must_use]
    pub fn are_arenas_freed(&self) -> bool {
        self.lock_state().arenas_freed
    }

    pub fn clear_arenas_freed(&self) {
        self.lock_state().arenas_freed = false;
    }

    /// Live bytes of all arenas freed so far. Diagnostic only; it is not
    /// updated while arenas are in use.
    #[must_use]
    pub fn bytes_allocated(&self) -> usize {
        self.lock_state().bytes_allocated
    }

    /// Total bytes of all mappings.
    #[must_use]
    pub fn mapped_bytes(&self) -> usize {
        self.lock_state().mappings.iter().map(Mapping::size).sum()
    }

    /// Free bytes available to the current lifecycle phase.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        let state = self.lock_state();
        state.free(state.phase()).free_bytes()
    }

    #[must_use]
    pub fn allocated_arena_count(&self) -> usize {
        self.lock_state().allocated.len()
    }

    /// Free chunks of one lifecycle phase, in address order.
    #[must_use]
    pub fn free_chunks(&self, kind: MappingKind) -> Vec<Chunk> {
        self.lock_state().free(kind).iter().collect()
    }

    /// Verify conservation and the no-adjacency invariant.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let state = self.lock_state();
        state.pre_fork_free.assert_consistent();
        state.post_fork_free.assert_consistent();

        for kind in [MappingKind::PreFork, MappingKind::PostFork] {
            let mapped: usize = state
                .mappings
                .iter()
                .filter(|m| m.kind() == kind)
                .map(Mapping::size)
                .sum();
            let live: usize = state
                .allocated
                .values()
                .filter(|a| a.is_pre_fork() == kind.is_pre_fork())
                .map(|a| a.size())
                .sum();
            assert_eq!(state.free(kind).free_bytes() + live, mapped, "{kind:?} bytes not conserved");

            for chunk in state.free(kind).iter() {
                assert!(
                    state
                        .mappings
                        .iter()
                        .any(|m| m.kind() == kind && m.contains(chunk.addr) && chunk.end() <= m.end()),
                    "chunk {chunk:?} outside every {kind:?} mapping"
                );
            }
        }

        // Live arenas never overlap each other or a free chunk.
        let mut ranges: Vec<(usize, usize)> = state
            .allocated
            .values()
            .map(|a| (a.begin() as usize, a.end() as usize))
            .chain(state.pre_fork_free.iter().map(|c| (c.addr, c.end())))
            .chain(state.post_fork_free.iter().map(|c| (c.addr, c.end())))
            .collect();
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlapping ranges {:?} {:?}", pair[0], pair[1]);
        }
    }
}

impl Default for ArenaPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl Drop for ArenaPool {
    fn drop(&mut self) {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !state.allocated.is_empty() {
            tracing::debug!(
                pool = %self.config.name,
                live = state.allocated.len(),
                "arena pool dropped with live arenas"
            );
        }
        for arena in state.allocated.values() {
            stats::sub_saturating(&stats::POOL_LIVE_ARENAS, 1);
            stats::sub_saturating(&stats::POOL_LIVE_ARENA_BYTES, arena.size());
        }
        // Mappings unmap themselves.
    }
}

impl fmt::Debug for ArenaPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaPool")
            .field("name", &self.config.name)
            .field("low_address_space", &self.config.low_address_space)
            .field("page_size", &self.page_size)
            .field("mapping_size", &self.mapping_size)
            .finish_non_exhaustive()
    }
}

/// The pool lock, held. Every method runs without re-acquiring it.
pub struct PoolGuard<'a> {
    state: MutexGuard<'a, PoolState>,
    page_size: usize,
}

impl PoolGuard<'_> {
    /// Walk every live arena in address order and, within it, every page
    /// front to back, calling `visitor(page_begin, first_object)` until the
    /// first page with no recorded object.
    ///
    /// The visitor only sees the first object of each page; it walks on
    /// through object sizes itself to find the rest.
    pub fn visit_roots<F>(&self, mut visitor: F)
    where
        F: FnMut(NonNull<u8>, NonNull<u8>),
    {
        for arena in self.state.allocated.values() {
            arena.visit_roots(&mut visitor);
        }
    }

    pub fn for_each_allocated_arena<F>(&self, mut f: F)
    where
        F: FnMut(&TrackedArena),
    {
        for arena in self.state.allocated.values() {
            f(arena);
        }
    }

    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        self.state.mappings.iter().any(|m| m.contains(addr))
    }

    /// True if `arena` is currently registered as live with this pool.
    #[must_use]
    pub fn find_allocated_arena(&self, arena: &TrackedArena) -> bool {
        self.state
            .allocated
            .get(&(arena.begin() as usize))
            .is_some_and(|live| std::ptr::eq(Arc::as_ptr(live), arena))
    }

    /// The live arena whose range holds `ptr`.
    #[must_use]
    pub fn arena_containing(&self, ptr: *const u8) -> Option<Arc<TrackedArena>> {
        let addr = ptr as usize;
        let (_, arena) = self.state.allocated.range(..=addr).next_back()?;
        arena.contains(ptr).then(|| arena.clone())
    }

    #[must_use]
    pub fn are_arenas_freed(&self) -> bool {
        self.state.arenas_freed
    }

    pub fn clear_arenas_freed(&mut self) {
        self.state.arenas_freed = false;
    }

    #[must_use]
    pub fn is_pre_fork(&self) -> bool {
        self.state.pre_fork
    }

    #[must_use]
    pub fn bytes_allocated(&self) -> usize {
        self.state.bytes_allocated
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

#[cold]
fn fatal_mapping(pool: &str, size: usize, error: &VmError) -> ! {
    tracing::error!(pool, size, error = %error, "failed to map arena pool memory");
    eprintln!("[gcarena] fatal: failed to allocate {size} bytes for {pool}: {error}");
    std::process::abort();
}

#[cold]
fn fatal(pool: &str, size: usize, reason: &str) -> ! {
    tracing::error!(pool, size, reason, "arena pool invariant broken");
    eprintln!("[gcarena] fatal: {pool}: {reason} ({size} bytes)");
    std::process::abort();
}
