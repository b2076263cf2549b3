use super::stats;
use super::vm::{PlatformVmOps, VmOps};
use crate::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::sync::Arc;
use std::fmt;
use std::ptr::NonNull;

/// The contract every arena handed to a bump-pointer allocator satisfies.
pub trait Arena {
    /// First byte of the arena.
    fn begin(&self) -> *mut u8;

    /// Size in bytes.
    fn size(&self) -> usize;

    /// Bytes the owning allocator has placed in the arena so far.
    fn bytes_allocated(&self) -> usize;

    /// One past the last byte of the arena.
    fn end(&self) -> *mut u8 {
        self.begin().wrapping_add(self.size())
    }

    /// Bytes still unused.
    fn remaining(&self) -> usize {
        self.size() - self.bytes_allocated()
    }

    fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        (self.begin() as usize..self.end() as usize).contains(&addr)
    }
}

/// Where an arena is in its one-way lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaState {
    /// Handed out; the first-object array is being filled.
    Allocated,
    /// Pages discarded and first-object array cleared, still registered.
    Released,
    /// Returned to the pool. The range may already belong to another arena.
    Freed,
}

/// An arena carved out of a pool mapping that records, for every page, the
/// first object known to overlap it.
///
/// The first-object array has one slot per page. Slot `i` holds the address
/// of the object covering the beginning of page `i` (or the first object
/// placed on the page when nothing covers its beginning), or 0. Slots are
/// written by the single client that owns the arena and read concurrently
/// by root visiting, so they are atomics.
pub struct TrackedArena {
    memory: NonNull<u8>,
    size: usize,
    page_size: usize,
    bytes_allocated: AtomicUsize,
    first_objects: Box<[AtomicUsize]>,
    pre_fork: bool,
    released: AtomicBool,
    freed: AtomicBool,
    pool_id: usize,
}

// Safety: the arena only hands out raw addresses; all bookkeeping is atomic.
unsafe impl Send for TrackedArena {}
// Safety: see above.
unsafe impl Sync for TrackedArena {}

impl TrackedArena {
    pub(crate) fn new(
        memory: NonNull<u8>,
        size: usize,
        page_size: usize,
        pre_fork: bool,
        pool_id: usize,
    ) -> Self {
        debug_assert!(page_size.is_power_of_two());
        debug_assert!(size > 0 && size.is_multiple_of(page_size), "arena size {size:#x}");
        debug_assert!(
            (memory.as_ptr() as usize).is_multiple_of(page_size),
            "arena at {memory:p} is not page aligned"
        );

        let first_objects = (0..size / page_size).map(|_| AtomicUsize::new(0)).collect();
        Self {
            memory,
            size,
            page_size,
            bytes_allocated: AtomicUsize::new(0),
            first_objects,
            pre_fork,
            released: AtomicBool::new(false),
            freed: AtomicBool::new(false),
            pool_id,
        }
    }

    #[inline]
    fn begin_addr(&self) -> usize {
        self.memory.as_ptr() as usize
    }

    #[inline]
    fn page_index(&self, addr: usize) -> usize {
        (addr - self.begin_addr()) / self.page_size
    }

    /// Number of pages (and first-object slots).
    #[inline]
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.first_objects.len()
    }

    /// True if the arena was allocated before the pool's post-fork transition.
    #[inline]
    #[must_use]
    pub fn is_pre_fork(&self) -> bool {
        self.pre_fork
    }

    #[must_use]
    pub fn state(&self) -> ArenaState {
        if self.freed.load(Ordering::Acquire) {
            ArenaState::Freed
        } else if self.released.load(Ordering::Acquire) {
            ArenaState::Released
        } else {
            ArenaState::Allocated
        }
    }

    /// Record the bump-pointer high-water mark of the owning allocator.
    ///
    /// # Panics
    ///
    /// Panics (debug builds only) if `bytes` exceeds the arena size.
    pub fn set_bytes_allocated(&self, bytes: usize) {
        debug_assert!(bytes <= self.size, "{bytes} bytes allocated in a {} byte arena", self.size);
        self.bytes_allocated.store(bytes, Ordering::Relaxed);
    }

    /// Register an object occupying `[obj_begin, obj_end)`.
    ///
    /// Every page whose beginning falls inside the object records
    /// `obj_begin`. The page the object starts on records it too when the
    /// object starts exactly on the page boundary or the page has no entry
    /// yet. Objects are placed in increasing address order, so a later object
    /// always legitimately replaces an earlier entry.
    ///
    /// # Panics
    ///
    /// Panics (debug builds only) if the object is empty or not inside this
    /// arena.
    pub fn set_first_object(&self, obj_begin: *const u8, obj_end: *const u8) {
        let obj_begin = obj_begin as usize;
        let obj_end = obj_end as usize;
        debug_assert!(
            self.begin_addr() <= obj_begin && obj_begin < obj_end && obj_end <= self.end() as usize,
            "object {obj_begin:#x}..{obj_end:#x} outside arena {:#x}..{:#x}",
            self.begin_addr(),
            self.end() as usize,
        );

        let mut idx = self.page_index(obj_begin);
        let last_idx = self.page_index(obj_end - 1);

        let start_slot = &self.first_objects[idx];
        if obj_begin.is_multiple_of(self.page_size) || start_slot.load(Ordering::Relaxed) == 0 {
            start_slot.store(obj_begin, Ordering::Release);
        }
        while idx < last_idx {
            idx += 1;
            self.first_objects[idx].store(obj_begin, Ordering::Release);
        }
    }

    /// First object recorded for the page containing `addr`.
    ///
    /// # Panics
    ///
    /// Panics (debug builds only) if `addr` is outside the arena.
    #[must_use]
    pub fn first_object(&self, addr: *const u8) -> Option<NonNull<u8>> {
        debug_assert!(self.contains(addr), "{addr:p} outside arena");
        let slot = self.first_objects[self.page_index(addr as usize)].load(Ordering::Acquire);
        NonNull::new(slot as *mut u8)
    }

    /// Address of the first page at or past the allocation high-water mark
    /// with no recorded object, or `end()` if every such page has one.
    #[must_use]
    pub fn last_used_byte(&self) -> *mut u8 {
        let begin = self.begin_addr();
        let end = self.end() as usize;
        // Skip straight past the bytes the allocator reports as used.
        let mut last = (begin + self.bytes_allocated()).next_multiple_of(self.page_size).min(end);
        let mut idx = self.page_index(last);
        while last < end && self.first_objects[idx].load(Ordering::Acquire) != 0 {
            last += self.page_size;
            idx += 1;
        }
        last as *mut u8
    }

    /// Call `visitor(page_begin, first_object)` for each page front to back,
    /// stopping at the first page with no recorded object.
    pub fn visit_roots<F>(&self, visitor: &mut F)
    where
        F: FnMut(NonNull<u8>, NonNull<u8>),
    {
        for (i, slot) in self.first_objects.iter().enumerate() {
            let Some(first) = NonNull::new(slot.load(Ordering::Acquire) as *mut u8) else {
                break;
            };
            // Safety: i < page_count, so the page lies inside the arena.
            let page = unsafe { NonNull::new_unchecked(self.memory.as_ptr().add(i * self.page_size)) };
            visitor(page, first);
        }
    }

    /// Hand the arena's pages back to the OS and forget every recorded
    /// object. The memory reads as zero afterwards, whatever the client wrote
    /// through [`begin`](Arena::begin). Only the first call does anything.
    ///
    /// A freed arena's range may already belong to another arena, so
    /// releasing it is a no-op.
    ///
    /// # Panics
    ///
    /// Panics (debug builds only) if the arena was already freed.
    pub(crate) fn release(&self) {
        let freed = self.freed.load(Ordering::Acquire);
        debug_assert!(!freed, "arena {:p} released after it was freed", self.memory);
        if freed || self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        // Safety: the range is this arena's own until it is freed, and the
        // pool keeps its mapping alive until then.
        if let Err(e) = unsafe { PlatformVmOps::discard(self.memory, self.size) } {
            tracing::warn!(error = %e, arena = ?self.memory, "page discard failed, zeroing in place");
            // Safety: as above.
            unsafe { std::ptr::write_bytes(self.memory.as_ptr(), 0, self.size) };
        }
        for slot in &*self.first_objects {
            slot.store(0, Ordering::Relaxed);
        }
        self.bytes_allocated.store(0, Ordering::Release);
        stats::POOL_RELEASED_BYTES.add(self.size);
    }

    #[inline]
    pub(crate) fn pool_id(&self) -> usize {
        self.pool_id
    }

    /// Flag the arena as returned to its pool. Returns false if it already was.
    pub(crate) fn mark_freed(&self) -> bool {
        !self.freed.swap(true, Ordering::AcqRel)
    }
}

impl Arena for TrackedArena {
    #[inline]
    fn begin(&self) -> *mut u8 {
        self.memory.as_ptr()
    }

    #[inline]
    fn size(&self) -> usize {
        self.size
    }

    #[inline]
    fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for TrackedArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedArena")
            .field("begin", &self.memory)
            .field("size", &self.size)
            .field("bytes_allocated", &self.bytes_allocated())
            .field("pre_fork", &self.pre_fork)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// A group of arenas owned by one allocator and freed together, head first.
#[derive(Debug, Default)]
pub struct ArenaChain {
    arenas: Vec<Arc<TrackedArena>>,
}

impl ArenaChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, arena: Arc<TrackedArena>) {
        self.arenas.push(arena);
    }

    #[must_use]
    pub fn head(&self) -> Option<&Arc<TrackedArena>> {
        self.arenas.first()
    }

    /// The most recently added arena.
    #[must_use]
    pub fn last(&self) -> Option<&Arc<TrackedArena>> {
        self.arenas.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TrackedArena>> {
        self.arenas.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.arenas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.arenas.is_empty()
    }

    /// Total bytes the owning allocator placed across the chain.
    #[must_use]
    pub fn bytes_allocated(&self) -> usize {
        self.arenas.iter().map(|a| a.bytes_allocated()).sum()
    }
}

impl From<Arc<TrackedArena>> for ArenaChain {
    fn from(arena: Arc<TrackedArena>) -> Self {
        Self { arenas: vec![arena] }
    }
}

impl FromIterator<Arc<TrackedArena>> for ArenaChain {
    fn from_iter<I: IntoIterator<Item = Arc<TrackedArena>>>(iter: I) -> Self {
        Self {
            arenas: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for ArenaChain {
    type Item = Arc<TrackedArena>;
    type IntoIter = std::vec::IntoIter<Arc<TrackedArena>>;

    fn into_iter(self) -> Self::IntoIter {
        self.arenas.into_iter()
    }
}
