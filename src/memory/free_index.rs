use std::collections::{BTreeMap, BTreeSet};

/// A free byte range `[addr, addr + size)` owned by an arena pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chunk {
    pub addr: usize,
    pub size: usize,
}

impl Chunk {
    #[inline]
    #[must_use]
    pub fn end(&self) -> usize {
        self.addr + self.size
    }
}

/// Free-space index: the same chunk set ordered two ways.
///
/// `by_addr` answers neighbour queries for coalescing; `by_size` answers
/// best-fit queries, with the address breaking ties so that equal-sized
/// chunks are handed out lowest address first.
///
/// Invariant: no two chunks are address-adjacent. Every insertion coalesces.
#[derive(Debug, Default)]
pub(crate) struct FreeIndex {
    by_addr: BTreeMap<usize, usize>,
    by_size: BTreeSet<(usize, usize)>,
    free_bytes: usize,
}

impl FreeIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Return `[addr, addr + size)` to the index, merging with the chunk
    /// ending at `addr` and the chunk starting at `addr + size` if present.
    ///
    /// # Panics
    ///
    /// Panics (debug builds only) if the range is empty or overlaps a chunk
    /// already in the index, which means it was freed twice.
    pub(crate) fn insert(&mut self, addr: usize, size: usize) {
        debug_assert!(size > 0, "inserting empty range at {addr:#x}");

        let mut begin = addr;
        let mut merged = size;

        if let Some((&prev_addr, &prev_size)) = self.by_addr.range(..addr).next_back() {
            debug_assert!(
                prev_addr + prev_size <= addr,
                "range {addr:#x}+{size:#x} overlaps free chunk {prev_addr:#x}+{prev_size:#x}"
            );
            if prev_addr + prev_size == addr {
                self.unlink(prev_addr, prev_size);
                begin = prev_addr;
                merged += prev_size;
            }
        }

        if let Some((&next_addr, &next_size)) = self.by_addr.range(addr..).next() {
            debug_assert!(
                addr + size <= next_addr,
                "range {addr:#x}+{size:#x} overlaps free chunk {next_addr:#x}+{next_size:#x}"
            );
            if addr + size == next_addr {
                self.unlink(next_addr, next_size);
                merged += next_size;
            }
        }

        self.link(begin, merged);
        self.free_bytes += size;
    }

    /// Remove the best-fitting chunk for `size` bytes and return the range
    /// handed out.
    ///
    /// The smallest chunk with capacity `>= size` is chosen. A chunk smaller
    /// than twice the request is consumed whole, so the returned range may be
    /// larger than `size`. Otherwise the low `size` bytes are split off and
    /// the remainder stays in the index.
    pub(crate) fn take_best_fit(&mut self, size: usize) -> Option<Chunk> {
        debug_assert!(size > 0);
        let &(capacity, addr) = self.by_size.range((size, 0)..).next()?;

        if capacity < size.saturating_mul(2) {
            self.unlink(addr, capacity);
            self.free_bytes -= capacity;
            return Some(Chunk { addr, size: capacity });
        }

        self.unlink(addr, capacity);
        self.link(addr + size, capacity - size);
        self.free_bytes -= size;
        Some(Chunk { addr, size })
    }

    #[inline]
    pub(crate) fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.by_addr.len()
    }

    /// Chunks in address order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = Chunk> + '_ {
        self.by_addr.iter().map(|(&addr, &size)| Chunk { addr, size })
    }

    pub(crate) fn largest(&self) -> Option<Chunk> {
        self.by_size
            .iter()
            .next_back()
            .map(|&(size, addr)| Chunk { addr, size })
    }

    fn link(&mut self, addr: usize, size: usize) {
        self.by_addr.insert(addr, size);
        self.by_size.insert((size, addr));
    }

    fn unlink(&mut self, addr: usize, size: usize) {
        let by_addr = self.by_addr.remove(&addr);
        let by_size = self.by_size.remove(&(size, addr));
        debug_assert_eq!(by_addr, Some(size), "chunk {addr:#x} missing from address index");
        debug_assert!(by_size, "chunk {addr:#x}+{size:#x} missing from size index");
    }

    /// Check both orderings describe the same set, nothing is adjacent, and
    /// the byte total matches.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        assert_eq!(self.by_addr.len(), self.by_size.len());
        for (&addr, &size) in &self.by_addr {
            assert!(self.by_size.contains(&(size, addr)));
        }
        let chunks: Vec<Chunk> = self.iter().collect();
        for pair in chunks.windows(2) {
            assert!(
                pair[0].end() < pair[1].addr,
                "adjacent or overlapping chunks {:?} {:?}",
                pair[0],
                pair[1]
            );
        }
        assert_eq!(chunks.iter().map(|c| c.size).sum::<usize>(), self.free_bytes);
    }
}
