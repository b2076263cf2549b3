//! Process-wide diagnostic gauges for every arena pool.
//!
//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g. live arena bytes may briefly exceed mapped bytes while
//! another thread is between two updates). This is acceptable for diagnostic
//! display. Do NOT use these values for allocation decisions; the pool's own
//! lock-protected state is authoritative.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

#[cfg(not(loom))]
impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

// Address space mapped by all arena pools.
crate::sync::static_atomic! {
    pub static POOL_MAPPED_BYTES: Counter = Counter::new();
}
// Arenas currently handed out (allocated or released, not yet freed).
crate::sync::static_atomic! {
    pub static POOL_LIVE_ARENAS: Counter = Counter::new();
}
// Bytes covered by the arenas above.
crate::sync::static_atomic! {
    pub static POOL_LIVE_ARENA_BYTES: Counter = Counter::new();
}
// Bytes handed back to the OS by arena release (cumulative).
crate::sync::static_atomic! {
    pub static POOL_RELEASED_BYTES: Counter = Counter::new();
}

/// Point-in-time copy of the global gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub mapped_bytes: usize,
    pub live_arenas: usize,
    pub live_arena_bytes: usize,
    pub released_bytes: usize,
}

/// Read every gauge.
#[must_use]
pub fn snapshot() -> PoolStats {
    PoolStats {
        mapped_bytes: POOL_MAPPED_BYTES.load(Ordering::Relaxed),
        live_arenas: POOL_LIVE_ARENAS.load(Ordering::Relaxed),
        live_arena_bytes: POOL_LIVE_ARENA_BYTES.load(Ordering::Relaxed),
        released_bytes: POOL_RELEASED_BYTES.load(Ordering::Relaxed),
    }
}

/// Best-effort subtract from a diagnostic atomic counter.
///
/// Uses a single atomic subtraction (no TOCTOU load-then-subtract race).
/// Readers clamp negative transients via `Counter::load`.
pub fn sub_saturating(counter: &Counter, val: usize) {
    counter.sub(val);
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_counter_add_sub() {
        let c = Counter::new();
        c.add(10);
        c.sub(3);
        assert_eq!(c.get(), 7);
    }

    #[test]
    fn test_counter_clamps_negative() {
        let c = Counter::new();
        c.sub(5);
        assert_eq!(c.get(), 0);
        c.add(8);
        assert_eq!(c.get(), 3);
    }

    #[test]
    fn test_counter_huge_delta_does_not_wrap() {
        let c = Counter::new();
        c.add(usize::MAX);
        assert_eq!(c.get(), isize::MAX.cast_unsigned());
    }

    #[test]
    fn test_snapshot_reads_gauges() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let before = snapshot();
        POOL_RELEASED_BYTES.add(4096);
        let after = snapshot();
        assert_eq!(after.released_bytes, before.released_bytes + 4096);
        sub_saturating(&POOL_RELEASED_BYTES, 4096);
        assert_eq!(snapshot().released_bytes, before.released_bytes);
    }
}
