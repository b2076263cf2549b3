//! Arena pool whose arenas a garbage collector can visit.
//!
//! [`ArenaPool`] hands out page-granular arenas from a few large anonymous
//! mappings and records, per page, the first object placed on it. A
//! collector walks those roots with [`ArenaPool::visit_roots`] or, holding
//! the pool lock across steps, through [`PoolGuard`]. [`LinearAlloc`] is the
//! bump allocator that fills arenas and keeps the records current.

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
compile_error!("gcarena supports only Linux and macOS.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// pool
pub use memory::arena_pool::{ArenaPool, PoolGuard};
pub use memory::config::{DEFAULT_POOL_NAME, LOW_ADDRESS_MAPPING_SIZE, MAPPING_SIZE, PoolConfig};
pub use memory::free_index::Chunk;
pub use memory::mapping::MappingKind;
pub use memory::tracked_arena::{Arena, ArenaChain, ArenaState, TrackedArena};

// clients
pub use memory::linear_alloc::{ALIGNMENT, DEFAULT_ARENA_PAGES, LinearAlloc};

// stats
pub use memory::stats::{PoolStats, snapshot as stats_snapshot};

// errors
pub use memory::vm::VmError;
