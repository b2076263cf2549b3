pub(crate) mod arena_pool;
pub(crate) mod config;
pub(crate) mod free_index;
pub(crate) mod integration;
pub(crate) mod linear_alloc;
pub(crate) mod mapping;
pub(crate) mod stats;
pub(crate) mod tracked_arena;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
