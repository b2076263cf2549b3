/// Default mapping size. Multiples of 1GB let the kernel move page tables
/// wholesale when a mapping is remapped.
#[cfg(target_pointer_width = "64")]
pub const MAPPING_SIZE: usize = 1024 * 1024 * 1024;
#[cfg(not(target_pointer_width = "64"))]
pub const MAPPING_SIZE: usize = 32 * 1024 * 1024;

/// Default mapping size when the pool is confined to the low address range.
pub const LOW_ADDRESS_MAPPING_SIZE: usize = 32 * 1024 * 1024;

/// Label used for pool mappings when none is configured.
pub const DEFAULT_POOL_NAME: &str = "linear-alloc";

/// Construction-time settings of an [`ArenaPool`](super::arena_pool::ArenaPool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Diagnostic name. Only used to label mappings at the OS level and in
    /// log output. Default: `"linear-alloc"`.
    pub name: String,

    /// Place every mapping below 4GB, for processes that produce data a
    /// narrower-addressed companion process must consume. Default: false.
    pub low_address_space: bool,

    /// Minimum size of each mapping in bytes, rounded up to the page size.
    /// Default: 0 = auto ([`MAPPING_SIZE`], or [`LOW_ADDRESS_MAPPING_SIZE`]
    /// with `low_address_space`).
    pub mapping_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_POOL_NAME.to_string(),
            low_address_space: false,
            mapping_size: 0,
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_low_address_space(mut self, low_address_space: bool) -> Self {
        self.low_address_space = low_address_space;
        self
    }

    #[must_use]
    pub fn with_mapping_size(mut self, mapping_size: usize) -> Self {
        self.mapping_size = mapping_size;
        self
    }

    /// Minimum bytes per mapping after resolving the auto setting.
    pub(crate) fn resolved_mapping_size(&self, page_size: usize) -> usize {
        let size = match self.mapping_size {
            0 if self.low_address_space => LOW_ADDRESS_MAPPING_SIZE,
            0 => MAPPING_SIZE,
            n => n,
        };
        size.next_multiple_of(page_size)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_default_mapping_size() {
        let cfg = PoolConfig::default();
        assert_eq!(cfg.resolved_mapping_size(4096), MAPPING_SIZE);
        assert_eq!(cfg.name, DEFAULT_POOL_NAME);
    }

    #[test]
    fn test_low_address_mapping_size() {
        let cfg = PoolConfig::default().with_low_address_space(true);
        assert_eq!(cfg.resolved_mapping_size(4096), LOW_ADDRESS_MAPPING_SIZE);
    }

    #[test]
    fn test_explicit_mapping_size_is_page_rounded() {
        let cfg = PoolConfig::default()
            .with_low_address_space(true)
            .with_mapping_size(10_000);
        assert_eq!(cfg.resolved_mapping_size(4096), 12_288);
    }

    #[test]
    fn test_with_name() {
        let cfg = PoolConfig::default().with_name("jit-code");
        assert_eq!(cfg.name, "jit-code");
    }
}
