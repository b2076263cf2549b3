use super::stats;
use super::vm::{PlatformVmOps, VmError, VmOps};
use std::ffi::CStr;
use std::ptr::NonNull;

/// Lifecycle phase a mapping was created in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingKind {
    /// Private memory created before the post-fork transition. Never subject
    /// to the collector's page-sharing protocol.
    PreFork,
    /// Memory created after the transition; follows the page-shareable path.
    PostFork,
}

impl MappingKind {
    #[inline]
    #[must_use]
    pub fn is_pre_fork(self) -> bool {
        matches!(self, MappingKind::PreFork)
    }
}

/// One OS-backed region owned by an arena pool. Unmapped on drop.
#[derive(Debug)]
pub(crate) struct Mapping {
    base: NonNull<u8>,
    size: usize,
    kind: MappingKind,
}

// Safety: Mapping owns its region exclusively; the pointer is only an address.
unsafe impl Send for Mapping {}
// Safety: Mapping exposes no interior mutability.
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Map `size` bytes (already page-rounded) and label them with `label`.
    pub(crate) fn new(
        size: usize,
        kind: MappingKind,
        low_address_space: bool,
        label: &CStr,
    ) -> Result<Self, VmError> {
        debug_assert!(size > 0 && size.is_multiple_of(PlatformVmOps::page_size()));
        // Safety: FFI call to create a fresh mapping.
        let base = unsafe { PlatformVmOps::map_anonymous(size, low_address_space)? };

        // Safety: base/size describe the mapping we just created.
        if let Err(e) = unsafe { PlatformVmOps::set_name(base, size, label) } {
            tracing::warn!(label = ?label, error = %e, "could not label arena pool mapping");
        }

        stats::POOL_MAPPED_BYTES.add(size);
        Ok(Self { base, size, kind })
    }

    #[inline]
    pub(crate) fn begin(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn end(&self) -> usize {
        self.begin() + self.size
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub(crate) fn kind(&self) -> MappingKind {
        self.kind
    }

    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        (self.begin()..self.end()).contains(&addr)
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // Safety: base/size are exactly what map_anonymous returned.
        if let Err(e) = unsafe { PlatformVmOps::unmap(self.base, self.size) } {
            tracing::error!(error = %e, size = self.size, "failed to unmap arena pool mapping");
        }
        stats::sub_saturating(&stats::POOL_MAPPED_BYTES, self.size);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_bounds() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let page = PlatformVmOps::page_size();
        let m = Mapping::new(page * 4, MappingKind::PostFork, false, c"gcarena-test").unwrap();

        assert_eq!(m.size(), page * 4);
        assert_eq!(m.end() - m.begin(), page * 4);
        assert!(m.contains(m.begin()));
        assert!(m.contains(m.end() - 1));
        assert!(!m.contains(m.end()));
        assert!(!m.kind().is_pre_fork());
    }

    #[test]
    fn test_mapping_stats_lifecycle() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let page = PlatformVmOps::page_size();
        let before = stats::POOL_MAPPED_BYTES.get();
        {
            let m = Mapping::new(page * 2, MappingKind::PreFork, false, c"gcarena-test").unwrap();
            assert!(m.kind().is_pre_fork());
            assert_eq!(stats::POOL_MAPPED_BYTES.get(), before + page * 2);
        }
        assert_eq!(stats::POOL_MAPPED_BYTES.get(), before);
    }
}
