use std::ffi::CStr;
use std::fmt;
use std::ptr::NonNull;

/// Exclusive upper bound of the restricted range used when a pool is
/// configured with `low_address_space`.
pub const LOW_ADDRESS_LIMIT: u64 = 1 << 32;

#[derive(Debug)]
pub enum VmError {
    MapFailed { size: usize, source: std::io::Error },
    UnmapFailed(std::io::Error),
    DiscardFailed(std::io::Error),
    NameFailed(std::io::Error),
    LowAddressSpaceExhausted { size: usize },
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::MapFailed { size, source } => {
                write!(f, "VM mapping of {size} bytes failed: {source}")
            }
            VmError::UnmapFailed(e) => write!(f, "VM unmap failed: {e}"),
            VmError::DiscardFailed(e) => write!(f, "VM page discard failed: {e}"),
            VmError::NameFailed(e) => write!(f, "VM mapping label failed: {e}"),
            VmError::LowAddressSpaceExhausted { size } => write!(
                f,
                "no room for {size} bytes below {LOW_ADDRESS_LIMIT:#x}"
            ),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::MapFailed { source, .. } => Some(source),
            VmError::UnmapFailed(e) | VmError::DiscardFailed(e) | VmError::NameFailed(e) => Some(e),
            VmError::LowAddressSpaceExhausted { .. } => None,
        }
    }
}

/// Abstract interface for the virtual memory operations the arena pool needs.
pub(crate) trait VmOps {
    /// Map `size` bytes of private, anonymous, read-write memory.
    ///
    /// Fresh mappings are zero-filled. With `low_address_space` the whole
    /// range lies below [`LOW_ADDRESS_LIMIT`].
    unsafe fn map_anonymous(size: usize, low_address_space: bool) -> Result<NonNull<u8>, VmError>;

    /// Unmap a range previously returned by [`map_anonymous`](Self::map_anonymous).
    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Give the physical pages of a range back to the OS. The range stays
    /// mapped and reads as zero afterwards.
    unsafe fn discard(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Attach a diagnostic label to a mapping. Best effort: kernels without
    /// support report an error which callers are free to ignore.
    unsafe fn set_name(ptr: NonNull<u8>, size: usize, name: &CStr) -> Result<(), VmError>;

    /// OS page size.
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[inline]
#[cfg_attr(any(loom, miri), allow(dead_code))]
pub(crate) fn is_low_range(ptr: NonNull<u8>, size: usize) -> bool {
    (ptr.as_ptr() as usize as u64).saturating_add(size as u64) <= LOW_ADDRESS_LIMIT
}

const LOW_SCAN_START: usize = 64 * 1024;
const LOW_SCAN_STEP: usize = 16 * 1024 * 1024;

/// Walk hint addresses upwards through the low range, calling `try_at` on
/// each until it yields a mapping. `Ok(None)` means the hint was not honoured;
/// an error at one hint moves on to the next rather than ending the scan.
#[cfg_attr(
    any(loom, miri, all(target_os = "linux", target_arch = "x86_64")),
    allow(dead_code)
)]
pub(crate) fn scan_low_hints<F>(size: usize, mut try_at: F) -> Result<NonNull<u8>, VmError>
where
    F: FnMut(usize) -> Result<Option<NonNull<u8>>, VmError>,
{
    let mut hint = LOW_SCAN_START;
    while (hint as u64).saturating_add(size as u64) <= LOW_ADDRESS_LIMIT {
        match try_at(hint) {
            Ok(Some(ptr)) => return Ok(ptr),
            Ok(None) => {}
            Err(e) => tracing::trace!(hint, size, error = %e, "low address hint refused"),
        }
        hint = hint.saturating_add(size.max(LOW_SCAN_STEP));
        if hint == usize::MAX {
            break;
        }
    }
    Err(VmError::LowAddressSpaceExhausted { size })
}

#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
mod unix {
    use super::{is_low_range, CStr, NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    unsafe fn mmap_anon(
        hint: *mut libc::c_void,
        size: usize,
        extra_flags: libc::c_int,
    ) -> Result<NonNull<u8>, VmError> {
        // Safety: FFI call to mmap. Without MAP_FIXED the hint never clobbers
        // an existing mapping.
        let ptr = unsafe {
            libc::mmap(
                hint,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON | extra_flags,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(VmError::MapFailed {
                size,
                source: io::Error::last_os_error(),
            });
        }

        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| VmError::MapFailed {
            size,
            source: io::Error::other("mmap returned null"),
        })
    }

    /// x86_64 Linux: MAP_32BIT places the mapping in the first 2GB.
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    unsafe fn map_low(size: usize) -> Result<NonNull<u8>, VmError> {
        // Safety: forwarded FFI preconditions.
        let ptr = unsafe { mmap_anon(std::ptr::null_mut(), size, libc::MAP_32BIT)? };
        debug_assert!(is_low_range(ptr, size), "MAP_32BIT returned {ptr:p}");
        Ok(ptr)
    }

    /// Everywhere else: walk hint addresses upwards through the low range
    /// until the kernel honours one.
    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    unsafe fn map_low(size: usize) -> Result<NonNull<u8>, VmError> {
        super::scan_low_hints(size, |hint| {
            // Safety: forwarded FFI preconditions.
            let ptr = unsafe { mmap_anon(hint as *mut libc::c_void, size, 0)? };
            if is_low_range(ptr, size) {
                return Ok(Some(ptr));
            }
            // Hint ignored; hand the range back and probe higher.
            // Safety: ptr/size are exactly the mapping we just created.
            unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) };
            Ok(None)
        })
    }

    impl VmOps for PlatformVmOps {
        unsafe fn map_anonymous(
            size: usize,
            low_address_space: bool,
        ) -> Result<NonNull<u8>, VmError> {
            if low_address_space {
                // Safety: forwarded FFI preconditions.
                unsafe { map_low(size) }
            } else {
                // Safety: forwarded FFI preconditions.
                unsafe { mmap_anon(std::ptr::null_mut(), size, 0) }
            }
        }

        unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::UnmapFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn discard(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Linux: MADV_DONTNEED on private anonymous memory drops the pages;
            // the next touch faults in zero-filled pages.
            #[cfg(target_os = "linux")]
            {
                // Safety: FFI call to madvise.
                if unsafe {
                    libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_DONTNEED)
                } != 0
                {
                    return Err(VmError::DiscardFailed(io::Error::last_os_error()));
                }
            }

            // macOS: no zero-fill guarantee from madvise, so zero explicitly
            // and let MADV_FREE reclaim lazily.
            #[cfg(target_os = "macos")]
            {
                // Safety: caller guarantees the range is mapped and unshared.
                unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, size) };
                // Safety: FFI call to madvise.
                if unsafe {
                    libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_FREE)
                } != 0
                {
                    return Err(VmError::DiscardFailed(io::Error::last_os_error()));
                }
            }

            Ok(())
        }

        #[cfg(target_os = "linux")]
        unsafe fn set_name(ptr: NonNull<u8>, size: usize, name: &CStr) -> Result<(), VmError> {
            // Linux >= 5.17 with CONFIG_ANON_VMA_NAME.
            const PR_SET_VMA: libc::c_int = 0x5356_4d41;
            const PR_SET_VMA_ANON_NAME: libc::c_ulong = 0;

            // Safety: FFI call to prctl; the kernel copies `name`.
            let rc = unsafe {
                libc::prctl(
                    PR_SET_VMA,
                    PR_SET_VMA_ANON_NAME,
                    ptr.as_ptr() as libc::c_ulong,
                    size as libc::c_ulong,
                    name.as_ptr() as libc::c_ulong,
                )
            };
            if rc != 0 {
                return Err(VmError::NameFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        #[cfg(not(target_os = "linux"))]
        unsafe fn set_name(_ptr: NonNull<u8>, _size: usize, _name: &CStr) -> Result<(), VmError> {
            Err(VmError::NameFailed(io::Error::from(io::ErrorKind::Unsupported)))
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed VmOps (no real mmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls: loom runs inside a
// single OS process with its own scheduler. Every "mapping" is a zeroed heap
// block; `discard` zeroes in place. The low-address constraint is ignored.
//
// This is sufficient for testing the synchronization logic of the pool
// (loom) and detecting undefined behaviour in the page bookkeeping (Miri).
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn map_anonymous(size: usize, _low_address_space: bool) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::MapFailed {
                size,
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "zero-size mapping"),
            });
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096).map_err(|e| {
            VmError::MapFailed {
                size,
                source: std::io::Error::other(e),
            }
        })?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| VmError::MapFailed {
            size,
            source: std::io::Error::new(std::io::ErrorKind::OutOfMemory, "alloc returned null"),
        })
    }

    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::UnmapFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `map_anonymous`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    unsafe fn discard(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        // Safety: caller guarantees the range is live.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(())
    }

    unsafe fn set_name(_ptr: NonNull<u8>, _size: usize, _name: &CStr) -> Result<(), VmError> {
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}
