//! Page-aligned memory regions with tracked permissions.
//!
//! A [`MemoryRegion`] owns one anonymous mapping. Its [`Permission`] always
//! mirrors the last protection the OS accepted: a failed `mprotect` leaves the
//! recorded state untouched.
//!
//! Which transitions are legal depends on the [`Strategy`] the region was
//! allocated under. A write-xor-execute region refuses any request that would
//! make it writable and executable at once.

use core::fmt;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU64, Ordering};
use std::io;

use log::{debug, trace, warn};

use crate::error::{JitError, Result};
use crate::strategy::Strategy;
use crate::sys::{self, Protection};

/// Permission state of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    /// Writable, not executable.
    ReadWrite,
    /// Executable, not writable.
    ReadExecute,
    /// Writable and executable. Only reachable under [`Strategy::Direct`].
    ReadWriteExecute,
    /// Released.
    Unmapped,
}

impl Permission {
    /// OS protection bits for this state.
    pub fn protection(self) -> Protection {
        match self {
            Self::ReadWrite => Protection::READ | Protection::WRITE,
            Self::ReadExecute => Protection::READ | Protection::EXEC,
            Self::ReadWriteExecute => Protection::READ | Protection::WRITE | Protection::EXEC,
            Self::Unmapped => Protection::empty(),
        }
    }

    pub fn is_writable(self) -> bool {
        self.protection().contains(Protection::WRITE)
    }

    pub fn is_executable(self) -> bool {
        self.protection().contains(Protection::EXEC)
    }

    pub fn is_mapped(self) -> bool {
        self != Self::Unmapped
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadWrite => write!(f, "read-write"),
            Self::ReadExecute => write!(f, "read-execute"),
            Self::ReadWriteExecute => write!(f, "read-write-execute"),
            Self::Unmapped => write!(f, "unmapped"),
        }
    }
}

/// Process-unique region identity, used in logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId(pub u64);

impl RegionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One anonymous mapping and its permission state.
pub struct MemoryRegion {
    id: RegionId,
    base: NonNull<u8>,
    /// Mapped length; always a multiple of the page size.
    size: usize,
    permission: Permission,
    strategy: Strategy,
}

// SAFETY: the region exclusively owns its mapping. Every mutation of the
// mapped bytes or of the protection goes through `&mut self`, so shared
// references only ever read.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Map at least `size` bytes with `initial` permission.
    ///
    /// `initial` selects the strategy: [`Permission::ReadWrite`] for
    /// write-xor-execute, [`Permission::ReadWriteExecute`] for direct.
    pub fn allocate(size: usize, initial: Permission) -> Result<Self> {
        let fail = |source: io::Error| JitError::Allocation {
            size,
            permission: initial,
            source,
        };

        let strategy = Strategy::for_initial_permission(initial).ok_or_else(|| {
            fail(io::Error::new(
                io::ErrorKind::InvalidInput,
                "initial permission must be read-write or read-write-execute",
            ))
        })?;
        if size == 0 {
            return Err(fail(io::Error::new(
                io::ErrorKind::InvalidInput,
                "region size must be non-zero",
            )));
        }
        let mapped = sys::round_to_page(size).ok_or_else(|| {
            fail(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "region size overflows page rounding",
            ))
        })?;

        let base = sys::map(mapped, initial.protection()).map_err(fail)?;
        let region = Self {
            id: RegionId::next(),
            base,
            size: mapped,
            permission: initial,
            strategy,
        };

        if strategy == Strategy::Direct {
            warn!(
                "region {}: mapped {} bytes read-write-execute (direct strategy, W^X not enforced)",
                region.id, mapped
            );
        } else {
            debug!("region {}: mapped {} bytes {}", region.id, mapped, initial);
        }
        Ok(region)
    }

    pub fn id(&self) -> RegionId {
        self.id
    }

    /// Mapped size in bytes (page multiple).
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn is_writable(&self) -> bool {
        self.permission.is_writable()
    }

    pub fn is_executable(&self) -> bool {
        self.permission.is_executable()
    }

    /// Base address. Only meaningful while the region is mapped.
    pub fn base(&self) -> *const u8 {
        self.base.as_ptr()
    }

    pub(crate) fn entry(&self) -> NonNull<u8> {
        self.base
    }

    /// Copy `code` into the region at `offset`.
    ///
    /// Nothing outside `[offset, offset + code.len())` is touched, and a
    /// rejected write touches nothing at all.
    pub fn write_into(&mut self, code: impl AsRef<[u8]>, offset: usize) -> Result<usize> {
        let code = code.as_ref();
        if !self.permission.is_writable() {
            return Err(JitError::NotWritable {
                region: self.id,
                permission: self.permission,
            });
        }
        let out_of_bounds = || JitError::OutOfBounds {
            region: self.id,
            offset,
            len: code.len(),
            capacity: self.size,
        };
        let end = offset.checked_add(code.len()).ok_or_else(out_of_bounds)?;
        if end > self.size {
            return Err(out_of_bounds());
        }

        // SAFETY: the range was bounds-checked against the live, writable
        // mapping, and `&mut self` excludes every other access to it.
        unsafe {
            let dst = self.base.as_ptr().add(offset);
            ptr::copy_nonoverlapping(code.as_ptr(), dst, code.len());
            if self.permission.is_executable() {
                sys::sync_instruction_cache(dst, code.len());
            }
        }
        trace!(
            "region {}: wrote {} bytes at offset {}",
            self.id,
            code.len(),
            offset
        );
        Ok(code.len())
    }

    /// Change the region's permission in place. Bytes are never moved.
    ///
    /// Requesting the current permission is a no-op.
    pub fn protect(&mut self, requested: Permission) -> Result<()> {
        let refuse = |reason: &'static str| JitError::Protection {
            region: self.id,
            from: self.permission,
            requested,
            reason,
            source: None,
        };

        if !self.permission.is_mapped() {
            return Err(refuse("region already released"));
        }
        if !requested.is_mapped() {
            return Err(refuse("use release to unmap a region"));
        }
        if !self.strategy.permits(requested) {
            return Err(refuse("write-xor-execute region cannot be writable and executable"));
        }
        if requested == self.permission {
            return Ok(());
        }

        // SAFETY: base/size describe our live mapping, and `&mut self` means
        // no outstanding reference depends on the old protection.
        unsafe { sys::protect(self.base, self.size, requested.protection()) }.map_err(
            |source| JitError::Protection {
                region: self.id,
                from: self.permission,
                requested,
                reason: "mprotect rejected the change",
                source: Some(source),
            },
        )?;

        if requested.is_executable() {
            // SAFETY: the mapping is live and readable in every mapped state.
            unsafe { sys::sync_instruction_cache(self.base.as_ptr(), self.size) };
        }
        debug!("region {}: {} -> {}", self.id, self.permission, requested);
        self.permission = requested;
        Ok(())
    }

    /// Unmap the region. A second call fails with [`JitError::Release`].
    pub fn release(&mut self) -> Result<()> {
        if !self.permission.is_mapped() {
            return Err(JitError::Release {
                region: self.id,
                reason: "region already released",
                source: None,
            });
        }
        // SAFETY: the mapping is live and `&mut self` guarantees no borrow of
        // its bytes survives this call.
        unsafe { sys::unmap(self.base, self.size) }.map_err(|source| JitError::Release {
            region: self.id,
            reason: "munmap failed",
            source: Some(source),
        })?;
        debug!("region {}: released {} bytes", self.id, self.size);
        self.permission = Permission::Unmapped;
        Ok(())
    }

    /// Read back the full mapped contents.
    pub fn bytes(&self) -> Result<&[u8]> {
        if !self.permission.is_mapped() {
            return Err(JitError::InvalidState {
                operation: "read",
                region: self.id,
                permission: self.permission,
            });
        }
        // SAFETY: every mapped permission includes READ, and writers need
        // `&mut self`, so the slice cannot alias a concurrent write.
        Ok(unsafe { core::slice::from_raw_parts(self.base.as_ptr(), self.size) })
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("id", &self.id)
            .field("base", &self.base)
            .field("size", &self.size)
            .field("permission", &self.permission)
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if self.permission.is_mapped() {
            if let Err(e) = self.release() {
                warn!("{}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_rounds_to_page() {
        let region = MemoryRegion::allocate(1024, Permission::ReadWrite).unwrap();
        assert_eq!(region.size(), sys::page_size());
        assert_eq!(region.permission(), Permission::ReadWrite);
        assert_eq!(region.strategy(), Strategy::WriteXorExecute);
        assert_eq!(region.base() as usize % sys::page_size(), 0);
    }

    #[test]
    fn test_allocate_rejects_zero_and_bad_permission() {
        let err = MemoryRegion::allocate(0, Permission::ReadWrite).unwrap_err();
        assert!(matches!(err, JitError::Allocation { size: 0, .. }));

        let err = MemoryRegion::allocate(64, Permission::ReadExecute).unwrap_err();
        assert!(matches!(
            err,
            JitError::Allocation { permission: Permission::ReadExecute, .. }
        ));
    }

    #[test]
    fn test_wx_write_then_lock() {
        let mut region = MemoryRegion::allocate(64, Permission::ReadWrite).unwrap();
        assert!(region.is_writable());
        assert!(!region.is_executable());

        region.write_into([0x90u8, 0x90, 0xC3], 0).unwrap(); // nop, nop, ret
        region.protect(Permission::ReadExecute).unwrap();
        assert!(region.is_executable());
        assert!(!region.is_writable());

        let err = region.write_into([0x90u8], 0).unwrap_err();
        assert!(matches!(
            err,
            JitError::NotWritable { permission: Permission::ReadExecute, .. }
        ));
        assert_eq!(&region.bytes().unwrap()[..3], &[0x90, 0x90, 0xC3]);
    }

    #[test]
    fn test_wx_refuses_rwx() {
        let mut region = MemoryRegion::allocate(64, Permission::ReadWrite).unwrap();
        let err = region.protect(Permission::ReadWriteExecute).unwrap_err();
        assert!(matches!(err, JitError::Protection { source: None, .. }));
        assert_eq!(region.permission(), Permission::ReadWrite);
    }

    #[test]
    fn test_wx_make_writable_again() {
        let mut region = MemoryRegion::allocate(64, Permission::ReadWrite).unwrap();
        region.write_into([0xCCu8], 0).unwrap();
        region.protect(Permission::ReadExecute).unwrap();
        region.protect(Permission::ReadWrite).unwrap();
        region.write_into([0x90u8], 1).unwrap();
        assert_eq!(&region.bytes().unwrap()[..2], &[0xCC, 0x90]);
    }

    #[test]
    fn test_direct_region_is_rwx() {
        let mut region = MemoryRegion::allocate(64, Permission::ReadWriteExecute).unwrap();
        assert_eq!(region.strategy(), Strategy::Direct);
        assert!(region.is_writable() && region.is_executable());
        region.write_into([0xC3u8], 0).unwrap();
        assert_eq!(region.bytes().unwrap()[0], 0xC3);
    }

    #[test]
    fn test_protect_same_permission_is_noop() {
        let mut region = MemoryRegion::allocate(64, Permission::ReadWrite).unwrap();
        region.protect(Permission::ReadWrite).unwrap();
        assert_eq!(region.permission(), Permission::ReadWrite);
    }

    #[test]
    fn test_out_of_bounds_touches_nothing() {
        let mut region = MemoryRegion::allocate(64, Permission::ReadWrite).unwrap();
        let size = region.size();
        region.write_into([0xAAu8; 4], size - 4).unwrap();

        let err = region.write_into([0xBBu8; 8], size - 4).unwrap_err();
        assert!(matches!(err, JitError::OutOfBounds { len: 8, .. }));
        assert_eq!(&region.bytes().unwrap()[size - 4..], &[0xAA; 4]);

        let err = region.write_into([0xBBu8], usize::MAX).unwrap_err();
        assert!(matches!(err, JitError::OutOfBounds { .. }));
    }

    #[test]
    fn test_release_twice() {
        let mut region = MemoryRegion::allocate(64, Permission::ReadWrite).unwrap();
        region.release().unwrap();
        assert_eq!(region.permission(), Permission::Unmapped);

        let err = region.release().unwrap_err();
        assert!(matches!(err, JitError::Release { source: None, .. }));
    }

    #[test]
    fn test_released_region_rejects_everything() {
        let mut region = MemoryRegion::allocate(64, Permission::ReadWrite).unwrap();
        region.release().unwrap();

        assert!(matches!(
            region.write_into([0x90u8], 0),
            Err(JitError::NotWritable { permission: Permission::Unmapped, .. })
        ));
        assert!(matches!(
            region.protect(Permission::ReadExecute),
            Err(JitError::Protection { .. })
        ));
        assert!(matches!(region.bytes(), Err(JitError::InvalidState { .. })));
    }

    #[test]
    fn test_region_ids_are_unique() {
        let a = MemoryRegion::allocate(64, Permission::ReadWrite).unwrap();
        let b = MemoryRegion::allocate(64, Permission::ReadWrite).unwrap();
        assert_ne!(a.id(), b.id());
    }
}
