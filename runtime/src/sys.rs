//! OS memory primitives.
//!
//! The only module that calls `mmap`, `mprotect`, `munmap` and `sysconf`.
//! Everything above this layer reasons about [`Protection`] values and page
//! counts, never about raw `PROT_*` bits.

use core::ptr::{self, NonNull};
use std::io;

use bitflags::bitflags;

bitflags! {
    /// Access rights applied to mapped pages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        /// Pages can be read.
        const READ = 1 << 0;
        /// Pages can be written.
        const WRITE = 1 << 1;
        /// Pages can be fetched as instructions.
        const EXEC = 1 << 2;
    }
}

impl Protection {
    fn to_prot(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Self::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Self::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// Fallback when `sysconf` cannot report a page size.
const DEFAULT_PAGE_SIZE: usize = 4096;

static PAGE_SIZE: spin::Once<usize> = spin::Once::new();

/// Platform page size in bytes.
pub fn page_size() -> usize {
    *PAGE_SIZE.call_once(|| {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            DEFAULT_PAGE_SIZE
        }
    })
}

/// Round `size` up to the next page boundary. `None` on overflow.
pub fn round_to_page(size: usize) -> Option<usize> {
    let mask = page_size() - 1;
    size.checked_add(mask).map(|s| s & !mask)
}

/// Map `len` bytes of fresh anonymous memory with `prot`.
///
/// `len` must already be page-aligned and non-zero.
pub fn map(len: usize, prot: Protection) -> io::Result<NonNull<u8>> {
    // SAFETY: a private anonymous mapping at a kernel-chosen address never
    // aliases existing memory.
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            prot.to_prot(),
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))
}

/// Change the access rights of `[base, base + len)` in place.
///
/// # Safety
///
/// `base` and `len` must describe (part of) a live mapping returned by
/// [`map`], and no reference into the range may be used in a way the new
/// protection forbids.
pub unsafe fn protect(base: NonNull<u8>, len: usize, prot: Protection) -> io::Result<()> {
    // SAFETY: guaranteed by the caller.
    let rc = unsafe { libc::mprotect(base.as_ptr().cast(), len, prot.to_prot()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Unmap `[base, base + len)`.
///
/// # Safety
///
/// `base` and `len` must describe a live mapping returned by [`map`] that no
/// one will touch again.
pub unsafe fn unmap(base: NonNull<u8>, len: usize) -> io::Result<()> {
    // SAFETY: guaranteed by the caller.
    let rc = unsafe { libc::munmap(base.as_ptr().cast(), len) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Make bytes written through the data side visible to instruction fetch.
///
/// # Safety
///
/// `[start, start + len)` must lie inside a live, readable mapping.
#[cfg(target_arch = "aarch64")]
pub unsafe fn sync_instruction_cache(start: *const u8, len: usize) {
    extern "C" {
        fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
    }
    // SAFETY: guaranteed by the caller; `start + len` is one past the range.
    unsafe {
        __clear_cache(start as *mut libc::c_char, start.add(len) as *mut libc::c_char);
    }
}

/// Make bytes written through the data side visible to instruction fetch.
///
/// x86-64 keeps instruction and data caches coherent; only compiler
/// reordering has to be ruled out.
///
/// # Safety
///
/// `[start, start + len)` must lie inside a live, readable mapping.
#[cfg(not(target_arch = "aarch64"))]
pub unsafe fn sync_instruction_cache(_start: *const u8, _len: usize) {
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}
