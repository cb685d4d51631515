//! A region shared between threads.
//!
//! Writes, protection changes and release take the write side of a
//! reader/writer lock; every invocation holds the read side for its whole
//! duration. A region is therefore never written or re-protected while code in
//! it may be running, while invocations of a sealed region still run in
//! parallel.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use spin::{RwLock, RwLockWriteGuard};

use crate::callable::{self, FunctionSignature, Value};
use crate::error::{JitError, Result};
use crate::region::{MemoryRegion, Permission, RegionId};

/// Cloneable, thread-safe handle to one [`MemoryRegion`].
#[derive(Debug, Clone)]
pub struct SharedRegion {
    id: RegionId,
    inner: Arc<RwLock<MemoryRegion>>,
    /// Last permission committed under the write lock. Readable while a
    /// writer holds the lock.
    permission: Arc<AtomicU8>,
}

impl SharedRegion {
    pub fn new(region: MemoryRegion) -> Self {
        Self {
            id: region.id(),
            permission: Arc::new(AtomicU8::new(encode(region.permission()))),
            inner: Arc::new(RwLock::new(region)),
        }
    }

    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn permission(&self) -> Permission {
        self.inner.read().permission()
    }

    pub fn write_into(&self, code: impl AsRef<[u8]>, offset: usize) -> Result<usize> {
        self.inner.write().write_into(code, offset)
    }

    /// Start a batch of writes. Until the writer is dropped, invocations block
    /// and [`try_protect`](Self::try_protect) is refused.
    pub fn writer(&self) -> RegionWriter<'_> {
        RegionWriter {
            guard: self.inner.write(),
        }
    }

    /// Change the permission, waiting for in-flight writes and invocations.
    pub fn protect(&self, requested: Permission) -> Result<()> {
        let mut region = self.inner.write();
        let result = region.protect(requested);
        self.commit(&region);
        result
    }

    /// Change the permission only if nothing is writing to or running from
    /// the region right now.
    pub fn try_protect(&self, requested: Permission) -> Result<()> {
        match self.inner.try_write() {
            Some(mut region) => {
                let result = region.protect(requested);
                self.commit(&region);
                result
            }
            None => Err(JitError::Protection {
                region: self.id,
                from: decode(self.permission.load(Ordering::Acquire)),
                requested,
                reason: "region is busy (write or invocation in flight)",
                source: None,
            }),
        }
    }

    pub fn release(&self) -> Result<()> {
        let mut region = self.inner.write();
        let result = region.release();
        self.commit(&region);
        result
    }

    /// Copy of the mapped bytes, taken under the read lock.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        self.inner.read().bytes().map(<[u8]>::to_vec)
    }

    /// Run `f` with shared access to the region.
    pub fn with_region<R>(&self, f: impl FnOnce(&MemoryRegion) -> R) -> R {
        f(&self.inner.read())
    }

    /// Bind the region for invocation from any thread.
    ///
    /// Fails with [`JitError::InvalidState`] unless the region is currently
    /// executable.
    ///
    /// # Safety
    ///
    /// Same contract as [`callable::bind`], and it must keep holding after any
    /// later write through this `SharedRegion`.
    pub unsafe fn bind(&self, signature: FunctionSignature) -> Result<SharedCallable> {
        {
            let region = self.inner.read();
            // SAFETY: forwarded from the caller.
            unsafe { callable::bind(&region, signature.clone()) }?;
        }
        Ok(SharedCallable {
            region: self.clone(),
            signature,
        })
    }

    fn commit(&self, region: &MemoryRegion) {
        self.permission
            .store(encode(region.permission()), Ordering::Release);
    }
}

fn encode(permission: Permission) -> u8 {
    match permission {
        Permission::ReadWrite => 0,
        Permission::ReadExecute => 1,
        Permission::ReadWriteExecute => 2,
        Permission::Unmapped => 3,
    }
}

fn decode(raw: u8) -> Permission {
    match raw {
        0 => Permission::ReadWrite,
        1 => Permission::ReadExecute,
        2 => Permission::ReadWriteExecute,
        _ => Permission::Unmapped,
    }
}

/// Exclusive write access to a [`SharedRegion`] for a batch of writes.
pub struct RegionWriter<'a> {
    guard: RwLockWriteGuard<'a, MemoryRegion>,
}

impl RegionWriter<'_> {
    pub fn write_into(&mut self, code: impl AsRef<[u8]>, offset: usize) -> Result<usize> {
        self.guard.write_into(code, offset)
    }

    pub fn region(&self) -> &MemoryRegion {
        &self.guard
    }
}

/// A bound entry point into a [`SharedRegion`], invocable from many threads.
#[derive(Debug, Clone)]
pub struct SharedCallable {
    region: SharedRegion,
    signature: FunctionSignature,
}

impl SharedCallable {
    pub fn signature(&self) -> &FunctionSignature {
        &self.signature
    }

    /// Invoke under the read lock. Fails with [`JitError::InvalidState`] if
    /// the region was re-protected or released since binding.
    pub fn invoke(&self, args: &[Value]) -> Result<Option<Value>> {
        let region = self.region.inner.read();
        // SAFETY: `SharedRegion::bind`'s caller vouched for the bytes; the
        // read guard keeps them unchanged for the duration of the call.
        let handle = unsafe { callable::bind(&region, self.signature.clone()) }.map_err(|_| {
            JitError::InvalidState {
                operation: "invoke",
                region: region.id(),
                permission: region.permission(),
            }
        })?;
        handle.invoke(args)
    }
}
