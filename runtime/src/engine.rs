//! Install-and-run engine.
//!
//! [`JitEngine`] strings the pieces together: allocate a region for the
//! configured [`Strategy`], copy a [`CodeBuffer`] in, seal it, optionally dump
//! it, and hand back an [`InstalledFunction`] that owns the region.
//!
//! The engine also enforces a global budget on mapped code bytes and keeps
//! counters for installs, invocations and releases.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use crate::callable::{self, FunctionSignature, Value};
use crate::code::CodeBuffer;
use crate::dump;
use crate::error::{JitError, Result};
use crate::region::MemoryRegion;
use crate::strategy::Strategy;
use crate::sys;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Permission transition strategy for every region.
    pub strategy: Strategy,
    /// Minimum region size requested per install (rounded up to pages).
    pub region_size: usize,
    /// Maximum bytes mapped across all live installed functions.
    pub max_code_bytes: usize,
    /// When set, every install dumps its code bytes here.
    pub dump_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::WriteXorExecute,
            region_size: 1024,
            max_code_bytes: 64 * 1024 * 1024, // 64 MB
            dump_path: None,
        }
    }
}

/// Engine counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Successful installs.
    pub installs: AtomicU64,
    /// Calls that reached machine code.
    pub invocations: AtomicU64,
    /// Installed functions dropped or released.
    pub releases: AtomicU64,
    /// Total code bytes copied into regions.
    pub bytes_installed: AtomicU64,
    /// Bytes currently mapped by live installed functions.
    pub bytes_mapped: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub installs: u64,
    pub invocations: u64,
    pub releases: u64,
    pub bytes_installed: u64,
    pub bytes_mapped: u64,
}

impl EngineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            installs: self.installs.load(Ordering::Relaxed),
            invocations: self.invocations.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            bytes_installed: self.bytes_installed.load(Ordering::Relaxed),
            bytes_mapped: self.bytes_mapped.load(Ordering::Relaxed),
        }
    }

    /// Reserve `bytes` of budget, or fail without reserving anything.
    fn reserve(&self, bytes: u64, limit: u64) -> bool {
        self.bytes_mapped
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |mapped| {
                mapped.checked_add(bytes).filter(|&total| total <= limit)
            })
            .is_ok()
    }

    fn unreserve(&self, bytes: u64) {
        self.bytes_mapped.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// Installs code buffers as callable functions.
#[derive(Debug, Default)]
pub struct JitEngine {
    config: EngineConfig,
    stats: Arc<EngineStats>,
}

impl JitEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            stats: Arc::new(EngineStats::default()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Install `code` as a function with `signature`.
    ///
    /// On any failure the partially built region is unmapped and its budget
    /// returned. A failed dump is logged and does not fail the install.
    ///
    /// # Safety
    ///
    /// `code` must be a complete function body implementing `signature` under
    /// the platform C calling convention; see [`callable::bind`].
    pub unsafe fn install(
        &self,
        code: CodeBuffer,
        signature: FunctionSignature,
    ) -> Result<InstalledFunction> {
        let strategy = self.config.strategy;
        let wanted = self.config.region_size.max(code.len());
        let mapped = sys::round_to_page(wanted).unwrap_or(usize::MAX);

        if !self
            .stats
            .reserve(mapped as u64, self.config.max_code_bytes as u64)
        {
            return Err(JitError::Allocation {
                size: wanted,
                permission: strategy.initial_permission(),
                source: io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    format!(
                        "code budget of {} bytes exhausted",
                        self.config.max_code_bytes
                    ),
                ),
            });
        }

        let region = match strategy.install(code.clone(), wanted) {
            Ok(region) => region,
            Err(e) => {
                self.stats.unreserve(mapped as u64);
                return Err(e);
            }
        };

        if let Some(path) = &self.config.dump_path {
            if let Err(e) = dump::dump_to_path(&region, code.len(), path) {
                warn!("{}", e);
            }
        }

        self.stats.installs.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_installed
            .fetch_add(code.len() as u64, Ordering::Relaxed);
        debug!(
            "installed {} ({} bytes) in region {} ({} bytes mapped, {})",
            signature,
            code.len(),
            region.id(),
            region.size(),
            strategy
        );

        Ok(InstalledFunction {
            region,
            signature,
            code_len: code.len(),
            reserved: mapped as u64,
            stats: Arc::clone(&self.stats),
        })
    }
}

/// A function installed by a [`JitEngine`]. Owns its region; dropping it
/// unmaps the code.
#[derive(Debug)]
pub struct InstalledFunction {
    region: MemoryRegion,
    signature: FunctionSignature,
    code_len: usize,
    reserved: u64,
    stats: Arc<EngineStats>,
}

impl InstalledFunction {
    pub fn signature(&self) -> &FunctionSignature {
        &self.signature
    }

    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    /// Length of the installed code in bytes.
    pub fn code_len(&self) -> usize {
        self.code_len
    }

    pub fn invoke(&self, args: &[Value]) -> Result<Option<Value>> {
        // SAFETY: `JitEngine::install`'s caller vouched that the code
        // implements `self.signature`.
        let handle = unsafe { callable::bind(&self.region, self.signature.clone()) }?;
        let result = handle.invoke(args)?;
        self.stats.invocations.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    /// Dump the installed code bytes to `path`.
    pub fn dump_to(&self, path: impl AsRef<std::path::Path>) -> Result<usize> {
        dump::dump_to_path(&self.region, self.code_len, path)
    }

    /// Unmap now instead of at drop, surfacing any OS error.
    pub fn release(mut self) -> Result<()> {
        self.region.release()
    }
}

impl Drop for InstalledFunction {
    fn drop(&mut self) {
        // MemoryRegion's own Drop unmaps if `release` was not called.
        self.stats.unreserve(self.reserved);
        self.stats.releases.fetch_add(1, Ordering::Relaxed);
    }
}
