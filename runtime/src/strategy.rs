//! Permission transition protocol.
//!
//! Two strategies share allocation and copy-in and differ only in whether a
//! protection change happens before the code may run:
//!
//! ```text
//! WriteXorExecute: allocate(RW) -> write_into* -> protect(RX) -> invoke* -> release
//! Direct:          allocate(RWX) -> write_into* -> invoke* (writes still allowed) -> release
//! ```
//!
//! `Direct` keeps live code writable for the region's whole lifetime. It exists
//! for comparison and benchmarking only.

use core::fmt;
use core::str::FromStr;

use log::debug;

use crate::code::CodeBuffer;
use crate::error::{JitError, Result};
use crate::region::{MemoryRegion, Permission};

/// How a region moves from writable to executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Strategy {
    /// Map read-write, write, then flip to read-execute. Never W and X at once.
    #[default]
    WriteXorExecute,
    /// Map read-write-execute once. **Weaker**: live code stays writable.
    Direct,
}

impl Strategy {
    /// Permission a fresh region is mapped with.
    pub fn initial_permission(self) -> Permission {
        match self {
            Self::WriteXorExecute => Permission::ReadWrite,
            Self::Direct => Permission::ReadWriteExecute,
        }
    }

    /// Permission a region must hold before its code may be invoked.
    pub fn executable_permission(self) -> Permission {
        match self {
            Self::WriteXorExecute => Permission::ReadExecute,
            Self::Direct => Permission::ReadWriteExecute,
        }
    }

    pub(crate) fn for_initial_permission(permission: Permission) -> Option<Self> {
        match permission {
            Permission::ReadWrite => Some(Self::WriteXorExecute),
            Permission::ReadWriteExecute => Some(Self::Direct),
            Permission::ReadExecute | Permission::Unmapped => None,
        }
    }

    /// Whether a region under this strategy may be protected as `requested`.
    pub fn permits(self, requested: Permission) -> bool {
        match self {
            Self::WriteXorExecute => requested != Permission::ReadWriteExecute,
            Self::Direct => true,
        }
    }

    /// True for the mode that does not enforce W^X.
    pub fn is_weaker(self) -> bool {
        self == Self::Direct
    }

    /// Allocate a region of at least `size` bytes for this strategy.
    pub fn allocate(self, size: usize) -> Result<MemoryRegion> {
        MemoryRegion::allocate(size, self.initial_permission())
    }

    /// Allocate, copy `code` in at offset 0 and seal.
    ///
    /// The region is at least `size` bytes and never smaller than the code.
    /// On failure the partially built region is unmapped before returning.
    pub fn install(self, code: CodeBuffer, size: usize) -> Result<MemoryRegion> {
        let mut region = self.allocate(size.max(code.len()))?;
        region.write_into(&code, 0)?;
        seal(&mut region)?;
        debug!(
            "region {}: installed {} bytes ({})",
            region.id(),
            code.len(),
            self
        );
        Ok(region)
    }
}

/// Move a freshly written region into the state its strategy executes from.
///
/// Under write-xor-execute this is the `protect(ReadExecute)` step, which also
/// synchronises the instruction cache. Under direct it only checks that the
/// region is still read-write-execute.
pub fn seal(region: &mut MemoryRegion) -> Result<()> {
    let target = region.strategy().executable_permission();
    match region.strategy() {
        Strategy::WriteXorExecute => region.protect(target),
        Strategy::Direct if region.permission() == target => Ok(()),
        Strategy::Direct => Err(JitError::Protection {
            region: region.id(),
            from: region.permission(),
            requested: target,
            reason: "direct region is no longer read-write-execute",
            source: None,
        }),
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WriteXorExecute => write!(f, "w^x"),
            Self::Direct => write!(f, "direct-rwx"),
        }
    }
}

/// Error for an unrecognised strategy name.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown strategy `{0}` (expected `wx` or `rwx`)")]
pub struct ParseStrategyError(pub String);

impl FromStr for Strategy {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wx" | "w^x" | "wxe" | "write-xor-execute" => Ok(Self::WriteXorExecute),
            "rwx" | "direct" | "direct-rwx" => Ok(Self::Direct),
            _ => Err(ParseStrategyError(s.to_string())),
        }
    }
}
