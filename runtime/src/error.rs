//! Error taxonomy for region management, installation and invocation.
//!
//! Every variant is recoverable at the call site. Executing bytes that do not
//! implement the bound signature is not represented here: that failure happens
//! in machine code, past the point where this crate can observe it.

use std::io;

use crate::callable::ValueType;
use crate::region::{Permission, RegionId};

/// All errors produced by the runtime.
#[derive(thiserror::Error, Debug)]
pub enum JitError {
    /// The OS refused to map memory, or the engine's code budget is exhausted.
    #[error("allocate: mapping {size} bytes as {permission} failed: {source}")]
    Allocation {
        size: usize,
        permission: Permission,
        #[source]
        source: io::Error,
    },

    /// A permission change was rejected, either by the OS or by the region's
    /// strategy.
    #[error("protect: region {region} {from} -> {requested} rejected: {reason}")]
    Protection {
        region: RegionId,
        from: Permission,
        requested: Permission,
        reason: &'static str,
        #[source]
        source: Option<io::Error>,
    },

    #[error("write_into: region {region}: {offset} + {len} exceeds capacity {capacity}")]
    OutOfBounds {
        region: RegionId,
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("write_into: region {region} is {permission}, not writable")]
    NotWritable {
        region: RegionId,
        permission: Permission,
    },

    /// `bind`/`invoke` on a region that is not executable or already released.
    #[error("{operation}: region {region} is {permission}, expected an executable mapping")]
    InvalidState {
        operation: &'static str,
        region: RegionId,
        permission: Permission,
    },

    #[error("release: region {region}: {reason}")]
    Release {
        region: RegionId,
        reason: &'static str,
        #[source]
        source: Option<io::Error>,
    },

    /// Arguments do not fit the bound signature, or the signature itself
    /// cannot be expressed in registers.
    #[error("{operation}: signature mismatch: expected {expected:?}, got {found:?}")]
    SignatureMismatch {
        operation: &'static str,
        expected: Vec<ValueType>,
        found: Vec<ValueType>,
    },

    /// Diagnostic dump failed. Never produced by allocation, protection or
    /// invocation paths.
    #[error("dump: region {region} to {target}: {source}")]
    Dump {
        region: RegionId,
        /// Destination path, or `<writer>` for an in-process sink.
        target: String,
        #[source]
        source: io::Error,
    },
}

impl JitError {
    /// Name of the operation that failed.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Allocation { .. } => "allocate",
            Self::Protection { .. } => "protect",
            Self::OutOfBounds { .. } | Self::NotWritable { .. } => "write_into",
            Self::InvalidState { operation, .. } => *operation,
            Self::Release { .. } => "release",
            Self::SignatureMismatch { operation, .. } => *operation,
            Self::Dump { .. } => "dump",
        }
    }

    /// Region the error refers to, if one existed.
    pub fn region(&self) -> Option<RegionId> {
        match self {
            Self::Allocation { .. } | Self::SignatureMismatch { .. } => None,
            Self::Protection { region, .. }
            | Self::OutOfBounds { region, .. }
            | Self::NotWritable { region, .. }
            | Self::InvalidState { region, .. }
            | Self::Release { region, .. }
            | Self::Dump { region, .. } => Some(*region),
        }
    }

    /// Raw OS error code (`errno`), where the failure came from the OS.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Self::Allocation { source, .. } | Self::Dump { source, .. } => source.raw_os_error(),
            Self::Protection { source, .. } | Self::Release { source, .. } => {
                source.as_ref().and_then(io::Error::raw_os_error)
            }
            _ => None,
        }
    }
}

pub type Result<T> = core::result::Result<T, JitError>;
