//! wxjit runtime
//!
//! Installs raw machine code into memory and calls it. A region is mapped,
//! written, moved to an executable protection and then bound to a function
//! signature; the write-xor-execute strategy keeps it from ever being writable
//! and executable at the same time.
//!
//! # Architecture
//!
//! - `sys`: OS memory primitives (`mmap`/`mprotect`/`munmap`, page size,
//!   instruction-cache sync)
//! - `region`: Page-aligned regions with tracked permission state
//! - `code`: Immutable machine-code buffers
//! - `strategy`: Write-xor-execute vs direct RWX transition protocol
//! - `callable`: Signatures, values, and the unsafe address-to-function binding
//! - `shared`: Regions shared across threads behind a reader/writer lock
//! - `dump`: Raw byte dumps for offline disassembly
//! - `engine`: Install-and-run orchestration with a code budget and counters
//! - `templates`: Fixed x86-64 function bodies (add-constant, gcd, tail calls
//!   into host functions)
//!
//! # Trust boundary
//!
//! Nothing here validates instruction bytes. Binding a region to a signature
//! is `unsafe`, and bytes that do not implement the signature fail in machine
//! code (crash, illegal instruction, wrong result), outside [`JitError`].

#![cfg_attr(docsrs, feature(doc_cfg))]

#[cfg(not(unix))]
compile_error!("wxjit-runtime maps memory with mmap/mprotect and requires a unix target");

pub mod callable;
pub mod code;
pub mod dump;
pub mod engine;
pub mod error;
pub mod region;
pub mod shared;
pub mod strategy;
pub mod sys;
pub mod templates;

pub use callable::{bind, CallableHandle, FunctionSignature, Value, ValueType};
pub use code::CodeBuffer;
pub use engine::{EngineConfig, InstalledFunction, JitEngine, StatsSnapshot};
pub use error::{JitError, Result};
pub use region::{MemoryRegion, Permission, RegionId};
pub use shared::{SharedCallable, SharedRegion};
pub use strategy::{seal, Strategy};
