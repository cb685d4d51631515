use std::process::ExitCode;

use wxjit_runtime::callable::ParseSignatureError;
use wxjit_runtime::code::HexError;
use wxjit_runtime::JitError;

/// All errors produced by wxjit-run.
///
/// Variants are split into two categories:
/// - **Input errors** (exit code 2): bad hex, bad signature, bad arguments, I/O
/// - **Engine errors** (exit code 1): allocation, protection, binding, invocation
#[derive(thiserror::Error, Debug)]
pub enum RunError {
    // ── Input errors (exit code 2) ───────────────────────────────────

    #[error("Invalid machine code: {0}")]
    InvalidHex(#[from] HexError),

    #[error("Invalid signature: {0}")]
    InvalidSignature(#[from] ParseSignatureError),

    #[error("Invalid argument {index} ({text:?}) for {ty}: {reason}")]
    InvalidArgument {
        index: usize,
        text: String,
        ty: String,
        reason: String,
    },

    #[error("Expected {expected} arguments for {signature}, got {found}")]
    ArgumentCount {
        signature: String,
        expected: usize,
        found: usize,
    },

    #[error("Empty machine code")]
    EmptyCode,

    #[error("{flag} is not accepted by {command}")]
    UnsupportedFlag {
        flag: &'static str,
        command: &'static str,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ── Engine errors (exit code 1) ──────────────────────────────────

    #[error("{0}")]
    Jit(#[from] JitError),
}

impl RunError {
    /// Map each error variant to its process exit code.
    ///
    /// - `2`: input error (nothing was mapped or executed)
    /// - `1`: engine failure
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.exit_code_num())
    }

    pub fn exit_code_num(&self) -> u8 {
        match self {
            Self::InvalidHex(_)
            | Self::InvalidSignature(_)
            | Self::InvalidArgument { .. }
            | Self::ArgumentCount { .. }
            | Self::EmptyCode
            | Self::UnsupportedFlag { .. }
            | Self::Io(_)
            | Self::Json(_) => 2,

            Self::Jit(_) => 1,
        }
    }
}
