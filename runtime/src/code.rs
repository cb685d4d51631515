//! Machine-code payloads.
//!
//! A [`CodeBuffer`] is an opaque, immutable byte sequence produced by some
//! emitter. Nothing here interprets the instructions.

use core::fmt;
use core::ops::Deref;
use std::sync::Arc;

/// Immutable machine code. Cloning shares the bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CodeBuffer {
    bytes: Arc<[u8]>,
}

/// Errors from parsing hex text into a [`CodeBuffer`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HexError {
    #[error("odd number of hex digits ({0})")]
    OddDigitCount(usize),
    #[error("invalid hex digit {found:?} at position {position}")]
    InvalidDigit { position: usize, found: char },
}

impl CodeBuffer {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Parse hex text such as `"48 89 f8 c3"` or `"4889f8c3"`.
    ///
    /// Whitespace, commas and `0x` prefixes between bytes are ignored.
    pub fn from_hex(text: &str) -> Result<Self, HexError> {
        // (byte offset in `text`, digit)
        let mut digits = Vec::with_capacity(text.len());
        let mut chars = text.char_indices().peekable();
        while let Some((position, c)) = chars.next() {
            if c.is_whitespace() || c == ',' {
                continue;
            }
            if c == '0' && matches!(chars.peek(), Some((_, 'x' | 'X'))) {
                chars.next();
                continue;
            }
            digits.push((position, c));
        }
        if digits.len() % 2 != 0 {
            return Err(HexError::OddDigitCount(digits.len()));
        }

        let nibble = |(position, found): (usize, char)| {
            found
                .to_digit(16)
                .map(|d| d as u8)
                .ok_or(HexError::InvalidDigit { position, found })
        };
        let mut bytes = Vec::with_capacity(digits.len() / 2);
        for pair in digits.chunks_exact(2) {
            bytes.push(nibble(pair[0])? << 4 | nibble(pair[1])?);
        }
        Ok(Self::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Deref for CodeBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl AsRef<[u8]> for CodeBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<Vec<u8>> for CodeBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for CodeBuffer {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes)
    }
}

/// Space-separated lowercase hex, e.g. `48 89 f8 c3`.
impl fmt::Display for CodeBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.bytes.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for CodeBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodeBuffer({} bytes: {})", self.len(), self)
    }
}
