//! Callable binding: treating a region's base address as a function.
//!
//! [`bind`] is the only place a memory address becomes something callable,
//! and it is `unsafe`: nothing here can check that the installed bytes
//! actually implement the signature. Once bound, [`CallableHandle::invoke`]
//! marshals [`Value`]s into the platform C calling convention's integer
//! argument registers and narrows the return register back to the declared
//! type.
//!
//! Only integer and pointer parameters are modelled, at most
//! [`MAX_REGISTER_ARGS`] of them, so every argument travels in a register.

use core::fmt;
use core::mem;
use core::ptr::NonNull;
use core::str::FromStr;

use log::trace;

use crate::error::{JitError, Result};
use crate::region::MemoryRegion;

/// Integer argument registers available to a call (System V x86-64: rdi, rsi,
/// rdx, rcx, r8, r9).
pub const MAX_REGISTER_ARGS: usize = 6;

/// Width and signedness of a parameter or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    I32,
    U32,
    I64,
    U64,
    Ptr,
}

impl ValueType {
    /// Width in bytes.
    pub fn width(self) -> usize {
        match self {
            Self::I32 | Self::U32 => 4,
            Self::I64 | Self::U64 => 8,
            Self::Ptr => mem::size_of::<usize>(),
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Self::I32 | Self::I64)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::I64 => "i64",
            Self::U64 => "u64",
            Self::Ptr => "ptr",
        };
        f.write_str(name)
    }
}

/// A typed argument or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Ptr(usize),
}

impl Value {
    pub fn ty(self) -> ValueType {
        match self {
            Self::I32(_) => ValueType::I32,
            Self::U32(_) => ValueType::U32,
            Self::I64(_) => ValueType::I64,
            Self::U64(_) => ValueType::U64,
            Self::Ptr(_) => ValueType::Ptr,
        }
    }

    /// Parse `text` as a value of type `ty`.
    ///
    /// Decimal takes an optional `-`. Hex (`0x`) may also carry a `-`, and
    /// for signed types spans the full width as a bit pattern, so `0xffffffff`
    /// is `-1` for `i32`.
    pub fn parse(ty: ValueType, text: &str) -> core::result::Result<Self, ParseValueError> {
        let text = text.trim();
        let (negative, body) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) else {
            return Ok(match ty {
                ValueType::I32 => Self::I32(text.parse()?),
                ValueType::U32 => Self::U32(text.parse()?),
                ValueType::I64 => Self::I64(text.parse()?),
                ValueType::U64 => Self::U64(text.parse()?),
                ValueType::Ptr => Self::Ptr(text.parse()?),
            });
        };

        let magnitude = u64::from_str_radix(hex, 16)?;
        let bits = ty.width() * 8;
        let out_of_range = || ParseValueError::OutOfRange {
            text: text.to_string(),
            ty,
        };
        let raw = if negative {
            if !ty.is_signed() || magnitude > 1u64 << (bits - 1) {
                return Err(out_of_range());
            }
            magnitude.wrapping_neg()
        } else {
            if bits < 64 && magnitude >> bits != 0 {
                return Err(out_of_range());
            }
            magnitude
        };
        Ok(Self::from_register(ty, raw))
    }

    /// Widen to a full register; signed types sign-extend.
    fn to_register(self) -> u64 {
        match self {
            Self::I32(v) => v as i64 as u64,
            Self::U32(v) => v as u64,
            Self::I64(v) => v as u64,
            Self::U64(v) => v,
            Self::Ptr(v) => v as u64,
        }
    }

    /// Narrow a raw return register to `ty`. Bits above the type's width are
    /// unspecified by the ABI and discarded.
    fn from_register(ty: ValueType, raw: u64) -> Self {
        match ty {
            ValueType::I32 => Self::I32(raw as u32 as i32),
            ValueType::U32 => Self::U32(raw as u32),
            ValueType::I64 => Self::I64(raw as i64),
            ValueType::U64 => Self::U64(raw),
            ValueType::Ptr => Self::Ptr(raw as usize),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I32(v) => write!(f, "{}", v),
            Self::U32(v) => write!(f, "{}", v),
            Self::I64(v) => write!(f, "{}", v),
            Self::U64(v) => write!(f, "{}", v),
            Self::Ptr(v) => write!(f, "{:#x}", v),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::U32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::U64(v)
    }
}

/// Parameter and return types of a function installed in a region.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionSignature {
    params: Vec<ValueType>,
    ret: Option<ValueType>,
}

impl FunctionSignature {
    /// Fails with [`JitError::SignatureMismatch`] when the parameters do not
    /// fit in argument registers.
    pub fn new(params: impl Into<Vec<ValueType>>, ret: Option<ValueType>) -> Result<Self> {
        let params = params.into();
        if params.len() > MAX_REGISTER_ARGS {
            return Err(JitError::SignatureMismatch {
                operation: "signature",
                expected: params[..MAX_REGISTER_ARGS].to_vec(),
                found: params,
            });
        }
        Ok(Self { params, ret })
    }

    /// For signatures known to fit in registers.
    pub(crate) fn from_parts(params: Vec<ValueType>, ret: Option<ValueType>) -> Self {
        debug_assert!(params.len() <= MAX_REGISTER_ARGS);
        Self { params, ret }
    }

    pub fn params(&self) -> &[ValueType] {
        &self.params
    }

    pub fn ret(&self) -> Option<ValueType> {
        self.ret
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    fn check_args(&self, args: &[Value]) -> Result<()> {
        let matches = args.len() == self.params.len()
            && args.iter().zip(&self.params).all(|(a, p)| a.ty() == *p);
        if matches {
            Ok(())
        } else {
            Err(JitError::SignatureMismatch {
                operation: "invoke",
                expected: self.params.clone(),
                found: args.iter().map(|a| a.ty()).collect(),
            })
        }
    }
}

/// `ret(param, ...)`, with `void` for no return value.
impl fmt::Display for FunctionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ret {
            Some(ty) => write!(f, "{}(", ty)?,
            None => f.write_str("void(")?,
        }
        for (i, ty) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", ty)?;
        }
        f.write_str(")")
    }
}

/// Errors from parsing signature text such as `i64(i64,i64)`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseSignatureError {
    #[error("expected `ret(params)`, got `{0}`")]
    Malformed(String),
    #[error("unknown type `{0}`")]
    UnknownType(String),
    #[error("at most 6 parameters are supported, got {0}")]
    TooManyParams(usize),
}

/// Errors from parsing argument text into a [`Value`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseValueError {
    #[error(transparent)]
    Int(#[from] core::num::ParseIntError),
    #[error("{text} does not fit in {ty}")]
    OutOfRange { text: String, ty: ValueType },
}

impl FromStr for ValueType {
    type Err = ParseSignatureError;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.trim() {
            "i32" => Ok(Self::I32),
            "u32" => Ok(Self::U32),
            "i64" => Ok(Self::I64),
            "u64" => Ok(Self::U64),
            "ptr" | "usize" => Ok(Self::Ptr),
            other => Err(ParseSignatureError::UnknownType(other.to_string())),
        }
    }
}

impl FromStr for FunctionSignature {
    type Err = ParseSignatureError;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        let malformed = || ParseSignatureError::Malformed(s.to_string());
        let (ret, rest) = s.trim().split_once('(').ok_or_else(malformed)?;
        let params = rest.strip_suffix(')').ok_or_else(malformed)?;

        let ret = match ret.trim() {
            "void" => None,
            ty => Some(ty.parse()?),
        };
        let params = if params.trim().is_empty() {
            Vec::new()
        } else {
            params
                .split(',')
                .map(str::parse)
                .collect::<core::result::Result<Vec<ValueType>, _>>()?
        };
        if params.len() > MAX_REGISTER_ARGS {
            return Err(ParseSignatureError::TooManyParams(params.len()));
        }
        Ok(Self { params, ret })
    }
}

/// A region bound to a signature. Borrowing the region keeps it mapped and
/// unwritable-by-others for as long as the handle lives.
#[derive(Debug)]
pub struct CallableHandle<'r> {
    region: &'r MemoryRegion,
    entry: NonNull<u8>,
    signature: FunctionSignature,
}

// SAFETY: the handle only reads the region and calls into it. The borrow
// excludes writes, protection changes and release for the handle's lifetime,
// so concurrent invocations never race with a mutation.
unsafe impl Send for CallableHandle<'_> {}
unsafe impl Sync for CallableHandle<'_> {}

/// Bind `region` as a function with `signature`.
///
/// Fails with [`JitError::InvalidState`] unless the region is currently
/// executable.
///
/// # Safety
///
/// The bytes at the region's base must be a complete function body that
/// follows the platform C calling convention for `signature`. If they do not,
/// any later [`CallableHandle::invoke`] is undefined behaviour (illegal
/// instruction, corrupted stack, wrong result or crash).
pub unsafe fn bind(
    region: &MemoryRegion,
    signature: FunctionSignature,
) -> Result<CallableHandle<'_>> {
    if !region.is_executable() {
        return Err(JitError::InvalidState {
            operation: "bind",
            region: region.id(),
            permission: region.permission(),
        });
    }
    Ok(CallableHandle {
        region,
        entry: region.entry(),
        signature,
    })
}

impl CallableHandle<'_> {
    pub fn signature(&self) -> &FunctionSignature {
        &self.signature
    }

    pub fn region(&self) -> &MemoryRegion {
        self.region
    }

    /// Call the bound function. Returns `None` for `void` signatures.
    ///
    /// Arguments are checked against the signature before control leaves
    /// this crate; a mismatch fails with [`JitError::SignatureMismatch`] and
    /// nothing is executed.
    pub fn invoke(&self, args: &[Value]) -> Result<Option<Value>> {
        if !self.region.is_executable() {
            return Err(JitError::InvalidState {
                operation: "invoke",
                region: self.region.id(),
                permission: self.region.permission(),
            });
        }
        self.signature.check_args(args)?;

        let mut regs = [0u64; MAX_REGISTER_ARGS];
        for (reg, arg) in regs.iter_mut().zip(args) {
            *reg = arg.to_register();
        }
        trace!("region {}: invoke {} {:?}", self.region.id(), self.signature, args);

        // SAFETY: `bind`'s caller vouched that the entry point implements
        // `self.signature`, and the borrow keeps the region mapped executable.
        let raw = unsafe { call_entry(self.entry, &regs[..args.len()]) };
        Ok(self.signature.ret.map(|ty| Value::from_register(ty, raw)))
    }
}

/// Transfer control to `entry`, passing `args` in the integer argument
/// registers, and return the raw return register.
///
/// # Safety
///
/// `entry` must point at executable code implementing a C-ABI function that
/// takes exactly `args.len()` integer parameters. `args.len()` must not exceed
/// [`MAX_REGISTER_ARGS`].
unsafe fn call_entry(entry: NonNull<u8>, args: &[u64]) -> u64 {
    type F0 = unsafe extern "C" fn() -> u64;
    type F1 = unsafe extern "C" fn(u64) -> u64;
    type F2 = unsafe extern "C" fn(u64, u64) -> u64;
    type F3 = unsafe extern "C" fn(u64, u64, u64) -> u64;
    type F4 = unsafe extern "C" fn(u64, u64, u64, u64) -> u64;
    type F5 = unsafe extern "C" fn(u64, u64, u64, u64, u64) -> u64;
    type F6 = unsafe extern "C" fn(u64, u64, u64, u64, u64, u64) -> u64;

    let addr = entry.as_ptr() as *const ();
    // SAFETY: guaranteed by the caller. Function pointers and data pointers
    // share a representation on every supported target.
    unsafe {
        match *args {
            [] => mem::transmute::<*const (), F0>(addr)(),
            [a] => mem::transmute::<*const (), F1>(addr)(a),
            [a, b] => mem::transmute::<*const (), F2>(addr)(a, b),
            [a, b, c] => mem::transmute::<*const (), F3>(addr)(a, b, c),
            [a, b, c, d] => mem::transmute::<*const (), F4>(addr)(a, b, c, d),
            [a, b, c, d, e] => mem::transmute::<*const (), F5>(addr)(a, b, c, d, e),
            [a, b, c, d, e, g, ..] => mem::transmute::<*const (), F6>(addr)(a, b, c, d, e, g),
        }
    }
}
