//! Ready-made x86-64 System V function bodies.
//!
//! These stand in for an external code generator: each returns finished bytes
//! and the signature they implement. They are fixed templates with at most an
//! immediate patched in, not an assembler.

use crate::callable::{FunctionSignature, ValueType};
use crate::code::CodeBuffer;

/// `long f(long x) { return x + k; }`
///
/// ```text
/// 48 89 f8             mov rax, rdi
/// 48 83 c0 ib          add rax, imm8     (when k fits in i8)
/// 48 05 id             add rax, imm32    (otherwise)
/// c3                   ret
/// ```
pub fn add_constant(k: i32) -> CodeBuffer {
    let mut code = vec![0x48, 0x89, 0xf8];
    match i8::try_from(k) {
        Ok(imm8) => code.extend_from_slice(&[0x48, 0x83, 0xc0, imm8 as u8]),
        Err(_) => {
            code.extend_from_slice(&[0x48, 0x05]);
            code.extend_from_slice(&k.to_le_bytes());
        }
    }
    code.push(0xc3);
    CodeBuffer::from(code)
}

/// `i64(i64)`
pub fn add_constant_signature() -> FunctionSignature {
    unary(ValueType::I64)
}

/// `unsigned gcd(unsigned x, unsigned y)` by repeated subtraction.
///
/// Both arguments must be non-zero; `gcd(0, y)` never terminates.
///
/// ```text
/// 0:  39 f7       cmp edi, esi
/// 2:  74 0a       je  14
/// 4:  72 04       jb  10
/// 6:  29 f7       sub edi, esi
/// 8:  eb f6       jmp 0
/// 10: 29 fe       sub esi, edi
/// 12: eb f2       jmp 0
/// 14: 89 f8       mov eax, edi
/// 16: c3          ret
/// ```
pub fn gcd() -> CodeBuffer {
    CodeBuffer::from(vec![
        0x39, 0xf7, // cmp edi, esi
        0x74, 0x0a, // je done
        0x72, 0x04, // jb less
        0x29, 0xf7, // sub edi, esi
        0xeb, 0xf6, // jmp loop
        0x29, 0xfe, // less: sub esi, edi
        0xeb, 0xf2, // jmp loop
        0x89, 0xf8, // done: mov eax, edi
        0xc3, // ret
    ])
}

/// `u32(u32,u32)`
pub fn gcd_signature() -> FunctionSignature {
    binary(ValueType::U32)
}

/// `int f(int x, int y) { return target(x + y, y); }`
///
/// `target` must be the address of an `extern "C" fn(i32, i32) -> i32`. The
/// call is a tail jump, so the stack the target sees is the caller's.
///
/// ```text
/// 01 f7                add edi, esi
/// 48 b8 <imm64>        movabs rax, target
/// ff e0                jmp rax
/// ```
pub fn tail_call(target: usize) -> CodeBuffer {
    let mut code = vec![0x01, 0xf7, 0x48, 0xb8];
    code.extend_from_slice(&(target as u64).to_le_bytes());
    code.extend_from_slice(&[0xff, 0xe0]);
    CodeBuffer::from(code)
}

/// `i32(i32,i32)`
pub fn tail_call_signature() -> FunctionSignature {
    binary(ValueType::I32)
}

/// `void f(const char *s) { target(s); }`
///
/// `target` must be the address of an `extern "C" fn(*const c_char)`. The
/// pointer is already in the first argument register, so the body is only
/// a tail jump.
///
/// ```text
/// 48 b8 <imm64>        movabs rax, target
/// ff e0                jmp rax
/// ```
pub fn call_with_pointer(target: usize) -> CodeBuffer {
    let mut code = vec![0x48, 0xb8];
    code.extend_from_slice(&(target as u64).to_le_bytes());
    code.extend_from_slice(&[0xff, 0xe0]);
    CodeBuffer::from(code)
}

/// `void(ptr)`
pub fn call_with_pointer_signature() -> FunctionSignature {
    FunctionSignature::from_parts(vec![ValueType::Ptr], None)
}

fn unary(ty: ValueType) -> FunctionSignature {
    FunctionSignature::from_parts(vec![ty], Some(ty))
}

fn binary(ty: ValueType) -> FunctionSignature {
    FunctionSignature::from_parts(vec![ty, ty], Some(ty))
}
