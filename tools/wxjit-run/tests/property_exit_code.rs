//! Property 1: Exit code contract
//!
//! For any `RunError` variant, `exit_code_num()` returns 1 or 2.
//! Input errors (nothing was mapped or executed) map to 2, engine errors map
//! to 1.

use proptest::prelude::*;
use std::process::ExitCode;
use wxjit_run::error::RunError;
use wxjit_runtime::callable::ParseSignatureError;
use wxjit_runtime::code::HexError;
use wxjit_runtime::{JitError, Permission, RegionId};

fn arb_permission() -> impl Strategy<Value = Permission> {
    prop_oneof![
        Just(Permission::ReadWrite),
        Just(Permission::ReadExecute),
        Just(Permission::ReadWriteExecute),
        Just(Permission::Unmapped),
    ]
}

fn arb_jit_error() -> impl Strategy<Value = JitError> {
    (0..4u8, 1..1000u64, 0..65536usize, 0..65536usize, arb_permission()).prop_map(
        |(tag, id, a, b, permission)| {
            let region = RegionId(id);
            match tag {
                0 => JitError::OutOfBounds {
                    region,
                    offset: a,
                    len: b,
                    capacity: a / 2,
                },
                1 => JitError::NotWritable { region, permission },
                2 => JitError::InvalidState {
                    operation: "bind",
                    region,
                    permission,
                },
                _ => JitError::Release {
                    region,
                    reason: "region already released",
                    source: None,
                },
            }
        },
    )
}

/// Strategy that produces an arbitrary input-side `RunError`.
fn arb_input_error() -> impl Strategy<Value = RunError> {
    let arb_string = "[a-zA-Z0-9_ ,()\\-]{0,32}";
    (0..7u8, arb_string, 0..16usize, 0..16usize, any::<char>()).prop_map(
        |(tag, s, a, b, c)| match tag {
            0 => RunError::InvalidHex(HexError::OddDigitCount(a * 2 + 1)),
            1 => RunError::InvalidHex(HexError::InvalidDigit {
                position: a,
                found: c,
            }),
            2 => RunError::InvalidSignature(ParseSignatureError::Malformed(s)),
            3 => RunError::InvalidArgument {
                index: a,
                text: s,
                ty: "i64".into(),
                reason: "invalid digit found in string".into(),
            },
            4 => RunError::ArgumentCount {
                signature: s,
                expected: a,
                found: b,
            },
            5 => RunError::EmptyCode,
            _ => RunError::UnsupportedFlag {
                flag: "--dump",
                command: "demo",
            },
        },
    )
}

proptest! {
    #[test]
    fn input_errors_exit_with_2(err in arb_input_error()) {
        prop_assert_eq!(err.exit_code_num(), 2);
        prop_assert_eq!(err.exit_code(), ExitCode::from(2));
    }

    #[test]
    fn engine_errors_exit_with_1(err in arb_jit_error()) {
        let err = RunError::from(err);
        prop_assert_eq!(err.exit_code_num(), 1);
        prop_assert!(!err.to_string().is_empty());
    }
}

#[test]
fn io_and_json_errors_exit_with_2() {
    let io = RunError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
    assert_eq!(io.exit_code_num(), 2);

    let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    assert_eq!(RunError::from(json).exit_code_num(), 2);
}
