//! Property: writes land exactly where requested, and rejected writes land nowhere
//!
//! - For any byte sequence `B` that fits, `write_into(region, B, offset)` on a
//!   writable region reads back as `B` at `offset`, and all other bytes keep
//!   their previous value.
//! - For any write with `offset + len(B) > size`, the call fails with
//!   `OutOfBounds` and the region's bytes are unchanged.

use proptest::prelude::*;
use wxjit_runtime::{dump, JitError, Permission, Strategy as CodeStrategy};

fn arb_bytes() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 1..512)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn write_then_read_back(bytes in arb_bytes(), offset in 0usize..3000) {
        let mut region = CodeStrategy::WriteXorExecute.allocate(4096).unwrap();
        prop_assume!(offset + bytes.len() <= region.size());

        let before = region.bytes().unwrap().to_vec();
        prop_assert_eq!(region.write_into(&bytes, offset).unwrap(), bytes.len());

        let after = region.bytes().unwrap();
        prop_assert_eq!(&after[offset..offset + bytes.len()], &bytes[..]);
        prop_assert_eq!(&after[..offset], &before[..offset]);
        prop_assert_eq!(&after[offset + bytes.len()..], &before[offset + bytes.len()..]);
    }

    #[test]
    fn read_back_through_dump_channel(bytes in arb_bytes()) {
        let mut region = CodeStrategy::Direct.allocate(bytes.len()).unwrap();
        region.write_into(&bytes, 0).unwrap();

        let mut out = Vec::new();
        dump::dump_to_writer(&region, bytes.len(), &mut out).unwrap();
        prop_assert_eq!(out, bytes);
    }

    #[test]
    fn out_of_bounds_modifies_nothing(bytes in arb_bytes(), overshoot in 1usize..512) {
        let mut region = CodeStrategy::WriteXorExecute.allocate(64).unwrap();
        region.write_into([0x5Au8; 64], 0).unwrap();
        let size = region.size();
        let offset = (size + overshoot).saturating_sub(bytes.len());
        let before = region.bytes().unwrap().to_vec();

        let err = region.write_into(&bytes, offset).unwrap_err();
        let is_out_of_bounds = matches!(err, JitError::OutOfBounds { .. });
        prop_assert!(is_out_of_bounds);
        prop_assert_eq!(region.bytes().unwrap(), &before[..]);
    }

    #[test]
    fn sealed_region_rejects_writes(bytes in arb_bytes()) {
        let mut region = CodeStrategy::WriteXorExecute.allocate(bytes.len()).unwrap();
        region.protect(Permission::ReadExecute).unwrap();
        let err = region.write_into(&bytes, 0).unwrap_err();
        let is_not_writable = matches!(err, JitError::NotWritable { .. });
        prop_assert!(is_not_writable);
    }
}
