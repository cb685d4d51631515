//! Subcommand behaviour on x86-64: each run installs, calls, and unmaps.

#![cfg(all(unix, target_arch = "x86_64"))]

use wxjit_run::error::RunError;
use wxjit_run::run::{self, engine_config};
use wxjit_runtime::{JitError, Strategy};

#[test]
fn add_under_both_strategies() {
    for strategy in [Strategy::WriteXorExecute, Strategy::Direct] {
        let report = run::run_add(engine_config(strategy, 1024), 4, 2, None).unwrap();
        assert_eq!(report.result.as_deref(), Some("6"));
        assert_eq!(report.signature, "i64(i64)");
        assert_eq!(report.strategy, strategy.to_string());
        assert!(report.region_size >= 1024);
    }

    let report = run::run_add(engine_config(Strategy::Direct, 1024), 0x28, 2, None).unwrap();
    assert_eq!(report.result.as_deref(), Some("42"));
}

#[test]
fn gcd_and_call_native() {
    let config = engine_config(Strategy::WriteXorExecute, 1024);
    let gcd = run::run_gcd(config.clone(), 1071, 462, None).unwrap();
    assert_eq!(gcd.result.as_deref(), Some("21"));

    let foo = run::run_call_native(config, 3, 5, None).unwrap();
    assert_eq!(foo.result.as_deref(), Some("40"));
}

#[test]
fn call_pointer_hands_string_to_host() {
    let config = engine_config(Strategy::WriteXorExecute, 1024);
    let report = run::run_call_pointer(config, "foobar", None).unwrap();
    assert_eq!(report.signature, "void(ptr)");
    assert_eq!(report.result, None);
    assert_eq!(report.captured.as_deref(), Some("foobar"));
    assert!(report.args[0].starts_with("0x"));

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["captured"], "foobar");
}

#[test]
fn exec_user_bytes() {
    let args = vec!["-0x10".to_string()];
    // mov rax, rdi; add rax, 4; ret
    let report = run::run_exec(
        engine_config(Strategy::WriteXorExecute, 64),
        "48 89 f8 48 83 c0 04 c3",
        "i64(i64)",
        &args,
        None,
    )
    .unwrap();
    assert_eq!(report.result.as_deref(), Some("-12"));
    assert_eq!(report.code_len, 8);
    assert_eq!(report.code, "48 89 f8 48 83 c0 04 c3");
    assert!(serde_json::to_value(&report).unwrap().get("captured").is_none());
}

#[test]
fn exec_rejects_bad_input_before_mapping() {
    let config = engine_config(Strategy::WriteXorExecute, 64);
    let err = run::run_exec(config.clone(), "c", "void()", &[], None).unwrap_err();
    assert!(matches!(err, RunError::InvalidHex(_)));

    let err = run::run_exec(config.clone(), "c3", "f64()", &[], None).unwrap_err();
    assert!(matches!(err, RunError::InvalidSignature(_)));

    let err = run::run_exec(config, "c3", "i64(i64)", &[], None).unwrap_err();
    assert!(matches!(err, RunError::ArgumentCount { expected: 1, found: 0, .. }));
    assert_eq!(err.exit_code_num(), 2);
}

#[test]
fn exhausted_budget_is_engine_error() {
    let mut config = engine_config(Strategy::WriteXorExecute, 1024);
    config.max_code_bytes = 0;
    let err = run::run_add(config, 4, 2, None).unwrap_err();
    assert!(matches!(err, RunError::Jit(JitError::Allocation { .. })));
    assert_eq!(err.exit_code_num(), 1);
}

#[test]
fn dump_writes_installed_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jitout.bin");
    let report =
        run::run_add(engine_config(Strategy::Direct, 1024), 4, 2, Some(&path)).unwrap();
    assert_eq!(report.dumped_to.as_deref(), Some(path.as_path()));
    assert_eq!(
        std::fs::read(&path).unwrap(),
        [0x48, 0x89, 0xf8, 0x48, 0x83, 0xc0, 0x04, 0xc3]
    );
}

#[test]
fn failed_dump_still_runs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("no/such/dir/jitout.bin");
    let report =
        run::run_add(engine_config(Strategy::Direct, 1024), 4, 2, Some(&path)).unwrap();
    assert!(report.dumped_to.is_none());
    assert_eq!(report.result.as_deref(), Some("6"));
}

#[test]
fn demo_runs_both_strategies() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("jitout.bin");
    let demo = run::run_demo(1024, &out).unwrap();
    assert_eq!(demo.direct.result.as_deref(), Some("6"));
    assert_eq!(demo.write_xor_execute.result.as_deref(), Some("6"));
    assert_eq!(demo.direct.dumped_to.as_deref(), Some(out.as_path()));

    let json: serde_json::Value = serde_json::to_value(&demo).unwrap();
    assert_eq!(json["direct"]["strategy"], "direct-rwx");
    assert_eq!(json["write_xor_execute"]["strategy"], "w^x");
}
