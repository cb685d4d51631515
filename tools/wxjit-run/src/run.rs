use std::cell::RefCell;
use std::ffi::{c_char, CStr, CString};
use std::fmt;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::Serialize;
use wxjit_runtime::{
    templates, CodeBuffer, EngineConfig, FunctionSignature, JitEngine, Strategy, Value,
};

use crate::error::RunError;

/// Outcome of one install-and-call.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub strategy: String,
    pub signature: String,
    /// Installed bytes as space-separated hex.
    pub code: String,
    pub code_len: usize,
    pub region_id: u64,
    pub region_size: usize,
    pub args: Vec<String>,
    /// `None` for `void` signatures.
    pub result: Option<String>,
    pub dumped_to: Option<PathBuf>,
    /// What a host function received from the generated code, if anything.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captured: Option<String>,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "strategy:  {}", self.strategy)?;
        writeln!(f, "signature: {}", self.signature)?;
        writeln!(f, "code:      {} ({} bytes)", self.code, self.code_len)?;
        writeln!(
            f,
            "region:    #{} ({} bytes)",
            self.region_id, self.region_size
        )?;
        if let Some(path) = &self.dumped_to {
            writeln!(f, "dumped to: {}", path.display())?;
        }
        if let Some(text) = &self.captured {
            writeln!(f, "host saw:  {:?}", text)?;
        }
        write!(f, "result = {}", self.result.as_deref().unwrap_or("void"))
    }
}

/// Both halves of the reference demo.
#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    pub direct: RunReport,
    pub write_xor_execute: RunReport,
}

impl fmt::Display for DemoReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.direct)?;
        writeln!(f)?;
        write!(f, "{}", self.write_xor_execute)
    }
}

/// Engine configuration from command-line settings.
pub fn engine_config(strategy: Strategy, region_size: usize) -> EngineConfig {
    EngineConfig {
        strategy,
        region_size,
        ..EngineConfig::default()
    }
}

pub fn run_add(
    config: EngineConfig,
    constant: i32,
    arg: i64,
    dump: Option<&Path>,
) -> Result<RunReport, RunError> {
    // SAFETY: the template implements its own signature.
    unsafe {
        execute(
            config,
            templates::add_constant(constant),
            templates::add_constant_signature(),
            vec![Value::I64(arg)],
            dump,
        )
    }
}

pub fn run_gcd(
    config: EngineConfig,
    x: u32,
    y: u32,
    dump: Option<&Path>,
) -> Result<RunReport, RunError> {
    // gcd by subtraction never terminates on a zero operand
    for (index, value) in [(0, x), (1, y)] {
        if value == 0 {
            return Err(RunError::InvalidArgument {
                index,
                text: value.to_string(),
                ty: "u32".into(),
                reason: "must be non-zero".into(),
            });
        }
    }
    // SAFETY: the template implements its own signature.
    unsafe {
        execute(
            config,
            templates::gcd(),
            templates::gcd_signature(),
            vec![Value::U32(x), Value::U32(y)],
            dump,
        )
    }
}

/// Host function the generated code tail-calls into.
pub extern "C" fn multiply(a: i32, b: i32) -> i32 {
    a.wrapping_mul(b)
}

pub fn run_call_native(
    config: EngineConfig,
    x: i32,
    y: i32,
    dump: Option<&Path>,
) -> Result<RunReport, RunError> {
    let target = multiply as extern "C" fn(i32, i32) -> i32 as usize;
    // SAFETY: the template implements its own signature, and `target` is an
    // `extern "C" fn(i32, i32) -> i32` that lives for the whole process.
    unsafe {
        execute(
            config,
            templates::tail_call(target),
            templates::tail_call_signature(),
            vec![Value::I32(x), Value::I32(y)],
            dump,
        )
    }
}

thread_local! {
    static CAPTURED: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Host function the generated code hands a string pointer to.
///
/// # Safety
///
/// `s` must point at a NUL-terminated string.
pub unsafe extern "C" fn capture(s: *const c_char) {
    // SAFETY: guaranteed by the caller.
    let text = unsafe { CStr::from_ptr(s) }.to_string_lossy().into_owned();
    CAPTURED.with(|captured| *captured.borrow_mut() = Some(text));
}

pub fn run_call_pointer(
    config: EngineConfig,
    text: &str,
    dump: Option<&Path>,
) -> Result<RunReport, RunError> {
    let text = CString::new(text).map_err(|e| RunError::InvalidArgument {
        index: 0,
        text: text.to_string(),
        ty: "ptr".into(),
        reason: e.to_string(),
    })?;
    CAPTURED.with(|captured| captured.borrow_mut().take());

    let target = capture as unsafe extern "C" fn(*const c_char) as usize;
    // SAFETY: the template implements its own signature, `target` is an
    // `unsafe extern "C" fn(*const c_char)` living for the whole process, and
    // `text` stays alive and NUL-terminated until `execute` returns.
    let mut report = unsafe {
        execute(
            config,
            templates::call_with_pointer(target),
            templates::call_with_pointer_signature(),
            vec![Value::Ptr(text.as_ptr() as usize)],
            dump,
        )
    }?;
    report.captured = CAPTURED.with(|captured| captured.borrow_mut().take());
    Ok(report)
}

/// Run caller-supplied bytes.
pub fn run_exec(
    config: EngineConfig,
    hex: &str,
    sig: &str,
    args: &[String],
    dump: Option<&Path>,
) -> Result<RunReport, RunError> {
    let code = CodeBuffer::from_hex(hex)?;
    if code.is_empty() {
        return Err(RunError::EmptyCode);
    }
    let signature: FunctionSignature = sig.parse()?;
    let values = parse_args(&signature, args)?;
    // SAFETY: the `exec` subcommand documents that the user vouches for the
    // bytes implementing `signature`.
    unsafe { execute(config, code, signature, values, dump) }
}

/// Parse one argument per signature parameter.
pub fn parse_args(signature: &FunctionSignature, args: &[String]) -> Result<Vec<Value>, RunError> {
    if args.len() != signature.arity() {
        return Err(RunError::ArgumentCount {
            signature: signature.to_string(),
            expected: signature.arity(),
            found: args.len(),
        });
    }
    signature
        .params()
        .iter()
        .zip(args)
        .enumerate()
        .map(|(index, (&ty, text))| {
            Value::parse(ty, text).map_err(|e| RunError::InvalidArgument {
                index,
                text: text.clone(),
                ty: ty.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Run the reference demo: direct strategy with a dump, then W^X.
pub fn run_demo(region_size: usize, out: &Path) -> Result<DemoReport, RunError> {
    let direct = run_add(engine_config(Strategy::Direct, region_size), 4, 2, Some(out))?;
    let write_xor_execute =
        run_add(engine_config(Strategy::WriteXorExecute, region_size), 4, 2, None)?;
    Ok(DemoReport {
        direct,
        write_xor_execute,
    })
}

/// Install `code`, call it once with `args`, and describe what happened.
///
/// A failed dump is logged and reported as `dumped_to: None`; it never fails
/// the run.
///
/// # Safety
///
/// `code` must implement `signature`; see [`JitEngine::install`].
unsafe fn execute(
    config: EngineConfig,
    code: CodeBuffer,
    signature: FunctionSignature,
    args: Vec<Value>,
    dump: Option<&Path>,
) -> Result<RunReport, RunError> {
    let strategy = config.strategy;
    if strategy.is_weaker() {
        warn!("running with the direct strategy: code pages are writable and executable");
    }
    let engine = JitEngine::new(config);
    // SAFETY: forwarded from the caller.
    let function = unsafe { engine.install(code.clone(), signature.clone()) }?;

    let dumped_to = dump.and_then(|path| match function.dump_to(path) {
        Ok(n) => {
            info!("emitted {} bytes to {}", n, path.display());
            Some(path.to_path_buf())
        }
        Err(e) => {
            warn!("{}", e);
            None
        }
    });

    let result = function.invoke(&args)?;
    let report = RunReport {
        strategy: strategy.to_string(),
        signature: signature.to_string(),
        code: code.to_string(),
        code_len: code.len(),
        region_id: function.region().id().0,
        region_size: function.region().size(),
        args: args.iter().map(Value::to_string).collect(),
        result: result.map(|v| v.to_string()),
        dumped_to,
        captured: None,
    };
    function.release()?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_args_counts_and_types() {
        let sig: FunctionSignature = "u32(u32,i64)".parse().unwrap();
        let args = vec!["7".to_string(), "-3".to_string()];
        assert_eq!(
            parse_args(&sig, &args).unwrap(),
            vec![Value::U32(7), Value::I64(-3)]
        );

        assert!(matches!(
            parse_args(&sig, &args[..1]),
            Err(RunError::ArgumentCount { expected: 2, found: 1, .. })
        ));

        let bad = vec!["-1".to_string(), "0".to_string()];
        assert!(matches!(
            parse_args(&sig, &bad),
            Err(RunError::InvalidArgument { index: 0, .. })
        ));
    }

    #[test]
    fn gcd_rejects_zero_before_mapping() {
        let err = run_gcd(EngineConfig::default(), 0, 5, None).unwrap_err();
        assert_eq!(err.exit_code_num(), 2);
    }

    #[test]
    fn call_pointer_rejects_interior_nul() {
        let err = run_call_pointer(EngineConfig::default(), "a\0b", None).unwrap_err();
        assert!(matches!(err, RunError::InvalidArgument { index: 0, .. }));
    }

    #[test]
    fn exec_rejects_empty_code() {
        let err = run_exec(EngineConfig::default(), "  ", "void()", &[], None).unwrap_err();
        assert!(matches!(err, RunError::EmptyCode));
    }
}
