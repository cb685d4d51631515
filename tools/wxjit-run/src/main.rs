use std::process::ExitCode;

use clap::Parser;
use log::LevelFilter;

use wxjit_run::cli::{Cli, Command};
use wxjit_run::error::RunError;
use wxjit_run::output;
use wxjit_run::run;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // warnings always reach stderr; --verbose enables debug; RUST_LOG overrides
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_module("wxjit_runtime", level)
        .filter_module("wxjit_run", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    let config = run::engine_config(cli.strategy(), cli.region_size);
    let dump = cli.dump.as_deref();

    let result: Result<(), RunError> = cli.validate().and_then(|()| match &cli.command {
        Command::Add { arg, constant } => run::run_add(config, *constant, *arg, dump)
            .and_then(|report| Ok(output::emit(cli.output, &report)?)),
        Command::Gcd { x, y } => run::run_gcd(config, *x, *y, dump)
            .and_then(|report| Ok(output::emit(cli.output, &report)?)),
        Command::CallNative { x, y } => run::run_call_native(config, *x, *y, dump)
            .and_then(|report| Ok(output::emit(cli.output, &report)?)),
        Command::CallPointer { text } => run::run_call_pointer(config, text, dump)
            .and_then(|report| Ok(output::emit(cli.output, &report)?)),
        Command::Exec { hex, sig, args } => run::run_exec(config, hex, sig, args, dump)
            .and_then(|report| Ok(output::emit(cli.output, &report)?)),
        Command::Demo { out } => run::run_demo(cli.region_size, out)
            .and_then(|report| Ok(output::emit(cli.output, &report)?)),
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            output::emit_error(cli.output, e.exit_code_num(), &e.to_string());
            e.exit_code()
        }
    }
}
