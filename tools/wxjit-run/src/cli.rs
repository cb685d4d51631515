use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use wxjit_runtime::Strategy;

use crate::error::RunError;
use crate::output::OutputFormat;

/// Install raw x86-64 machine code into an executable region and call it.
#[derive(Parser, Debug)]
#[command(name = "wxjit-run", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Output format for all subcommands.
    #[arg(long, value_enum, default_value = "human", global = true)]
    pub output: OutputFormat,

    /// Permission strategy (default `wx`). `rwx` maps code writable and
    /// executable at once and does not enforce W^X. Not accepted by `demo`.
    #[arg(long, value_enum, global = true)]
    pub strategy: Option<StrategyArg>,

    /// Minimum region size in bytes (rounded up to whole pages).
    #[arg(long, default_value_t = 1024, global = true)]
    pub region_size: usize,

    /// Write the installed code bytes to this file. Not accepted by `demo`,
    /// which takes `--out`.
    #[arg(long, global = true)]
    pub dump: Option<PathBuf>,

    /// Log region lifecycle at debug level (RUST_LOG overrides).
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run `long f(long x) { return x + CONSTANT; }`.
    Add {
        /// Argument passed to the function.
        #[arg(allow_hyphen_values = true)]
        arg: i64,

        /// Constant added to the argument.
        #[arg(long, default_value_t = 4, allow_hyphen_values = true)]
        constant: i32,
    },

    /// Run an iterative gcd over two non-zero unsigned integers.
    Gcd { x: u32, y: u32 },

    /// Run `int f(int x, int y) { return multiply(x + y, y); }`, where
    /// `multiply` is a host function reached by a tail jump.
    CallNative {
        #[arg(allow_hyphen_values = true)]
        x: i32,
        #[arg(allow_hyphen_values = true)]
        y: i32,
    },

    /// Run `void f(const char *s) { capture(s); }`, where `capture` is a host
    /// function that copies the string it is handed.
    CallPointer {
        /// String whose address is passed to the generated code.
        #[arg(default_value = "foobar")]
        text: String,
    },

    /// Run caller-supplied machine code. The bytes are trusted to implement
    /// the signature; if they do not, the process may crash.
    Exec {
        /// Machine code as hex, e.g. "48 89 f8 48 83 c0 04 c3".
        #[arg(long)]
        hex: String,

        /// Signature such as "i64(i64)" or "u32(u32,u32)".
        #[arg(long, default_value = "i64(i64)")]
        sig: String,

        /// Arguments, one per parameter (decimal or 0x-prefixed hex).
        #[arg(allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Run the reference demo under both strategies: `x + 4` with x = 2,
    /// dumping the direct-strategy bytes to a file. Always runs both
    /// strategies, so `--strategy` and `--dump` are rejected.
    Demo {
        /// Dump target for the direct run.
        #[arg(long, default_value = "/tmp/jitout.bin")]
        out: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum StrategyArg {
    /// Write, then flip to read-execute (W^X).
    #[default]
    Wx,
    /// Map read-write-execute once (weaker).
    Rwx,
}

impl Cli {
    /// Strategy selected on the command line, or the default.
    pub fn strategy(&self) -> Strategy {
        self.strategy.unwrap_or_default().into()
    }

    /// Reject global flags the chosen subcommand has no use for.
    pub fn validate(&self) -> Result<(), RunError> {
        if let Command::Demo { .. } = self.command {
            let flag = if self.strategy.is_some() {
                Some("--strategy")
            } else if self.dump.is_some() {
                Some("--dump")
            } else {
                None
            };
            if let Some(flag) = flag {
                return Err(RunError::UnsupportedFlag {
                    flag,
                    command: "demo",
                });
            }
        }
        Ok(())
    }
}

impl From<StrategyArg> for Strategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Wx => Strategy::WriteXorExecute,
            StrategyArg::Rwx => Strategy::Direct,
        }
    }
}
