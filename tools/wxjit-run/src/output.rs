use serde::Serialize;
use std::fmt;

/// Output format selection for all subcommands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Single JSON object on stdout.
    Json,
    /// Human-readable summary on stdout.
    #[default]
    Human,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Human => write!(f, "human"),
        }
    }
}

/// Write a successful result to stdout.
///
/// - **Json**: a single JSON object, no extraneous text.
/// - **Human**: the value's `Display` form.
pub fn emit<T: Serialize + fmt::Display>(
    format: OutputFormat,
    value: &T,
) -> Result<(), serde_json::Error> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(value)?),
        OutputFormat::Human => println!("{value}"),
    }
    Ok(())
}

/// Write an error to stdout (JSON mode) or stderr (human mode).
pub fn emit_error(format: OutputFormat, exit_code_num: u8, message: &str) {
    match format {
        OutputFormat::Json => {
            // JSON errors go to stdout so the caller always gets valid JSON on stdout.
            println!("{}", error_json(exit_code_num, message));
        }
        OutputFormat::Human => {
            eprintln!("error: {message}");
        }
    }
}

fn error_json(exit_code_num: u8, message: &str) -> String {
    let obj = serde_json::json!({
        "error": message,
        "exit_code": exit_code_num,
    });
    serde_json::to_string(&obj).unwrap_or_else(|_| format!("{{\"error\":{message:?}}}"))
}
