//! Output formatting and exit-code mapping.

use colored::Colorize;
use virtshift_core::types::ErrorResponse;
use virtshift_core::ShiftError;

/// Top-level output mode for operation results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputMode {
    Text,
    Json,
}

/// Print an error in the selected mode and return its exit code.
pub fn report_error(err: &ShiftError, mode: OutputMode, operation_id: Option<String>) -> i32 {
    match mode {
        OutputMode::Json => {
            let response = ErrorResponse::from_error(err, operation_id);
            println!("{}", serde_json::to_string_pretty(&response).unwrap_or_default());
        }
        OutputMode::Text => {
            eprintln!("{} {}", "error:".red().bold(), err);
            if let Some(steps) = err.remediation() {
                eprintln!();
                eprintln!("{}", "Try the following:".yellow());
                for (i, step) in steps.iter().enumerate() {
                    eprintln!("  {}. {}", i + 1, step);
                }
            }
        }
    }
    err.exit_code()
}

/// Print a serializable payload as pretty JSON.
pub fn print_json<T: serde::Serialize>(value: &T) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

/// Human-readable byte count.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Human-readable duration in seconds.
pub fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        return format!("{:.1}s", secs);
    }
    let total = secs as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}h{:02}m{:02}s", h, m, s)
    } else {
        format!("{}m{:02}s", m, s)
    }
}
