//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the filter:
//! 1. `--log-level` / `--debug` CLI flags
//! 2. `STRATUM_DEBUG=1`
//! 3. `STRATUM_LOG` environment variable, either a level ("debug") or a
//!    full directive ("stratum::orchestration=trace,info")
//! 4. default to `info`
//!
//! Logs go to stderr so stdout stays clean for JSON reports.

use tracing_subscriber::{fmt, EnvFilter};

pub const ENV_LOG: &str = "STRATUM_LOG";
pub const ENV_DEBUG: &str = "STRATUM_DEBUG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Install the global subscriber.
///
/// A second call is a no-op.
pub fn init_logging(cli_level: Option<LogLevel>) {
    let directive = resolve_directive(
        cli_level,
        std::env::var(ENV_DEBUG).ok().as_deref(),
        std::env::var(ENV_LOG).ok().as_deref(),
    );
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Filter directive for the given CLI level and environment values.
fn resolve_directive(cli_level: Option<LogLevel>, debug_env: Option<&str>, log_env: Option<&str>) -> String {
    if let Some(level) = cli_level {
        return level.as_str().to_string();
    }
    if debug_env.is_some_and(is_truthy) {
        return LogLevel::Debug.as_str().to_string();
    }
    match log_env.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => match parse_level_str(s) {
            Some(level) => level.as_str().to_string(),
            None if EnvFilter::try_new(s).is_ok() => s.to_string(),
            None => LogLevel::Info.as_str().to_string(),
        },
        None => LogLevel::Info.as_str().to_string(),
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "yes")
}

fn parse_level_str(s: &str) -> Option<LogLevel> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(LogLevel::Error),
        "warn" | "warning" => Some(LogLevel::Warn),
        "info" => Some(LogLevel::Info),
        "debug" => Some(LogLevel::Debug),
        "trace" => Some(LogLevel::Trace),
        _ => None,
    }
}
