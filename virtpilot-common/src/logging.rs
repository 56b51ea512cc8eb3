//! Logging initialization using tracing.

use anyhow::{bail, Context, Result};
use std::str::FromStr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Output format of the log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable, one event per line
    #[default]
    Pretty,
    /// One JSON object per event, for log aggregation
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => bail!("unknown log format '{}'", other),
        }
    }
}

/// Build the event filter for `level`.
///
/// `RUST_LOG`, when set and valid, takes precedence over `level`. The level
/// itself must be one of trace, debug, info, warn, error.
pub fn build_filter(level: &str) -> Result<EnvFilter> {
    let level = level.trim().to_ascii_lowercase();
    if !LEVELS.contains(&level.as_str()) {
        bail!(
            "invalid log level '{}', expected one of: {}",
            level,
            LEVELS.join(", ")
        );
    }

    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&level).context("failed to build log filter"),
    }
}

/// Initialize the tracing subscriber with the specified log level.
///
/// # Arguments
/// * `level` - Log level string (trace, debug, info, warn, error)
/// * `format` - Pretty text or JSON lines
///
/// Fails if the level is unknown or a global subscriber is already set.
pub fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = build_filter(level)?;
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .try_init(),
    }
    .context("failed to install tracing subscriber")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_levels_accepted() {
        for level in LEVELS {
            assert!(build_filter(level).is_ok(), "{} should be accepted", level);
        }
        assert!(build_filter("INFO").is_ok());
    }

    #[test]
    fn test_unknown_level_rejected() {
        let err = build_filter("verbose").unwrap_err();
        assert!(err.to_string().contains("invalid log level"));
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
