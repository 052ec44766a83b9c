//! Logging setup shared by the daemon and tests
//!
//! Output always goes to stderr so that stdout stays free for submission
//! outcomes. `SYNDICAST_LOG_FORMAT` and `SYNDICAST_LOG_LEVEL` override the
//! `[logging]` section of the configuration file, and `RUST_LOG` overrides
//! both for per-module filtering.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text, no colors
    #[default]
    Text,
    /// One JSON object per line
    Json,
    /// Colored multi-line output for development
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            _ => Err(format!(
                "Invalid log format: '{}'. Valid options: text, json, pretty",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
            LogFormat::Pretty => write!(f, "pretty"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
    pub verbose: bool,
}

impl LoggingConfig {
    pub fn new(format: LogFormat, level: impl Into<String>, verbose: bool) -> Self {
        Self {
            format,
            level: level.into(),
            verbose,
        }
    }

    /// Build from the `[logging]` config section, applying env overrides
    pub fn from_section(section: &crate::config::LoggingSection, verbose: bool) -> Self {
        let format = std::env::var("SYNDICAST_LOG_FORMAT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(section.format);
        let level = std::env::var("SYNDICAST_LOG_LEVEL").unwrap_or_else(|_| section.level.clone());

        Self::new(format, level, verbose)
    }

    /// Effective filter directive before `RUST_LOG` is consulted
    pub fn directive(&self) -> &str {
        if self.verbose {
            "debug"
        } else {
            &self.level
        }
    }

    /// Install the global subscriber
    ///
    /// Returns an error if a subscriber is already installed, which happens
    /// when several tests in one process try to initialize logging.
    pub fn try_init(&self) -> Result<(), String> {
        use tracing_subscriber::EnvFilter;

        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.directive()));

        let result = match self.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .with_span_list(true)
                .flatten_event(true)
                .with_target(true)
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true)
                .with_file(true)
                .try_init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_level(true)
                .with_ansi(false)
                .try_init(),
        };

        result.map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoggingSection;
    use serial_test::serial;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);

        let err = "xml".parse::<LogFormat>().unwrap_err();
        assert!(err.contains("Invalid log format: 'xml'"));
    }

    #[test]
    fn test_verbose_forces_debug() {
        let config = LoggingConfig::new(LogFormat::Text, "warn", true);
        assert_eq!(config.directive(), "debug");

        let config = LoggingConfig::new(LogFormat::Text, "warn", false);
        assert_eq!(config.directive(), "warn");
    }

    #[test]
    #[serial]
    fn test_env_overrides_section() {
        let section = LoggingSection {
            format: LogFormat::Text,
            level: "info".to_string(),
        };

        std::env::set_var("SYNDICAST_LOG_FORMAT", "json");
        std::env::set_var("SYNDICAST_LOG_LEVEL", "trace");
        let config = LoggingConfig::from_section(&section, false);
        std::env::remove_var("SYNDICAST_LOG_FORMAT");
        std::env::remove_var("SYNDICAST_LOG_LEVEL");

        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, "trace");

        let config = LoggingConfig::from_section(&section, false);
        assert_eq!(config.format, LogFormat::Text);
        assert_eq!(config.level, "info");
    }
}
