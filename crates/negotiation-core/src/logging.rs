//! Logging setup for applications embedding the negotiation core
//!
//! The crate itself only emits `tracing` events; applications (and the
//! integration tests) install a subscriber through [`setup_logging`].

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Error, Result};

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// The log level to use
    pub level: Level,
    /// Whether to enable JSON formatting
    pub json: bool,
    /// Whether to include file and line information
    pub file_info: bool,
    /// Whether to log spans
    pub log_spans: bool,
    /// Write to the test capture writer instead of stdout
    pub test_writer: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            json: false,
            file_info: false,
            log_spans: false,
            test_writer: false,
        }
    }
}

impl LoggingConfig {
    /// Create a new logging configuration
    pub fn new(level: Level) -> Self {
        LoggingConfig {
            level,
            ..Default::default()
        }
    }

    /// Configuration used by tests: debug level, captured output
    pub fn for_tests() -> Self {
        LoggingConfig {
            level: Level::DEBUG,
            test_writer: true,
            ..Default::default()
        }
    }

    /// Enable JSON formatting
    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    /// Enable file and line information in logs
    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    /// Enable span logging
    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }
}

/// Install a global subscriber for the provided configuration.
///
/// Fails with a configuration error if a global subscriber is already set.
pub fn setup_logging(config: LoggingConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());

    let span_events = if config.log_spans {
        FmtSpan::ACTIVE
    } else {
        FmtSpan::NONE
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = match (config.json, config.test_writer) {
        (true, true) => builder.json().with_test_writer().try_init(),
        (true, false) => builder.json().with_writer(std::io::stdout).try_init(),
        (false, true) => builder.with_test_writer().try_init(),
        (false, false) => builder.try_init(),
    };

    installed.map_err(|e| Error::configuration(format!("failed to install subscriber: {}", e)))
}

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| Error::configuration(format!("Invalid log level: {}", level)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(parse_log_level("chatty").is_err());
    }

    #[test]
    fn builder_flags() {
        let config = LoggingConfig::new(Level::TRACE).with_json().with_file_info().with_spans();
        assert!(config.json && config.file_info && config.log_spans);
        assert!(!config.test_writer);
    }
}
