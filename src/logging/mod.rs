use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

pub const ALLOWED_LEVELS: &str = "error, warn, info, debug, verbose";

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Verbose = 5,
}

impl LogLevel {
    pub fn from_config_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "verbose" => Some(Self::Verbose),
            _ => None,
        }
    }

    fn as_directive(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Verbose => "trace",
        }
    }

    /// Our own targets follow the configured level; dependencies never go
    /// below `info`.
    pub fn filter_directive(self) -> String {
        let dependencies = self.min(Self::Info).as_directive();
        format!("{dependencies},jobgate={}", self.as_directive())
    }
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid logging.level '{value}'. Allowed values: {ALLOWED_LEVELS}")]
    InvalidLevel { value: String },
    #[error("invalid log filter '{directive}': {reason}")]
    InvalidFilter { directive: String, reason: String },
    #[error("failed to install log subscriber: {0}")]
    Install(String),
}

/// Installs the global subscriber: compact ANSI lines for humans, JSON lines
/// otherwise.
pub fn init(config: &LoggingConfig) -> Result<LogLevel, LoggingError> {
    let level =
        LogLevel::from_config_value(&config.level).ok_or_else(|| LoggingError::InvalidLevel {
            value: config.level.clone(),
        })?;
    let directive = level.filter_directive();
    let filter =
        EnvFilter::try_new(&directive).map_err(|error| LoggingError::InvalidFilter {
            directive: directive.clone(),
            reason: error.to_string(),
        })?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let installed = if config.human_friendly {
        builder.compact().with_ansi(true).try_init()
    } else {
        builder
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .try_init()
    };
    installed.map_err(|error| LoggingError::Install(error.to_string()))?;

    Ok(level)
}
