//! Tracing/logging initialization.
//!
//! The filter comes from `RUST_LOG` (default `info`); the format from
//! `DBQ_LOG_FORMAT` (`json` or `pretty`, default `json`).

use std::str::FromStr;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("unknown log format: {0}")]
    UnknownFormat(String),

    #[error("invalid filter directive {directive:?}: {message}")]
    InvalidFilter { directive: String, message: String },

    #[error("a global subscriber is already installed")]
    AlreadyInstalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = TracingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(TracingError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    pub format: LogFormat,
    /// Used when `RUST_LOG` is unset.
    pub default_directive: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            default_directive: "info".to_string(),
        }
    }
}

impl TracingConfig {
    /// Read `DBQ_LOG_FORMAT`; an unknown value falls back to JSON.
    pub fn from_env() -> Self {
        let format = std::env::var("DBQ_LOG_FORMAT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default();
        Self {
            format,
            ..Self::default()
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_default_directive(mut self, directive: impl Into<String>) -> Self {
        self.default_directive = directive.into();
        self
    }

    fn filter(&self) -> Result<EnvFilter, TracingError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.default_directive).map_err(|e| TracingError::InvalidFilter {
            directive: self.default_directive.clone(),
            message: e.to_string(),
        })
    }

    /// Install the global subscriber.
    pub fn try_init(&self) -> Result<(), TracingError> {
        let filter = self.filter()?;
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_thread_names(true);

        let installed = match self.format {
            LogFormat::Json => builder.json().with_target(false).try_init(),
            LogFormat::Pretty => builder.with_target(true).try_init(),
        };
        installed.map_err(|_| TracingError::AlreadyInstalled)
    }
}

/// Initialize tracing for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let _ = TracingConfig::from_env().try_init();
}

/// Human-readable output captured by the test harness; repeated calls are no-ops.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .with_thread_names(true)
        .try_init();
}
