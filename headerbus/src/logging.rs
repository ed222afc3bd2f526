//! Logging setup for headerbus
//!
//! The bus reports through `tracing`. Nothing is printed until a subscriber is
//! installed, so the default behaves like a null logger. Applications that want
//! output pick a mode here or install their own subscriber.

use std::str::FromStr;

use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Environment variable selecting the logging mode.
pub const ENV_LOG_MODE: &str = "HEADERBUS_LOG_MODE";

/// Environment variable overriding the log filter.
pub const ENV_LOG_LEVEL: &str = "HEADERBUS_LOG_LEVEL";

/// Logging mode for different use cases
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoggingMode {
    /// No output
    #[default]
    Silent,
    /// Compact stderr output for development
    Development,
    /// Verbose diagnostics with source locations
    Debug,
    /// One JSON object per line, for log shippers
    Json,
}

impl FromStr for LoggingMode {
    type Err = LoggingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "silent" => Ok(LoggingMode::Silent),
            "development" => Ok(LoggingMode::Development),
            "debug" => Ok(LoggingMode::Debug),
            "json" => Ok(LoggingMode::Json),
            other => Err(LoggingError::InvalidEnv(format!(
                "{ENV_LOG_MODE}={other}"
            ))),
        }
    }
}

/// Logging configuration error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to initialize tracing subscriber: {0}")]
    TracingInit(String),

    #[error("Invalid environment variable: {0}")]
    InvalidEnv(String),
}

/// Initialize logging with the specified mode
///
/// Call this once, early, before connecting the bus.
///
/// # Examples
///
/// ```rust,ignore
/// headerbus::logging::init_logging(LoggingMode::Development)?;
/// ```
///
/// # Environment Variables
///
/// - `HEADERBUS_LOG_LEVEL`: filter directive (e.g. `debug`, `headerbus=trace`)
/// - `RUST_LOG`: used when `HEADERBUS_LOG_LEVEL` is unset
pub fn init_logging(mode: LoggingMode) -> Result<(), LoggingError> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    match mode {
        LoggingMode::Silent => Ok(()),
        LoggingMode::Development => {
            let filter = create_env_filter("info");

            Registry::default()
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_thread_ids(false)
                        .with_file(false)
                        .with_line_number(false)
                        .compact(),
                )
                .with(filter)
                .try_init()
                .map_err(|e| LoggingError::TracingInit(e.to_string()))
        }
        LoggingMode::Debug => {
            let filter = create_env_filter("debug");

            Registry::default()
                .with(
                    fmt::layer()
                        .pretty()
                        .with_thread_ids(true)
                        .with_file(true)
                        .with_line_number(true),
                )
                .with(filter)
                .try_init()
                .map_err(|e| LoggingError::TracingInit(e.to_string()))
        }
        LoggingMode::Json => {
            let filter = create_env_filter("info");

            Registry::default()
                .with(fmt::layer().json().with_current_span(false))
                .with(filter)
                .try_init()
                .map_err(|e| LoggingError::TracingInit(e.to_string()))
        }
    }
}

/// Initialize logging from `HEADERBUS_LOG_MODE`.
///
/// Unset means silent. An unrecognised value is an error rather than a silent
/// fallback.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    let mode = match std::env::var(ENV_LOG_MODE) {
        Ok(value) => value.parse()?,
        Err(_) => LoggingMode::Silent,
    };

    init_logging(mode)
}

// HEADERBUS_LOG_LEVEL, then RUST_LOG, then the mode's default
fn create_env_filter(default_level: &str) -> EnvFilter {
    if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
        EnvFilter::new(level)
    } else if let Ok(rust_log) = std::env::var("RUST_LOG") {
        EnvFilter::new(rust_log)
    } else {
        EnvFilter::new(default_level)
    }
}

/// Check if a global subscriber has been installed
pub fn is_initialized() -> bool {
    tracing::dispatcher::has_been_set()
}
