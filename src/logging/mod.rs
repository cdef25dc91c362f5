//! Logging setup for woqforge
//!
//! The library itself only emits `tracing` events: stage progress at
//! `debug`, per-buffer detail at `trace`, and a `warn` whenever an operand
//! has to be compacted. Installing a subscriber is left to the embedding
//! application; this module offers one for binaries, tests and benches.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Standard tracing filter (e.g. `"woqforge=debug"`), wins over
//!   everything else
//! - `WOQFORGE_LOG_LEVEL`: error, warn, info, debug, trace
//! - `WOQFORGE_LOG_FORMAT`: `human` or `json`
//! - `WOQFORGE_LOG_FILE`: also write JSON lines to this file

use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

pub const LOG_LEVEL_ENV: &str = "WOQFORGE_LOG_LEVEL";
pub const LOG_FORMAT_ENV: &str = "WOQFORGE_LOG_FORMAT";
pub const LOG_FILE_ENV: &str = "WOQFORGE_LOG_FILE";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("failed to open log file {path}: {message}")]
    FileOpenFailed { path: PathBuf, message: String },

    #[error("failed to install subscriber: {0}")]
    InitFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "human" | "pretty" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

/// Subscriber configuration
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Emit an event when each `woq_matmul_int4` span closes
    pub with_span_events: bool,
    /// JSON copy of the log
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by the `WOQFORGE_LOG_*` variables; invalid values are ignored
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(level) = env_parse::<LogLevel>(LOG_LEVEL_ENV) {
            config.level = level;
        }
        if let Some(format) = env_parse::<LogFormat>(LOG_FORMAT_ENV) {
            config.format = format;
        }
        config.log_file = std::env::var_os(LOG_FILE_ENV).map(PathBuf::from);
        config
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_span_events(mut self, with_span_events: bool) -> Self {
        self.with_span_events = with_span_events;
        self
    }

    pub fn with_log_file(mut self, path: PathBuf) -> Self {
        self.log_file = Some(path);
        self
    }

    /// `RUST_LOG` if set, otherwise the configured level
    pub fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        match std::env::var("RUST_LOG") {
            Ok(directives) => EnvFilter::try_new(directives)
                .map_err(|e| LoggingError::InvalidFilter(e.to_string())),
            Err(_) => Ok(EnvFilter::new(self.level.as_filter_str())),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

fn span_events(enabled: bool) -> FmtSpan {
    if enabled {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Open (appending) the log file, creating parent directories
pub fn open_log_file(path: &Path) -> Result<File, LoggingError> {
    let fail = |e: std::io::Error| LoggingError::FileOpenFailed {
        path: path.to_path_buf(),
        message: e.to_string(),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(fail)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(fail)
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn build_layers(config: &LoggingConfig) -> Result<Vec<BoxedLayer>, LoggingError> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let console: BoxedLayer = match config.format {
        LogFormat::Human => fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_span_events(span_events(config.with_span_events))
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(false)
            .with_span_events(span_events(config.with_span_events))
            .boxed(),
    };
    layers.push(console);

    if let Some(path) = &config.log_file {
        let file = open_log_file(path)?;
        layers.push(
            fmt::layer()
                .json()
                .with_writer(file)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(span_events(config.with_span_events))
                .boxed(),
        );
    }
    Ok(layers)
}

/// Install a global subscriber for `config`
///
/// Idempotent: only the first successful call installs anything.
pub fn init_with_config(config: &LoggingConfig) -> Result<(), LoggingError> {
    TRACING_INITIALIZED.get_or_try_init(|| {
        let filter = config.env_filter()?;
        let layers = build_layers(config)?;
        tracing_subscriber::registry()
            .with(layers)
            .with(filter)
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))
    })?;
    Ok(())
}

/// Install a subscriber configured from the environment, ignoring failures
pub fn init_logging_default() {
    if let Err(e) = init_with_config(&LoggingConfig::from_env()) {
        eprintln!("woqforge: logging disabled: {}", e);
    }
}

pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_levels_and_formats() {
        assert_eq!("WARNING".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!("trace".parse::<LogLevel>(), Ok(LogLevel::Trace));
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!("json".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        std::env::set_var(LOG_LEVEL_ENV, "debug");
        std::env::set_var(LOG_FORMAT_ENV, "nonsense");
        std::env::remove_var(LOG_FILE_ENV);
        let config = LoggingConfig::from_env();
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, LogFormat::Human);
        assert!(config.log_file.is_none());
        std::env::remove_var(LOG_LEVEL_ENV);
        std::env::remove_var(LOG_FORMAT_ENV);
    }

    #[test]
    fn test_open_log_file_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/woq.log");
        open_log_file(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    #[serial]
    fn test_init_is_idempotent() {
        init_logging_default();
        init_logging_default();
        assert!(is_initialized());
        assert!(init_with_config(&LoggingConfig::new().with_level(LogLevel::Trace)).is_ok());
    }
}
