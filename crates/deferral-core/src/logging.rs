//! Subscriber setup for binaries and test harnesses embedding deferral-core.
//!
//! The library only emits `tracing` events. [`init_logging`] installs one
//! output on stderr plus an optional append-only file, both in the configured
//! [`LogFormat`]. Without `RUST_LOG`, other crates are held at `warn` while
//! this crate logs at [`LogConfig::level`].
//!
//! Field names used across the crate:
//! - `entry_id`: countdown queue entry
//! - `system_id`: freeze coordinator system
//! - `key`, `kind`, `batch_id`: undoable action identity
//! - `chunk_size`, `keys`: bulk request shape

pub use crate::config::LogFormat;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

const CRATE_TARGET: &str = "deferral_core";

static INSTALLED: OnceLock<()> = OnceLock::new();

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    /// Written in addition to stderr.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info.as_str().to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to open log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(LogError::InvalidLevel(s.to_string())),
        }
    }
}

/// Filter directive used when `RUST_LOG` is unset.
pub fn default_directive(level: LogLevel) -> String {
    format!("warn,{CRATE_TARGET}={}", level.as_str())
}

/// `RUST_LOG` if it parses, otherwise [`default_directive`].
///
/// The configured level is validated either way.
pub fn env_filter(config: &LogConfig) -> Result<EnvFilter, LogError> {
    let level: LogLevel = config.level.parse()?;
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(default_directive(level))
        .map_err(|err| LogError::InvalidLevel(err.to_string()))
}

/// One formatted output. `ansi` only affects the pretty format.
pub fn output_layer<W>(format: LogFormat, writer: W, ansi: bool) -> Box<dyn Layer<Registry> + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_current_span(true)
            .flatten_event(true)
            .boxed(),
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)?,
        _ => {}
    }
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

/// Install the process-wide subscriber. Only the first successful call wins.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if is_logging_initialized() {
        return Err(LogError::AlreadyInitialized);
    }

    let filter = env_filter(config)?;
    let mut outputs = vec![output_layer(
        config.format,
        io::stderr,
        config.format == LogFormat::Pretty,
    )];
    if let Some(path) = config.file.as_deref() {
        outputs.push(output_layer(config.format, Mutex::new(open_log_file(path)?), false));
    }

    let subscriber = tracing_subscriber::registry().with(outputs).with(filter);
    tracing::subscriber::set_global_default(subscriber)?;
    let _ = INSTALLED.set(());

    tracing::info!(
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "Logging initialized"
    );
    Ok(())
}

pub fn is_logging_initialized() -> bool {
    INSTALLED.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit_into(path: &Path, format: LogFormat) -> String {
        let file = open_log_file(path).unwrap();
        let subscriber = tracing_subscriber::registry().with(output_layer(format, Mutex::new(file), false));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(entry_id = "react:42", remaining_ms = 1200_u64, "Entry paused");
        });
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn levels_parse_case_insensitively() {
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!(" warning ".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!(matches!(
            "verbose".parse::<LogLevel>(),
            Err(LogError::InvalidLevel(level)) if level == "verbose"
        ));
    }

    #[test]
    fn default_directive_quiets_other_crates() {
        assert_eq!(default_directive(LogLevel::Debug), "warn,deferral_core=debug");
    }

    #[test]
    fn env_filter_rejects_unknown_level() {
        let config = LogConfig {
            level: "loud".to_string(),
            ..LogConfig::default()
        };
        assert!(matches!(env_filter(&config), Err(LogError::InvalidLevel(_))));
        assert!(env_filter(&LogConfig::default()).is_ok());
    }

    #[test]
    fn json_file_output_is_flat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("deferral.jsonl");
        let output = emit_into(&path, LogFormat::Json);

        let line: serde_json::Value = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(line["entry_id"], "react:42");
        assert_eq!(line["remaining_ms"], 1200);
        assert_eq!(line["message"], "Entry paused");
    }

    #[test]
    fn pretty_file_output_has_no_escape_codes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deferral.log");
        let output = emit_into(&path, LogFormat::Pretty);

        assert!(output.contains("Entry paused"));
        assert!(output.contains("entry_id"));
        assert!(!output.contains('\u{1b}'));
    }

    #[test]
    fn log_file_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deferral.log");
        emit_into(&path, LogFormat::Json);
        let output = emit_into(&path, LogFormat::Json);
        assert_eq!(output.lines().count(), 2);
    }
}
