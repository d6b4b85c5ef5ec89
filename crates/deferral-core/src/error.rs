//! Error types for deferral-core

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for deferral-core
#[derive(Error, Debug)]
pub enum Error {
    /// Freeze coordination errors
    #[error("Freeze error: {0}")]
    Freeze(#[from] FreezeError),

    /// Batch coalescing errors
    #[error("Batch error: {0}")]
    Batch(#[from] BatchError),

    /// Undoable action errors
    #[error("Action error: {0}")]
    Action(#[from] ActionError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Bulk endpoint transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Runtime errors (missing Tokio runtime, task failures, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Errors raised by the freeze coordinator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FreezeError {
    #[error("system `{0}` is not registered")]
    UnknownSystem(String),

    #[error("system id must not be empty")]
    EmptySystemId,
}

/// Errors delivered to individual batch callers.
///
/// Cloneable so a single failure can fan out to every subscriber of a key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    /// A second request for a key that is still pending (strict mode).
    #[error("request for key {key} is already in flight")]
    Duplicate { key: String },

    /// The bulk response did not mention a requested key.
    #[error("bulk response contained no result for key {key}")]
    MissingResult { key: String },

    /// The bulk call for the chunk holding this key failed.
    #[error("bulk fetch failed: {message}")]
    Fetch { message: String },

    /// The coalescer went away before the key was resolved.
    #[error("batch coalescer dropped before key {key} resolved")]
    Dropped { key: String },
}

/// Errors raised by undoable actions and their callbacks
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// The executor returned an error.
    #[error("executor failed: {0}")]
    Executor(String),

    /// The executor or a completion callback panicked.
    #[error("executor panicked: {0}")]
    Panicked(String),

    /// A restore callback failed. Logged, never propagated into cancel.
    #[error("restore failed: {0}")]
    Restore(String),

    /// The key already passed its window and is running.
    #[error("action `{0}` is already executing")]
    AlreadyExecuting(String),

    #[error("invalid action request: {0}")]
    InvalidRequest(String),

    /// The bulk hand-off for a batched executor failed.
    #[error(transparent)]
    Batch(#[from] BatchError),
}

impl ActionError {
    /// Build an executor failure from any displayable error.
    pub fn executor(err: impl std::fmt::Display) -> Self {
        Self::Executor(err.to_string())
    }

    /// Build a restore failure from any displayable error.
    pub fn restore(err: impl std::fmt::Display) -> Self {
        Self::Restore(err.to_string())
    }

    /// Whether running the executor again could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Executor(_) | Self::Batch(BatchError::Fetch { .. })
        )
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Render a panic payload as text for logs and error values.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
