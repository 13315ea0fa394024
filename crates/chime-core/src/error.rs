//! Core error types for chime-core.
//!
//! Only I/O-layer failures travel outward as errors. Evaluation outcomes such
//! as an exhausted schedule or a late-cancelled occurrence are decisions, not
//! errors, and never show up here.

use std::path::PathBuf;
use thiserror::Error;

use crate::alarm::AlarmId;

/// Core error type for chime-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Unknown alarm id
    #[error("Alarm not found: {0}")]
    NotFound(AlarmId),

    /// The id matches more than one stored definition
    #[error("Alarm id is ambiguous: {0}")]
    Ambiguous(AlarmId),

    /// A pre/post action, command or email could not be carried out
    #[error("{stage} failed for alarm {id}: {message}")]
    ExternalActionFailed {
        id: AlarmId,
        stage: ActionStage,
        message: String,
    },

    /// The alarm store is missing, unreadable or unwritable
    #[error("Alarm store unavailable: {0}")]
    ResourceUnavailable(#[from] StoreError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Which external step of a firing failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStage {
    PreAction,
    PostAction,
    Command,
    Email,
    Display,
}

impl std::fmt::Display for ActionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ActionStage::PreAction => "pre-alarm action",
            ActionStage::PostAction => "post-alarm action",
            ActionStage::Command => "command",
            ActionStage::Email => "email",
            ActionStage::Display => "display",
        };
        f.write_str(name)
    }
}

/// Alarm store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to open the backing file
    #[error("Failed to open alarm store at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// The store has not been opened, or was closed
    #[error("Alarm store is not open")]
    NotOpen,

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// A stored definition could not be decoded
    #[error("Corrupt alarm record {id}: {message}")]
    Corrupt { id: String, message: String },

    /// Database is locked by another process
    #[error("Alarm store is locked")]
    Locked,
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Unknown dot-path key
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Could not determine the data directory
    #[error("Data directory unavailable: {0}")]
    DataDir(String),
}

/// Validation errors for alarm drafts.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Recurrence or repetition interval of zero
    #[error("Invalid interval for '{field}': must be at least 1")]
    ZeroInterval { field: String },

    /// Weekly recurrence without any weekday
    #[error("Weekly recurrence needs at least one weekday")]
    NoWeekdays,

    /// Sub-repetition longer than the recurrence period
    #[error("Sub-repetition spans {span_minutes} minutes, longer than the recurrence period ({period_minutes} minutes)")]
    RepetitionTooLong {
        span_minutes: i64,
        period_minutes: i64,
    },

    /// The alarm can never trigger
    #[error("Alarm has no occurrence after {0}")]
    NoOccurrence(chrono::DateTime<chrono::Utc>),

    /// Invalid value
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(err, _msg) => {
                if err.code == rusqlite::ErrorCode::DatabaseBusy
                    || err.code == rusqlite::ErrorCode::DatabaseLocked
                {
                    StoreError::Locked
                } else {
                    StoreError::QueryFailed(err.to_string())
                }
            }
            _ => StoreError::QueryFailed(err.to_string()),
        }
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
