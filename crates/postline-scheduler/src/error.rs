//! Error types for the scheduler.

use std::time::Duration;

use thiserror::Error;

use crate::JobState;

/// Errors that can occur in store and scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Bad input. Never retried.
    #[error("invalid {field}: {message}")]
    Validation {
        /// The offending request field.
        field: &'static str,
        message: String,
    },

    /// Job not found.
    #[error("job not found: {0}")]
    NotFound(String),

    /// A state change outside the allowed transition table.
    #[error("invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: JobState,
        to: JobState,
    },

    /// The backing store is not connected.
    #[error("job store unavailable: {0}")]
    Unavailable(String),

    /// SQLite error.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SchedulerError {
    pub(crate) fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    /// Whether the error means the store could not be reached at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Storage(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ffi::ErrorCode::DatabaseBusy | rusqlite::ffi::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// A failed publish attempt.
#[derive(Debug, Error)]
pub enum CallbackError {
    /// The callback did not answer within the configured timeout.
    #[error("callback timed out after {0:?}")]
    Timeout(Duration),

    /// The callback answered with a non-2xx status.
    #[error("callback returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Network or protocol failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The webhook URL could not be used.
    #[error("invalid webhook URL: {0}")]
    InvalidUrl(String),
}
