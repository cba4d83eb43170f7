//! HTTP error mapping for the job lifecycle API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use postline_scheduler::SchedulerError;

pub(crate) const MISSING_FIELDS: &str =
    "Missing required fields: webhookUrl, payload, scheduledTime";
pub(crate) const NOT_IN_FUTURE: &str = "Scheduled time must be in the future";

const UNAVAILABLE_MESSAGE: &str =
    "The job store is not connected. Scheduling resumes automatically once it reconnects.";
const UNAVAILABLE_HINT: &str =
    "Check that the database path (--db / POSTLINE_DB) exists and is writable";

/// Errors returned by API handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request was malformed or failed validation.
    #[error("{error}: {message}")]
    BadRequest { error: String, message: String },

    #[error("job not found: {0}")]
    NotFound(String),

    /// The job store is disconnected.
    #[error("scheduler unavailable: {0}")]
    Unavailable(String),

    /// Unexpected failure while performing `action`.
    #[error("{action}: {source}")]
    Internal {
        action: &'static str,
        #[source]
        source: SchedulerError,
    },
}

impl ApiError {
    pub(crate) fn bad_request(error: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError::BadRequest {
            error: error.into(),
            message: message.into(),
        }
    }

    /// Classify a scheduler error raised while performing `action`.
    pub(crate) fn from_scheduler(err: SchedulerError, action: &'static str) -> Self {
        match err {
            SchedulerError::Validation { field, message } => {
                let error = if field == "scheduledTime" {
                    NOT_IN_FUTURE
                } else {
                    "Invalid request"
                };
                ApiError::bad_request(error, format!("invalid {field}: {message}"))
            }
            SchedulerError::NotFound(id) => ApiError::NotFound(id),
            SchedulerError::Unavailable(reason) => ApiError::Unavailable(reason),
            source => ApiError::Internal { action, source },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest { error, message } => {
                json_error(StatusCode::BAD_REQUEST, error, message)
            }
            ApiError::NotFound(id) => json_error(
                StatusCode::NOT_FOUND,
                "Job not found",
                format!("no scheduled job with id {id}"),
            ),
            ApiError::Unavailable(reason) => {
                tracing::warn!(reason = %reason, "rejecting request, job store unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    axum::Json(json!({
                        "error": "Scheduler unavailable",
                        "message": UNAVAILABLE_MESSAGE,
                        "hint": UNAVAILABLE_HINT,
                    })),
                )
                    .into_response()
            }
            ApiError::Internal { action, source } => {
                error!(error = %source, "{}", action);
                json_error(StatusCode::INTERNAL_SERVER_ERROR, action, source.to_string())
            }
        }
    }
}

pub fn json_error(
    status: StatusCode,
    error: impl Into<String>,
    message: impl Into<String>,
) -> Response {
    (
        status,
        axum::Json(json!({
            "error": error.into(),
            "message": message.into(),
        })),
    )
        .into_response()
}
