//! HTTP routes for the job lifecycle API.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use postline_scheduler::{
    Job, JobState, JobStore, NewJob, RetryPolicy, STORE_UNAVAILABLE_WARNING, StatusReporter,
};

use crate::error::{ApiError, MISSING_FIELDS};

/// Channel reported for reminders that name none.
const DEFAULT_CHANNEL: &str = "twitter";

/// Shared state for API handlers.
pub struct AppState {
    store: Arc<JobStore>,
    reporter: StatusReporter,
    policy: RetryPolicy,
}

impl AppState {
    pub fn new(store: Arc<JobStore>, reporter: StatusReporter, policy: RetryPolicy) -> Self {
        Self {
            store,
            reporter,
            policy,
        }
    }
}

/// Create the API router.
///
/// Every route is served both at the root and under `/api`.
pub fn create_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/schedule", post(schedule_post))
        .route(
            "/schedule/{job_id}",
            get(get_scheduled_post).delete(cancel_scheduled_post),
        )
        .route("/scheduled", get(list_scheduled_posts))
        .route("/reminders", get(list_reminders))
        .route("/health", get(health));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(api.clone())
        .nest("/api", api)
        .layer(cors)
        .with_state(state)
}

/// Body of a schedule request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleRequest {
    webhook_url: Option<String>,
    payload: Option<Value>,
    #[serde(default)]
    channels: Vec<String>,
    scheduled_time: Option<String>,
}

async fn schedule_post(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ScheduleRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    const ACTION: &str = "Failed to schedule post";

    if !state.store.is_connected() {
        return Err(ApiError::Unavailable("job store not connected".to_string()));
    }

    let Json(request) =
        body.map_err(|e| ApiError::bad_request("Invalid request body", e.body_text()))?;

    let (Some(webhook_url), Some(payload), Some(scheduled_time)) = (
        request.webhook_url.filter(|url| !url.trim().is_empty()),
        request.payload.filter(|payload| !payload.is_null()),
        request.scheduled_time.filter(|time| !time.trim().is_empty()),
    ) else {
        return Err(ApiError::bad_request(
            MISSING_FIELDS,
            "webhookUrl, payload and scheduledTime must all be provided",
        ));
    };

    let due_time = parse_scheduled_time(&scheduled_time).ok_or_else(|| {
        ApiError::bad_request(
            "Invalid scheduledTime",
            format!("'{scheduled_time}' is not an ISO 8601 date-time"),
        )
    })?;

    let job = NewJob::new(webhook_url, payload, request.channels, due_time)
        .with_scheduled_time(scheduled_time)
        .with_policy(&state.policy);
    job.validate(Utc::now())
        .map_err(|e| ApiError::from_scheduler(e, ACTION))?;

    let job = state
        .store
        .put(job)
        .map_err(|e| ApiError::from_scheduler(e, ACTION))?;

    info!(
        job_id = %job.id,
        due_time = %job.due_time,
        channels = ?job.channels,
        "scheduled post"
    );

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "jobId": job.id,
            "scheduledTime": job.scheduled_time,
            "estimatedExecution": iso_millis(job.due_time),
        })),
    ))
}

async fn list_scheduled_posts(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.list(Some(&JobState::PENDING)) {
        Ok(jobs) => {
            let posts: Vec<Value> = jobs
                .iter()
                .map(|job| {
                    json!({
                        "id": job.id,
                        "scheduledTime": job.scheduled_time,
                        "channels": job.channels,
                        "status": job.state,
                    })
                })
                .collect();
            Json(json!({
                "success": true,
                "count": posts.len(),
                "posts": posts,
            }))
        }
        Err(e) if e.is_unavailable() => Json(json!({
            "success": true,
            "count": 0,
            "posts": [],
            "warning": STORE_UNAVAILABLE_WARNING,
        })),
        Err(e) => {
            warn!(error = %e, "failed to list scheduled posts");
            Json(json!({
                "success": true,
                "count": 0,
                "posts": [],
                "error": e.to_string(),
            }))
        }
    }
}

async fn get_scheduled_post(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .store
        .get(&job_id)
        .map_err(|e| ApiError::from_scheduler(e, "Failed to load post"))?;

    Ok(Json(json!({
        "success": true,
        "job": {
            "id": job.id,
            "status": job.state,
            "scheduledTime": job.scheduled_time,
            "estimatedExecution": iso_millis(job.due_time),
            "channels": job.channels,
            "attempts": job.attempts,
            "maxAttempts": job.max_attempts,
            "lastError": job.last_error,
        },
    })))
}

async fn cancel_scheduled_post(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let cancelled = state
        .store
        .cancel(&job_id)
        .map_err(|e| ApiError::from_scheduler(e, "Failed to cancel post"))?;

    if cancelled == JobState::Active {
        info!(job_id = %job_id, "cancelled post while in flight");
    } else {
        info!(job_id = %job_id, "cancelled post");
    }

    Ok(Json(json!({
        "success": true,
        "message": "Scheduled post cancelled",
    })))
}

async fn list_reminders(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let reminders: Vec<Value> = match state.store.list(Some(&JobState::PENDING)) {
        Ok(jobs) => jobs.iter().filter_map(reminder_view).collect(),
        Err(e) => {
            warn!(error = %e, "failed to list scheduled reminders");
            Vec::new()
        }
    };

    Json(json!({
        "success": true,
        "reminders": reminders,
    }))
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.reporter.snapshot())
}

/// Project a job carrying a `reminder` in its payload.
fn reminder_view(job: &Job) -> Option<Value> {
    let reminder = job.payload.get("reminder")?;
    let field = |key: &str| {
        job.payload
            .get(key)
            .or_else(|| reminder.get(key))
            .filter(|value| !value.is_null())
    };

    let scheduled_time = if job.scheduled_time.is_empty() {
        reminder.get("time").cloned().unwrap_or(Value::Null)
    } else {
        Value::String(job.scheduled_time.clone())
    };

    let channel = job
        .payload
        .get("channel")
        .and_then(Value::as_str)
        .or_else(|| job.channels.first().map(String::as_str))
        .unwrap_or(DEFAULT_CHANNEL);

    Some(json!({
        "reminder_id": job.id,
        "scheduled_time": scheduled_time,
        "channel": channel,
        "score": field("score").cloned().unwrap_or(json!(0)),
        "reason": field("reason").cloned().unwrap_or(json!("")),
        "status": "scheduled",
    }))
}

/// Parse RFC 3339, or a zone-less ISO 8601 date or date-time taken as UTC.
fn parse_scheduled_time(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(time) = DateTime::parse_from_rfc3339(input) {
        return Some(time.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(input, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(input, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

fn iso_millis(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}
