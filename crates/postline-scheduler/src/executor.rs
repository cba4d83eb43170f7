//! Publish callback invocation and retry bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::{CallbackError, Job, JobState, JobStore, JobUpdate, RetryPolicy, SchedulerError};

/// Longest callback error body kept in `last_error`.
const MAX_ERROR_BODY: usize = 512;

/// First wait before retrying a result write the store refused.
const RECORD_RETRY_INTERVAL: Duration = Duration::from_millis(500);
const RECORD_RETRY_MAX: Duration = Duration::from_secs(30);

/// Performs the actual publish for a job.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `job`, returning the callback's response body.
    async fn publish(&self, job: &Job) -> Result<Value, CallbackError>;
}

/// Publishes by POSTing the job to its webhook URL.
#[derive(Debug, Clone)]
pub struct WebhookPublisher {
    client: reqwest::Client,
    timeout: Duration,
}

impl WebhookPublisher {
    /// Create a publisher whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, CallbackError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("postline/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, timeout })
    }

    /// The callback body: `{...payload, channels, scheduled: true, scheduledTime}`.
    ///
    /// A payload that is not a JSON object is sent under a `payload` key.
    pub fn callback_body(job: &Job) -> Value {
        let mut body = match &job.payload {
            Value::Object(fields) => fields.clone(),
            other => {
                let mut fields = Map::new();
                fields.insert("payload".to_string(), other.clone());
                fields
            }
        };
        body.insert("channels".to_string(), json!(job.channels));
        body.insert("scheduled".to_string(), Value::Bool(true));
        body.insert("scheduledTime".to_string(), json!(job.scheduled_time));
        Value::Object(body)
    }

    fn classify(&self, e: reqwest::Error) -> CallbackError {
        if e.is_timeout() {
            CallbackError::Timeout(self.timeout)
        } else {
            CallbackError::Http(e)
        }
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    async fn publish(&self, job: &Job) -> Result<Value, CallbackError> {
        let url = reqwest::Url::parse(&job.webhook_url)
            .map_err(|e| CallbackError::InvalidUrl(e.to_string()))?;

        let response = self
            .client
            .post(url)
            .json(&Self::callback_body(job))
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| self.classify(e))?;

        if !status.is_success() {
            return Err(CallbackError::Status {
                status: status.as_u16(),
                body: truncate(&text, MAX_ERROR_BODY).to_string(),
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

/// What happened to a job after one execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The callback succeeded.
    Completed,
    /// The callback failed; the job waits for another attempt.
    Retrying {
        attempts: u32,
        next_due: DateTime<Utc>,
    },
    /// The last allowed attempt failed.
    Failed { attempts: u32 },
    /// The result was not recorded: the job was cancelled in flight, or
    /// shutdown arrived while the store was unreachable.
    Abandoned,
}

/// Runs claimed jobs against a [`Publisher`].
pub struct Executor {
    store: Arc<JobStore>,
    publisher: Arc<dyn Publisher>,
    policy: RetryPolicy,
    timeout: Duration,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Executor {
    pub fn new(
        store: Arc<JobStore>,
        publisher: Arc<dyn Publisher>,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            publisher,
            policy,
            timeout,
            shutdown: None,
        }
    }

    /// Stop waiting for an unreachable store once `shutdown_rx` fires.
    pub fn with_shutdown(mut self, shutdown_rx: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown_rx);
        self
    }

    /// Execute an `active` job once and record the result.
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id, attempt = job.attempts + 1))]
    pub async fn execute(&self, job: Job) -> ExecutionOutcome {
        info!(webhook_url = %job.webhook_url, "publishing scheduled job");

        let result = match tokio::time::timeout(self.timeout, self.publisher.publish(&job)).await {
            Ok(result) => result,
            Err(_) => Err(CallbackError::Timeout(self.timeout)),
        };

        let attempts = job.attempts + 1;
        let now = Utc::now();

        let (state, update, outcome) = match result {
            Ok(response) => {
                info!("job published");
                let update = JobUpdate {
                    attempts: Some(attempts),
                    result: Some(json!({
                        "success": true,
                        "response": response,
                        "timestamp": now.to_rfc3339(),
                    })),
                    ..Default::default()
                };
                (JobState::Completed, update, ExecutionOutcome::Completed)
            }
            Err(e) if job.has_attempts_left(attempts) => {
                let next_due = self.policy.next_due(attempts, now);
                warn!(
                    error = %e,
                    attempts,
                    max_attempts = job.max_attempts,
                    next_retry = %next_due,
                    "publish failed, scheduled retry"
                );
                let update = JobUpdate {
                    attempts: Some(attempts),
                    due_time: Some(next_due),
                    last_error: Some(e.to_string()),
                    result: None,
                };
                (
                    JobState::Waiting,
                    update,
                    ExecutionOutcome::Retrying { attempts, next_due },
                )
            }
            Err(e) => {
                error!(error = %e, attempts, "publish failed, no attempts left");
                let update = JobUpdate {
                    attempts: Some(attempts),
                    last_error: Some(e.to_string()),
                    ..Default::default()
                };
                (JobState::Failed, update, ExecutionOutcome::Failed { attempts })
            }
        };

        match self.record(&job.id, state, update).await {
            Ok(_) => outcome,
            Err(SchedulerError::NotFound(_)) => {
                info!("job cancelled while in flight, result dropped");
                ExecutionOutcome::Abandoned
            }
            Err(SchedulerError::InvalidTransition {
                from: JobState::Cancelled,
                ..
            }) => {
                info!("job cancelled while in flight, result dropped");
                ExecutionOutcome::Abandoned
            }
            Err(e) => {
                error!(error = %e, state = %state, "failed to record job result");
                ExecutionOutcome::Abandoned
            }
        }
    }

    /// Write the result, waiting out store outages until shutdown.
    async fn record(
        &self,
        id: &str,
        state: JobState,
        update: JobUpdate,
    ) -> Result<Job, SchedulerError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: RECORD_RETRY_INTERVAL,
            max_interval: RECORD_RETRY_MAX,
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut shutdown = self.shutdown.clone();

        loop {
            match self.store.update_state(id, state, update.clone()) {
                Err(e) if e.is_transient() => {
                    let wait = backoff.next_backoff().unwrap_or(RECORD_RETRY_MAX);
                    warn!(
                        error = %e,
                        state = %state,
                        retry_in = ?wait,
                        "failed to record job result, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = shutdown_requested(&mut shutdown) => return Err(e),
                    }
                }
                other => return other,
            }
        }
    }
}

/// Resolves once shutdown is signalled; never without a receiver.
async fn shutdown_requested(shutdown: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = shutdown else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
