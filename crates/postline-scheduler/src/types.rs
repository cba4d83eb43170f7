//! Scheduler types.

use std::fmt;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::SchedulerError;

/// A scheduled publish job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Opaque unique identifier.
    pub id: String,
    /// Endpoint the executor POSTs to.
    pub webhook_url: String,
    /// Content forwarded to the callback.
    pub payload: Value,
    /// Channels to publish on.
    pub channels: Vec<String>,
    /// Scheduled time exactly as submitted.
    pub scheduled_time: String,
    /// Earliest moment the job may execute.
    pub due_time: DateTime<Utc>,
    /// Current state of the job.
    pub state: JobState,
    /// Execution attempts made so far.
    pub attempts: u32,
    /// Attempts allowed before the job fails.
    pub max_attempts: u32,
    /// Message of the most recent failed attempt.
    pub last_error: Option<String>,
    /// Response metadata recorded on completion.
    pub result: Option<Value>,
    /// When this job was submitted.
    pub created_at: DateTime<Utc>,
    /// When this job last changed.
    pub updated_at: DateTime<Utc>,
}

/// Current state of a job.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Delay not yet elapsed (or waiting for a retry).
    #[default]
    Waiting,
    /// Claimed by an executor, callback in flight.
    Active,
    /// Callback succeeded.
    Completed,
    /// All attempts exhausted.
    Failed,
    /// Cancelled before it could complete.
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Waiting,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
        JobState::Cancelled,
    ];

    /// States that may still execute.
    pub const PENDING: [JobState; 2] = [JobState::Waiting, JobState::Active];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    /// No transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Check the transition table.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Waiting, Active)
                | (Waiting, Cancelled)
                | (Active, Completed)
                | (Active, Waiting)
                | (Active, Failed)
                | (Active, Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state '{}'", s))
    }
}

/// A job as submitted, before the store assigns an id.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub webhook_url: String,
    pub payload: Value,
    pub channels: Vec<String>,
    pub scheduled_time: String,
    pub due_time: DateTime<Utc>,
    pub max_attempts: u32,
}

impl NewJob {
    /// Create a job with the default attempt budget.
    pub fn new(
        webhook_url: impl Into<String>,
        payload: Value,
        channels: Vec<String>,
        due_time: DateTime<Utc>,
    ) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            payload,
            channels,
            scheduled_time: due_time.to_rfc3339(),
            due_time,
            max_attempts: RetryPolicy::default().max_attempts,
        }
    }

    /// Use a specific retry policy's attempt budget.
    pub fn with_policy(mut self, policy: &RetryPolicy) -> Self {
        self.max_attempts = policy.max_attempts;
        self
    }

    /// Keep the caller's original time string.
    pub fn with_scheduled_time(mut self, scheduled_time: impl Into<String>) -> Self {
        self.scheduled_time = scheduled_time.into();
        self
    }

    /// Check required fields and that the due time lies strictly after `now`.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        if self.webhook_url.trim().is_empty() {
            return Err(SchedulerError::validation("webhookUrl", "is required"));
        }
        let url = reqwest::Url::parse(&self.webhook_url)
            .map_err(|e| SchedulerError::validation("webhookUrl", e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SchedulerError::validation(
                "webhookUrl",
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }
        if self.payload.is_null() {
            return Err(SchedulerError::validation("payload", "is required"));
        }
        if self.due_time <= now {
            return Err(SchedulerError::validation(
                "scheduledTime",
                "must be in the future",
            ));
        }
        if self.max_attempts == 0 {
            return Err(SchedulerError::validation(
                "maxAttempts",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Fields written alongside a state transition.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub attempts: Option<u32>,
    pub due_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<Value>,
}

/// How failed callbacks are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles for each later one.
    pub base_delay: StdDuration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: StdDuration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt once `attempts` have failed.
    ///
    /// `base_delay * 2^(attempts - 1)`, so 5s, 10s, 20s with the defaults.
    pub fn delay_after(&self, attempts: u32) -> StdDuration {
        let exponent = attempts.saturating_sub(1).min(20);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Due time of the retry scheduled at `now`.
    pub fn next_due(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = Duration::from_std(self.delay_after(attempts)).unwrap_or(Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Job {
    /// Check if this job may be claimed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Waiting && self.due_time <= now
    }

    /// Whether another attempt is allowed once `attempts` have been made.
    pub fn has_attempts_left(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
