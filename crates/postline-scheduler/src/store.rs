//! SQLite-backed durable job store.
//!
//! The store is the single source of truth for job state and doubles as the
//! timer wheel: a job's delay lives in its `due_at` column, not in memory.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, Type, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, ToSql, params, params_from_iter};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{Job, JobState, JobUpdate, NewJob, SchedulerError};

/// Columns selected for every job row, in `row_to_job` order.
const JOB_COLUMNS: &str = "id, webhook_url, payload, channels, scheduled_time, due_at, state, \
                           attempts, max_attempts, last_error, result, created_at, updated_at";

/// How long a writer waits on a lock held by another connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the store keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    Memory,
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreLocation::File(path) => write!(f, "{}", path.display()),
            StoreLocation::Memory => f.write_str(":memory:"),
        }
    }
}

/// Durable job store.
///
/// `None` in `conn` is the explicit unavailable state: every operation fails
/// with [`SchedulerError::Unavailable`] until [`JobStore::reconnect`] succeeds.
pub struct JobStore {
    location: StoreLocation,
    conn: Mutex<Option<Connection>>,
    requeue_on_connect: AtomicBool,
}

impl JobStore {
    /// Open or create a file-backed store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SchedulerError> {
        let location = StoreLocation::File(path.into());
        let conn = connect(&location)?;
        Ok(Self {
            location,
            conn: Mutex::new(Some(conn)),
            requeue_on_connect: AtomicBool::new(false),
        })
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> Result<Self, SchedulerError> {
        let location = StoreLocation::Memory;
        let conn = connect(&location)?;
        Ok(Self {
            location,
            conn: Mutex::new(Some(conn)),
            requeue_on_connect: AtomicBool::new(false),
        })
    }

    /// A handle for `location` that starts disconnected.
    pub fn unavailable(location: StoreLocation) -> Self {
        Self {
            location,
            conn: Mutex::new(None),
            requeue_on_connect: AtomicBool::new(false),
        }
    }

    /// Run [`JobStore::requeue_interrupted`] as part of the next successful
    /// [`JobStore::reconnect`], before any other caller sees the connection.
    pub fn requeue_on_connect(self) -> Self {
        self.requeue_on_connect.store(true, Ordering::SeqCst);
        self
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    /// Whether the store currently holds a connection.
    pub fn is_connected(&self) -> bool {
        self.conn.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    /// Reopen the configured location. No-op when already connected.
    pub fn reconnect(&self) -> Result<(), SchedulerError> {
        let mut guard = self.lock()?;
        if guard.is_none() {
            let conn = connect(&self.location)?;
            if self.requeue_on_connect.load(Ordering::SeqCst) {
                log_requeued(requeue_active(&conn)?);
                self.requeue_on_connect.store(false, Ordering::SeqCst);
            }
            *guard = Some(conn);
            info!(location = %self.location, "job store connected");
        }
        Ok(())
    }

    /// Drop the connection.
    pub fn close(&self) {
        if let Ok(mut guard) = self.conn.lock() {
            if guard.take().is_some() {
                info!(location = %self.location, "job store closed");
            }
        }
    }

    /// Persist a new job in the `waiting` state.
    pub fn put(&self, job: NewJob) -> Result<Job, SchedulerError> {
        let now = Utc::now();
        job.validate(now)?;

        let job = Job {
            id: Uuid::new_v4().to_string(),
            webhook_url: job.webhook_url,
            payload: job.payload,
            channels: job.channels,
            scheduled_time: job.scheduled_time,
            due_time: job.due_time,
            state: JobState::Waiting,
            attempts: 0,
            max_attempts: job.max_attempts,
            last_error: None,
            result: None,
            created_at: now,
            updated_at: now,
        };

        let payload = serde_json::to_string(&job.payload)?;
        let channels = serde_json::to_string(&job.channels)?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO jobs
                 (id, webhook_url, payload, channels, scheduled_time, due_at, state,
                  attempts, max_attempts, last_error, result, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, NULL, NULL, ?9, ?9)",
                params![
                    job.id,
                    job.webhook_url,
                    payload,
                    channels,
                    job.scheduled_time,
                    job.due_time.timestamp_millis(),
                    job.state,
                    job.max_attempts,
                    now.timestamp_millis(),
                ],
            )?;
            Ok(())
        })?;

        debug!(job_id = %job.id, due_time = %job.due_time, "stored job");
        Ok(job)
    }

    /// Claim the earliest-due waiting job, moving it to `active`.
    ///
    /// The select and the state change are one statement, so two callers
    /// can never claim the same job.
    pub fn claim_due(&self, now: DateTime<Utc>) -> Result<Option<Job>, SchedulerError> {
        let sql = format!(
            "UPDATE jobs SET state = 'active', updated_at = ?1
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE state = 'waiting' AND due_at <= ?1
                 ORDER BY due_at, seq
                 LIMIT 1
             ) AND state = 'waiting'
             RETURNING {JOB_COLUMNS}"
        );
        self.with_conn(|conn| {
            let job = conn
                .query_row(&sql, params![now.timestamp_millis()], row_to_job)
                .optional()?;
            Ok(job)
        })
    }

    /// All jobs, optionally restricted to `states`, in insertion order.
    pub fn list(&self, states: Option<&[JobState]>) -> Result<Vec<Job>, SchedulerError> {
        self.with_conn(|conn| {
            let jobs = match states {
                Some(states) => {
                    if states.is_empty() {
                        return Ok(Vec::new());
                    }
                    let placeholders = vec!["?"; states.len()].join(", ");
                    let sql = format!(
                        "SELECT {JOB_COLUMNS} FROM jobs WHERE state IN ({placeholders}) ORDER BY seq"
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt
                        .query_map(params_from_iter(states.iter()), row_to_job)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
                None => {
                    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY seq");
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt
                        .query_map([], row_to_job)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
            };
            Ok(jobs)
        })
    }

    /// Get a job by id.
    pub fn get(&self, id: &str) -> Result<Job, SchedulerError> {
        self.with_conn(|conn| fetch(conn, id))
    }

    /// Apply a validated state transition together with `update`.
    pub fn update_state(
        &self,
        id: &str,
        new_state: JobState,
        update: JobUpdate,
    ) -> Result<Job, SchedulerError> {
        let result = update.result.as_ref().map(serde_json::to_string).transpose()?;

        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            let current: JobState = tx
                .query_row("SELECT state FROM jobs WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()?
                .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;

            if !current.can_transition_to(new_state) {
                return Err(SchedulerError::InvalidTransition {
                    id: id.to_string(),
                    from: current,
                    to: new_state,
                });
            }

            let changed = tx.execute(
                "UPDATE jobs SET
                     state = ?1,
                     attempts = COALESCE(?2, attempts),
                     due_at = COALESCE(?3, due_at),
                     last_error = COALESCE(?4, last_error),
                     result = COALESCE(?5, result),
                     updated_at = ?6
                 WHERE id = ?7 AND state = ?8",
                params![
                    new_state,
                    update.attempts,
                    update.due_time.map(|t| t.timestamp_millis()),
                    update.last_error,
                    result,
                    Utc::now().timestamp_millis(),
                    id,
                    current,
                ],
            )?;
            if changed != 1 {
                return Err(SchedulerError::InvalidTransition {
                    id: id.to_string(),
                    from: current,
                    to: new_state,
                });
            }

            let job = fetch(&tx, id)?;
            tx.commit()?;
            Ok(job)
        })
    }

    /// Delete a `waiting` or `active` job, returning the state it was in.
    ///
    /// Terminal and unknown jobs are both [`SchedulerError::NotFound`].
    pub fn cancel(&self, id: &str) -> Result<JobState, SchedulerError> {
        self.with_conn(|conn| {
            conn.query_row(
                "DELETE FROM jobs WHERE id = ?1 AND state IN ('waiting', 'active')
                 RETURNING state",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
        })
    }

    /// Delete a job record.
    pub fn remove(&self, id: &str) -> Result<(), SchedulerError> {
        self.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
            if removed == 0 {
                return Err(SchedulerError::NotFound(id.to_string()));
            }
            Ok(())
        })
    }

    /// Delete terminal jobs last touched before `before`.
    pub fn purge_terminal(&self, before: DateTime<Utc>) -> Result<usize, SchedulerError> {
        self.with_conn(|conn| {
            let purged = conn.execute(
                "DELETE FROM jobs
                 WHERE state IN ('completed', 'failed', 'cancelled') AND updated_at < ?1",
                params![before.timestamp_millis()],
            )?;
            Ok(purged)
        })
    }

    /// Return jobs left `active` by a previous process to `waiting`.
    ///
    /// Only safe while no other scheduler is running against the same file.
    pub fn requeue_interrupted(&self) -> Result<usize, SchedulerError> {
        let recovered = self.with_conn(|conn| requeue_active(conn))?;
        log_requeued(recovered);
        Ok(recovered)
    }

    /// Number of jobs per state.
    pub fn counts(&self) -> Result<BTreeMap<JobState, u64>, SchedulerError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
            let counts = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, JobState>(0)?, row.get::<_, i64>(1)? as u64))
                })?
                .collect::<Result<BTreeMap<_, _>, _>>()?;
            Ok(counts)
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<Connection>>, SchedulerError> {
        self.conn
            .lock()
            .map_err(|_| SchedulerError::Unavailable("job store lock poisoned".to_string()))
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, SchedulerError>,
    ) -> Result<T, SchedulerError> {
        let mut guard = self.lock()?;
        let conn = guard.as_mut().ok_or_else(|| {
            SchedulerError::Unavailable(format!("not connected to {}", self.location))
        })?;
        f(conn)
    }
}

fn connect(location: &StoreLocation) -> Result<Connection, SchedulerError> {
    let conn = match location {
        StoreLocation::File(path) => {
            let conn = Connection::open(path)?;
            // WAL so API reads do not block on sweeps
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
            conn
        }
        StoreLocation::Memory => Connection::open_in_memory()?,
    };
    conn.busy_timeout(BUSY_TIMEOUT)?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            webhook_url TEXT NOT NULL,
            payload TEXT NOT NULL,
            channels TEXT NOT NULL DEFAULT '[]',
            scheduled_time TEXT NOT NULL,
            due_at INTEGER NOT NULL,
            state TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            last_error TEXT,
            result TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_state_due ON jobs(state, due_at);
        ",
    )?;

    info!(location = %location, "job store initialized");
    Ok(conn)
}

fn requeue_active(conn: &Connection) -> Result<usize, SchedulerError> {
    let recovered = conn.execute(
        "UPDATE jobs SET state = 'waiting', updated_at = ?1 WHERE state = 'active'",
        params![Utc::now().timestamp_millis()],
    )?;
    Ok(recovered)
}

fn log_requeued(count: usize) {
    if count > 0 {
        warn!(count, "requeued jobs interrupted while active");
    }
}

fn fetch(conn: &Connection, id: &str) -> Result<Job, SchedulerError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
    conn.query_row(&sql, params![id], row_to_job)
        .optional()?
        .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        webhook_url: row.get(1)?,
        payload: json_column(row, 2)?,
        channels: json_column(row, 3)?,
        scheduled_time: row.get(4)?,
        due_time: millis_column(row, 5)?,
        state: row.get(6)?,
        attempts: row.get(7)?,
        max_attempts: row.get(8)?,
        last_error: row.get(9)?,
        result: row
            .get::<_, Option<String>>(10)?
            .map(|text| parse_json(&text, 10))
            .transpose()?,
        created_at: millis_column(row, 11)?,
        updated_at: millis_column(row, 12)?,
    })
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    parse_json(&text, idx)
}

fn parse_json<T: DeserializeOwned>(text: &str, idx: usize) -> rusqlite::Result<T> {
    serde_json::from_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn millis_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp out of range: {}", millis).into(),
        )
    })
}

impl ToSql for JobState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for JobState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}
