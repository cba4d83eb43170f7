//! Delay scheduler: moves due jobs from the store to the executor.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::executor::{ExecutionOutcome, Executor};
use crate::{JobStore, SchedulerConfig, SchedulerError};

/// Periodic sweeper over the job store.
pub struct Scheduler {
    store: Arc<JobStore>,
    executor: Arc<Executor>,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Create a new scheduler.
    pub fn new(store: Arc<JobStore>, executor: Arc<Executor>, config: SchedulerConfig) -> Self {
        Self {
            store,
            executor,
            config,
        }
    }

    /// Run the scheduler loop until shutdown, then wait for in-flight jobs.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(sweep_interval = ?self.config.sweep_interval, "scheduler starting");

        let mut in_flight = JoinSet::new();
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_purge: Option<Instant> = None;

        loop {
            if *shutdown_rx.borrow() {
                info!("scheduler shutting down");
                break;
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("scheduler received shutdown signal");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.sweep(&mut in_flight) {
                        Ok(0) => {}
                        Ok(count) => debug!(count, "dispatched due jobs"),
                        Err(e) => warn!(error = %e, "sweep failed, retrying next tick"),
                    }
                    self.purge_if_due(&mut last_purge);
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_join(joined);
                }
            }
        }

        if !in_flight.is_empty() {
            info!(count = in_flight.len(), "waiting for in-flight jobs");
        }
        while let Some(joined) = in_flight.join_next().await {
            log_join(joined);
        }

        info!("scheduler shut down gracefully");
    }

    /// Claim and execute everything due right now, waiting for the results.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self) -> Result<Vec<ExecutionOutcome>, SchedulerError> {
        let mut in_flight = JoinSet::new();
        let dispatched = self.sweep(&mut in_flight);

        let mut outcomes = Vec::new();
        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "job execution task failed"),
            }
        }

        dispatched.map(|_| outcomes)
    }

    /// Claim due jobs until none remain, spawning one execution per job.
    fn sweep(
        &self,
        in_flight: &mut JoinSet<ExecutionOutcome>,
    ) -> Result<usize, SchedulerError> {
        let mut count = 0;
        while let Some(job) = self.store.claim_due(Utc::now())? {
            debug!(job_id = %job.id, attempts = job.attempts, "claimed job");
            let executor = Arc::clone(&self.executor);
            in_flight.spawn(async move { executor.execute(job).await });
            count += 1;
        }
        Ok(count)
    }

    /// Drop terminal jobs past the retention window, at most once per purge interval.
    fn purge_if_due(&self, last_purge: &mut Option<Instant>) {
        let Some(retention) = self.config.retention else {
            return;
        };
        if last_purge.is_some_and(|at| at.elapsed() < self.config.purge_interval) {
            return;
        }
        *last_purge = Some(Instant::now());

        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return;
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return;
        };
        match self.store.purge_terminal(cutoff) {
            Ok(0) => {}
            Ok(count) => info!(count, "purged expired jobs"),
            Err(e) => warn!(error = %e, "failed to purge expired jobs"),
        }
    }
}

fn log_join(joined: Result<ExecutionOutcome, tokio::task::JoinError>) {
    match joined {
        Ok(outcome) => debug!(?outcome, "job execution finished"),
        Err(e) => error!(error = %e, "job execution task failed"),
    }
}
