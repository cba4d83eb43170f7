//! Keeps the job store connected.

use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::JobStore;

/// How often a connected store is checked.
const CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Reconnects the store with exponential backoff whenever it is unavailable.
pub struct StoreSupervisor {
    store: Arc<JobStore>,
    check_interval: Duration,
}

impl StoreSupervisor {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self {
            store,
            check_interval: CHECK_INTERVAL,
        }
    }

    /// Override the connected-state polling interval.
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Run until shutdown. Connection failures are never fatal.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            max_elapsed_time: None,
            ..Default::default()
        };

        loop {
            if *shutdown_rx.borrow() {
                info!("store supervisor shutting down");
                return;
            }

            let wait_duration = if self.store.is_connected() {
                backoff.reset();
                self.check_interval
            } else {
                match self.store.reconnect() {
                    Ok(()) => {
                        backoff.reset();
                        self.check_interval
                    }
                    Err(e) => {
                        let wait = backoff.next_backoff().unwrap_or(Duration::from_secs(60));
                        warn!(
                            location = %self.store.location(),
                            error = %e,
                            retry_in = ?wait,
                            "job store unavailable, retrying"
                        );
                        wait
                    }
                }
            };

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(wait_duration) => {}
            }
        }
    }
}
