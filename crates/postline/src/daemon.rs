//! Serve command: HTTP API, delay scheduler and store supervisor.
//!
//! The three run as independent tasks sharing one store handle and one
//! shutdown channel. A missing or unreadable database never stops the
//! service from starting; it serves degraded responses until the
//! supervisor reconnects.

use std::path::PathBuf;
use std::sync::Arc;

use miette::Result;
use tokio::sync::watch;
use tracing::{info, warn};

use postline_scheduler::{
    Executor, JobStore, Publisher, Scheduler, ServiceConfig, StatusReporter, StoreLocation,
    StoreSupervisor, WebhookPublisher,
};
use postline_web::{AppState, create_router};

pub async fn run(port: u16, db: PathBuf, config: ServiceConfig) -> Result<()> {
    let store = Arc::new(open_store(db));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let publisher: Arc<dyn Publisher> = Arc::new(
        WebhookPublisher::new(config.callback_timeout)
            .map_err(|e| miette::miette!("failed to build webhook client: {}", e))?,
    );
    let executor = Arc::new(
        Executor::new(
            Arc::clone(&store),
            publisher,
            config.retry.clone(),
            config.callback_timeout,
        )
        .with_shutdown(shutdown_rx.clone()),
    );
    let scheduler = Scheduler::new(Arc::clone(&store), executor, config.scheduler.clone());
    let supervisor = StoreSupervisor::new(Arc::clone(&store));

    // Handle shutdown signals
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        let _ = shutdown_tx_clone.send(true);
    });

    let supervisor_handle = {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { supervisor.run(shutdown_rx).await })
    };
    let scheduler_handle = {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    let reporter = StatusReporter::new(Arc::clone(&store), config.queue_name.clone());
    let router = create_router(Arc::new(AppState::new(
        Arc::clone(&store),
        reporter,
        config.retry.clone(),
    )));

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .map_err(|e| miette::miette!("failed to bind port {}: {}", port, e))?;

    info!(
        port,
        db = %store.location(),
        queue = %config.queue_name,
        "scheduler API listening on http://0.0.0.0:{}",
        port
    );

    let mut server_shutdown = shutdown_rx.clone();
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            while !*server_shutdown.borrow() {
                if server_shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

    // Stop background tasks even if the server failed on its own
    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_handle.await {
        warn!(error = %e, "scheduler task panicked");
    }
    if let Err(e) = supervisor_handle.await {
        warn!(error = %e, "store supervisor task panicked");
    }

    store.close();
    info!("postline shut down");

    served.map_err(|e| miette::miette!("server error: {}", e))
}

/// Open the store, falling back to a disconnected handle on failure.
///
/// Jobs a crashed process left `active` are requeued now, or on the first
/// reconnect when the store starts disconnected.
fn open_store(db: PathBuf) -> JobStore {
    match JobStore::open(&db) {
        Ok(store) => {
            if let Err(e) = store.requeue_interrupted() {
                warn!(error = %e, "failed to requeue interrupted jobs");
            }
            info!(db = %db.display(), "job store opened");
            store
        }
        Err(e) => {
            warn!(
                db = %db.display(),
                error = %e,
                "job store unavailable, starting in degraded mode"
            );
            JobStore::unavailable(StoreLocation::File(db)).requeue_on_connect()
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
