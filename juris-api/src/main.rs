//! JURIS service entry point
//!
//! Loads configuration, opens the shared store connection, starts the
//! background jobs and runs until ctrl-c or until the store is declared
//! unreachable.

use std::sync::Arc;

use juris_api::db::{PgChatStore, PostgresDriver};
use juris_api::{
    init_tracing, maintenance_task, ApiResult, AppConfig, AppState, UnconfiguredProvider,
};
use juris_core::ConnectionError;
use juris_llm::CompletionProvider;
use juris_storage::{LifecycleEvent, StoreDriver};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> ApiResult<()> {
    let config = AppConfig::from_env();
    init_tracing(&config.telemetry)?;
    config.validate()?;

    let store = Arc::new(PgChatStore::new());
    let provider: Arc<dyn CompletionProvider> = Arc::new(UnconfiguredProvider);
    tracing::warn!("No completion provider configured; replies use the fallback message");

    let maintenance_config = config.maintenance.clone();
    let state = Arc::new(AppState::new(
        config,
        Arc::new(PostgresDriver::new()),
        store.clone(),
        provider,
    ));

    let mut lifecycle = state.connection.subscribe();
    let conn = state.connection.ensure_connection().await?;
    store.ensure_schema(&conn).await?;
    state.start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = tokio::spawn(maintenance_task(
        Arc::clone(&state),
        maintenance_config,
        shutdown_rx,
    ));

    tracing::info!(
        driver = state.connection.driver().name(),
        "JURIS service started"
    );

    let exhausted = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            None
        }
        attempts = reconnect_exhausted(&mut lifecycle) => {
            tracing::error!(attempts, "Store unreachable; shutting down");
            Some(attempts)
        }
    };

    let _ = shutdown_tx.send(true);
    if let Err(e) = maintenance.await {
        tracing::warn!(error = %e, "Maintenance task did not finish cleanly");
    }
    if let Err(e) = state.shutdown().await {
        tracing::warn!(error = %e, "Store disconnect failed during shutdown");
    }

    match exhausted {
        Some(attempts) => Err(ConnectionError::ReconnectExhausted { attempts }.into()),
        None => Ok(()),
    }
}

/// Resolves once the connection manager gives up reconnecting.
async fn reconnect_exhausted(events: &mut broadcast::Receiver<LifecycleEvent>) -> u32 {
    loop {
        match events.recv().await {
            Ok(LifecycleEvent::ReconnectExhausted { attempts }) => return attempts,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Lifecycle event receiver lagged");
            }
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}
