//! The relayq server binary.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use relayq::http::{self, AppState};
use relayq::{
    setup_database, Config, Dispatcher, DispatcherConfig, EventBus, HandlerRegistry, JobStore,
    PgStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.store.max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.store.url())
        .await
        .context("failed to connect to the store")?;
    setup_database(&pool)
        .await
        .context("failed to apply schema migrations")?;

    let store: Arc<dyn JobStore> = Arc::new(PgStore::new(pool));

    // Jobs orphaned by a crash stay `processing` until their lease lapses;
    // recover them before the pool starts claiming.
    let released = store
        .release_expired(config.worker.visibility_timeout(), Utc::now())
        .await?;
    if released > 0 {
        info!(released, "recovered jobs with expired leases");
    }

    let registry = Arc::new(default_registry());
    let bus = Arc::new(EventBus::default());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        registry,
        Arc::clone(&bus),
        DispatcherConfig {
            pool_size: config.worker.pool_size,
            visibility_timeout: config.worker.visibility_timeout(),
            poll_interval: config.worker.poll_interval(),
            retry: config.retry.policy(),
            default_max_retries: config.retry.max_attempts,
            ..DispatcherConfig::default()
        },
    ));
    dispatcher.start();

    let state = AppState {
        dispatcher: Arc::clone(&dispatcher),
        store,
        bus,
    };

    let listener = TcpListener::bind((config.server.host.as_str(), config.server.port))
        .await
        .with_context(|| {
            format!(
                "failed to bind {}:{}",
                config.server.host, config.server.port
            )
        })?;
    info!(addr = %listener.local_addr()?, "server listening");

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    dispatcher.shutdown().await;
    Ok(())
}

/// Handlers for the server binary. Deployments embedding relayq as a
/// library register their own.
fn default_registry() -> HandlerRegistry {
    HandlerRegistry::new().with_default_handler(|_ctx, job| async move {
        info!(job.id = %job.id, job.queue = %job.queue, "processing job");
        Ok(())
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received");
}
