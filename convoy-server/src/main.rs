use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use convoy_server::api::{self, AppState};
use convoy_server::config::Config;
use convoy_server::db;
use convoy_server::lease;
use convoy_server::notify::Notifier;
use convoy_server::queue::Queue;
use convoy_server::storage::{MemoryStorage, PgStorage, Storage};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "convoy_server=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Convoy Server...");

    let config = Config::from_env();
    config.validate()?;

    let storage: Arc<dyn Storage> = match &config.database_url {
        Some(database_url) => {
            tracing::info!("Connecting to database...");
            let pool = db::create_pool(database_url)
                .await
                .context("Failed to create database pool")?;
            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            Arc::new(PgStorage::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, jobs are kept in memory only");
            Arc::new(MemoryStorage::new())
        }
    };

    let notifier = Notifier::from_url(config.webhook_url.clone());
    let queue = Arc::new(Queue::new(storage, notifier, config.queue_config()));
    queue
        .restore()
        .await
        .context("Failed to restore unfinished jobs")?;

    let shutdown = CancellationToken::new();
    let reaper = lease::spawn_reaper(queue.clone(), config.reap_interval, shutdown.clone());

    let app = api::create_router(AppState::new(queue, &config));

    tracing::info!(
        "Lease TTL {:?}, reap interval {:?}, max deliveries {}",
        config.lease_ttl,
        config.reap_interval,
        config.max_deliveries
    );
    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
            signal.cancel();
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    reaper.await.context("Lease reaper panicked")?;

    Ok(())
}
