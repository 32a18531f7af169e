use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use convoy_agent::config::Config;
use convoy_agent::engine::{PodmanEngine, check_available};
use convoy_agent::scheduler::JobPoller;
use convoy_client::QueueClient;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "convoy_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Convoy Agent");

    let config = Config::from_env()?;
    config.validate()?;
    info!(
        "Loaded configuration: agent_id={}, server_url={}, slots={}, labels={:?}",
        config.agent_id, config.server_url, config.slots, config.labels
    );

    check_available(&config.engine)
        .await
        .with_context(|| format!("{} is not usable", config.engine))?;
    tokio::fs::create_dir_all(&config.workspace)
        .await
        .context("Failed to create workspace directory")?;

    let client = QueueClient::new(config.server_url.clone()).with_token(config.token.clone());
    let engine = Arc::new(PodmanEngine::new(
        config.engine.clone(),
        config.workspace.clone(),
    ));
    let poller = JobPoller::new(&config, Arc::new(client), engine);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested, finishing running jobs");
            signal.cancel();
        }
    });

    if let Err(e) = poller.run(shutdown).await {
        error!("Agent stopped: {}", e);
        return Err(e.into());
    }

    info!("Agent stopped");
    Ok(())
}
