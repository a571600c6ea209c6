// Hub daemon entry point.
use anyhow::{Context, Result};
use hubd::config::HubdConfig;
use hubd::{observability, server};
use portico_hub::Hub;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let metrics_handle = observability::init_observability();
    let config = HubdConfig::from_env_or_yaml().context("load hubd config")?;

    let hub = Arc::new(Hub::new(config.shard_count));
    tracing::info!(shards = hub.shard_count(), "hub started");

    let listener = server::bind(&config).await?;
    tracing::info!(addr = %listener.local_addr()?, "hub listener started");

    let metrics_bind = config.metrics_bind;
    let metrics_task = tokio::spawn(async move {
        if let Err(err) = observability::serve_metrics(metrics_handle, metrics_bind).await {
            tracing::warn!(error = %err, "metrics listener exited");
        }
    });
    let accept_task = {
        let hub = Arc::clone(&hub);
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(err) = server::serve(listener, hub, config).await {
                tracing::warn!(error = %err, "accept loop exited");
            }
        })
    };

    // Block until SIGINT so the process stays alive.
    let _ = tokio::signal::ctrl_c().await;
    accept_task.abort();
    metrics_task.abort();
    tracing::info!("hub stopped");
    Ok(())
}
