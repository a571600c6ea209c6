// TCP acceptor: one handler task per client connection.
use crate::config::HubdConfig;
use crate::conn;
use anyhow::{Context, Result};
use portico_hub::Hub;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Bind the hub listener. A bind failure is fatal to the process.
pub async fn bind(config: &HubdConfig) -> Result<TcpListener> {
    TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("bind hub listener on {}", config.bind))
}

/// Accept connections forever; accept failures are logged and the loop
/// continues.
pub async fn serve(listener: TcpListener, hub: Arc<Hub>, config: HubdConfig) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                metrics::counter!("portico_connections_accepted_total").increment(1);
                tracing::debug!(%peer, "client connected");
                let hub = Arc::clone(&hub);
                let config = config.clone();
                tokio::spawn(conn::handle_connection(hub, stream, peer, config));
            }
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
            }
        }
    }
}
