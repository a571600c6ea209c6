use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;

// Hub daemon configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct HubdConfig {
    // TCP listener bind address.
    pub bind: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Number of hub shards.
    pub shard_count: usize,
    // Per-connection outgoing message queue depth.
    pub outgoing_queue_depth: usize,
    // Per-connection signal queue depth.
    pub signal_queue_depth: usize,
}

const DEFAULT_BIND: &str = "127.0.0.1:1703";
const DEFAULT_METRICS_BIND: &str = "127.0.0.1:9632";
const DEFAULT_OUTGOING_QUEUE_DEPTH: usize = 64;
const DEFAULT_SIGNAL_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Deserialize)]
struct HubdConfigOverride {
    bind: Option<String>,
    metrics_bind: Option<String>,
    shard_count: Option<usize>,
    outgoing_queue_depth: Option<usize>,
    signal_queue_depth: Option<usize>,
}

impl HubdConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let bind = std::env::var("PORTICO_BIND")
            .unwrap_or_else(|_| DEFAULT_BIND.to_string())
            .parse()
            .with_context(|| "parse PORTICO_BIND")?;
        let metrics_bind = std::env::var("PORTICO_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse PORTICO_METRICS_BIND")?;
        // One shard per logical CPU by default.
        let shard_count = std::env::var("PORTICO_SHARDS")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or_else(portico_hub::default_shard_count);
        let outgoing_queue_depth = std::env::var("PORTICO_OUTGOING_QUEUE_DEPTH")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_OUTGOING_QUEUE_DEPTH);
        let signal_queue_depth = std::env::var("PORTICO_SIGNAL_QUEUE_DEPTH")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_SIGNAL_QUEUE_DEPTH);
        Ok(Self {
            bind,
            metrics_bind,
            shard_count,
            outgoing_queue_depth,
            signal_queue_depth,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        let Ok(config_path) = std::env::var("PORTICO_CONFIG") else {
            return Ok(config);
        };
        // YAML overrides allow ops-friendly config files.
        let contents = fs::read_to_string(&config_path)
            .with_context(|| format!("read PORTICO_CONFIG: {config_path}"))?;
        let override_cfg: HubdConfigOverride =
            serde_yaml::from_str(&contents).with_context(|| "parse hubd config yaml")?;
        if let Some(value) = override_cfg.bind {
            config.bind = value.parse().with_context(|| "parse bind")?;
        }
        if let Some(value) = override_cfg.metrics_bind {
            config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.shard_count {
            if value > 0 {
                config.shard_count = value;
            }
        }
        if let Some(value) = override_cfg.outgoing_queue_depth {
            if value > 0 {
                config.outgoing_queue_depth = value;
            }
        }
        if let Some(value) = override_cfg.signal_queue_depth {
            if value > 0 {
                config.signal_queue_depth = value;
            }
        }
        Ok(config)
    }
}
