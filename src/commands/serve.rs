//! `serve`: wire a session to a device link and the delivery server.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::config::Config;
use crate::constants::{CONTROL_PATH, STREAM_PATH};
use crate::delivery::{DeliveryOptions, DeliveryServer};
use crate::link::{LinkManager, Source};
use crate::session::Session;

/// Read a handshake payload from a JSON file.
pub fn load_topology(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read topology {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Invalid topology JSON in {}", path.display()))
}

/// Run the relay until Ctrl-C.
///
/// A configured source is connected at startup; if that fails the relay
/// keeps serving and a device can be connected later over the control
/// endpoint. Until then consumers receive underrun ticks only.
pub async fn run(config: Config, topology: Option<Value>) -> Result<()> {
    let source = config
        .source
        .as_deref()
        .map(str::parse::<Source>)
        .transpose()?;

    let session = Arc::new(Session::new(&config));
    let links = Arc::new(LinkManager::new(Arc::clone(&session)));

    let server = DeliveryServer::bind(
        &config.listen_addr,
        Arc::clone(&links),
        DeliveryOptions {
            skip_underruns: config.skip_underruns,
        },
    )
    .await?;

    match source {
        Some(source) => {
            if let Err(e) = links.connect(source.clone(), topology).await {
                log::error!("Initial connect to {source} failed: {e:#}");
            }
        }
        None => {
            log::warn!("No device source configured; waiting for a connect request");
            if let Some(topology) = topology {
                session.connect(topology);
            }
        }
    }

    log::info!(
        "Relay ready: {} Hz, buffer {} samples, consumers at ws://{addr}{STREAM_PATH}, control at ws://{addr}{CONTROL_PATH}",
        config.tick_hz,
        config.buffer_capacity,
        addr = server.local_addr(),
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    log::info!("Shutting down...");

    server.shutdown();
    links.disconnect().await;

    let health = session.health();
    log::info!(
        "Final counters: {} accepted, {} rejected, {} evicted",
        health.ingest.accepted,
        health.ingest.rejected,
        health.evicted
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_topology() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("topology.json");
        std::fs::write(&path, r#"{"channels": ["emg0"], "rate": 500}"#).unwrap();
        let topology = load_topology(&path).unwrap();
        assert_eq!(topology["rate"], 500);
    }

    #[test]
    fn test_load_topology_rejects_bad_json() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("topology.json");
        std::fs::write(&path, "channels: 2").unwrap();
        assert!(load_topology(&path).is_err());
    }

    #[tokio::test]
    async fn test_invalid_source_fails_before_binding() {
        let config = Config {
            source: Some("not-an-address".into()),
            listen_addr: "127.0.0.1:0".into(),
            ..Config::default()
        };
        assert!(run(config, None).await.is_err());
    }
}
