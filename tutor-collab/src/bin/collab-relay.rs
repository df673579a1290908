//! Collab relay: standalone WebSocket relay for shared session documents.
//!
//! Environment:
//! - `COLLAB_BIND_ADDR` (default `127.0.0.1:9090`)
//! - `COLLAB_STORAGE_PATH` (unset = in-memory rooms)
//! - `COLLAB_SNAPSHOT_INTERVAL_SECS`, `COLLAB_EVICT_GRACE_SECS`
//! - `RUST_LOG` for log filtering

use log::{info, warn};
use std::path::PathBuf;
use std::time::Duration;

use tutor_collab::{RelayConfig, RelayServer};

fn env_secs(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(e) => {
            warn!("Ignoring {name}={raw}: {e}");
            None
        }
    }
}

fn config_from_env() -> RelayConfig {
    let mut config = RelayConfig::default();
    if let Ok(addr) = std::env::var("COLLAB_BIND_ADDR") {
        config.bind_addr = addr;
    }
    config.storage_path = std::env::var_os("COLLAB_STORAGE_PATH").map(PathBuf::from);
    if let Some(interval) = env_secs("COLLAB_SNAPSHOT_INTERVAL_SECS") {
        config.room.snapshot_interval = interval;
    }
    if let Some(grace) = env_secs("COLLAB_EVICT_GRACE_SECS") {
        config.room.evict_grace = grace;
    }
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = config_from_env();
    info!(
        "Starting collab relay (storage: {})",
        config
            .storage_path
            .as_ref()
            .map_or_else(|| "in-memory".to_string(), |p| p.display().to_string())
    );

    let server = RelayServer::new(config)?;
    server.run().await
}
