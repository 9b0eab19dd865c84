//! Switchyard discovery server binary.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use switchyard_registry::registry::{spawn_sweeper, Registry};
use switchyard_registry::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let addr: SocketAddr = std::env::var("REGISTRY_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8761".to_string())
        .parse()
        .context("invalid REGISTRY_ADDR")?;
    let lease_ttl_ms: u64 = std::env::var("REGISTRY_LEASE_TTL_MS")
        .unwrap_or_else(|_| "30000".to_string())
        .parse()
        .context("invalid REGISTRY_LEASE_TTL_MS")?;

    let lease_ttl = Duration::from_millis(lease_ttl_ms);
    let registry = Arc::new(Registry::new(lease_ttl));
    spawn_sweeper(registry.clone(), (lease_ttl / 2).max(Duration::from_millis(500)));

    tracing::info!(%addr, lease_ttl_ms, "discovery server starting");
    server::start_server(addr, registry).await?;
    Ok(())
}
