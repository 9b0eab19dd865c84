//! Switchyard gateway binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use switchyard_core::balancer::{LeastLoaded, RoundRobin, SelectionPolicy};
use switchyard_core::domain::route::SharedRoutingTable;
use switchyard_core::health::HealthTracker;
use switchyard_gateway::config::provider::{ConfigProvider, HttpConfigProvider};
use switchyard_gateway::config::{self, PolicyConfig};
use switchyard_gateway::forward::Forwarder;
use switchyard_gateway::health_check::spawn_probe_loop;
use switchyard_gateway::server::{self, GatewayState};
use switchyard_gateway::{resolve, tls};
use switchyard_registry::agent::{AgentConfig, RegistrationAgent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let provider: Option<Arc<dyn ConfigProvider>> = std::env::var("CONFIG_URL")
        .ok()
        .map(|url| Arc::new(HttpConfigProvider::new(url)) as Arc<dyn ConfigProvider>);
    let config_file = std::env::var("GATEWAY_CONFIG_FILE").ok().map(PathBuf::from);

    let config = config::load(provider.as_deref(), config_file.as_deref()).await;

    let listen_addr: SocketAddr = std::env::var("GATEWAY_LISTEN")
        .unwrap_or_else(|_| config.listen_addr.clone())
        .parse()
        .context("invalid listen address")?;

    let health = Arc::new(HealthTracker::new(
        config.health.failure_threshold,
        Duration::from_millis(config.health.probe_base_ms),
        Duration::from_millis(config.health.probe_cap_ms),
    ));
    let policy: Arc<dyn SelectionPolicy> = match config.policy {
        PolicyConfig::RoundRobin => Arc::new(RoundRobin::default()),
        PolicyConfig::LeastLoaded => Arc::new(LeastLoaded::default()),
    };
    let resolver = resolve::from_config(&config.discovery, health.clone());
    let table = Arc::new(SharedRoutingTable::new(config.routing_table()));

    spawn_probe_loop(health.clone(), config.health.probe_interval_ms);
    if let Some(provider) = provider {
        config::spawn_config_watch(provider, table.clone(), Duration::from_secs(30));
    }

    let agent = config.registration.as_ref().map(|registration| {
        RegistrationAgent::spawn(AgentConfig {
            registry_url: registration.registry_url.clone(),
            service: registration.service.clone(),
            endpoint: registration.endpoint.clone(),
        })
    });

    let tls_acceptor = match &config.tls {
        Some(tls_config) => Some(tls::build_acceptor(tls_config)?),
        None => None,
    };

    let state = Arc::new(GatewayState {
        table,
        forwarder: Arc::new(Forwarder::new(resolver, health, policy)),
    });

    let serve = server::start_server(listen_addr, tls_acceptor, state);
    tokio::select! {
        result = serve => result.context("gateway server failed")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    if let Some(agent) = agent {
        agent.shutdown().await;
    }
    Ok(())
}
