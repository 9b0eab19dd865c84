//! Gateway configuration: types, loading, and the change watcher.
//!
//! Loading fails open at every step: an unreachable or undecodable
//! external provider degrades to the config file, and that to the bundled
//! static definition. Startup never fails because a collaborator is down.

pub mod provider;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::provider::ConfigProvider;
use switchyard_core::domain::endpoint::{Endpoint, ServiceName};
use switchyard_core::domain::route::{RewriteRule, Route, RoutingTable, SharedRoutingTable};
use switchyard_core::error::GatewayError;

/// Provider key holding the gateway configuration document.
pub const CONFIG_KEY: &str = "gateway";

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address the gateway listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Endpoint selection policy.
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Discovery strategy, fixed for the lifetime of the process.
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Health tracking tuning.
    #[serde(default)]
    pub health: HealthConfig,
    /// Inbound routes.
    #[serde(default)]
    pub routes: Vec<Route>,
    /// TLS termination; absent means plain HTTP.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Self-registration with a registry; absent means none.
    #[serde(default)]
    pub registration: Option<RegistrationConfig>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

/// Which selection policy the forwarder uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyConfig {
    /// Deterministic rotation over the healthy set.
    #[default]
    RoundRobin,
    /// Latency- and load-aware selection.
    LeastLoaded,
}

/// Discovery strategy selection.
///
/// Chosen once at configuration time; request handling never branches on
/// the mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum DiscoveryConfig {
    /// Instances register themselves; the gateway queries the registry.
    Registry {
        /// Registry base URL.
        base_url: String,
        /// How long a queried endpoint set stays fresh.
        #[serde(default = "default_cache_ttl_ms")]
        cache_ttl_ms: u64,
    },
    /// The platform answers name lookups; nothing registers explicitly.
    Dns {
        /// Suffix appended to the service name, e.g. `.svc.cluster.local`.
        #[serde(default)]
        domain_suffix: Option<String>,
        /// Port assumed for every resolved address.
        default_port: u16,
        /// How long a resolved set is served before re-resolving.
        #[serde(default = "default_refresh_ms")]
        refresh_ms: u64,
    },
    /// Discovery disabled: a fixed endpoint set per service.
    Static {
        /// Endpoints keyed by service name.
        services: BTreeMap<ServiceName, Vec<Endpoint>>,
    },
}

fn default_cache_ttl_ms() -> u64 {
    10_000
}

fn default_refresh_ms() -> u64 {
    30_000
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig::Static {
            services: BTreeMap::new(),
        }
    }
}

/// Health tracker and probe loop tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Consecutive connection failures before an endpoint is unhealthy.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Initial re-probe delay for an unhealthy endpoint.
    #[serde(default = "default_probe_base_ms")]
    pub probe_base_ms: u64,
    /// Upper bound for the doubling re-probe delay.
    #[serde(default = "default_probe_cap_ms")]
    pub probe_cap_ms: u64,
    /// How often the probe loop wakes up.
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_probe_base_ms() -> u64 {
    1_000
}

fn default_probe_cap_ms() -> u64 {
    30_000
}

fn default_probe_interval_ms() -> u64 {
    2_000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            probe_base_ms: default_probe_base_ms(),
            probe_cap_ms: default_probe_cap_ms(),
            probe_interval_ms: default_probe_interval_ms(),
        }
    }
}

/// Certificate and key for TLS termination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain path.
    pub cert_path: String,
    /// PEM PKCS#8 private key path.
    pub key_path: String,
}

/// Self-registration of the gateway with a registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Registry base URL.
    pub registry_url: String,
    /// Service name to register under.
    pub service: ServiceName,
    /// Advertised endpoint of this gateway instance.
    pub endpoint: Endpoint,
}

impl GatewayConfig {
    /// The statically bundled definition used when every external source
    /// is disabled or unreachable.
    pub fn bundled() -> Self {
        let api_route = |prefix: &str, service: &str| Route {
            prefix: prefix.to_string(),
            host: None,
            service: ServiceName::new(service),
            timeout_ms: 5_000,
            max_retries: 2,
            priority: 0,
            rewrite: RewriteRule {
                strip_prefix: Some(prefix.to_string()),
                prepend: None,
            },
        };

        Self {
            listen_addr: default_listen_addr(),
            policy: PolicyConfig::RoundRobin,
            discovery: DiscoveryConfig::Dns {
                domain_suffix: None,
                default_port: 8080,
                refresh_ms: default_refresh_ms(),
            },
            health: HealthConfig::default(),
            routes: vec![
                api_route("/api/customer", "customers-service"),
                api_route("/api/vet", "vets-service"),
                api_route("/api/visit", "visits-service"),
            ],
            tls: None,
            registration: None,
        }
    }

    /// Builds the immutable routing table from the configured routes.
    pub fn routing_table(&self) -> RoutingTable {
        RoutingTable::new(self.routes.clone())
    }
}

/// Reads a configuration file.
pub fn from_file(path: &Path) -> Result<GatewayConfig, GatewayError> {
    let raw = std::fs::read(path)
        .map_err(|err| GatewayError::ConfigUnavailable(format!("{}: {err}", path.display())))?;
    serde_json::from_slice(&raw)
        .map_err(|err| GatewayError::ConfigUnavailable(format!("{}: {err}", path.display())))
}

/// Loads the startup configuration, failing open.
///
/// Precedence: external provider, then config file, then the bundled
/// definition. A failure at any step logs the degradation and moves on;
/// this function cannot fail.
pub async fn load(provider: Option<&dyn ConfigProvider>, file: Option<&Path>) -> GatewayConfig {
    if let Some(provider) = provider {
        match provider.get(CONFIG_KEY).await {
            Ok(value) => match serde_json::from_value::<GatewayConfig>(value) {
                Ok(config) => {
                    tracing::info!(routes = config.routes.len(), "configuration loaded from provider");
                    return config;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "provider configuration undecodable; falling back");
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "configuration provider unavailable; falling back");
            }
        }
    }

    if let Some(path) = file {
        match from_file(path) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "configuration loaded from file");
                return config;
            }
            Err(err) => {
                tracing::warn!(error = %err, "config file unusable; falling back to bundled");
            }
        }
    }

    tracing::info!("using bundled static configuration");
    GatewayConfig::bundled()
}

/// Spawns the watcher that polls the provider and atomically rebuilds the
/// routing table on change.
///
/// Provider failures leave the last-good table in effect. In-flight
/// requests keep the snapshot they started with.
pub fn spawn_config_watch(
    provider: Arc<dyn ConfigProvider>,
    table: Arc<SharedRoutingTable>,
    interval: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        let mut last_seen: Option<serde_json::Value> = None;

        loop {
            ticker.tick().await;
            match provider.get(CONFIG_KEY).await {
                Ok(value) => {
                    if last_seen.as_ref() == Some(&value) {
                        continue;
                    }
                    match serde_json::from_value::<GatewayConfig>(value.clone()) {
                        Ok(config) => {
                            let routes = config.routes.len();
                            table.replace(config.routing_table());
                            last_seen = Some(value);
                            tracing::info!(routes, "routing table rebuilt");
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "ignoring undecodable configuration update");
                        }
                    }
                }
                Err(err) => {
                    tracing::debug!(error = %err, "config watch degraded; keeping last-good table");
                }
            }
        }
    });
}
