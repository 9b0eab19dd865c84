//! Endpoint resolution strategies.
//!
//! One trait, three implementations, selected once at configuration time.
//! Request handling talks to `dyn EndpointResolver` and never branches on
//! the discovery mode.

pub mod dns;
pub mod registry;
pub mod static_list;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::DiscoveryConfig;
use switchyard_core::domain::endpoint::{Endpoint, ServiceName};
use switchyard_core::error::GatewayError;
use switchyard_core::health::HealthTracker;

/// Maps a logical service name to its current candidate endpoints.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    /// Returns the known endpoints for `service`.
    ///
    /// Fails with [`GatewayError::Resolution`] when no endpoints are known.
    async fn resolve(&self, service: &ServiceName) -> Result<Vec<Endpoint>, GatewayError>;
}

/// Builds the resolver selected by configuration.
pub fn from_config(
    discovery: &DiscoveryConfig,
    health: Arc<HealthTracker>,
) -> Arc<dyn EndpointResolver> {
    match discovery {
        DiscoveryConfig::Registry {
            base_url,
            cache_ttl_ms,
        } => Arc::new(registry::RegistryBackedResolver::new(
            base_url.clone(),
            Duration::from_millis(*cache_ttl_ms),
            health,
        )),
        DiscoveryConfig::Dns {
            domain_suffix,
            default_port,
            refresh_ms,
        } => Arc::new(dns::PlatformDnsResolver::new(
            domain_suffix.clone(),
            *default_port,
            Duration::from_millis(*refresh_ms),
            health,
        )),
        DiscoveryConfig::Static { services } => {
            Arc::new(static_list::StaticListResolver::new(services.clone()))
        }
    }
}
