//! Platform-naming resolution.
//!
//! The platform owns endpoint membership entirely: there is no explicit
//! registration or deregistration, and health tracked by the gateway is
//! advisory only. The cached set for a service is replaced wholesale on
//! every refresh.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::resolve::EndpointResolver;
use switchyard_core::domain::endpoint::{Endpoint, ServiceName};
use switchyard_core::error::GatewayError;
use switchyard_core::health::HealthTracker;

#[derive(Debug, Clone)]
struct CachedSet {
    endpoints: Vec<Endpoint>,
    fetched_at: Instant,
}

/// Resolves service names through the platform's name service.
pub struct PlatformDnsResolver {
    domain_suffix: Option<String>,
    default_port: u16,
    refresh: Duration,
    health: Arc<HealthTracker>,
    cache: DashMap<ServiceName, CachedSet>,
}

impl PlatformDnsResolver {
    /// Creates the resolver.
    ///
    /// `domain_suffix` is appended to every lookup (e.g.
    /// `.svc.cluster.local`); `default_port` is assumed for each resolved
    /// address since plain name lookups carry none.
    pub fn new(
        domain_suffix: Option<String>,
        default_port: u16,
        refresh: Duration,
        health: Arc<HealthTracker>,
    ) -> Self {
        Self {
            domain_suffix,
            default_port,
            refresh,
            health,
            cache: DashMap::new(),
        }
    }

    fn lookup_target(&self, service: &ServiceName) -> String {
        match &self.domain_suffix {
            Some(suffix) => format!("{service}{suffix}:{}", self.default_port),
            None => format!("{service}:{}", self.default_port),
        }
    }

    async fn refresh_set(&self, service: &ServiceName) -> Result<Vec<Endpoint>, GatewayError> {
        let target = self.lookup_target(service);
        let addrs = tokio::net::lookup_host(&target)
            .await
            .map_err(|err| GatewayError::Resolution(format!("{service}: {err}")))?;

        let mut endpoints: Vec<Endpoint> = addrs
            .map(|addr| Endpoint::anonymous(addr.ip().to_string(), addr.port()))
            .collect();
        endpoints.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        endpoints.dedup();

        if endpoints.is_empty() {
            return Err(GatewayError::Resolution(service.to_string()));
        }
        Ok(endpoints)
    }

    /// Advisory health cleanup: addresses the platform stopped returning
    /// are forgotten so stale failure counts never outlive the instance.
    fn forget_dropped(&self, previous: &[Endpoint], current: &[Endpoint]) {
        for endpoint in previous {
            if !current.contains(endpoint) {
                self.health.forget(endpoint);
            }
        }
    }
}

#[async_trait]
impl EndpointResolver for PlatformDnsResolver {
    async fn resolve(&self, service: &ServiceName) -> Result<Vec<Endpoint>, GatewayError> {
        let cached = self.cache.get(service).map(|entry| entry.value().clone());
        if let Some(cached) = &cached {
            if cached.fetched_at.elapsed() < self.refresh {
                return Ok(cached.endpoints.clone());
            }
        }

        match self.refresh_set(service).await {
            Ok(endpoints) => {
                if let Some(previous) = &cached {
                    self.forget_dropped(&previous.endpoints, &endpoints);
                }
                self.cache.insert(
                    service.clone(),
                    CachedSet {
                        endpoints: endpoints.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                Ok(endpoints)
            }
            Err(err) => match cached {
                // A transient lookup failure serves the stale set.
                Some(stale) => {
                    tracing::warn!(
                        service = %service,
                        error = %err,
                        "name lookup failed; serving stale set"
                    );
                    Ok(stale.endpoints)
                }
                None => Err(err),
            },
        }
    }
}
