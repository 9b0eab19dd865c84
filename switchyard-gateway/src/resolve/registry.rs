//! Registry-backed resolution.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::resolve::EndpointResolver;
use switchyard_core::domain::endpoint::{Endpoint, ServiceName};
use switchyard_core::error::GatewayError;
use switchyard_core::health::HealthTracker;
use switchyard_registry::client::RegistryClient;

#[derive(Debug, Clone)]
struct CachedSet {
    endpoints: Vec<Endpoint>,
    fetched_at: Instant,
    stale: bool,
}

/// Resolves service names by querying the registry, caching each answer.
///
/// A fresh cache short-circuits the query. When the registry cannot be
/// reached the last-known set is served and marked stale: transient
/// registry unreachability never fails a resolve while a cache exists.
/// Lease expiry propagates within the cache TTL, since an expired
/// instance vanishes from the next registry answer.
pub struct RegistryBackedResolver {
    client: RegistryClient,
    cache_ttl: Duration,
    health: Arc<HealthTracker>,
    cache: DashMap<ServiceName, CachedSet>,
}

impl RegistryBackedResolver {
    /// Creates the resolver for one registry base URL.
    pub fn new(base_url: String, cache_ttl: Duration, health: Arc<HealthTracker>) -> Self {
        Self {
            client: RegistryClient::new(base_url),
            cache_ttl,
            health,
            cache: DashMap::new(),
        }
    }

    /// Endpoints present before but absent now are put into Draining:
    /// nothing new is sent their way while in-flight requests finish.
    fn drain_removed(&self, previous: &[Endpoint], current: &[Endpoint]) {
        for endpoint in previous {
            if !current.contains(endpoint) {
                tracing::info!(endpoint = %endpoint, "endpoint left the registry; draining");
                self.health.drain(endpoint);
            }
        }
    }
}

#[async_trait]
impl EndpointResolver for RegistryBackedResolver {
    async fn resolve(&self, service: &ServiceName) -> Result<Vec<Endpoint>, GatewayError> {
        let cached = self.cache.get(service).map(|entry| entry.value().clone());
        if let Some(cached) = &cached {
            if !cached.stale && cached.fetched_at.elapsed() < self.cache_ttl {
                return Ok(cached.endpoints.clone());
            }
        }

        match self.client.query(service).await {
            Ok(answer) => {
                if let Some(previous) = &cached {
                    self.drain_removed(&previous.endpoints, &answer.endpoints);
                }
                self.cache.insert(
                    service.clone(),
                    CachedSet {
                        endpoints: answer.endpoints.clone(),
                        fetched_at: Instant::now(),
                        stale: false,
                    },
                );
                if answer.endpoints.is_empty() {
                    return Err(GatewayError::Resolution(service.to_string()));
                }
                Ok(answer.endpoints)
            }
            Err(err) => match cached {
                Some(mut stale) => {
                    tracing::warn!(
                        service = %service,
                        error = %err,
                        "registry unreachable; serving stale cache"
                    );
                    stale.stale = true;
                    let endpoints = stale.endpoints.clone();
                    self.cache.insert(service.clone(), stale);
                    if endpoints.is_empty() {
                        return Err(GatewayError::Resolution(service.to_string()));
                    }
                    Ok(endpoints)
                }
                None => Err(GatewayError::Resolution(format!("{service}: {err}"))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{SocketAddr, TcpListener as StdTcpListener};

    use switchyard_core::domain::endpoint::HealthState;
    use switchyard_registry::registry::Registry;
    use switchyard_registry::server;

    use super::*;

    fn ephemeral_addr() -> SocketAddr {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    async fn start_registry() -> (String, Arc<Registry>, tokio::task::JoinHandle<()>) {
        let addr = ephemeral_addr();
        let registry = Arc::new(Registry::new(Duration::from_secs(30)));
        let serving = registry.clone();
        let handle = tokio::spawn(async move {
            let _ = server::start_server(addr, serving).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        (format!("http://{addr}"), registry, handle)
    }

    #[tokio::test]
    async fn registered_instances_resolve() {
        let (base, registry, _server) = start_registry().await;
        let service = ServiceName::new("vets-service");
        registry.register(service.clone(), Endpoint::new("10.0.0.1", 8081, "i-1"));

        let resolver = RegistryBackedResolver::new(
            base,
            Duration::from_secs(5),
            Arc::new(HealthTracker::default()),
        );
        let endpoints = resolver.resolve(&service).await.unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].instance_id, "i-1");
    }

    #[tokio::test]
    async fn empty_answer_is_a_resolution_error() {
        let (base, _registry, _server) = start_registry().await;
        let resolver = RegistryBackedResolver::new(
            base,
            Duration::from_secs(5),
            Arc::new(HealthTracker::default()),
        );
        let err = resolver
            .resolve(&ServiceName::new("vets-service"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Resolution(_)));
    }

    #[tokio::test]
    async fn unreachable_registry_serves_the_stale_cache() {
        let (base, registry, server_task) = start_registry().await;
        let service = ServiceName::new("vets-service");
        registry.register(service.clone(), Endpoint::new("10.0.0.1", 8081, "i-1"));

        // Zero TTL forces a re-query on every resolve.
        let resolver = RegistryBackedResolver::new(
            base,
            Duration::ZERO,
            Arc::new(HealthTracker::default()),
        );
        let first = resolver.resolve(&service).await.unwrap();

        server_task.abort();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = resolver.resolve(&service).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn departed_instances_are_drained() {
        let (base, registry, _server) = start_registry().await;
        let service = ServiceName::new("vets-service");
        let leaving = Endpoint::new("10.0.0.1", 8081, "i-1");
        let lease = registry.register(service.clone(), leaving.clone());
        registry.register(service.clone(), Endpoint::new("10.0.0.2", 8081, "i-2"));

        let health = Arc::new(HealthTracker::default());
        let resolver = RegistryBackedResolver::new(base, Duration::ZERO, health.clone());
        resolver.resolve(&service).await.unwrap();

        registry.deregister(&lease.id);
        let endpoints = resolver.resolve(&service).await.unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(health.state(&leaving), HealthState::Draining);
    }
}
