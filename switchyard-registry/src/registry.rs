//! The lease registry.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use uuid::Uuid;

use switchyard_core::domain::endpoint::{Endpoint, ServiceName};

/// A time-bounded registration record.
///
/// Created on registration, refreshed by heartbeat, removed when
/// `expires_at` passes without one.
#[derive(Debug, Clone)]
pub struct Lease {
    /// Opaque lease handle returned to the registrant.
    pub id: String,
    /// Service the endpoint belongs to.
    pub service: ServiceName,
    /// The registered endpoint.
    pub endpoint: Endpoint,
    /// Instant after which the lease is dead.
    pub expires_at: Instant,
    /// When the last heartbeat (or the registration) arrived.
    pub last_heartbeat: Instant,
}

/// Result of a heartbeat attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAck {
    /// The lease was live and has been extended.
    Renewed,
    /// The lease is unknown or already expired; the caller must re-register.
    Expired,
}

/// A versioned snapshot of one service's live endpoints.
#[derive(Debug, Clone, Default)]
pub struct ServiceView {
    /// Monotonically increasing per-service change counter.
    pub version: u64,
    /// Live endpoints, sorted by instance id.
    pub endpoints: Vec<Endpoint>,
}

/// In-memory lease registry.
///
/// Queries filter expired leases on the fly, so an instance that died
/// silently stops being returned as soon as its lease runs out even if the
/// sweeper has not caught up yet.
#[derive(Debug)]
pub struct Registry {
    lease_ttl: Duration,
    leases: DashMap<String, Lease>,
    channels: DashMap<ServiceName, watch::Sender<ServiceView>>,
}

impl Registry {
    /// Creates a registry handing out leases of the given duration.
    pub fn new(lease_ttl: Duration) -> Self {
        Self {
            lease_ttl,
            leases: DashMap::new(),
            channels: DashMap::new(),
        }
    }

    /// The lease duration granted to registrants.
    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// Registers an endpoint and returns its fresh lease.
    pub fn register(&self, service: ServiceName, endpoint: Endpoint) -> Lease {
        let now = Instant::now();
        let lease = Lease {
            id: Uuid::new_v4().to_string(),
            service: service.clone(),
            endpoint,
            expires_at: now + self.lease_ttl,
            last_heartbeat: now,
        };
        self.leases.insert(lease.id.clone(), lease.clone());
        self.publish(&service);
        tracing::info!(service = %service, lease_id = %lease.id, "instance registered");
        lease
    }

    /// Refreshes a lease, or reports it expired.
    pub fn heartbeat(&self, lease_id: &str) -> HeartbeatAck {
        let now = Instant::now();
        let expired_service = match self.leases.get_mut(lease_id) {
            Some(mut lease) if lease.expires_at > now => {
                lease.last_heartbeat = now;
                lease.expires_at = now + self.lease_ttl;
                return HeartbeatAck::Renewed;
            }
            Some(lease) => Some(lease.service.clone()),
            None => None,
        };

        // The guard must be released before removal touches the same shard.
        if let Some(service) = expired_service {
            self.leases.remove(lease_id);
            self.publish(&service);
            tracing::warn!(lease_id, service = %service, "heartbeat on expired lease");
        }
        HeartbeatAck::Expired
    }

    /// Removes a lease on graceful shutdown.
    ///
    /// Returns `false` when the lease was already gone, which a caller must
    /// treat as success: lease expiry may have cleaned up first.
    pub fn deregister(&self, lease_id: &str) -> bool {
        match self.leases.remove(lease_id) {
            Some((_, lease)) => {
                self.publish(&lease.service);
                tracing::info!(lease_id, service = %lease.service, "instance deregistered");
                true
            }
            None => false,
        }
    }

    /// Live endpoints for a service.
    pub fn query(&self, service: &ServiceName) -> Vec<Endpoint> {
        self.live_endpoints(service)
    }

    /// Versioned snapshot for a service.
    pub fn view(&self, service: &ServiceName) -> ServiceView {
        let version = self
            .channels
            .get(service)
            .map(|tx| tx.borrow().version)
            .unwrap_or(0);
        ServiceView {
            version,
            endpoints: self.live_endpoints(service),
        }
    }

    /// Subscribes to endpoint-set changes for a service.
    pub fn watch(&self, service: &ServiceName) -> watch::Receiver<ServiceView> {
        self.channels
            .entry(service.clone())
            .or_insert_with(|| watch::channel(ServiceView::default()).0)
            .subscribe()
    }

    /// Removes expired leases and publishes updated views.
    ///
    /// Returns the number of leases removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, ServiceName)> = self
            .leases
            .iter()
            .filter(|lease| lease.expires_at <= now)
            .map(|lease| (lease.id.clone(), lease.service.clone()))
            .collect();

        for (id, _) in &expired {
            self.leases.remove(id);
        }
        let services: BTreeSet<&ServiceName> = expired.iter().map(|(_, s)| s).collect();
        for service in services {
            self.publish(service);
            tracing::warn!(service = %service, "expired leases swept");
        }
        expired.len()
    }

    fn live_endpoints(&self, service: &ServiceName) -> Vec<Endpoint> {
        let now = Instant::now();
        let mut endpoints: Vec<Endpoint> = self
            .leases
            .iter()
            .filter(|lease| &lease.service == service && lease.expires_at > now)
            .map(|lease| lease.endpoint.clone())
            .collect();
        endpoints.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        endpoints
    }

    fn publish(&self, service: &ServiceName) {
        let endpoints = self.live_endpoints(service);
        let tx = self
            .channels
            .entry(service.clone())
            .or_insert_with(|| watch::channel(ServiceView::default()).0);
        let version = tx.borrow().version + 1;
        tx.send_replace(ServiceView { version, endpoints });
    }
}

/// Spawns the background task that periodically sweeps expired leases.
pub fn spawn_sweeper(registry: Arc<Registry>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        // Skip the immediate first tick.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = registry.sweep();
            if removed > 0 {
                tracing::info!(removed, "lease sweep completed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(id: &str, port: u16) -> Endpoint {
        Endpoint::new("10.0.0.1", port, id)
    }

    #[tokio::test(start_paused = true)]
    async fn registered_endpoints_are_queryable() {
        let registry = Registry::new(Duration::from_secs(30));
        let service = ServiceName::new("vets-service");
        registry.register(service.clone(), ep("i-1", 8081));
        registry.register(service.clone(), ep("i-2", 8082));

        let endpoints = registry.query(&service);
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].instance_id, "i-1");
        assert_eq!(endpoints[1].instance_id, "i-2");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_death_excludes_the_endpoint_after_expiry() {
        let registry = Registry::new(Duration::from_secs(30));
        let service = ServiceName::new("vets-service");
        registry.register(service.clone(), ep("i-1", 8081));

        time::advance(Duration::from_secs(31)).await;
        // No sweep has run; query-time filtering alone must exclude it.
        assert!(registry.query(&service).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_extends_the_lease() {
        let registry = Registry::new(Duration::from_secs(30));
        let service = ServiceName::new("vets-service");
        let lease = registry.register(service.clone(), ep("i-1", 8081));

        time::advance(Duration::from_secs(20)).await;
        assert_eq!(registry.heartbeat(&lease.id), HeartbeatAck::Renewed);
        time::advance(Duration::from_secs(20)).await;
        // 40s since registration, but only 20s since the heartbeat.
        assert_eq!(registry.query(&service).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_after_expiry_demands_reregistration() {
        let registry = Registry::new(Duration::from_secs(30));
        let service = ServiceName::new("vets-service");
        let lease = registry.register(service.clone(), ep("i-1", 8081));

        time::advance(Duration::from_secs(31)).await;
        assert_eq!(registry.heartbeat(&lease.id), HeartbeatAck::Expired);
        assert_eq!(registry.heartbeat("no-such-lease"), HeartbeatAck::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn deregister_removes_immediately() {
        let registry = Registry::new(Duration::from_secs(30));
        let service = ServiceName::new("vets-service");
        let lease = registry.register(service.clone(), ep("i-1", 8081));

        assert!(registry.deregister(&lease.id));
        assert!(registry.query(&service).is_empty());
        assert!(!registry.deregister(&lease.id));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_expired_leases_and_bumps_the_view() {
        let registry = Registry::new(Duration::from_secs(30));
        let service = ServiceName::new("vets-service");
        registry.register(service.clone(), ep("i-1", 8081));
        let before = registry.view(&service).version;

        time::advance(Duration::from_secs(31)).await;
        assert_eq!(registry.sweep(), 1);
        let view = registry.view(&service);
        assert!(view.version > before);
        assert!(view.endpoints.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn watchers_observe_registrations() {
        let registry = Registry::new(Duration::from_secs(30));
        let service = ServiceName::new("vets-service");
        let mut rx = registry.watch(&service);
        assert_eq!(rx.borrow_and_update().version, 0);

        registry.register(service.clone(), ep("i-1", 8081));
        rx.changed().await.unwrap();
        let view = rx.borrow_and_update().clone();
        assert_eq!(view.version, 1);
        assert_eq!(view.endpoints.len(), 1);
    }
}
