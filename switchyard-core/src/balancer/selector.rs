//! Selection policies picking one endpoint per outgoing request.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::balancer::ewma::PeakEwma;
use crate::domain::endpoint::{Endpoint, ServiceName};

/// Chooses one endpoint from a healthy candidate set.
///
/// The forwarder calls `on_dispatch`/`on_complete` around each attempt so
/// load-aware policies can track in-flight counts and observed latency;
/// stateless policies ignore them.
pub trait SelectionPolicy: Send + Sync {
    /// Picks an endpoint for `service`, or `None` when the set is empty.
    fn select(&self, service: &ServiceName, candidates: &[Endpoint]) -> Option<Endpoint>;

    /// Called just before a request is dispatched to `endpoint`.
    fn on_dispatch(&self, _endpoint: &Endpoint) {}

    /// Called when an attempt finishes; `rtt` is present only when an
    /// upstream response was received.
    fn on_complete(&self, _endpoint: &Endpoint, _rtt: Option<Duration>) {}
}

/// Round-robin over a stable ordering, one cursor per service.
///
/// Candidates are sorted by instance id before indexing, so selection is
/// deterministic for a given set. The cursor is a monotone counter reduced
/// modulo the current set size: it persists across calls, and a set-size
/// change merely clamps the position instead of restarting the rotation.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursors: DashMap<ServiceName, AtomicUsize>,
}

impl SelectionPolicy for RoundRobin {
    fn select(&self, service: &ServiceName, candidates: &[Endpoint]) -> Option<Endpoint> {
        if candidates.is_empty() {
            return None;
        }

        let mut ordered: Vec<&Endpoint> = candidates.iter().collect();
        ordered.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        let cursor = self
            .cursors
            .entry(service.clone())
            .or_insert_with(|| AtomicUsize::new(0));
        let position = cursor.fetch_add(1, Ordering::Relaxed);

        Some(ordered[position % ordered.len()].clone())
    }
}

/// Latency-aware policy favoring the least-loaded endpoint.
///
/// Keeps a [`PeakEwma`] per endpoint authority and picks the candidate with
/// the lowest score.
pub struct LeastLoaded {
    stats: DashMap<String, Arc<PeakEwma>>,
    decay_alpha: f64,
    initial_latency_ms: f64,
}

impl LeastLoaded {
    /// Creates the policy; `decay_alpha` of 0.5 is a balanced default.
    pub fn new(decay_alpha: f64) -> Self {
        Self {
            stats: DashMap::new(),
            decay_alpha,
            initial_latency_ms: 10.0,
        }
    }

    fn tracker(&self, endpoint: &Endpoint) -> Arc<PeakEwma> {
        self.stats
            .entry(endpoint.authority())
            .or_insert_with(|| Arc::new(PeakEwma::new(self.initial_latency_ms, self.decay_alpha)))
            .clone()
    }
}

impl Default for LeastLoaded {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl SelectionPolicy for LeastLoaded {
    fn select(&self, _service: &ServiceName, candidates: &[Endpoint]) -> Option<Endpoint> {
        candidates
            .iter()
            .min_by(|a, b| {
                let score_a = self.tracker(a).score();
                let score_b = self.tracker(b).score();
                score_a
                    .partial_cmp(&score_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }

    fn on_dispatch(&self, endpoint: &Endpoint) {
        self.tracker(endpoint).start_request();
    }

    fn on_complete(&self, endpoint: &Endpoint, rtt: Option<Duration>) {
        let tracker = self.tracker(endpoint);
        tracker.end_request();
        if let Some(rtt) = rtt {
            tracker.observe(rtt.as_secs_f64() * 1_000.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    fn endpoints(ids: &[&str]) -> Vec<Endpoint> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| Endpoint::new("127.0.0.1", 9000 + i as u16, *id))
            .collect()
    }

    #[test]
    fn empty_set_yields_none() {
        let policy = RoundRobin::default();
        assert!(policy.select(&ServiceName::new("svc"), &[]).is_none());
    }

    #[test]
    fn round_robin_cycles_deterministically() {
        let policy = RoundRobin::default();
        let service = ServiceName::new("svc");
        let eps = endpoints(&["a", "b", "c"]);

        let picked: Vec<String> = (0..6)
            .map(|_| policy.select(&service, &eps).unwrap().instance_id)
            .collect();
        assert_eq!(picked, ["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn cursor_is_per_service() {
        let policy = RoundRobin::default();
        let eps = endpoints(&["a", "b"]);

        let one = ServiceName::new("one");
        let two = ServiceName::new("two");
        assert_eq!(policy.select(&one, &eps).unwrap().instance_id, "a");
        // A fresh service starts its own rotation.
        assert_eq!(policy.select(&two, &eps).unwrap().instance_id, "a");
        assert_eq!(policy.select(&one, &eps).unwrap().instance_id, "b");
    }

    #[test]
    fn shrinking_set_clamps_instead_of_resetting() {
        let policy = RoundRobin::default();
        let service = ServiceName::new("svc");
        let full = endpoints(&["a", "b", "c"]);
        let reduced = endpoints(&["a", "b"]);

        policy.select(&service, &full);
        policy.select(&service, &full);
        // Cursor is at 2; over a two-element set it wraps to position 0
        // rather than starting a new rotation from scratch.
        assert_eq!(policy.select(&service, &reduced).unwrap().instance_id, "a");
        assert_eq!(policy.select(&service, &reduced).unwrap().instance_id, "b");
    }

    #[test]
    fn selection_ignores_input_order() {
        let policy = RoundRobin::default();
        let service = ServiceName::new("svc");
        let shuffled = endpoints(&["c", "a", "b"]);
        assert_eq!(policy.select(&service, &shuffled).unwrap().instance_id, "a");
    }

    #[test]
    fn least_loaded_prefers_idle_endpoints() {
        let policy = LeastLoaded::default();
        let service = ServiceName::new("svc");
        let eps = endpoints(&["a", "b"]);

        policy.on_dispatch(&eps[0]);
        let picked = policy.select(&service, &eps).unwrap();
        assert_eq!(picked.instance_id, "b");
        policy.on_complete(&eps[0], Some(Duration::from_millis(5)));
    }

    #[test]
    fn least_loaded_avoids_slow_endpoints() {
        let policy = LeastLoaded::default();
        let service = ServiceName::new("svc");
        let eps = endpoints(&["a", "b"]);

        policy.on_dispatch(&eps[0]);
        policy.on_complete(&eps[0], Some(Duration::from_millis(500)));
        policy.on_dispatch(&eps[1]);
        policy.on_complete(&eps[1], Some(Duration::from_millis(1)));

        assert_eq!(policy.select(&service, &eps).unwrap().instance_id, "b");
    }

    proptest! {
        // K consecutive selections over a fixed set of size K visit every
        // endpoint exactly once.
        #[test]
        fn round_robin_visits_each_endpoint_once_per_cycle(size in 1usize..8) {
            let policy = RoundRobin::default();
            let service = ServiceName::new("svc");
            let eps: Vec<Endpoint> = (0..size)
                .map(|i| Endpoint::new("127.0.0.1", 9000 + i as u16, format!("i-{i}")))
                .collect();

            let visited: HashSet<String> = (0..size)
                .map(|_| policy.select(&service, &eps).unwrap().instance_id)
                .collect();
            prop_assert_eq!(visited.len(), size);
        }
    }
}
