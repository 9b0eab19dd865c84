//! Passive health accounting for resolved endpoints.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::domain::endpoint::{Endpoint, HealthState};

/// Outcome of one forwarding attempt, reported by the forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The upstream produced a response (any status).
    Success,
    /// Connection-level failure before any response byte arrived.
    ConnectFailure,
}

#[derive(Debug)]
struct EndpointHealth {
    state: HealthState,
    consecutive_failures: u32,
    next_probe: Instant,
    probe_backoff: Duration,
}

/// Tracks liveness per endpoint, keyed by `host:port` authority.
///
/// Endpoints that were never reported are assumed healthy. After
/// `failure_threshold` consecutive connection-level failures an endpoint
/// becomes Unhealthy and is scheduled for re-probing with exponential
/// backoff; a successful probe (or forwarded request) restores it.
///
/// State mutations go through `DashMap` entry guards, which serializes
/// updates per endpoint, so concurrent reports never lose increments.
#[derive(Debug)]
pub struct HealthTracker {
    entries: DashMap<String, EndpointHealth>,
    failure_threshold: u32,
    probe_base: Duration,
    probe_cap: Duration,
}

impl HealthTracker {
    /// Creates a tracker with explicit tuning.
    pub fn new(failure_threshold: u32, probe_base: Duration, probe_cap: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            failure_threshold: failure_threshold.max(1),
            probe_base,
            probe_cap,
        }
    }

    /// Current state of an endpoint.
    pub fn state(&self, endpoint: &Endpoint) -> HealthState {
        self.entries
            .get(&endpoint.authority())
            .map(|entry| entry.state)
            .unwrap_or(HealthState::Unknown)
    }

    /// Whether an endpoint may receive new requests.
    pub fn is_healthy(&self, endpoint: &Endpoint) -> bool {
        self.state(endpoint).selectable()
    }

    /// Filters `candidates` down to the selectable ones.
    pub fn healthy(&self, candidates: &[Endpoint]) -> Vec<Endpoint> {
        candidates
            .iter()
            .filter(|ep| self.is_healthy(ep))
            .cloned()
            .collect()
    }

    /// Records the outcome of one forwarding attempt.
    pub fn report(&self, endpoint: &Endpoint, outcome: Outcome) {
        let authority = endpoint.authority();
        let mut entry = self
            .entries
            .entry(authority)
            .or_insert_with(|| EndpointHealth {
                state: HealthState::Healthy,
                consecutive_failures: 0,
                next_probe: Instant::now(),
                probe_backoff: self.probe_base,
            });

        match outcome {
            Outcome::Success => {
                entry.consecutive_failures = 0;
                if entry.state != HealthState::Draining {
                    entry.state = HealthState::Healthy;
                }
            }
            Outcome::ConnectFailure => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.failure_threshold
                    && entry.state != HealthState::Draining
                {
                    entry.state = HealthState::Unhealthy;
                    entry.probe_backoff = self.probe_base;
                    entry.next_probe = Instant::now() + self.probe_base;
                }
            }
        }
    }

    /// Marks an endpoint as leaving the candidate set: no new selections,
    /// in-flight requests are unaffected.
    pub fn drain(&self, endpoint: &Endpoint) {
        let mut entry = self
            .entries
            .entry(endpoint.authority())
            .or_insert_with(|| EndpointHealth {
                state: HealthState::Healthy,
                consecutive_failures: 0,
                next_probe: Instant::now(),
                probe_backoff: self.probe_base,
            });
        entry.state = HealthState::Draining;
    }

    /// Drops all recorded state for an endpoint.
    pub fn forget(&self, endpoint: &Endpoint) {
        self.entries.remove(&endpoint.authority());
    }

    /// Authorities of Unhealthy endpoints whose probe is due.
    pub fn due_probes(&self) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| entry.state == HealthState::Unhealthy && entry.next_probe <= now)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Records the result of an active probe.
    ///
    /// Returns `true` when the probe restored the endpoint to Healthy.
    pub fn probe_result(&self, authority: &str, reachable: bool) -> bool {
        let Some(mut entry) = self.entries.get_mut(authority) else {
            return false;
        };
        if entry.state != HealthState::Unhealthy {
            return false;
        }

        if reachable {
            entry.state = HealthState::Healthy;
            entry.consecutive_failures = 0;
            entry.probe_backoff = self.probe_base;
            true
        } else {
            let doubled = entry.probe_backoff.saturating_mul(2);
            entry.probe_backoff = doubled.min(self.probe_cap);
            entry.next_probe = Instant::now() + entry.probe_backoff;
            false
        }
    }

    /// The configured consecutive-failure threshold.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30))
    }
}
