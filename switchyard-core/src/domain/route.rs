//! Route definitions and the hot-swappable routing table.

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::domain::endpoint::ServiceName;

/// Path rewrite applied before a request is forwarded upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteRule {
    /// Prefix removed from the inbound path when present.
    #[serde(default)]
    pub strip_prefix: Option<String>,
    /// Prefix prepended after stripping.
    #[serde(default)]
    pub prepend: Option<String>,
}

impl RewriteRule {
    /// Rewrites `path`, always producing an absolute path.
    pub fn apply(&self, path: &str) -> String {
        let stripped = match &self.strip_prefix {
            Some(prefix) if path.starts_with(prefix.as_str()) => &path[prefix.len()..],
            _ => path,
        };

        let mut out = self.prepend.clone().unwrap_or_default();
        if !stripped.starts_with('/') && !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(stripped);
        if out.is_empty() {
            out.push('/');
        }
        out
    }
}

fn default_timeout_ms() -> u64 {
    5_000
}

/// One inbound match pattern and its forwarding policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Path prefix this route matches, respecting `/` segment boundaries.
    pub prefix: String,
    /// Optional host pin; `None` matches any host.
    #[serde(default)]
    pub host: Option<String>,
    /// Logical service the request is forwarded to.
    pub service: ServiceName,
    /// Deadline for the whole forward, retries included.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Additional attempts allowed on connection-level failure.
    #[serde(default)]
    pub max_retries: u32,
    /// Tie-breaker between routes with equally long prefixes; higher wins.
    #[serde(default)]
    pub priority: i32,
    /// Path rewrite applied before forwarding.
    #[serde(default)]
    pub rewrite: RewriteRule,
}

impl Route {
    fn matches(&self, path: &str, host: &str) -> bool {
        if let Some(pinned) = &self.host {
            if !pinned.eq_ignore_ascii_case(host) {
                return false;
            }
        }
        prefix_matches(&self.prefix, path)
    }
}

/// Prefix matching that respects path segment boundaries:
/// `/api` matches `/api` and `/api/users` but not `/apikeys`.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    if path == prefix {
        return true;
    }
    if path.starts_with(prefix) {
        if prefix.ends_with('/') {
            return true;
        }
        return path.as_bytes().get(prefix.len()) == Some(&b'/');
    }
    false
}

/// Strips the port and lowercases an inbound host value.
pub fn normalize_host(host: &str) -> String {
    host.split(':').next().unwrap_or(host).to_ascii_lowercase()
}

/// An immutable, ordered set of routes.
///
/// Built once from configuration and published through
/// [`SharedRoutingTable`]; matching never mutates the table.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: Vec<Route>,
}

impl RoutingTable {
    /// Builds a table preserving registration order.
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// Finds the route for `path` and `host`, or `None`.
    ///
    /// Longest prefix wins; ties go to the higher explicit priority, then
    /// to registration order (first wins).
    pub fn match_route(&self, path: &str, host: &str) -> Option<&Route> {
        let host = normalize_host(host);
        let mut best: Option<(usize, i32, &Route)> = None;

        for route in &self.routes {
            if !route.matches(path, &host) {
                continue;
            }
            let key = (route.prefix.len(), route.priority);
            let better = match best {
                None => true,
                // Strictly greater, so the earliest registration wins ties.
                Some((len, prio, _)) => key > (len, prio),
            };
            if better {
                best = Some((key.0, key.1, route));
            }
        }

        best.map(|(_, _, route)| route)
    }

    /// All routes in registration order.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Number of routes in the table.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table has no routes.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// A lock-free holder for the active routing table.
///
/// Uses `ArcSwap` so config reloads replace the whole table atomically:
/// concurrent readers see either the old table or the new one, never a
/// hybrid, and never block.
#[derive(Debug)]
pub struct SharedRoutingTable {
    inner: ArcSwap<RoutingTable>,
}

impl SharedRoutingTable {
    /// Creates the holder with an initial table.
    pub fn new(initial: RoutingTable) -> Self {
        Self {
            inner: ArcSwap::from_pointee(initial),
        }
    }

    /// Atomically replaces the active table.
    pub fn replace(&self, table: RoutingTable) {
        self.inner.store(Arc::new(table));
    }

    /// Retrieves the current table snapshot.
    pub fn snapshot(&self) -> Arc<RoutingTable> {
        self.inner.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(prefix: &str, service: &str) -> Route {
        Route {
            prefix: prefix.to_string(),
            host: None,
            service: ServiceName::new(service),
            timeout_ms: 1_000,
            max_retries: 0,
            priority: 0,
            rewrite: RewriteRule::default(),
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let table = RoutingTable::new(vec![
            route("/api", "fallback"),
            route("/api/vet", "vets-service"),
        ]);
        let matched = table.match_route("/api/vet/1", "any").unwrap();
        assert_eq!(matched.service, ServiceName::new("vets-service"));
    }

    #[test]
    fn priority_breaks_prefix_length_ties() {
        let mut low = route("/api/vet", "low");
        low.priority = 1;
        let mut high = route("/api/vet", "high");
        high.priority = 5;
        // Equal prefixes; the higher priority must win despite being
        // registered later.
        let table = RoutingTable::new(vec![low, high]);
        let matched = table.match_route("/api/vet/1", "any").unwrap();
        assert_eq!(matched.service, ServiceName::new("high"));
    }

    #[test]
    fn registration_order_breaks_full_ties() {
        let first = route("/api", "first");
        let second = route("/api", "second");
        let table = RoutingTable::new(vec![first, second]);
        let matched = table.match_route("/api/x", "any").unwrap();
        assert_eq!(matched.service, ServiceName::new("first"));
    }

    #[test]
    fn prefix_respects_segment_boundaries() {
        let table = RoutingTable::new(vec![route("/api", "svc")]);
        assert!(table.match_route("/api", "h").is_some());
        assert!(table.match_route("/api/users", "h").is_some());
        assert!(table.match_route("/apikeys", "h").is_none());
    }

    #[test]
    fn host_pin_is_case_insensitive_and_ignores_port() {
        let mut pinned = route("/api", "pinned");
        pinned.host = Some("edge.example.com".to_string());
        let table = RoutingTable::new(vec![pinned]);
        assert!(table.match_route("/api/x", "Edge.Example.Com:8080").is_some());
        assert!(table.match_route("/api/x", "other.example.com").is_none());
    }

    #[test]
    fn unmatched_path_yields_none() {
        let table = RoutingTable::new(vec![route("/api/vet", "vets-service")]);
        assert!(table.match_route("/unknown/path", "h").is_none());
    }

    #[test]
    fn rewrite_strips_and_prepends() {
        let rule = RewriteRule {
            strip_prefix: Some("/api/vet".to_string()),
            prepend: None,
        };
        assert_eq!(rule.apply("/api/vet/1"), "/1");
        assert_eq!(rule.apply("/api/vet"), "/");

        let rule = RewriteRule {
            strip_prefix: Some("/api".to_string()),
            prepend: Some("/internal".to_string()),
        };
        assert_eq!(rule.apply("/api/vet/1"), "/internal/vet/1");

        let identity = RewriteRule::default();
        assert_eq!(identity.apply("/api/vet/1"), "/api/vet/1");
    }

    #[test]
    fn shared_table_swap_is_wholesale() {
        let shared = SharedRoutingTable::new(RoutingTable::new(vec![route("/old", "old")]));
        let before = shared.snapshot();

        shared.replace(RoutingTable::new(vec![route("/new", "new")]));
        let after = shared.snapshot();

        // The earlier snapshot is untouched by the swap.
        assert!(before.match_route("/old/x", "h").is_some());
        assert!(before.match_route("/new/x", "h").is_none());
        assert!(after.match_route("/new/x", "h").is_some());
        assert!(after.match_route("/old/x", "h").is_none());
    }
}
