//! Service and endpoint models.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A logical service name.
///
/// Names are compared case-insensitively; the constructor (and serde)
/// normalize to lowercase so the derived `Eq`/`Hash`/`Ord` are correct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ServiceName(String);

impl ServiceName {
    /// Creates a normalized service name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().to_ascii_lowercase())
    }

    /// The normalized (lowercase) form of the name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ServiceName {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<&str> for ServiceName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<ServiceName> for String {
    fn from(name: ServiceName) -> Self {
        name.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Application protocol spoken by an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain HTTP/1.1.
    #[default]
    Http,
    /// HTTP over TLS.
    Https,
}

/// A concrete network location of one service instance.
///
/// Endpoints have value semantics: resolvers replace candidate sets
/// wholesale instead of mutating endpoints in place, so concurrent readers
/// never observe a torn endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Application protocol.
    #[serde(default)]
    pub protocol: Protocol,
    /// Stable identity of the instance behind this endpoint.
    ///
    /// Resolvers that cannot observe instance identity (platform naming)
    /// derive it from the address.
    pub instance_id: String,
    /// Free-form instance metadata (zone, version, weight hints).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Endpoint {
    /// Creates an endpoint with an explicit instance id.
    pub fn new(host: impl Into<String>, port: u16, instance_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: Protocol::Http,
            instance_id: instance_id.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Creates an endpoint whose instance id is its own address.
    pub fn anonymous(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let instance_id = format!("{host}:{port}");
        Self::new(host, port, instance_id)
    }

    /// The `host:port` authority this endpoint is dialed at.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.instance_id, self.host, self.port)
    }
}

/// Liveness state of an endpoint as tracked by the health tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Never observed; assumed healthy until reported otherwise.
    Unknown,
    /// Eligible for selection.
    Healthy,
    /// Excluded from selection until a probe succeeds.
    Unhealthy,
    /// Leaving the candidate set: no new requests, in-flight ones complete.
    Draining,
}

impl HealthState {
    /// Whether an endpoint in this state may receive new requests.
    pub fn selectable(self) -> bool {
        matches!(self, HealthState::Unknown | HealthState::Healthy)
    }
}
