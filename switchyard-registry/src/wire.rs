//! Wire types for the registry's HTTP/JSON interface.

use serde::{Deserialize, Serialize};

use switchyard_core::domain::endpoint::{Endpoint, ServiceName};

/// Body of `POST /services/{service}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// The endpoint being registered.
    pub endpoint: Endpoint,
}

/// Response to a successful registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Lease handle to heartbeat and deregister with.
    pub lease_id: String,
    /// Granted lease duration; heartbeats must arrive well within it.
    pub lease_ttl_ms: u64,
}

/// Outcome of `PUT /leases/{id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeartbeatStatus {
    /// Lease extended.
    #[serde(rename = "ok")]
    Renewed,
    /// Lease unknown or expired; the instance must register afresh.
    #[serde(rename = "expired")]
    Expired,
}

/// Response to a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Whether the lease was renewed.
    pub status: HeartbeatStatus,
}

/// Response to `GET /services/{service}` and its `/watch` variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    /// The queried service.
    pub service: ServiceName,
    /// Per-service change counter; watch requests pass it back as `after`.
    pub version: u64,
    /// Live endpoints, sorted by instance id.
    pub endpoints: Vec<Endpoint>,
}

/// JSON error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable failure description.
    pub error: String,
}
