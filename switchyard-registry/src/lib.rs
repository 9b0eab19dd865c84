//! Switchyard service registry.
//!
//! The discovery-server half of the edge layer: a lease-based registry with
//! an HTTP/JSON wire surface, a client for it, and the self-registration
//! agent that registry-backed services run.
//!
//! Failure detection is lease expiry and nothing else: an instance that
//! stops heartbeating disappears from query results once its lease runs
//! out, whether or not it ever managed to deregister.

pub mod agent;
pub mod client;
pub mod registry;
pub mod server;
pub mod wire;
