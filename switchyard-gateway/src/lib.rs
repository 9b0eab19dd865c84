//! Switchyard gateway engine.
//!
//! The request-handling half of the edge layer: accepts inbound HTTP(S)
//! traffic, matches it against the routing table, resolves the target
//! service to a healthy endpoint, and forwards with per-route timeout and
//! retry semantics.

pub mod config;
pub mod forward;
pub mod health_check;
pub mod resolve;
pub mod server;
pub mod tls;
