//! Endpoint liveness tracking.

pub mod tracker;

pub use tracker::{HealthTracker, Outcome};
