//! Endpoint selection policies.

pub mod ewma;
pub mod selector;

pub use selector::{LeastLoaded, RoundRobin, SelectionPolicy};
