//! Active re-probing of unhealthy endpoints.

pub mod prober;

pub use prober::spawn_probe_loop;
