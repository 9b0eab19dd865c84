//! Peak-sensitive exponentially weighted moving average of endpoint latency.
//!
//! Latency spikes jump the average immediately; recovery decays back toward
//! the observed samples at the configured rate. Combined with the in-flight
//! request count this yields a load score for the least-loaded policy.

use std::sync::atomic::{AtomicU64, Ordering};

/// Latency and in-flight tracking for one endpoint.
///
/// The average is stored as the bit pattern of an `f64` so updates stay
/// lock-free.
#[derive(Debug)]
pub struct PeakEwma {
    ewma: AtomicU64,
    /// Decay rate: higher keeps history longer, lower favors recent samples.
    decay_alpha: f64,
    in_flight: AtomicU64,
}

impl PeakEwma {
    /// Creates a tracker seeded with an assumed initial latency.
    pub fn new(initial_latency_ms: f64, decay_alpha: f64) -> Self {
        Self {
            ewma: AtomicU64::new(initial_latency_ms.to_bits()),
            decay_alpha,
            in_flight: AtomicU64::new(0),
        }
    }

    /// The current moving average in milliseconds.
    pub fn current(&self) -> f64 {
        f64::from_bits(self.ewma.load(Ordering::Relaxed))
    }

    /// Folds a newly observed round-trip time into the average.
    pub fn observe(&self, rtt_ms: f64) {
        let mut current_bits = self.ewma.load(Ordering::Acquire);

        loop {
            let current = f64::from_bits(current_bits);

            // A sample above the average is a peak: track it instantly.
            // A sample below it decays the average toward the sample.
            let next = if rtt_ms > current {
                rtt_ms
            } else {
                rtt_ms * (1.0 - self.decay_alpha) + current * self.decay_alpha
            };

            match self.ewma.compare_exchange_weak(
                current_bits,
                next.to_bits(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(updated) => current_bits = updated,
            }
        }
    }

    /// Records the start of a request to this endpoint.
    pub fn start_request(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the end of a request to this endpoint.
    pub fn end_request(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    /// Load score: `(ewma + 1) * (in_flight + 1)`, lower is better.
    ///
    /// The `+ 1` terms keep an idle, fast endpoint from scoring zero and
    /// shadowing every other candidate forever.
    pub fn score(&self) -> f64 {
        let in_flight = self.in_flight.load(Ordering::Relaxed) as f64;
        (self.current() + 1.0) * (in_flight + 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peaks_are_tracked_instantly() {
        let ewma = PeakEwma::new(10.0, 0.5);
        ewma.observe(100.0);
        assert_eq!(ewma.current(), 100.0);
    }

    #[test]
    fn recovery_decays_gradually() {
        let ewma = PeakEwma::new(100.0, 0.5);
        ewma.observe(10.0);
        // 10 * 0.5 + 100 * 0.5
        assert!((ewma.current() - 55.0).abs() < f64::EPSILON);
        ewma.observe(10.0);
        assert!(ewma.current() < 55.0);
        assert!(ewma.current() > 10.0);
    }

    #[test]
    fn in_flight_requests_inflate_the_score() {
        let ewma = PeakEwma::new(10.0, 0.5);
        let idle_score = ewma.score();
        ewma.start_request();
        assert!(ewma.score() > idle_score);
        ewma.end_request();
        assert!((ewma.score() - idle_score).abs() < f64::EPSILON);
    }
}
