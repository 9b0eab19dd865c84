//! Background prober restoring unhealthy endpoints.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time;

use switchyard_core::health::HealthTracker;

/// TCP connect budget for one probe.
const PROBE_TIMEOUT: Duration = Duration::from_millis(1_500);

/// Spawns the task that periodically re-probes unhealthy endpoints.
///
/// Only endpoints whose per-endpoint backoff has elapsed are probed; a
/// successful TCP connect restores the endpoint to Healthy, a failed one
/// pushes its next probe further out.
pub fn spawn_probe_loop(tracker: Arc<HealthTracker>, interval_ms: u64) {
    let wake_every = Duration::from_millis(interval_ms);

    tokio::spawn(async move {
        let mut ticker = time::interval(wake_every);
        // Skip the immediate first tick.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            for authority in tracker.due_probes() {
                let reachable = matches!(
                    time::timeout(PROBE_TIMEOUT, TcpStream::connect(&authority)).await,
                    Ok(Ok(_))
                );

                if tracker.probe_result(&authority, reachable) {
                    tracing::info!(%authority, "endpoint restored after probe");
                } else if !reachable {
                    tracing::debug!(%authority, "probe failed; backing off");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use switchyard_core::domain::endpoint::Endpoint;
    use switchyard_core::health::Outcome;

    use super::*;

    #[tokio::test]
    async fn probe_loop_restores_a_reachable_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                drop(stream);
            }
        });

        let tracker = Arc::new(HealthTracker::new(
            3,
            Duration::from_millis(1),
            Duration::from_millis(50),
        ));
        let endpoint = Endpoint::new(addr.ip().to_string(), addr.port(), "i-1");
        for _ in 0..3 {
            tracker.report(&endpoint, Outcome::ConnectFailure);
        }
        assert!(!tracker.is_healthy(&endpoint));

        spawn_probe_loop(tracker.clone(), 10);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(tracker.is_healthy(&endpoint));
    }
}
