//! Self-registration agent for registry-backed services.
//!
//! One background task per instance owns the entire lease lifecycle:
//! register on start, heartbeat on an interval, deregister on graceful
//! shutdown. Lease state never leaves the task; the handle talks to it
//! through a command channel, so heartbeat and deregistration can never
//! race each other.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::client::RegistryClient;
use crate::wire::HeartbeatStatus;
use switchyard_core::domain::endpoint::{Endpoint, ServiceName};

/// What the agent registers, and where.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the registry, e.g. `http://127.0.0.1:8761`.
    pub registry_url: String,
    /// Logical service the instance belongs to.
    pub service: ServiceName,
    /// The instance's own advertised endpoint.
    pub endpoint: Endpoint,
}

enum Command {
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running registration agent.
pub struct RegistrationAgent {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl RegistrationAgent {
    /// Spawns the agent task and begins the register/heartbeat lifecycle.
    pub fn spawn(config: AgentConfig) -> Self {
        let (commands, rx) = mpsc::channel(1);
        let task = tokio::spawn(run(config, rx));
        Self { commands, task }
    }

    /// Deregisters the instance and stops the agent.
    ///
    /// Deregistration is best effort; if it cannot run, lease expiry cleans
    /// up on the registry side.
    pub async fn shutdown(self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack)).await.is_ok() {
            let _ = done.await;
        }
        let _ = self.task.await;
    }
}

enum RenewOutcome {
    Renewed,
    LeaseLost,
    ShuttingDown,
}

async fn run(config: AgentConfig, mut commands: mpsc::Receiver<Command>) {
    let client = RegistryClient::new(&config.registry_url);

    'lifecycle: loop {
        let Some(lease) = register_with_backoff(&client, &config, &mut commands).await else {
            return;
        };
        let ttl = Duration::from_millis(lease.lease_ttl_ms.max(2));
        // Heartbeating twice per lease keeps a >= 2x safety margin.
        let mut ticker = time::interval(ttl / 2);
        ticker.tick().await;
        let mut last_renewal = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match renew(&client, &lease.lease_id, ttl, &mut last_renewal, &mut commands).await {
                        RenewOutcome::Renewed => {}
                        RenewOutcome::LeaseLost => {
                            tracing::warn!(
                                service = %config.service,
                                "lease lost; registering afresh"
                            );
                            continue 'lifecycle;
                        }
                        RenewOutcome::ShuttingDown => return,
                    }
                }
                command = commands.recv() => {
                    finish(&client, &lease.lease_id, command).await;
                    return;
                }
            }
        }
    }
}

/// Registers the instance, backing off on failure. Returns `None` when a
/// shutdown arrives before registration succeeds.
async fn register_with_backoff(
    client: &RegistryClient,
    config: &AgentConfig,
    commands: &mut mpsc::Receiver<Command>,
) -> Option<crate::wire::RegisterResponse> {
    let mut backoff = Duration::from_millis(250);

    loop {
        match client.register(&config.service, &config.endpoint).await {
            Ok(lease) => {
                tracing::info!(
                    service = %config.service,
                    lease_id = %lease.lease_id,
                    ttl_ms = lease.lease_ttl_ms,
                    "instance registered"
                );
                return Some(lease);
            }
            Err(err) => {
                tracing::warn!(
                    service = %config.service,
                    error = %err,
                    "registration failed; retrying"
                );
                tokio::select! {
                    _ = time::sleep(backoff) => {
                        backoff = (backoff * 2).min(Duration::from_secs(10));
                    }
                    command = commands.recv() => {
                        if let Some(Command::Shutdown(ack)) = command {
                            let _ = ack.send(());
                        }
                        return None;
                    }
                }
            }
        }
    }
}

/// Renews the lease, retrying transport failures with backoff until the
/// lease would have expired.
async fn renew(
    client: &RegistryClient,
    lease_id: &str,
    ttl: Duration,
    last_renewal: &mut Instant,
    commands: &mut mpsc::Receiver<Command>,
) -> RenewOutcome {
    let mut backoff = Duration::from_millis(100);

    loop {
        match client.heartbeat(lease_id).await {
            Ok(HeartbeatStatus::Renewed) => {
                *last_renewal = Instant::now();
                return RenewOutcome::Renewed;
            }
            Ok(HeartbeatStatus::Expired) => return RenewOutcome::LeaseLost,
            Err(err) => {
                if last_renewal.elapsed() >= ttl {
                    tracing::warn!(lease_id, error = %err, "lease presumed expired");
                    return RenewOutcome::LeaseLost;
                }
                tracing::debug!(lease_id, error = %err, "heartbeat failed; retrying");
                tokio::select! {
                    _ = time::sleep(backoff) => {
                        backoff = (backoff * 2).min(Duration::from_secs(2));
                    }
                    command = commands.recv() => {
                        finish(client, lease_id, command).await;
                        return RenewOutcome::ShuttingDown;
                    }
                }
            }
        }
    }
}

/// Best-effort deregistration followed by the shutdown acknowledgement.
async fn finish(client: &RegistryClient, lease_id: &str, command: Option<Command>) {
    if let Err(err) = client.deregister(lease_id).await {
        tracing::warn!(
            lease_id,
            error = %err,
            "deregistration failed; lease expiry will clean up"
        );
    }
    if let Some(Command::Shutdown(ack)) = command {
        let _ = ack.send(());
    }
}
