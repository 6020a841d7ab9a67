//! Worker heartbeat loop (spec.md §5: workers renew a liveness key every
//! `H=15s`; the job registry uses its expiry to detect `WorkerLost`),
//! grounded on the CLI adapter factory's background health-monitor shape
//! (`tokio::spawn` + `tokio::time::interval`).

use std::sync::Arc;
use std::time::Duration;

use job_registry::JobRegistry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Default heartbeat interval (spec.md §5).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Spawn a background task that renews `worker_id`'s liveness key every
/// `interval` until the returned token is cancelled. The TTL is 3x the
/// interval so a single missed tick doesn't falsely flag the worker dead.
pub fn spawn_heartbeat(
    registry: Arc<JobRegistry>,
    worker_id: String,
    interval: Duration,
) -> (JoinHandle<()>, CancellationToken) {
    let token = CancellationToken::new();
    let loop_token = token.clone();
    let ttl = interval.saturating_mul(3);

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                () = loop_token.cancelled() => {
                    info!(worker_id = %worker_id, "heartbeat loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = registry.heartbeat(&worker_id, ttl).await {
                        error!(worker_id = %worker_id, error = %e, "heartbeat renewal failed");
                    }
                }
            }
        }
    });

    (handle, token)
}
