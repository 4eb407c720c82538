use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::JANITOR_INTERVAL_SECS;
use crate::state::SharedState;

/// One sweep: forget finished jobs older than the retention window.
pub async fn sweep(state: &SharedState) -> usize {
    let removed = state
        .queue
        .cleanup_completed_jobs(state.config.job_retention_hours)
        .await;
    if removed > 0 {
        info!("Janitor: removed {} expired jobs", removed);
    } else {
        debug!("Janitor: nothing to remove");
    }
    removed
}

/// Spawn the janitor background task. It exits on shutdown.
pub fn spawn_janitor(state: SharedState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Janitor task started (retention {}h)",
            state.config.job_retention_hours
        );
        let interval = Duration::from_secs(JANITOR_INTERVAL_SECS);
        let mut shutdown_rx = state.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = sleep(interval) => {
                    sweep(&state).await;
                }
            }
        }
        info!("Janitor task stopped");
    })
}
