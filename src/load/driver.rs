use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use super::executor::RequestExecutor;
use super::metrics::{FailureKind, MetricsAggregator, RequestOutcome};

/// Everything a virtual user needs, shared by all drivers of one controller.
pub struct DriverContext {
    pub executor: Arc<dyn RequestExecutor>,
    pub aggregator: Arc<MetricsAggregator>,
    pub timeout: Duration,
    pub think_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The controller-wide stop token fired (cancel or end of run).
    Stopped,
    /// This driver was retired during ramp-down.
    Retired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverExit {
    pub index: usize,
    pub requests: u64,
    pub reason: ExitReason,
}

/// Request / record / think loop for one virtual user.
///
/// Both the in-flight request and the think-time sleep race the stop and
/// retire tokens, so a stop never waits for a request to finish. An
/// abandoned request is not recorded.
pub async fn run_virtual_user(
    index: usize,
    ctx: Arc<DriverContext>,
    mut stop: watch::Receiver<bool>,
    mut retire: watch::Receiver<bool>,
) -> DriverExit {
    let mut requests: u64 = 0;
    let exit = |requests, reason| DriverExit {
        index,
        requests,
        reason,
    };

    loop {
        if *stop.borrow() {
            return exit(requests, ExitReason::Stopped);
        }
        if *retire.borrow() {
            return exit(requests, ExitReason::Retired);
        }

        let outcome = tokio::select! {
            biased;
            _ = stopped(&mut stop) => return exit(requests, ExitReason::Stopped),
            _ = stopped(&mut retire) => return exit(requests, ExitReason::Retired),
            result = tokio::time::timeout(ctx.timeout, ctx.executor.execute()) => match result {
                Ok(outcome) => outcome,
                Err(_) => RequestOutcome::failure(
                    FailureKind::Timeout,
                    ctx.timeout.as_secs_f64() * 1000.0,
                    None,
                ),
            },
        };

        ctx.aggregator.record(&outcome);
        requests += 1;

        if ctx.think_time.is_zero() {
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            biased;
            _ = stopped(&mut stop) => return exit(requests, ExitReason::Stopped),
            _ = stopped(&mut retire) => return exit(requests, ExitReason::Retired),
            _ = tokio::time::sleep(ctx.think_time) => {}
        }
    }
}

/// Resolves once the token is set. A dropped sender counts as a stop.
pub(super) async fn stopped(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        debug!("Stop token sender dropped");
    }
}
