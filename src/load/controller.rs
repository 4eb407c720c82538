//! Load test controller: owns one run from spawn schedule to final report.
//!
//! Phase changes and the terminal decision go through one mutex. A stop
//! request sets `cancel_requested` under that mutex, and the terminal decision
//! reads it first, so an accepted cancel always ends as `cancelled` no matter
//! how far the run got. Once the full duration has elapsed the run is
//! draining and further stop requests are refused.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::driver::{run_virtual_user, stopped, DriverContext, DriverExit, ExitReason};
use super::executor::RequestExecutor;
use super::metrics::{MetricsAggregator, MetricsSnapshot};
use super::report::{Report, ReportInput};
use super::schedule::{self, LoadSchedule};
use super::{LoadTestConfig, RunPhase};
use crate::config::{DRAIN_GRACE_SECS, PROGRESS_INTERVAL_MS};
use crate::events::{EventHub, EventKind};

/// Point-in-time view of a live run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveTestStatus {
    pub test_id: String,
    pub user_id: String,
    pub url: String,
    pub status: RunPhase,
    pub progress: f64,
    pub active_users: usize,
    pub target_users: u32,
    pub elapsed_secs: f64,
    pub cancel_requested: bool,
    pub real_time_metrics: MetricsSnapshot,
}

struct PhaseState {
    phase: RunPhase,
    cancel_requested: bool,
    draining: bool,
    report: Option<Arc<Report>>,
}

struct ControllerShared {
    test_id: String,
    user_id: String,
    url: String,
    config: LoadTestConfig,
    aggregator: Arc<MetricsAggregator>,
    events: Arc<EventHub>,
    state: Mutex<PhaseState>,
    stop_tx: watch::Sender<bool>,
    report_tx: watch::Sender<Option<Arc<Report>>>,
    active_users: AtomicUsize,
    peak_active_users: AtomicUsize,
    started: Instant,
    started_at: DateTime<Utc>,
}

/// Cheap, cloneable reference to a controller for status, stop and result
/// retrieval.
#[derive(Clone)]
pub struct ControllerHandle {
    shared: Arc<ControllerShared>,
}

pub struct LoadTestController {
    shared: Arc<ControllerShared>,
    executor: Arc<dyn RequestExecutor>,
}

impl LoadTestController {
    pub fn new(
        test_id: impl Into<String>,
        user_id: impl Into<String>,
        url: impl Into<String>,
        config: LoadTestConfig,
        executor: Arc<dyn RequestExecutor>,
        events: Arc<EventHub>,
        reservoir_capacity: usize,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (report_tx, _) = watch::channel(None);
        let shared = Arc::new(ControllerShared {
            test_id: test_id.into(),
            user_id: user_id.into(),
            url: url.into(),
            config,
            aggregator: Arc::new(MetricsAggregator::with_capacity(reservoir_capacity)),
            events,
            state: Mutex::new(PhaseState {
                phase: RunPhase::Starting,
                cancel_requested: false,
                draining: false,
                report: None,
            }),
            stop_tx,
            report_tx,
            active_users: AtomicUsize::new(0),
            peak_active_users: AtomicUsize::new(0),
            started: Instant::now(),
            started_at: Utc::now(),
        });
        Self { shared, executor }
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Drive the run to a terminal state and return its report.
    pub async fn run(self) -> Arc<Report> {
        let handle = self.handle();
        let shared = &self.shared;
        let schedule = schedule::plan(&shared.config);

        info!(
            "Load test {} starting: user={}, url={}, users={}, duration={}s, profile={:?}",
            shared.test_id,
            shared.user_id,
            shared.url,
            shared.config.users,
            shared.config.duration,
            shared.config.test_type
        );
        handle.transition(RunPhase::RampingUp);

        let ctx = Arc::new(DriverContext {
            executor: self.executor.clone(),
            aggregator: shared.aggregator.clone(),
            timeout: shared.config.request_timeout(),
            think_time: shared.config.think_time(),
        });

        let (requested, error) = self.drive(&handle, &schedule, ctx).await;
        let report = handle.conclude(requested, error).await;
        handle.publish(report.clone());
        report
    }

    async fn drive(
        &self,
        handle: &ControllerHandle,
        schedule: &LoadSchedule,
        ctx: Arc<DriverContext>,
    ) -> (RunPhase, Option<String>) {
        let shared = &self.shared;
        let total = schedule.spawn_offsets.len();
        let mut drivers: JoinSet<DriverExit> = JoinSet::new();
        let mut retire_txs: Vec<watch::Sender<bool>> = Vec::with_capacity(total);
        let mut next_spawn = 0usize;
        let mut ramp_down_entered = false;
        let mut stop_rx = shared.stop_tx.subscribe();

        let mut progress = tokio::time::interval(Duration::from_millis(PROGRESS_INTERVAL_MS));
        progress.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let outcome = loop {
            let elapsed = shared.started.elapsed();

            while next_spawn < total && schedule.spawn_offsets[next_spawn] <= elapsed {
                let (retire_tx, retire_rx) = watch::channel(false);
                retire_txs.push(retire_tx);
                drivers.spawn(run_virtual_user(
                    next_spawn,
                    ctx.clone(),
                    shared.stop_tx.subscribe(),
                    retire_rx,
                ));
                handle.driver_started();
                next_spawn += 1;
            }

            if next_spawn == total && handle.phase() == RunPhase::RampingUp {
                handle.transition(schedule.hold_phase());
            }

            if let Some(start) = schedule.ramp_down_start {
                if !ramp_down_entered && elapsed >= start {
                    ramp_down_entered = true;
                    handle.transition(RunPhase::RampingDown);
                }
            }

            for (tx, retire_at) in retire_txs.iter().zip(&schedule.retire_offsets) {
                if let Some(at) = retire_at {
                    if *at <= elapsed && !*tx.borrow() {
                        tx.send_replace(true);
                    }
                }
            }

            if elapsed >= schedule.duration && handle.begin_drain() {
                break (RunPhase::Completed, None);
            }

            let deadline = shared.started
                + next_deadline(schedule, next_spawn, &retire_txs, ramp_down_entered, elapsed);

            tokio::select! {
                biased;
                _ = stopped(&mut stop_rx) => {
                    break (RunPhase::Cancelled, None);
                }
                joined = drivers.join_next(), if !drivers.is_empty() => {
                    match joined {
                        Some(Ok(exit)) => {
                            handle.driver_exited();
                            debug!(
                                "Test {} driver {} exited ({:?}) after {} requests",
                                shared.test_id, exit.index, exit.reason, exit.requests
                            );
                        }
                        Some(Err(e)) if e.is_panic() => {
                            handle.driver_exited();
                            break (
                                RunPhase::Failed,
                                Some(format!("virtual user task panicked: {}", e)),
                            );
                        }
                        Some(Err(_)) => handle.driver_exited(),
                        None => {}
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {}
                _ = progress.tick() => {
                    handle.emit_progress().await;
                }
            }
        };

        // Stop everyone, then wait out in-flight work for at most one
        // request/think cycle before aborting stragglers.
        shared.stop_tx.send_replace(true);
        let drain_window = shared.config.request_timeout()
            + shared.config.think_time()
            + Duration::from_secs(DRAIN_GRACE_SECS);
        let drained = tokio::time::timeout(drain_window, async {
            while let Some(joined) = drivers.join_next().await {
                handle.driver_exited();
                if let Ok(exit) = joined {
                    if exit.reason == ExitReason::Retired {
                        debug!("Test {} driver {} retired during drain", shared.test_id, exit.index);
                    }
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "Test {}: {} virtual users did not stop within {:?}, aborting",
                shared.test_id,
                drivers.len(),
                drain_window
            );
            drivers.abort_all();
            while drivers.join_next().await.is_some() {}
        }
        shared.active_users.store(0, Ordering::SeqCst);

        outcome
    }
}

/// Earliest upcoming schedule event after `elapsed`.
fn next_deadline(
    schedule: &LoadSchedule,
    next_spawn: usize,
    retire_txs: &[watch::Sender<bool>],
    ramp_down_entered: bool,
    elapsed: Duration,
) -> Duration {
    let mut next = schedule.duration;
    if let Some(spawn_at) = schedule.spawn_offsets.get(next_spawn) {
        next = next.min(*spawn_at);
    }
    if !ramp_down_entered {
        if let Some(start) = schedule.ramp_down_start {
            next = next.min(start);
        }
    }
    for (i, retire_at) in schedule.retire_offsets.iter().enumerate() {
        if let Some(at) = retire_at {
            let pending = retire_txs.get(i).map(|tx| !*tx.borrow()).unwrap_or(true);
            if pending && *at > elapsed {
                next = next.min(*at);
            }
        }
    }
    next.max(elapsed)
}

impl ControllerHandle {
    fn lock(&self) -> MutexGuard<'_, PhaseState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn test_id(&self) -> &str {
        &self.shared.test_id
    }

    pub fn user_id(&self) -> &str {
        &self.shared.user_id
    }

    pub fn config(&self) -> &LoadTestConfig {
        &self.shared.config
    }

    pub fn phase(&self) -> RunPhase {
        self.lock().phase
    }

    pub fn is_finished(&self) -> bool {
        self.phase().is_terminal()
    }

    pub fn active_users(&self) -> usize {
        self.shared.active_users.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.shared.aggregator.snapshot()
    }

    /// The report, once the run is terminal.
    pub fn report(&self) -> Option<Arc<Report>> {
        self.lock().report.clone()
    }

    pub fn same_run(&self, other: &ControllerHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn transition(&self, next: RunPhase) -> bool {
        let mut state = self.lock();
        if state.phase.is_terminal() || state.phase == next {
            return false;
        }
        info!(
            "Test {}: {} -> {}",
            self.shared.test_id, state.phase, next
        );
        state.phase = next;
        true
    }

    fn driver_started(&self) {
        let active = self.shared.active_users.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared
            .peak_active_users
            .fetch_max(active, Ordering::SeqCst);
    }

    fn driver_exited(&self) {
        let _ = self
            .shared
            .active_users
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Full duration reached. Returns false if a stop got in first, in which
    /// case the run ends as cancelled.
    fn begin_drain(&self) -> bool {
        let mut state = self.lock();
        if state.cancel_requested {
            return false;
        }
        state.draining = true;
        true
    }

    /// Request cancellation. Returns false if the run is already terminal or
    /// has run its full duration.
    pub fn stop(&self) -> bool {
        let mut state = self.lock();
        if state.phase.is_terminal() || state.draining {
            return false;
        }
        if !state.cancel_requested {
            info!("Test {}: stop requested", self.shared.test_id);
            state.cancel_requested = true;
        }
        self.shared.stop_tx.send_replace(true);
        true
    }

    pub fn progress(&self) -> f64 {
        if self.is_finished() {
            return 100.0;
        }
        let total = self.shared.config.duration().as_secs_f64();
        if total <= 0.0 {
            return 0.0;
        }
        (self.shared.started.elapsed().as_secs_f64() / total * 100.0).clamp(0.0, 100.0)
    }

    pub fn status(&self) -> LiveTestStatus {
        let (phase, cancel_requested) = {
            let state = self.lock();
            (state.phase, state.cancel_requested)
        };
        LiveTestStatus {
            test_id: self.shared.test_id.clone(),
            user_id: self.shared.user_id.clone(),
            url: self.shared.url.clone(),
            status: phase,
            progress: self.progress(),
            active_users: self.active_users(),
            target_users: self.shared.config.users,
            elapsed_secs: self.shared.started.elapsed().as_secs_f64(),
            cancel_requested,
            real_time_metrics: self.snapshot(),
        }
    }

    async fn emit_progress(&self) {
        match serde_json::to_value(self.status()) {
            Ok(data) => {
                self.shared
                    .events
                    .emit(&self.shared.test_id, EventKind::ProgressUpdate, data)
                    .await
            }
            Err(e) => warn!("Failed to serialize progress for {}: {}", self.shared.test_id, e),
        }
    }

    /// Make the terminal decision and build the report. Idempotent: once a
    /// terminal phase is set, later calls return the existing report.
    pub async fn conclude(&self, requested: RunPhase, error: Option<String>) -> Arc<Report> {
        let report = {
            let mut state = self.lock();
            if let Some(existing) = &state.report {
                return existing.clone();
            }

            let status = if state.cancel_requested {
                RunPhase::Cancelled
            } else if requested.is_terminal() {
                requested
            } else {
                RunPhase::Completed
            };
            let error = if status == RunPhase::Failed { error } else { None };

            let summary = self.shared.aggregator.finalize();
            let report = Arc::new(Report::build(ReportInput {
                test_id: &self.shared.test_id,
                url: &self.shared.url,
                config: &self.shared.config,
                status,
                current_phase: state.phase,
                summary,
                actual_duration: self.shared.started.elapsed().as_secs_f64(),
                peak_active_users: self.shared.peak_active_users.load(Ordering::SeqCst),
                started_at: self.shared.started_at,
                error,
            }));

            state.phase = status;
            state.report = Some(report.clone());
            self.shared.stop_tx.send_replace(true);
            report
        };

        info!(
            "Test {} {}: {} requests ({} failed), grade {:?}, {:.1}s",
            self.shared.test_id,
            report.status,
            report.metrics.total_requests,
            report.metrics.failed_requests,
            report.performance_grade,
            report.actual_duration
        );

        let kind = if report.status == RunPhase::Failed {
            EventKind::TestError
        } else {
            EventKind::TestComplete
        };
        match serde_json::to_value(report.as_ref()) {
            Ok(data) => {
                self.shared
                    .events
                    .emit(&self.shared.test_id, kind, data)
                    .await
            }
            Err(e) => warn!("Failed to serialize report for {}: {}", self.shared.test_id, e),
        }
        report
    }

    /// Mark the run fully wound down; wakes `wait_report` callers.
    pub fn publish(&self, report: Arc<Report>) {
        self.shared.report_tx.send_replace(Some(report));
    }

    /// Wait until the run has concluded and its drivers have drained.
    pub async fn wait_report(&self) -> Arc<Report> {
        let mut rx = self.shared.report_tx.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(report) = current {
                return report;
            }
            if rx.changed().await.is_err() {
                // Unreachable while this handle holds the sender.
                let report = self
                    .conclude(RunPhase::Failed, Some("controller vanished".to_string()))
                    .await;
                return report;
            }
        }
    }
}
