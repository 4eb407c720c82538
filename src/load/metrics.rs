//! Per-run metrics aggregation.
//!
//! One [`MetricsAggregator`] belongs to exactly one controller. Drivers write
//! outcomes concurrently; observers read consistent snapshots. Latency samples
//! live in a fixed-capacity reservoir (Algorithm R), so percentiles are exact
//! until the reservoir fills and a uniform-sample approximation afterwards.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{DEFAULT_RESERVOIR_CAPACITY, TPS_WINDOW_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Connection,
    HttpStatus,
    Other,
}

/// Result of a single virtual-user request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    pub success: bool,
    pub latency_ms: f64,
    pub status_code: Option<u16>,
    pub failure: Option<FailureKind>,
}

impl RequestOutcome {
    pub fn success(latency_ms: f64, status_code: Option<u16>) -> Self {
        Self {
            success: true,
            latency_ms,
            status_code,
            failure: None,
        }
    }

    pub fn failure(kind: FailureKind, latency_ms: f64, status_code: Option<u16>) -> Self {
        Self {
            success: false,
            latency_ms,
            status_code,
            failure: Some(kind),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    #[serde(rename = "currentTPS")]
    pub current_tps: f64,
    #[serde(rename = "peakTPS")]
    pub peak_tps: f64,
    pub error_rate: f64,
    pub average_response_time: f64,
    pub min_response_time: f64,
    pub max_response_time: f64,
    pub sample_count: usize,
    pub error_breakdown: BTreeMap<FailureKind, u64>,
    pub status_codes: BTreeMap<u16, u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Frozen metrics section of a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub snapshot: MetricsSnapshot,
    pub percentiles: Percentiles,
}

struct LatencyReservoir {
    capacity: usize,
    samples: Vec<f64>,
    seen: u64,
    rng: fastrand::Rng,
}

impl LatencyReservoir {
    fn new(capacity: usize, seed: u64) -> Self {
        Self {
            capacity,
            samples: Vec::with_capacity(capacity.min(1024)),
            seen: 0,
            rng: fastrand::Rng::with_seed(seed),
        }
    }

    fn insert(&mut self, value: f64) {
        self.seen += 1;
        if self.samples.len() < self.capacity {
            self.samples.push(value);
            return;
        }
        let slot = self.rng.u64(0..self.seen);
        if slot < self.capacity as u64 {
            self.samples[slot as usize] = value;
        }
    }

    fn sorted(&self) -> Vec<f64> {
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        sorted
    }
}

struct AggregatorInner {
    total: u64,
    successful: u64,
    failed: u64,
    latency_sum: f64,
    latency_min: f64,
    latency_max: f64,
    reservoir: LatencyReservoir,
    window: VecDeque<Instant>,
    peak_tps: f64,
    error_breakdown: BTreeMap<FailureKind, u64>,
    status_codes: BTreeMap<u16, u64>,
    summary: Option<MetricsSummary>,
}

pub struct MetricsAggregator {
    inner: Mutex<AggregatorInner>,
    window: Duration,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RESERVOIR_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_seed(capacity, fastrand::u64(..))
    }

    pub fn with_seed(capacity: usize, seed: u64) -> Self {
        Self {
            inner: Mutex::new(AggregatorInner {
                total: 0,
                successful: 0,
                failed: 0,
                latency_sum: 0.0,
                latency_min: f64::INFINITY,
                latency_max: 0.0,
                reservoir: LatencyReservoir::new(capacity.max(1), seed),
                window: VecDeque::new(),
                peak_tps: 0.0,
                error_breakdown: BTreeMap::new(),
                status_codes: BTreeMap::new(),
                summary: None,
            }),
            window: Duration::from_millis(TPS_WINDOW_MS),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_outcome(&self, success: bool, latency_ms: f64) {
        let outcome = if success {
            RequestOutcome::success(latency_ms, None)
        } else {
            RequestOutcome::failure(FailureKind::Other, latency_ms, None)
        };
        self.record(&outcome);
    }

    /// Add one outcome. Ignored once the aggregator is finalized.
    pub fn record(&self, outcome: &RequestOutcome) {
        let now = Instant::now();
        let latency = if outcome.latency_ms.is_finite() {
            outcome.latency_ms.max(0.0)
        } else {
            0.0
        };

        let mut inner = self.lock();
        if inner.summary.is_some() {
            return;
        }

        inner.total += 1;
        if outcome.success {
            inner.successful += 1;
        } else {
            inner.failed += 1;
            let kind = outcome.failure.unwrap_or(FailureKind::Other);
            *inner.error_breakdown.entry(kind).or_insert(0) += 1;
        }
        if let Some(code) = outcome.status_code {
            *inner.status_codes.entry(code).or_insert(0) += 1;
        }

        inner.latency_sum += latency;
        inner.latency_min = inner.latency_min.min(latency);
        inner.latency_max = inner.latency_max.max(latency);
        inner.reservoir.insert(latency);

        inner.window.push_back(now);
        let tps = self.window_tps(&mut inner, now);
        if tps > inner.peak_tps {
            inner.peak_tps = tps;
        }
    }

    fn window_tps(&self, inner: &mut AggregatorInner, now: Instant) -> f64 {
        while let Some(front) = inner.window.front() {
            if now.duration_since(*front) > self.window {
                inner.window.pop_front();
            } else {
                break;
            }
        }
        inner.window.len() as f64 / self.window.as_secs_f64()
    }

    fn build_snapshot(&self, inner: &mut AggregatorInner, now: Instant) -> MetricsSnapshot {
        let current_tps = self.window_tps(inner, now);
        let error_rate = if inner.total == 0 {
            0.0
        } else {
            inner.failed as f64 / inner.total as f64
        };
        let average = if inner.total == 0 {
            0.0
        } else {
            inner.latency_sum / inner.total as f64
        };

        MetricsSnapshot {
            total_requests: inner.total,
            successful_requests: inner.successful,
            failed_requests: inner.failed,
            current_tps,
            peak_tps: inner.peak_tps.max(current_tps),
            error_rate,
            average_response_time: average,
            min_response_time: if inner.total == 0 { 0.0 } else { inner.latency_min },
            max_response_time: inner.latency_max,
            sample_count: inner.reservoir.samples.len(),
            error_breakdown: inner.error_breakdown.clone(),
            status_codes: inner.status_codes.clone(),
        }
    }

    /// Consistent copy of the running counters. After [`finalize`](Self::finalize)
    /// this returns the frozen final snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Instant::now();
        let mut inner = self.lock();
        if let Some(summary) = &inner.summary {
            return summary.snapshot.clone();
        }
        self.build_snapshot(&mut inner, now)
    }

    /// Freeze the counters and compute percentiles. Later calls return the same
    /// summary.
    pub fn finalize(&self) -> MetricsSummary {
        let now = Instant::now();
        let mut inner = self.lock();
        if let Some(summary) = &inner.summary {
            return summary.clone();
        }

        let snapshot = self.build_snapshot(&mut inner, now);
        let sorted = inner.reservoir.sorted();
        let summary = MetricsSummary {
            snapshot,
            percentiles: compute_percentiles(&sorted),
        };
        inner.summary = Some(summary.clone());
        summary
    }

    pub fn is_finalized(&self) -> bool {
        self.lock().summary.is_some()
    }
}

pub fn compute_percentiles(sorted: &[f64]) -> Percentiles {
    Percentiles {
        p50: nearest_rank(sorted, 50.0),
        p90: nearest_rank(sorted, 90.0),
        p95: nearest_rank(sorted, 95.0),
        p99: nearest_rank(sorted, 99.0),
    }
}

/// Nearest-rank percentile over an ascending slice: `rank = ceil(p/100 * n)`,
/// clamped to `[1, n]`. Empty input yields 0.
pub fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let rank = ((percentile / 100.0) * n as f64).ceil() as usize;
    let rank = rank.clamp(1, n);
    sorted[rank - 1]
}
