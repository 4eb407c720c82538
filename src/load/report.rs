use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::metrics::{MetricsSnapshot, MetricsSummary, Percentiles};
use super::{LoadTestConfig, RunPhase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PerformanceGrade {
    A,
    B,
    C,
    D,
    F,
}

/// Final artifact of a run. Built once by the controller and shared as
/// `Arc<Report>` afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub test_id: String,
    pub url: String,
    pub status: RunPhase,
    pub current_phase: RunPhase,
    pub metrics: MetricsSnapshot,
    pub percentiles: Percentiles,
    pub performance_grade: PerformanceGrade,
    pub overall_score: f64,
    /// Seconds from controller start to the terminal transition.
    pub actual_duration: f64,
    pub target_users: u32,
    pub peak_active_users: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub config: LoadTestConfig,
}

pub struct ReportInput<'a> {
    pub test_id: &'a str,
    pub url: &'a str,
    pub config: &'a LoadTestConfig,
    pub status: RunPhase,
    pub current_phase: RunPhase,
    pub summary: MetricsSummary,
    pub actual_duration: f64,
    pub peak_active_users: usize,
    pub started_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl Report {
    pub fn build(input: ReportInput<'_>) -> Self {
        let overall_score = compute_score(&input.summary);
        Report {
            test_id: input.test_id.to_string(),
            url: input.url.to_string(),
            status: input.status,
            current_phase: input.current_phase,
            metrics: input.summary.snapshot,
            percentiles: input.summary.percentiles,
            performance_grade: grade_for(overall_score),
            overall_score,
            actual_duration: input.actual_duration,
            target_users: input.config.users,
            peak_active_users: input.peak_active_users,
            started_at: input.started_at,
            ended_at: Utc::now(),
            error: input.error,
            config: input.config.clone(),
        }
    }
}

/// Overall run score (0-100).
///
/// | Component   | Weight | Scoring                                        |
/// |-------------|--------|------------------------------------------------|
/// | Latency     | 60     | 60pts if p95 <= 200ms, linear decay to 0 at 5s |
/// | Reliability | 40     | 40pts at 0% errors, linear decay to 0 at 50%   |
///
/// A run that issued no requests scores 0.
pub fn compute_score(summary: &MetricsSummary) -> f64 {
    if summary.snapshot.total_requests == 0 {
        return 0.0;
    }

    let p95 = summary.percentiles.p95;
    let latency_score = if p95 <= 200.0 {
        60.0
    } else if p95 >= 5_000.0 {
        0.0
    } else {
        60.0 * (1.0 - (p95 - 200.0) / 4_800.0)
    };

    let error_rate = summary.snapshot.error_rate;
    let reliability_score = if error_rate >= 0.5 {
        0.0
    } else {
        40.0 * (1.0 - error_rate / 0.5)
    };

    latency_score + reliability_score
}

pub fn grade_for(score: f64) -> PerformanceGrade {
    if score >= 90.0 {
        PerformanceGrade::A
    } else if score >= 80.0 {
        PerformanceGrade::B
    } else if score >= 70.0 {
        PerformanceGrade::C
    } else if score >= 60.0 {
        PerformanceGrade::D
    } else {
        PerformanceGrade::F
    }
}
