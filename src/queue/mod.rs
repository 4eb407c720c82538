pub mod service;

pub use service::TestQueueService;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::config::PlanLimits;
use crate::load::report::Report;
use crate::load::{LoadTestConfig, RunPhase};

// ============================================================================
// Data model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Job status for a finished run.
    pub fn from_run(phase: RunPhase) -> Self {
        match phase {
            RunPhase::Cancelled => JobStatus::Cancelled,
            RunPhase::Failed => JobStatus::Failed,
            _ => JobStatus::Completed,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    #[default]
    Load,
    Stress,
    Security,
    Seo,
    Performance,
    Compatibility,
    Api,
}

impl TestType {
    /// Only load-style tests have a runner in this service.
    pub fn is_runnable(self) -> bool {
        matches!(self, TestType::Load | TestType::Stress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TestType::Load => "load",
            TestType::Stress => "stress",
            TestType::Security => "security",
            TestType::Seo => "seo",
            TestType::Performance => "performance",
            TestType::Compatibility => "compatibility",
            TestType::Api => "api",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserPlan {
    #[default]
    Free,
    Pro,
    Enterprise,
}

impl UserPlan {
    /// Unknown or missing plan names fall back to the free tier.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("pro") => UserPlan::Pro,
            Some("enterprise") => UserPlan::Enterprise,
            _ => UserPlan::Free,
        }
    }

    pub fn max_concurrent(self, limits: &PlanLimits) -> usize {
        match self {
            UserPlan::Free => limits.free,
            UserPlan::Pro => limits.pro,
            UserPlan::Enterprise => limits.enterprise,
        }
    }
}

/// A request to run a test, before it becomes a job.
#[derive(Debug, Clone)]
pub struct TestSubmission {
    pub user_id: Option<String>,
    pub plan: UserPlan,
    pub test_type: TestType,
    pub url: String,
    pub config: LoadTestConfig,
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestJob {
    pub id: String,
    pub user_id: Option<String>,
    pub test_type: TestType,
    pub url: String,
    pub config: LoadTestConfig,
    pub priority: i32,
    pub status: JobStatus,
    pub plan: UserPlan,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result: Option<Arc<Report>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<String>,
    #[serde(skip)]
    pub(crate) seq: u64,
}

impl TestJob {
    /// Concurrency bucket; anonymous submissions share one.
    pub fn owner(&self) -> &str {
        self.user_id
            .as_deref()
            .unwrap_or(crate::config::ANONYMOUS_USER)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueReceipt {
    pub job_id: String,
    pub status: JobStatus,
    /// 0 when admitted straight away, otherwise the 1-based rank among the
    /// caller's waiting jobs.
    pub position: usize,
    /// Seconds.
    pub estimated_wait_time: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub user_id: String,
    pub plan: UserPlan,
    pub max_concurrent: usize,
    pub running: usize,
    pub queued: usize,
    pub queued_job_ids: Vec<String>,
    pub global_running: usize,
    pub global_queued: usize,
    pub global_max_concurrent: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub test_type: Option<TestType>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total_jobs: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub global_max_concurrent: usize,
    pub plan_limits: PlanLimits,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_parsing_defaults_to_free() {
        assert_eq!(UserPlan::parse(Some("Enterprise")), UserPlan::Enterprise);
        assert_eq!(UserPlan::parse(Some(" pro ")), UserPlan::Pro);
        assert_eq!(UserPlan::parse(Some("platinum")), UserPlan::Free);
        assert_eq!(UserPlan::parse(None), UserPlan::Free);
        assert_eq!(UserPlan::Pro.max_concurrent(&PlanLimits::default()), 3);
    }

    #[test]
    fn test_only_load_types_run() {
        assert!(TestType::Load.is_runnable());
        assert!(TestType::Stress.is_runnable());
        assert!(!TestType::Seo.is_runnable());
        assert!(!TestType::Security.is_runnable());
    }

    #[test]
    fn test_filter_deserializes_from_query_shape() {
        let filter: JobFilter =
            serde_json::from_str(r#"{"status":"failed","testType":"stress","limit":5}"#).unwrap();
        assert_eq!(filter.status, Some(JobStatus::Failed));
        assert_eq!(filter.test_type, Some(TestType::Stress));
        assert_eq!(filter.limit, Some(5));
    }

    #[test]
    fn test_run_phase_maps_to_job_status() {
        assert_eq!(JobStatus::from_run(RunPhase::Completed), JobStatus::Completed);
        assert_eq!(JobStatus::from_run(RunPhase::Cancelled), JobStatus::Cancelled);
        assert_eq!(JobStatus::from_run(RunPhase::Failed), JobStatus::Failed);
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
