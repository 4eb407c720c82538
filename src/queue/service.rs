//! Admission control for test jobs.
//!
//! All bookkeeping lives in one `QueueInner` behind a tokio mutex. Status
//! changes and the running counters move together inside that critical
//! section, so the per-user and global ceilings can never be overshot.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    EnqueueReceipt, JobFilter, JobStatus, QueueStats, QueueStatus, TestJob, TestSubmission,
    TestType, UserPlan,
};
use crate::config::{PlanLimits, ANONYMOUS_USER};
use crate::error::OrchestratorError;
use crate::events::EventKind;
use crate::load::report::Report;
use crate::load::validation::validate_load_test;
use crate::load::LoadProfile;
use crate::store::{RecordDb, TerminalUpdate, TestRecord};
use crate::user_tests::UserTestManager;

type AdmitFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

#[derive(Default)]
struct QueueInner {
    jobs: HashMap<String, TestJob>,
    waiting: Vec<String>,
    /// Jobs currently holding a capacity slot, with their owner.
    running: HashMap<String, String>,
    running_per_user: HashMap<String, usize>,
    next_seq: u64,
}

impl QueueInner {
    fn running_for(&self, owner: &str) -> usize {
        self.running_per_user.get(owner).copied().unwrap_or(0)
    }

    fn release(&mut self, job_id: &str) {
        let Some(owner) = self.running.remove(job_id) else {
            return;
        };
        if let Some(n) = self.running_per_user.get_mut(&owner) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.running_per_user.remove(&owner);
            }
        }
    }

    /// A job visible to `owner`. Other users' jobs are reported as missing.
    fn owned(&self, job_id: &str, owner: &str) -> Result<&TestJob, OrchestratorError> {
        self.jobs
            .get(job_id)
            .filter(|j| j.owner() == owner)
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))
    }

    /// Waiting job ids in dispatch order: priority desc, then submission order.
    fn dispatch_order(&self) -> Vec<String> {
        let mut order: Vec<&TestJob> = self
            .waiting
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .collect();
        order.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        order.into_iter().map(|j| j.id.clone()).collect()
    }

    fn position_of(&self, job_id: &str, owner: &str) -> usize {
        self.dispatch_order()
            .iter()
            .filter(|id| self.jobs.get(*id).is_some_and(|j| j.owner() == owner))
            .position(|id| id == job_id)
            .map(|p| p + 1)
            .unwrap_or(0)
    }

    /// Average configured duration of the owner's running jobs, in seconds.
    fn average_running_duration(&self, owner: &str) -> Option<f64> {
        let durations: Vec<u64> = self
            .running
            .keys()
            .filter_map(|id| self.jobs.get(id))
            .filter(|j| j.owner() == owner)
            .map(|j| j.config.duration)
            .collect();
        if durations.is_empty() {
            return None;
        }
        Some(durations.iter().sum::<u64>() as f64 / durations.len() as f64)
    }
}

#[derive(Clone)]
pub struct TestQueueService {
    inner: Arc<Mutex<QueueInner>>,
    tests: Arc<UserTestManager>,
    store: Option<Arc<RecordDb>>,
    global_max_concurrent: usize,
    plan_limits: PlanLimits,
}

impl TestQueueService {
    pub fn new(
        tests: Arc<UserTestManager>,
        store: Option<Arc<RecordDb>>,
        global_max_concurrent: usize,
        plan_limits: PlanLimits,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner::default())),
            tests,
            store,
            global_max_concurrent,
            plan_limits,
        }
    }

    pub fn tests(&self) -> &Arc<UserTestManager> {
        &self.tests
    }

    fn ceiling(&self, job: &TestJob) -> usize {
        // Anonymous submissions always get the free ceiling.
        let plan = if job.user_id.is_none() {
            UserPlan::Free
        } else {
            job.plan
        };
        plan.max_concurrent(&self.plan_limits).max(1)
    }

    pub async fn enqueue(&self, submission: TestSubmission) -> Result<EnqueueReceipt, OrchestratorError> {
        self.enqueue_job(submission, None).await
    }

    async fn enqueue_job(
        &self,
        submission: TestSubmission,
        retry_of: Option<String>,
    ) -> Result<EnqueueReceipt, OrchestratorError> {
        if !submission.test_type.is_runnable() {
            return Err(OrchestratorError::Validation(format!(
                "test type '{}' is not supported by the load runner",
                submission.test_type.as_str()
            )));
        }
        validate_load_test(&submission.url, &submission.config)?;

        let mut config = submission.config;
        if submission.test_type == TestType::Stress {
            config.test_type = LoadProfile::Stress;
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        {
            let mut inner = self.inner.lock().await;
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let job = TestJob {
                id: job_id.clone(),
                user_id: submission.user_id,
                test_type: submission.test_type,
                url: submission.url,
                config,
                priority: submission.priority,
                status: JobStatus::Queued,
                plan: submission.plan,
                submitted_at: Utc::now(),
                started_at: None,
                ended_at: None,
                result: None,
                error: None,
                retry_of,
                seq,
            };
            self.persist_new(&job);
            info!(
                "Queued job {} ({}) for {} priority={}",
                job.id,
                job.test_type.as_str(),
                job.owner(),
                job.priority
            );
            inner.waiting.push(job_id.clone());
            inner.jobs.insert(job_id.clone(), job);
        }

        self.admit().await;

        let inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get(&job_id)
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.clone()))?;
        let owner = job.owner().to_string();
        let (position, estimated_wait_time) = if job.status == JobStatus::Queued {
            let position = inner.position_of(&job_id, &owner);
            let per_round = inner
                .average_running_duration(&owner)
                .unwrap_or(job.config.duration as f64);
            let rounds = position.div_ceil(self.ceiling(job));
            (position, (rounds as f64 * per_round).ceil() as u64)
        } else {
            (0, 0)
        };

        Ok(EnqueueReceipt {
            job_id,
            status: job.status,
            position,
            estimated_wait_time,
        })
    }

    /// Admit waiting jobs while capacity allows. Jobs whose owner is at their
    /// ceiling are skipped so other users' jobs can still start.
    ///
    /// Boxed because run watchers spawned here call back into it through
    /// `finish_job`.
    pub fn admit(&self) -> AdmitFuture<'_> {
        Box::pin(self.admission_pass())
    }

    async fn admission_pass(&self) {
        let mut inner = self.inner.lock().await;
        for job_id in inner.dispatch_order() {
            if inner.running.len() >= self.global_max_concurrent {
                break;
            }
            let Some(job) = inner.jobs.get(&job_id) else {
                continue;
            };
            let owner = job.owner().to_string();
            if inner.running_for(&owner) >= self.ceiling(job) {
                continue;
            }
            let (url, config) = (job.url.clone(), job.config.clone());

            inner.waiting.retain(|id| id != &job_id);
            inner.running.insert(job_id.clone(), owner.clone());
            *inner.running_per_user.entry(owner.clone()).or_insert(0) += 1;

            match self
                .tests
                .create_user_test(&owner, &job_id, &url, config)
                .await
            {
                Ok(handle) => {
                    let started_at = Utc::now();
                    if let Some(job) = inner.jobs.get_mut(&job_id) {
                        job.status = JobStatus::Running;
                        job.started_at = Some(started_at);
                    }
                    if let Some(store) = &self.store {
                        if let Err(e) = store.mark_running(&job_id, started_at) {
                            warn!("Failed to mark job {} running: {}", job_id, e);
                        }
                    }
                    info!("Started job {} for {}", job_id, owner);
                    let svc = self.clone();
                    let id = job_id.clone();
                    tokio::spawn(async move {
                        let report = handle.wait_report().await;
                        svc.finish_job(&id, report).await;
                    });
                }
                Err(e) => {
                    warn!("Dispatch of job {} failed: {}", job_id, e);
                    inner.release(&job_id);
                    if let Some(job) = inner.jobs.get_mut(&job_id) {
                        job.status = JobStatus::Failed;
                        job.ended_at = Some(Utc::now());
                        job.error = Some(e.to_string());
                        let job = job.clone();
                        self.persist_terminal(&job);
                    }
                    self.tests
                        .events()
                        .emit(
                            &job_id,
                            EventKind::TestError,
                            json!({
                                "testId": job_id,
                                "userId": owner,
                                "status": JobStatus::Failed,
                                "error": e.to_string(),
                            }),
                        )
                        .await;
                }
            }
        }
    }

    /// Record a finished run, free its slot, then admit more work.
    pub async fn finish_job(&self, job_id: &str, report: Arc<Report>) {
        {
            let mut inner = self.inner.lock().await;
            inner.release(job_id);

            if let Some(job) = inner.jobs.get_mut(job_id) {
                if !job.status.is_terminal() {
                    job.status = JobStatus::from_run(report.status);
                }
                if job.status == JobStatus::Failed && job.error.is_none() {
                    job.error = report.error.clone();
                }
                job.ended_at.get_or_insert(report.ended_at);
                job.result = Some(report.clone());
                info!("Job {} finished: {}", job_id, job.status);
                let job = job.clone();
                self.persist_terminal(&job);
            } else {
                debug!("Finished job {} no longer tracked", job_id);
                self.persist_outcome(
                    job_id,
                    JobStatus::from_run(report.status),
                    report.ended_at,
                    Some(report.as_ref()),
                    report.error.clone(),
                );
            }
        }
        self.admit().await;
    }

    /// Cancel one of `owner`'s jobs.
    pub async fn cancel_job(&self, owner: &str, job_id: &str) -> Result<TestJob, OrchestratorError> {
        let mut inner = self.inner.lock().await;
        let job = inner.owned(job_id, owner)?;

        match job.status {
            JobStatus::Queued => {
                inner.waiting.retain(|id| id != job_id);
                let job = match inner.jobs.get_mut(job_id) {
                    Some(job) => job,
                    None => return Err(OrchestratorError::JobNotFound(job_id.to_string())),
                };
                job.status = JobStatus::Cancelled;
                job.ended_at = Some(Utc::now());
                let job = job.clone();
                self.persist_terminal(&job);
                info!("Cancelled queued job {}", job_id);
                Ok(job)
            }
            JobStatus::Running => {
                let accepted = self.tests.stop_user_test(owner, job_id).await;
                let job = match inner.jobs.get_mut(job_id) {
                    Some(job) => job,
                    None => return Err(OrchestratorError::JobNotFound(job_id.to_string())),
                };
                if accepted {
                    // Slot is released once the drivers have drained.
                    job.status = JobStatus::Cancelled;
                    job.ended_at = Some(Utc::now());
                    info!("Cancelled running job {}", job_id);
                }
                Ok(job.clone())
            }
            _ => Ok(job.clone()),
        }
    }

    pub async fn retry_job(
        &self,
        owner: &str,
        job_id: &str,
    ) -> Result<EnqueueReceipt, OrchestratorError> {
        let submission = {
            let inner = self.inner.lock().await;
            let job = inner.owned(job_id, owner)?;
            if job.status != JobStatus::Failed {
                return Err(OrchestratorError::InvalidJobState {
                    job_id: job_id.to_string(),
                    status: job.status.to_string(),
                    reason: "only failed jobs can be retried".to_string(),
                });
            }
            TestSubmission {
                user_id: job.user_id.clone(),
                plan: job.plan,
                test_type: job.test_type,
                url: job.url.clone(),
                config: job.config.clone(),
                priority: job.priority,
            }
        };
        info!("Retrying failed job {}", job_id);
        self.enqueue_job(submission, Some(job_id.to_string())).await
    }

    /// Drop terminal jobs that ended more than `older_than_hours` ago. Jobs
    /// still holding a slot (cancelled but draining) are kept.
    pub async fn cleanup_completed_jobs(&self, older_than_hours: i64) -> usize {
        let cutoff = Utc::now() - ChronoDuration::hours(older_than_hours.max(0));
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let before = inner.jobs.len();
        let running = &inner.running;
        inner.jobs.retain(|id, job| {
            running.contains_key(id)
                || !(job.status.is_terminal() && job.ended_at.is_some_and(|t| t <= cutoff))
        });
        let removed = before - inner.jobs.len();
        if removed > 0 {
            info!("Removed {} finished jobs older than {}h", removed, older_than_hours);
        }
        removed
    }

    pub async fn get_job_details(&self, owner: &str, job_id: &str) -> Result<TestJob, OrchestratorError> {
        self.inner.lock().await.owned(job_id, owner).cloned()
    }

    /// The caller's jobs, newest first.
    pub async fn get_jobs(&self, user_id: Option<&str>, filter: &JobFilter) -> Vec<TestJob> {
        let owner = user_id.unwrap_or(ANONYMOUS_USER);
        let inner = self.inner.lock().await;
        let mut jobs: Vec<TestJob> = inner
            .jobs
            .values()
            .filter(|j| j.owner() == owner)
            .filter(|j| filter.status.is_none_or(|s| j.status == s))
            .filter(|j| filter.test_type.is_none_or(|t| j.test_type == t))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.seq.cmp(&a.seq));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        jobs
    }

    pub async fn get_queue_status(&self, user_id: Option<&str>, plan: UserPlan) -> QueueStatus {
        let owner = user_id.unwrap_or(ANONYMOUS_USER);
        let plan = if user_id.is_none() { UserPlan::Free } else { plan };
        let inner = self.inner.lock().await;
        let queued_job_ids: Vec<String> = inner
            .dispatch_order()
            .into_iter()
            .filter(|id| inner.jobs.get(id).is_some_and(|j| j.owner() == owner))
            .collect();
        QueueStatus {
            user_id: owner.to_string(),
            plan,
            max_concurrent: plan.max_concurrent(&self.plan_limits),
            running: inner.running_for(owner),
            queued: queued_job_ids.len(),
            queued_job_ids,
            global_running: inner.running.len(),
            global_queued: inner.waiting.len(),
            global_max_concurrent: self.global_max_concurrent,
        }
    }

    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().await;
        let count = |s: JobStatus| inner.jobs.values().filter(|j| j.status == s).count();
        QueueStats {
            total_jobs: inner.jobs.len(),
            queued: count(JobStatus::Queued),
            running: count(JobStatus::Running),
            completed: count(JobStatus::Completed),
            failed: count(JobStatus::Failed),
            cancelled: count(JobStatus::Cancelled),
            global_max_concurrent: self.global_max_concurrent,
            plan_limits: self.plan_limits,
        }
    }

    fn persist_new(&self, job: &TestJob) {
        let Some(store) = &self.store else { return };
        let record = TestRecord {
            id: job.id.clone(),
            user_id: job.owner().to_string(),
            test_type: job.test_type.as_str().to_string(),
            url: job.url.clone(),
            config: serde_json::to_value(&job.config).unwrap_or_default(),
            status: job.status.as_str().to_string(),
            submitted_at: job.submitted_at,
            started_at: None,
            ended_at: None,
            duration: None,
            results: None,
            overall_score: None,
            total_requests: None,
            successful_requests: None,
            failed_requests: None,
            error: None,
        };
        if let Err(e) = store.insert_record(&record) {
            warn!("Failed to persist job {}: {}", job.id, e);
        }
    }

    fn persist_terminal(&self, job: &TestJob) {
        self.persist_outcome(
            &job.id,
            job.status,
            job.ended_at.unwrap_or_else(Utc::now),
            job.result.as_deref(),
            job.error.clone(),
        );
    }

    fn persist_outcome(
        &self,
        job_id: &str,
        status: JobStatus,
        end_time: DateTime<Utc>,
        report: Option<&Report>,
        error: Option<String>,
    ) {
        let Some(store) = &self.store else { return };
        let update = TerminalUpdate {
            status: status.as_str().to_string(),
            end_time,
            duration: report.map(|r| r.actual_duration),
            results: report.and_then(|r| serde_json::to_value(r).ok()),
            overall_score: report.map(|r| r.overall_score),
            total_requests: report.map(|r| r.metrics.total_requests as i64),
            successful_requests: report.map(|r| r.metrics.successful_requests as i64),
            failed_requests: report.map(|r| r.metrics.failed_requests as i64),
            error,
        };
        match store.update_test_record(job_id, &update) {
            Ok(true) => {}
            Ok(false) => debug!("Record {} already terminal, update skipped", job_id),
            Err(e) => warn!("Failed to persist result of job {}: {}", job_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventHub;
    use crate::load::executor::RequestExecutor;
    use crate::load::metrics::RequestOutcome;
    use crate::load::LoadTestConfig;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Quick;

    #[async_trait]
    impl RequestExecutor for Quick {
        async fn execute(&self) -> RequestOutcome {
            tokio::time::sleep(Duration::from_millis(10)).await;
            RequestOutcome::success(10.0, Some(200))
        }
    }

    fn service_with_store(global: usize) -> (TestQueueService, Arc<RecordDb>) {
        let tests = Arc::new(UserTestManager::with_executor_factory(
            Arc::new(EventHub::new()),
            100,
            Arc::new(|_, _| Ok(Arc::new(Quick) as Arc<dyn RequestExecutor>)),
        ));
        let store = Arc::new(RecordDb::in_memory().unwrap());
        let svc = TestQueueService::new(tests, Some(store.clone()), global, PlanLimits::default());
        (svc, store)
    }

    fn service(global: usize) -> TestQueueService {
        service_with_store(global).0
    }

    fn submission(user: Option<&str>, plan: UserPlan, duration: u64) -> TestSubmission {
        TestSubmission {
            user_id: user.map(String::from),
            plan,
            test_type: TestType::Load,
            url: "https://example.com".to_string(),
            config: LoadTestConfig {
                users: 2,
                duration,
                ramp_up_time: 0.0,
                think_time: 0.5,
                ..LoadTestConfig::default()
            },
            priority: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_free_plan_queues_with_increasing_positions() {
        let svc = service(20);
        let first = svc.enqueue(submission(Some("u1"), UserPlan::Free, 10)).await.unwrap();
        assert_eq!(first.status, JobStatus::Running);
        assert_eq!(first.position, 0);

        let second = svc.enqueue(submission(Some("u1"), UserPlan::Free, 10)).await.unwrap();
        let third = svc.enqueue(submission(Some("u1"), UserPlan::Free, 10)).await.unwrap();
        assert_eq!(second.status, JobStatus::Queued);
        assert_eq!(second.position, 1);
        assert_eq!(third.position, 2);
        assert_eq!(second.estimated_wait_time, 10);
        assert_eq!(third.estimated_wait_time, 20);

        // another user is not blocked by u1's ceiling
        let other = svc.enqueue(submission(Some("u2"), UserPlan::Free, 10)).await.unwrap();
        assert_eq!(other.status, JobStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_job_starts_when_slot_frees() {
        let svc = service(20);
        let first = svc.enqueue(submission(Some("u1"), UserPlan::Free, 2)).await.unwrap();
        let second = svc.enqueue(submission(Some("u1"), UserPlan::Free, 2)).await.unwrap();
        assert_eq!(second.status, JobStatus::Queued);

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        let done = svc.get_job_details("u1", &first.job_id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.result.is_some());

        let started = svc.get_job_details("u1", &second.job_id).await.unwrap();
        assert_eq!(started.status, JobStatus::Running);
        assert!(started.started_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_ceiling_and_priority_order() {
        let svc = service(1);
        svc.enqueue(submission(Some("a"), UserPlan::Enterprise, 2)).await.unwrap();
        let low = svc.enqueue(submission(Some("b"), UserPlan::Pro, 2)).await.unwrap();
        let mut urgent = submission(Some("c"), UserPlan::Pro, 2);
        urgent.priority = 5;
        let high = svc.enqueue(urgent).await.unwrap();
        assert_eq!(low.status, JobStatus::Queued);
        assert_eq!(high.status, JobStatus::Queued);

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(
            svc.get_job_details("c", &high.job_id).await.unwrap().status,
            JobStatus::Running
        );
        assert_eq!(
            svc.get_job_details("b", &low.job_id).await.unwrap().status,
            JobStatus::Queued
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_running_job_stays_cancelled() {
        let svc = service(20);
        let receipt = svc.enqueue(submission(Some("u1"), UserPlan::Free, 5)).await.unwrap();
        let queued = svc.enqueue(submission(Some("u1"), UserPlan::Free, 5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_200)).await;

        let job = svc.cancel_job("u1", &receipt.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        tokio::time::sleep(Duration::from_secs(6)).await;
        let job = svc.get_job_details("u1", &receipt.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        let report = job.result.expect("report attached after drain");
        assert_eq!(report.status, crate::load::RunPhase::Cancelled);

        // the freed slot went to the queued job
        assert_ne!(
            svc.get_job_details("u1", &queued.job_id).await.unwrap().status,
            JobStatus::Queued
        );
        // cancelling again is a no-op
        assert_eq!(
            svc.cancel_job("u1", &receipt.job_id).await.unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_queued_job() {
        let svc = service(20);
        svc.enqueue(submission(Some("u1"), UserPlan::Free, 5)).await.unwrap();
        let queued = svc.enqueue(submission(Some("u1"), UserPlan::Free, 5)).await.unwrap();
        let job = svc.cancel_job("u1", &queued.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.started_at.is_none());
        assert_eq!(svc.get_queue_status(Some("u1"), UserPlan::Free).await.queued, 0);
        assert!(matches!(
            svc.cancel_job("u1", "nope").await,
            Err(OrchestratorError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_submission_creates_no_job() {
        let svc = service(20);
        let mut bad = submission(Some("u1"), UserPlan::Free, 5);
        bad.config.ramp_up_time = 5.0;
        assert!(matches!(
            svc.enqueue(bad).await,
            Err(OrchestratorError::Validation(_))
        ));

        let mut seo = submission(Some("u1"), UserPlan::Free, 5);
        seo.test_type = TestType::Seo;
        assert!(matches!(
            svc.enqueue(seo).await,
            Err(OrchestratorError::Validation(_))
        ));
        assert_eq!(svc.stats().await.total_jobs, 0);
    }

    #[tokio::test]
    async fn test_dispatch_failure_marks_job_failed_and_retry_requeues() {
        let events = Arc::new(EventHub::new());
        let tests = Arc::new(UserTestManager::with_executor_factory(
            events.clone(),
            100,
            Arc::new(|_, _| Err(OrchestratorError::Orchestration("proxy down".into()))),
        ));
        let store = Arc::new(RecordDb::in_memory().unwrap());
        let svc = TestQueueService::new(tests, Some(store.clone()), 20, PlanLimits::default());

        let receipt = svc.enqueue(submission(Some("u1"), UserPlan::Free, 5)).await.unwrap();
        assert_eq!(receipt.status, JobStatus::Failed);
        let failed = svc.get_job_details("u1", &receipt.job_id).await.unwrap();
        assert!(failed.error.as_deref().unwrap_or_default().contains("proxy down"));
        assert!(failed.started_at.is_none());
        assert!(failed.ended_at.is_some());
        assert_eq!(svc.get_queue_status(Some("u1"), UserPlan::Free).await.running, 0);

        let emitted = events.history_for(&receipt.job_id).await;
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].kind, EventKind::TestError);
        assert!(emitted[0].data["error"]
            .as_str()
            .unwrap_or_default()
            .contains("proxy down"));

        let record = store.get_record(&receipt.job_id).unwrap().unwrap();
        assert_eq!(record.status, "failed");
        assert!(record.started_at.is_none());

        let retry = svc.retry_job("u1", &receipt.job_id).await.unwrap();
        assert_ne!(retry.job_id, receipt.job_id);
        let retried = svc.get_job_details("u1", &retry.job_id).await.unwrap();
        assert_eq!(retried.retry_of.as_deref(), Some(receipt.job_id.as_str()));
        assert_eq!(retried.config, failed.config);
        assert_eq!(retried.url, failed.url);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_rejects_non_failed_jobs() {
        let svc = service(20);
        let receipt = svc.enqueue(submission(Some("u1"), UserPlan::Free, 5)).await.unwrap();
        assert!(matches!(
            svc.retry_job("u1", &receipt.job_id).await,
            Err(OrchestratorError::InvalidJobState { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_anonymous_users_share_the_free_bucket() {
        let svc = service(20);
        let a = svc.enqueue(submission(None, UserPlan::Enterprise, 5)).await.unwrap();
        let b = svc.enqueue(submission(None, UserPlan::Enterprise, 5)).await.unwrap();
        assert_eq!(a.status, JobStatus::Running);
        assert_eq!(b.status, JobStatus::Queued);
        assert_eq!(svc.get_jobs(None, &JobFilter::default()).await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_removes_only_old_terminal_jobs() {
        let svc = service(20);
        svc.enqueue(submission(Some("u1"), UserPlan::Free, 5)).await.unwrap();
        let queued = svc.enqueue(submission(Some("u1"), UserPlan::Free, 5)).await.unwrap();
        svc.cancel_job("u1", &queued.job_id).await.unwrap();

        assert_eq!(svc.cleanup_completed_jobs(24).await, 0);
        assert_eq!(svc.cleanup_completed_jobs(0).await, 1);
        assert_eq!(svc.stats().await.total_jobs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_users_cannot_touch_a_job() {
        let svc = service(20);
        let job = svc.enqueue(submission(Some("alice"), UserPlan::Free, 30)).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
        tokio::time::sleep(Duration::from_millis(500)).await;

        for intruder in ["mallory", ANONYMOUS_USER] {
            assert!(matches!(
                svc.cancel_job(intruder, &job.job_id).await,
                Err(OrchestratorError::JobNotFound(_))
            ));
            assert!(matches!(
                svc.get_job_details(intruder, &job.job_id).await,
                Err(OrchestratorError::JobNotFound(_))
            ));
            assert!(matches!(
                svc.retry_job(intruder, &job.job_id).await,
                Err(OrchestratorError::JobNotFound(_))
            ));
        }

        let mine = svc.get_job_details("alice", &job.job_id).await.unwrap();
        assert_eq!(mine.status, JobStatus::Running);
        let live = svc.tests().get_user_test("alice", &job.job_id).await.unwrap();
        assert!(!live.status().cancel_requested);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_keeps_cancelled_job_until_its_slot_frees() {
        let (svc, store) = service_with_store(20);
        let first = svc.enqueue(submission(Some("u1"), UserPlan::Free, 60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_200)).await;

        let job = svc.cancel_job("u1", &first.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        // still draining, so it keeps its slot and its entry
        assert_eq!(svc.cleanup_completed_jobs(0).await, 0);

        let next = svc.enqueue(submission(Some("u1"), UserPlan::Free, 60)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            svc.get_job_details("u1", &next.job_id).await.unwrap().status,
            JobStatus::Running
        );
        assert_eq!(svc.get_queue_status(Some("u1"), UserPlan::Free).await.running, 1);

        let record = store.get_record(&first.job_id).unwrap().unwrap();
        assert_eq!(record.status, "cancelled");

        // drained now, so it can go
        assert_eq!(svc.cleanup_completed_jobs(0).await, 1);
        assert_eq!(svc.stats().await.total_jobs, 1);
    }
}
