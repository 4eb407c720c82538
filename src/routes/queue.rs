use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::Caller;
use crate::error::OrchestratorError;
use crate::queue::{EnqueueReceipt, JobFilter, QueueStatus, TestJob};
use crate::state::SharedState;

/// GET /api/queue/status
pub async fn queue_status(State(state): State<SharedState>, caller: Caller) -> Json<QueueStatus> {
    Json(
        state
            .queue
            .get_queue_status(caller.user_id.as_deref(), caller.plan)
            .await,
    )
}

/// GET /api/queue/jobs?status=&testType=&limit=
pub async fn list_jobs(
    State(state): State<SharedState>,
    caller: Caller,
    Query(filter): Query<JobFilter>,
) -> Json<serde_json::Value> {
    let jobs = state.queue.get_jobs(caller.user_id.as_deref(), &filter).await;
    Json(json!({
        "total": jobs.len(),
        "jobs": jobs,
    }))
}

/// GET /api/queue/jobs/{id}
pub async fn job_details(
    State(state): State<SharedState>,
    caller: Caller,
    Path(job_id): Path<String>,
) -> Result<Json<TestJob>, OrchestratorError> {
    Ok(Json(state.queue.get_job_details(caller.owner(), &job_id).await?))
}

/// POST /api/queue/jobs/{id}/cancel
pub async fn cancel_job(
    State(state): State<SharedState>,
    caller: Caller,
    Path(job_id): Path<String>,
) -> Result<Json<TestJob>, OrchestratorError> {
    Ok(Json(state.queue.cancel_job(caller.owner(), &job_id).await?))
}

/// POST /api/queue/jobs/{id}/retry
pub async fn retry_job(
    State(state): State<SharedState>,
    caller: Caller,
    Path(job_id): Path<String>,
) -> Result<Json<EnqueueReceipt>, OrchestratorError> {
    Ok(Json(state.queue.retry_job(caller.owner(), &job_id).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupRequest {
    pub older_than_hours: Option<i64>,
}

/// POST /api/queue/cleanup — drop finished jobs past the retention window.
pub async fn cleanup_jobs(
    State(state): State<SharedState>,
    Json(req): Json<CleanupRequest>,
) -> Json<serde_json::Value> {
    let hours = req
        .older_than_hours
        .unwrap_or(state.config.job_retention_hours);
    let removed = state.queue.cleanup_completed_jobs(hours).await;
    Json(json!({
        "removed": removed,
        "olderThanHours": hours,
    }))
}
