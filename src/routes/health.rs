use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::state::SharedState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: i64,
    pub active_tests: usize,
    pub virtual_users: usize,
    pub queued_jobs: usize,
    pub running_jobs: usize,
    pub database: bool,
}

pub async fn build_health_response(state: &SharedState) -> HealthResponse {
    let tests = state.tests.get_stats().await;
    let queue = state.queue.stats().await;
    HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        active_tests: tests.active_tests,
        virtual_users: tests.virtual_users,
        queued_jobs: queue.queued,
        running_jobs: queue.running,
        database: state.store.is_some(),
    }
}

/// GET /health
pub async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(build_health_response(&state).await)
}
