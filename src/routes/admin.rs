use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::state::SharedState;

/// GET /api/admin/stats
pub async fn stats(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let queue = state.queue.stats().await;
    let tests = state.tests.get_stats().await;
    let records = match &state.store {
        Some(store) => match store.status_counts() {
            Ok(counts) => Some(counts),
            Err(e) => {
                warn!("Failed to read record counts: {}", e);
                None
            }
        },
        None => None,
    };

    Json(json!({
        "queue": queue,
        "tests": tests,
        "records": records,
        "uptimeSecs": (Utc::now() - state.started_at).num_seconds(),
    }))
}

/// POST /api/admin/cleanup — stop every live test.
pub async fn cleanup(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let stopped = state.tests.cleanup().await;
    info!("Admin cleanup stopped {} live tests", stopped);
    Json(json!({ "stopped": stopped }))
}
