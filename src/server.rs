use axum::routing::{get, post};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::routes;
use crate::state::SharedState;

pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/health", get(routes::health::health))
        // Tests
        .route("/api/tests/load", post(routes::tests::submit_load_test))
        .route("/api/tests/{id}/status", get(routes::tests::test_status))
        .route("/api/tests/{id}/cancel", post(routes::tests::cancel_test))
        .route("/api/tests/{id}/events", get(routes::tests::test_events))
        .route("/ws/tests/{id}", get(routes::ws::ws_handler))
        // Queue
        .route("/api/queue/status", get(routes::queue::queue_status))
        .route("/api/queue/jobs", get(routes::queue::list_jobs))
        .route("/api/queue/jobs/{id}", get(routes::queue::job_details))
        .route("/api/queue/jobs/{id}/cancel", post(routes::queue::cancel_job))
        .route("/api/queue/jobs/{id}/retry", post(routes::queue::retry_job))
        .route("/api/queue/cleanup", post(routes::queue::cleanup_jobs))
        // Admin
        .route("/api/admin/stats", get(routes::admin::stats))
        .route("/api/admin/cleanup", post(routes::admin::cleanup))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
