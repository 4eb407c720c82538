use std::sync::Arc;

use sitecheck_orchestrator::config::OrchestratorConfig;
use sitecheck_orchestrator::queue::UserPlan;
use sitecheck_orchestrator::state::AppState;
use sitecheck_orchestrator::store::RecordDb;

#[tokio::test]
async fn test_state_creation() {
    let store = Arc::new(RecordDb::in_memory().unwrap());
    let state = AppState::new(OrchestratorConfig::default(), Some(store));

    // Nothing live, nothing queued
    let stats = state.tests.get_stats().await;
    assert_eq!(stats.active_tests, 0);
    assert_eq!(stats.virtual_users, 0);

    let queue = state.queue.stats().await;
    assert_eq!(queue.total_jobs, 0);
    assert_eq!(queue.global_max_concurrent, 20);

    let status = state.queue.get_queue_status(None, UserPlan::Pro).await;
    assert_eq!(status.user_id, "anonymous");
    // anonymous callers are held to the free ceiling
    assert_eq!(status.plan, UserPlan::Free);
    assert_eq!(status.max_concurrent, 1);

    assert!(state.events.history().await.is_empty());
}

#[tokio::test]
async fn test_shutdown_broadcast() {
    let state = AppState::new(OrchestratorConfig::default(), None);
    let mut rx = state.shutdown_tx.subscribe();
    state.shutdown_tx.send(()).unwrap();
    assert!(rx.recv().await.is_ok());
}
