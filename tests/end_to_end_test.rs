use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sitecheck_orchestrator::events::EventHub;
use sitecheck_orchestrator::load::controller::LoadTestController;
use sitecheck_orchestrator::load::executor::HttpExecutor;
use sitecheck_orchestrator::load::metrics::FailureKind;
use sitecheck_orchestrator::load::report::PerformanceGrade;
use sitecheck_orchestrator::load::{HttpMethod, LoadProfile, LoadTestConfig, RunPhase};

/// Local target site; returns its base URL and a hit counter.
async fn spawn_target() -> (String, Arc<AtomicU64>) {
    let hits = Arc::new(AtomicU64::new(0));
    let counter = hits.clone();
    let app = Router::new()
        .route(
            "/",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    "ok"
                }
            })
            .post(|body: String| async move { body }),
        )
        .route("/broken", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), hits)
}

fn config(users: u32, duration: u64) -> LoadTestConfig {
    LoadTestConfig {
        users,
        duration,
        ramp_up_time: 0.0,
        test_type: LoadProfile::Load,
        timeout: 2,
        think_time: 0.1,
        ..LoadTestConfig::default()
    }
}

async fn run(url: &str, config: LoadTestConfig) -> Arc<sitecheck_orchestrator::load::report::Report> {
    let executor = Arc::new(HttpExecutor::new(url, &config).unwrap());
    LoadTestController::new(
        "e2e",
        "tester",
        url,
        config,
        executor,
        Arc::new(EventHub::new()),
        1_000,
    )
    .run()
    .await
}

#[tokio::test]
async fn test_healthy_target_completes_with_good_grade() {
    let (base, hits) = spawn_target().await;
    let report = run(&format!("{}/", base), config(3, 2)).await;

    assert_eq!(report.status, RunPhase::Completed);
    assert!(report.metrics.total_requests > 10);
    assert_eq!(report.metrics.failed_requests, 0);
    assert_eq!(report.metrics.status_codes.get(&200), Some(&report.metrics.total_requests));
    assert_eq!(report.performance_grade, PerformanceGrade::A);
    assert!(hits.load(Ordering::SeqCst) >= report.metrics.total_requests);
    assert_eq!(report.peak_active_users, 3);
}

#[tokio::test]
async fn test_server_errors_are_failed_requests_not_failed_runs() {
    let (base, _) = spawn_target().await;
    let report = run(&format!("{}/broken", base), config(2, 2)).await;

    assert_eq!(report.status, RunPhase::Completed);
    assert!(report.metrics.total_requests > 0);
    assert_eq!(report.metrics.successful_requests, 0);
    assert_eq!(
        report.metrics.error_breakdown.get(&FailureKind::HttpStatus),
        Some(&report.metrics.total_requests)
    );
    assert_eq!(report.metrics.error_rate, 1.0);
    assert_eq!(report.performance_grade, PerformanceGrade::F);
}

#[tokio::test]
async fn test_slow_target_times_out() {
    let (base, _) = spawn_target().await;
    let mut cfg = config(1, 3);
    cfg.timeout = 1;
    let report = run(&format!("{}/slow", base), cfg).await;

    assert_eq!(report.status, RunPhase::Completed);
    assert!(report.metrics.failed_requests >= 1);
    assert!(report
        .metrics
        .error_breakdown
        .contains_key(&FailureKind::Timeout));
}

#[tokio::test]
async fn test_unreachable_target_counts_connection_errors() {
    // Grab a free port, then close it.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let report = run(&format!("http://{}/", addr), config(1, 1)).await;
    assert_eq!(report.status, RunPhase::Completed);
    assert!(report.metrics.failed_requests > 0);
    assert!(report
        .metrics
        .error_breakdown
        .contains_key(&FailureKind::Connection));
}

#[tokio::test]
async fn test_post_with_body_and_headers() {
    let (base, _) = spawn_target().await;
    let mut cfg = config(1, 1);
    cfg.method = HttpMethod::Post;
    cfg.body = Some("{\"hello\":1}".to_string());
    cfg.headers
        .insert("content-type".to_string(), "application/json".to_string());

    let report = run(&format!("{}/", base), cfg).await;
    assert!(report.metrics.total_requests > 0);
    assert_eq!(report.metrics.failed_requests, 0);
}
