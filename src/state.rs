use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::OrchestratorConfig;
use crate::events::EventHub;
use crate::queue::TestQueueService;
use crate::store::RecordDb;
use crate::user_tests::{ExecutorFactory, UserTestManager};

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub config: OrchestratorConfig,
    pub events: Arc<EventHub>,
    pub tests: Arc<UserTestManager>,
    pub queue: TestQueueService,
    pub store: Option<Arc<RecordDb>>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: OrchestratorConfig, store: Option<Arc<RecordDb>>) -> Self {
        let events = Arc::new(EventHub::new());
        let tests = Arc::new(UserTestManager::new(
            events.clone(),
            config.reservoir_capacity,
        ));
        Self::assemble(config, store, events, tests)
    }

    /// Same wiring as `new`, with a custom request executor for every run.
    pub fn with_executor_factory(
        config: OrchestratorConfig,
        store: Option<Arc<RecordDb>>,
        factory: ExecutorFactory,
    ) -> Self {
        let events = Arc::new(EventHub::new());
        let tests = Arc::new(UserTestManager::with_executor_factory(
            events.clone(),
            config.reservoir_capacity,
            factory,
        ));
        Self::assemble(config, store, events, tests)
    }

    fn assemble(
        config: OrchestratorConfig,
        store: Option<Arc<RecordDb>>,
        events: Arc<EventHub>,
        tests: Arc<UserTestManager>,
    ) -> Self {
        let queue = TestQueueService::new(
            tests.clone(),
            store.clone(),
            config.global_max_concurrent,
            config.plan_limits,
        );
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            events,
            tests,
            queue,
            store,
            shutdown_tx,
            started_at: Utc::now(),
        }
    }
}
