use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use sitecheck_orchestrator::config::{CliArgs, OrchestratorConfig, SETTINGS_FILENAME};
use sitecheck_orchestrator::settings::{load_settings, save_settings, PersistentSettings};
use sitecheck_orchestrator::state::{AppState, SharedState};
use sitecheck_orchestrator::store::RecordDb;
use sitecheck_orchestrator::{janitor, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    // Initialize tracing; the guard keeps the file writer flushing until exit.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "sitecheck_orchestrator=info,tower_http=info".into());
    let (file_layer, _log_guard) = match &args.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "orchestrator.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                ),
                Some(guard),
            )
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    info!("Starting sitecheck-orchestrator v{}", env!("CARGO_PKG_VERSION"));
    info!("Data dir: {:?}", args.data_dir);

    std::fs::create_dir_all(&args.data_dir)?;
    let settings = load_settings(&args.data_dir.join(SETTINGS_FILENAME));
    let config = OrchestratorConfig::from_args(args, &settings);
    let settings_path = config.settings_path();

    if !settings_path.exists() {
        // Leave an editable template with the effective limits.
        save_settings(
            &settings_path,
            &PersistentSettings {
                global_max_concurrent: Some(config.global_max_concurrent),
                plan_limits: Some(config.plan_limits),
                reservoir_capacity: Some(config.reservoir_capacity),
            },
        );
    }

    info!(
        "Limits: global={}, free={}, pro={}, enterprise={}",
        config.global_max_concurrent,
        config.plan_limits.free,
        config.plan_limits.pro,
        config.plan_limits.enterprise
    );

    let store = match RecordDb::open(&config.database_path()) {
        Ok(db) => Some(Arc::new(db)),
        Err(e) => {
            error!("Failed to open test record database: {}", e);
            warn!("Continuing without persistence");
            None
        }
    };

    let port = config.port;
    let state: SharedState = Arc::new(AppState::new(config, store));

    let _janitor_handle = janitor::spawn_janitor(state.clone());

    let router = server::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Orchestrator listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    info!("Orchestrator shutting down");
    let stopped = state.tests.cleanup().await;
    if stopped > 0 {
        info!("Stopped {} live tests before exit", stopped);
    }

    Ok(())
}

async fn shutdown_signal(state: SharedState) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
    let _ = state.shutdown_tx.send(());
}
