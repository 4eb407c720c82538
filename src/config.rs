use clap::Parser;
use std::path::PathBuf;

use crate::settings::PersistentSettings;

/// Sitecheck Orchestrator — queues website diagnostics and drives load tests.
#[derive(Parser, Debug, Clone)]
#[command(name = "sitecheck-orchestrator")]
pub struct CliArgs {
    /// Directory for the test record database and settings file
    #[arg(short = 'd', long = "data-dir", default_value = ".sitecheck")]
    pub data_dir: PathBuf,

    /// HTTP port
    #[arg(long = "port", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Maximum number of tests running at once across all users
    #[arg(long = "global-max-concurrent")]
    pub global_max_concurrent: Option<usize>,

    /// Hours a finished job stays visible in the queue before cleanup
    #[arg(long = "job-retention-hours", default_value_t = DEFAULT_JOB_RETENTION_HOURS)]
    pub job_retention_hours: i64,

    /// Also write logs to a daily-rolling file in this directory
    #[arg(short = 'l', long = "log-dir")]
    pub log_dir: Option<PathBuf>,
}

/// Per-plan ceilings on concurrently running tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanLimits {
    pub free: usize,
    pub pro: usize,
    pub enterprise: usize,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            free: FREE_PLAN_MAX_CONCURRENT,
            pro: PRO_PLAN_MAX_CONCURRENT,
            enterprise: ENTERPRISE_PLAN_MAX_CONCURRENT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub data_dir: PathBuf,
    pub port: u16,
    pub global_max_concurrent: usize,
    pub plan_limits: PlanLimits,
    pub reservoir_capacity: usize,
    pub job_retention_hours: i64,
    pub log_dir: Option<PathBuf>,
}

// Server constants
pub const DEFAULT_PORT: u16 = 9890;
pub const SETTINGS_FILENAME: &str = "orchestrator-settings.json";
pub const DATABASE_FILENAME: &str = "test-records.db";

// Queue constants
pub const DEFAULT_GLOBAL_MAX_CONCURRENT: usize = 20;
pub const FREE_PLAN_MAX_CONCURRENT: usize = 1;
pub const PRO_PLAN_MAX_CONCURRENT: usize = 3;
pub const ENTERPRISE_PLAN_MAX_CONCURRENT: usize = 10;
pub const ANONYMOUS_USER: &str = "anonymous";

// Janitor constants
pub const JANITOR_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_JOB_RETENTION_HOURS: i64 = 24;

// Load test bounds
pub const MIN_USERS: u32 = 1;
pub const MAX_USERS: u32 = 100;
pub const MIN_DURATION_SECS: u64 = 1;
pub const MAX_DURATION_SECS: u64 = 300;
pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 60;
pub const MAX_THINK_TIME_SECS: f64 = 60.0;

// Load test defaults
pub const DEFAULT_USERS: u32 = 10;
pub const DEFAULT_DURATION_SECS: u64 = 30;
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_THINK_TIME_SECS: f64 = 1.0;

// Controller constants
pub const PROGRESS_INTERVAL_MS: u64 = 1_000;
pub const STRESS_RAMP_FACTOR: f64 = 0.5;
pub const DRAIN_GRACE_SECS: u64 = 1;

// Metrics constants
pub const DEFAULT_RESERVOIR_CAPACITY: usize = 10_000;
pub const TPS_WINDOW_MS: u64 = 1_000;

// Push channel constants
pub const EVENT_BUFFER_SIZE: usize = 500;
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

impl OrchestratorConfig {
    pub fn from_args(args: CliArgs, settings: &PersistentSettings) -> Self {
        let global_max_concurrent = args
            .global_max_concurrent
            .or(settings.global_max_concurrent)
            .unwrap_or(DEFAULT_GLOBAL_MAX_CONCURRENT)
            .max(1);

        OrchestratorConfig {
            data_dir: args.data_dir,
            port: args.port,
            global_max_concurrent,
            plan_limits: settings.plan_limits.unwrap_or_default(),
            reservoir_capacity: settings
                .reservoir_capacity
                .unwrap_or(DEFAULT_RESERVOIR_CAPACITY)
                .max(1),
            job_retention_hours: args.job_retention_hours,
            log_dir: args.log_dir,
        }
    }

    /// Path to the settings file inside the data directory
    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILENAME)
    }

    /// Path to the SQLite test record database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILENAME)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".sitecheck"),
            port: DEFAULT_PORT,
            global_max_concurrent: DEFAULT_GLOBAL_MAX_CONCURRENT,
            plan_limits: PlanLimits::default(),
            reservoir_capacity: DEFAULT_RESERVOIR_CAPACITY,
            job_retention_hours: DEFAULT_JOB_RETENTION_HOURS,
            log_dir: None,
        }
    }
}
