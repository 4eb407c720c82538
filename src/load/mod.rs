pub mod controller;
pub mod driver;
pub mod executor;
pub mod metrics;
pub mod report;
pub mod schedule;
pub mod validation;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::{
    DEFAULT_DURATION_SECS, DEFAULT_THINK_TIME_SECS, DEFAULT_TIMEOUT_SECS, DEFAULT_USERS,
};

// ============================================================================
// Data model
// ============================================================================

/// Load profile: how virtual users are brought up and retired over the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadProfile {
    Gradual,
    Stress,
    Spike,
    #[default]
    Load,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Load test parameters as submitted. Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadTestConfig {
    #[serde(default = "default_users")]
    pub users: u32,
    #[serde(default = "default_duration")]
    pub duration: u64,
    #[serde(default)]
    pub ramp_up_time: f64,
    #[serde(default)]
    pub test_type: LoadProfile,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_think_time")]
    pub think_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

fn default_users() -> u32 {
    DEFAULT_USERS
}

fn default_duration() -> u64 {
    DEFAULT_DURATION_SECS
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_think_time() -> f64 {
    DEFAULT_THINK_TIME_SECS
}

impl Default for LoadTestConfig {
    fn default() -> Self {
        Self {
            users: DEFAULT_USERS,
            duration: DEFAULT_DURATION_SECS,
            ramp_up_time: 0.0,
            test_type: LoadProfile::default(),
            method: HttpMethod::default(),
            timeout: DEFAULT_TIMEOUT_SECS,
            think_time: DEFAULT_THINK_TIME_SECS,
            proxy: None,
            headers: BTreeMap::new(),
            body: None,
        }
    }
}

impl LoadTestConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration)
    }

    pub fn ramp_up(&self) -> Duration {
        Duration::try_from_secs_f64(self.ramp_up_time.max(0.0)).unwrap_or(Duration::ZERO)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn think_time(&self) -> Duration {
        Duration::from_secs_f64(self.think_time.max(0.0))
    }
}

/// Controller lifecycle. The last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Starting,
    RampingUp,
    Steady,
    RampingDown,
    Spiking,
    Completed,
    Cancelled,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunPhase::Completed | RunPhase::Cancelled | RunPhase::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunPhase::Starting => "starting",
            RunPhase::RampingUp => "ramping_up",
            RunPhase::Steady => "steady",
            RunPhase::RampingDown => "ramping_down",
            RunPhase::Spiking => "spiking",
            RunPhase::Completed => "completed",
            RunPhase::Cancelled => "cancelled",
            RunPhase::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
