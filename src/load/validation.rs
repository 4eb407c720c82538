use reqwest::header::{HeaderName, HeaderValue};
use url::Url;

use super::LoadTestConfig;
use crate::config::{
    MAX_DURATION_SECS, MAX_THINK_TIME_SECS, MAX_TIMEOUT_SECS, MAX_USERS, MIN_DURATION_SECS,
    MIN_TIMEOUT_SECS, MIN_USERS,
};
use crate::error::OrchestratorError;

/// Check a target URL and load test config before anything is queued.
pub fn validate_load_test(url: &str, config: &LoadTestConfig) -> Result<(), OrchestratorError> {
    validate_target_url(url)?;
    validate_config(config)
}

pub fn validate_target_url(url: &str) -> Result<Url, OrchestratorError> {
    let parsed = Url::parse(url)
        .map_err(|e| OrchestratorError::Validation(format!("invalid url '{}': {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(OrchestratorError::Validation(format!(
                "unsupported url scheme '{}', expected http or https",
                other
            )))
        }
    }
    if parsed.host_str().is_none() {
        return Err(OrchestratorError::Validation(format!(
            "url '{}' has no host",
            url
        )));
    }
    Ok(parsed)
}

pub fn validate_config(config: &LoadTestConfig) -> Result<(), OrchestratorError> {
    if !(MIN_USERS..=MAX_USERS).contains(&config.users) {
        return Err(invalid(format!(
            "users must be between {} and {}, got {}",
            MIN_USERS, MAX_USERS, config.users
        )));
    }

    if !(MIN_DURATION_SECS..=MAX_DURATION_SECS).contains(&config.duration) {
        return Err(invalid(format!(
            "duration must be between {} and {} seconds, got {}",
            MIN_DURATION_SECS, MAX_DURATION_SECS, config.duration
        )));
    }

    if !config.ramp_up_time.is_finite() || config.ramp_up_time < 0.0 {
        return Err(invalid(format!(
            "rampUpTime must be a non-negative number, got {}",
            config.ramp_up_time
        )));
    }

    if config.ramp_up_time >= config.duration as f64 {
        return Err(invalid(format!(
            "rampUpTime ({}) must be shorter than duration ({})",
            config.ramp_up_time, config.duration
        )));
    }

    if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&config.timeout) {
        return Err(invalid(format!(
            "timeout must be between {} and {} seconds, got {}",
            MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS, config.timeout
        )));
    }

    if !config.think_time.is_finite()
        || config.think_time < 0.0
        || config.think_time > MAX_THINK_TIME_SECS
    {
        return Err(invalid(format!(
            "thinkTime must be between 0 and {} seconds, got {}",
            MAX_THINK_TIME_SECS, config.think_time
        )));
    }

    for (name, value) in &config.headers {
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| invalid(format!("invalid header name '{}'", name.escape_debug())))?;
        HeaderValue::from_str(value)
            .map_err(|_| invalid(format!("invalid value for header '{}'", name)))?;
    }

    if let Some(proxy) = &config.proxy {
        let parsed = Url::parse(&proxy.url).map_err(|e| {
            invalid(format!("invalid proxy url '{}': {}", proxy.url, e))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid(format!(
                "unsupported proxy scheme '{}'",
                parsed.scheme()
            )));
        }
        if proxy.password.is_some() && proxy.username.is_none() {
            return Err(invalid("proxy password given without username"));
        }
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> OrchestratorError {
    OrchestratorError::Validation(message.into())
}
