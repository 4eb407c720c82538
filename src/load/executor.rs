use async_trait::async_trait;
use std::time::Instant;

use super::metrics::{FailureKind, RequestOutcome};
use super::LoadTestConfig;
use crate::error::OrchestratorError;

/// Issues one virtual-user request and classifies the result.
///
/// Implementations must not panic on transport errors; every failure is an
/// outcome. The driver bounds each call with the configured timeout.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute(&self) -> RequestOutcome;
}

/// reqwest-backed executor for one target URL and config.
pub struct HttpExecutor {
    client: reqwest::Client,
    url: String,
    method: reqwest::Method,
    headers: Vec<(String, String)>,
    body: Option<String>,
}

impl HttpExecutor {
    pub fn new(url: &str, config: &LoadTestConfig) -> Result<Self, OrchestratorError> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .pool_max_idle_per_host(config.users as usize);

        if let Some(proxy) = &config.proxy {
            let mut p = reqwest::Proxy::all(proxy.url.as_str()).map_err(|e| {
                OrchestratorError::Orchestration(format!("failed to configure proxy: {}", e))
            })?;
            if let Some(username) = &proxy.username {
                p = p.basic_auth(username, proxy.password.as_deref().unwrap_or_default());
            }
            builder = builder.proxy(p);
        }

        let client = builder.build().map_err(|e| {
            OrchestratorError::Orchestration(format!("failed to create HTTP client: {}", e))
        })?;

        Ok(Self {
            client,
            url: url.to_string(),
            method: config.method.as_reqwest(),
            headers: config
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            body: config.body.clone(),
        })
    }
}

#[async_trait]
impl RequestExecutor for HttpExecutor {
    async fn execute(&self) -> RequestOutcome {
        let mut request = self.client.request(self.method.clone(), &self.url);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &self.body {
            request = request.body(body.clone());
        }

        let start = Instant::now();
        match request.send().await {
            Ok(resp) => {
                let status = resp.status();
                // Drain the body so latency covers the full response.
                let body = resp.bytes().await;
                let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                let code = Some(status.as_u16());
                match body {
                    Err(e) if e.is_timeout() => {
                        RequestOutcome::failure(FailureKind::Timeout, latency_ms, code)
                    }
                    Err(_) => RequestOutcome::failure(FailureKind::Connection, latency_ms, code),
                    Ok(_) if status.is_success() || status.is_redirection() => {
                        RequestOutcome::success(latency_ms, code)
                    }
                    Ok(_) => RequestOutcome::failure(FailureKind::HttpStatus, latency_ms, code),
                }
            }
            Err(e) => {
                let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                RequestOutcome::failure(classify_error(&e), latency_ms, None)
            }
        }
    }
}

fn classify_error(e: &reqwest::Error) -> FailureKind {
    if e.is_timeout() {
        FailureKind::Timeout
    } else if e.is_connect() || e.is_request() {
        FailureKind::Connection
    } else {
        FailureKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::ProxyConfig;

    #[test]
    fn test_builds_with_proxy_credentials() {
        let config = LoadTestConfig {
            proxy: Some(ProxyConfig {
                url: "http://proxy.local:3128".to_string(),
                username: Some("me".to_string()),
                password: None,
            }),
            ..LoadTestConfig::default()
        };
        assert!(HttpExecutor::new("http://example.com", &config).is_ok());
    }

    #[test]
    fn test_rejects_unusable_proxy() {
        let config = LoadTestConfig {
            proxy: Some(ProxyConfig {
                url: "::not a proxy::".to_string(),
                username: None,
                password: None,
            }),
            ..LoadTestConfig::default()
        };
        match HttpExecutor::new("http://example.com", &config) {
            Err(OrchestratorError::Orchestration(_)) => {}
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("expected proxy error"),
        }
    }
}
