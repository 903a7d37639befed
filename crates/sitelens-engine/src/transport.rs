use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::{RequestBuilder, Response};
use serde_json::Value;

/// Timeout and retry budget for one collaborator call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportPolicy {
    pub request_timeout: Duration,
    pub max_retries: usize,
    pub retry_backoff: Duration,
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(90),
            max_retries: 2,
            retry_backoff: Duration::from_millis(1200),
        }
    }
}

impl TransportPolicy {
    pub fn backoff_for(&self, attempt: usize) -> Duration {
        self.retry_backoff.mul_f64(attempt as f64 + 1.0)
    }
}

/// Sends the request built by `build`, retrying transient transport failures
/// (timeouts, refused connections) with linear backoff. HTTP error statuses are
/// returned as responses and never retried here.
pub(crate) async fn send_with_transport_retries<F>(
    service: &str,
    policy: &TransportPolicy,
    build: F,
) -> Result<Response>
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt = 0;
    loop {
        let response = build().timeout(policy.request_timeout).send().await;
        match response {
            Ok(ok) => return Ok(ok),
            Err(raw) => {
                let err = anyhow::Error::new(raw).context(format!("{service} request failed"));
                if !is_retryable_transport_error(&err) || attempt >= policy.max_retries {
                    return Err(err);
                }
                let delay = policy.backoff_for(attempt);
                tracing::debug!(
                    service,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "transport retry after transient request failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

pub(crate) async fn response_json_or_error(service: &str, response: Response) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .await
        .with_context(|| format!("{service} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{service} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{service} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| {
                reqwest_err.is_timeout() || reqwest_err.is_connect() || reqwest_err.is_request()
            })
            .unwrap_or(false)
    })
}

/// Flattens an error chain into one line, dropping repeated causes.
pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing: &String| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn api_base_from_env(key: &str, default: &str) -> String {
    normalize_api_base(non_empty_env(key).as_deref()).unwrap_or_else(|| default.to_string())
}

fn normalize_api_base(raw: Option<&str>) -> Option<String> {
    raw.map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
}
