//! Rate-limited GraphQL fetch client.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("graphql errors: {0}")]
    Graphql(String),
    #[error("decoding response at {path}: {message}")]
    Decode { path: String, message: String },
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Transport(err.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphqlRequest {
    pub query: String,
    pub variables: Value,
}

impl GraphqlRequest {
    pub fn new(query: impl Into<String>, variables: Value) -> Self {
        Self {
            query: query.into(),
            variables,
        }
    }
}

/// Rate-limit headers as reported by the upstream API.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub remaining: Option<u64>,
    pub reset_at: Option<DateTime<Utc>>,
    pub retry_after: Option<Duration>,
}

impl RateLimitHeaders {
    pub fn from_header_map(headers: &HeaderMap) -> Self {
        let number = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
        };
        Self {
            remaining: number("x-ratelimit-remaining"),
            reset_at: number("x-ratelimit-reset")
                .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single()),
            retry_after: number("retry-after").map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub rate_limit: RateLimitHeaders,
    pub body: Value,
}

/// One outbound GraphQL call. The authenticated HTTP client lives behind this
/// seam so callers can inject whatever client the process already owns.
#[async_trait]
pub trait GraphqlTransport: Send + Sync {
    async fn execute(&self, request: &GraphqlRequest) -> Result<TransportResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub endpoint: String,
    pub token: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.github.com/graphql".to_string(),
            token: None,
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl ReqwestTransport {
    /// Wraps an already-authenticated client.
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn from_config(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("building authorization header")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self::new(client, config.endpoint))
    }
}

#[async_trait]
impl GraphqlTransport for ReqwestTransport {
    async fn execute(&self, request: &GraphqlRequest) -> Result<TransportResponse, FetchError> {
        let resp = self.client.post(&self.endpoint).json(request).send().await?;
        let status = resp.status().as_u16();
        let rate_limit = RateLimitHeaders::from_header_map(resp.headers());
        let text = resp.text().await?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(TransportResponse {
            status,
            rate_limit,
            body,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleReason {
    /// Structured `RATE_LIMITED` error in the GraphQL body.
    RateLimitedError,
    /// Failed response while `x-ratelimit-remaining` reports zero.
    QuotaExhausted,
    /// 403/429 carrying `retry-after` (secondary rate limit).
    RetryAfter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleSignal {
    pub reason: ThrottleReason,
    pub reset_at: Option<DateTime<Utc>>,
}

fn graphql_error_types(body: &Value) -> impl Iterator<Item = &str> {
    body.get("errors")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|e| e.get("type").and_then(Value::as_str))
}

fn has_graphql_errors(body: &Value) -> bool {
    body.get("errors")
        .and_then(Value::as_array)
        .is_some_and(|errors| !errors.is_empty())
}

/// Classifies a response as throttled. A successful response that merely
/// spent the last unit of quota is not throttled; its data is still valid.
pub fn detect_throttle(resp: &TransportResponse, now: DateTime<Utc>) -> Option<ThrottleSignal> {
    let retry_after_reset = resp
        .rate_limit
        .retry_after
        .and_then(|d| TimeDelta::from_std(d).ok())
        .map(|d| now + d);
    let reset_at = retry_after_reset.or(resp.rate_limit.reset_at);

    if graphql_error_types(&resp.body).any(|t| t == "RATE_LIMITED") {
        return Some(ThrottleSignal {
            reason: ThrottleReason::RateLimitedError,
            reset_at,
        });
    }

    let failed = !(200..300).contains(&resp.status) || has_graphql_errors(&resp.body);
    if failed && resp.rate_limit.remaining == Some(0) {
        return Some(ThrottleSignal {
            reason: ThrottleReason::QuotaExhausted,
            reset_at,
        });
    }

    if matches!(resp.status, 403 | 429) && resp.rate_limit.retry_after.is_some() {
        return Some(ThrottleSignal {
            reason: ThrottleReason::RetryAfter,
            reset_at,
        });
    }
    None
}

#[derive(Debug, Clone, Copy)]
pub struct ThrottlePolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Used when the upstream gives no reset hint at all.
    pub fallback_delay: Duration,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(15 * 60),
            fallback_delay: Duration::from_secs(60),
        }
    }
}

impl ThrottlePolicy {
    /// Wait until the reset instant, floored against clock skew and capped so a
    /// distant reset is approached in bounded steps.
    pub fn delay_until(&self, reset_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
        let raw = match reset_at {
            Some(reset_at) => (reset_at - now).to_std().unwrap_or(Duration::ZERO),
            None => self.fallback_delay,
        };
        raw.clamp(self.min_delay, self.max_delay)
    }
}

/// Retries throttled calls transparently; every other failure propagates on
/// the first attempt. There is no attempt ceiling.
#[derive(Clone)]
pub struct RateLimitedClient {
    transport: Arc<dyn GraphqlTransport>,
    policy: ThrottlePolicy,
}

impl RateLimitedClient {
    pub fn new(transport: Arc<dyn GraphqlTransport>) -> Self {
        Self::with_policy(transport, ThrottlePolicy::default())
    }

    pub fn with_policy(transport: Arc<dyn GraphqlTransport>, policy: ThrottlePolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &ThrottlePolicy {
        &self.policy
    }

    /// Returns the `data` member of the response.
    pub async fn fetch(&self, request: &GraphqlRequest) -> Result<Value, FetchError> {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let response = self
                .transport
                .execute(request)
                .instrument(info_span!("graphql", attempt))
                .await?;

            let now = Utc::now();
            if let Some(signal) = detect_throttle(&response, now) {
                let delay = self.policy.delay_until(signal.reset_at, now);
                let resume_at = now + TimeDelta::milliseconds(delay.as_millis() as i64);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %resume_at,
                    reason = ?signal.reason,
                    "upstream rate limit hit; waiting before retrying the same request"
                );
                tokio::time::sleep(delay).await;
                continue;
            }
            return into_data(response);
        }
    }
}

fn into_data(response: TransportResponse) -> Result<Value, FetchError> {
    let TransportResponse { status, body, .. } = response;
    if !(200..300).contains(&status) {
        return Err(FetchError::HttpStatus {
            status,
            body: truncate(&body.to_string(), 512),
        });
    }

    let messages = body
        .get("errors")
        .and_then(Value::as_array)
        .map(|errors| {
            errors
                .iter()
                .map(|e| {
                    e.get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string()
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    match body.get("data") {
        Some(data) if !data.is_null() => {
            if !messages.is_empty() {
                // NOT_FOUND entries accompany null slots in batched node lookups.
                let only_not_found = graphql_error_types(&body).all(|t| t == "NOT_FOUND");
                if only_not_found {
                    debug!(count = messages.len(), "partial graphql response with unresolved nodes");
                } else {
                    warn!(errors = %messages.join("; "), "partial graphql response");
                }
            }
            Ok(data.clone())
        }
        _ if !messages.is_empty() => Err(FetchError::Graphql(messages.join("; "))),
        _ => Err(FetchError::Decode {
            path: "/data".into(),
            message: "response carried neither data nor errors".into(),
        }),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
