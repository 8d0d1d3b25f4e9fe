//! Rate-limited HTTP client shared by connectors and geocoding providers.
//!
//! Every request first acquires the shared [`RateLimiter`] for the
//! client's key, then goes out with the configured User-Agent and timeout.
//!
//! Retry strategy:
//! - HTTP 429 or 5xx → retry with exponential backoff
//! - HTTP 4xx (not 429) → fail immediately
//! - Network error → retry
//!
//! Backoff is `retry_delay * 2^(attempt - 1)`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use thiserror::Error;

use casewatch_core::models::RateLimit;

use crate::config::HttpConfig;
use crate::rate_limit::RateLimiter;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("rate limited by upstream (HTTP 429)")]
    RateLimited,
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            FetchError::RateLimited => Some(429),
            _ => None,
        }
    }
}

/// Join a base URL and a path. Absolute URLs in `path` are returned as-is.
pub fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[derive(Clone)]
pub struct SourceClient {
    key: String,
    limit: RateLimit,
    limiter: Arc<RateLimiter>,
    client: Client,
    max_retries: u32,
    retry_delay: Duration,
}

impl SourceClient {
    /// Build a client whose requests count against `key` in `limiter`.
    pub fn new(
        key: impl Into<String>,
        limit: RateLimit,
        limiter: Arc<RateLimiter>,
        http: &HttpConfig,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(http.user_agent.clone())
            .timeout(Duration::from_secs(http.timeout_secs))
            .build()?;
        Ok(Self {
            key: key.into(),
            limit,
            limiter,
            client,
            max_retries: http.max_retries,
            retry_delay: Duration::from_millis(http.retry_delay_ms),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn get_text(&self, url: &str, query: &[(&str, &str)]) -> Result<String, FetchError> {
        self.send(|| self.client.get(url).query(query)).await
    }

    pub async fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Result<Value, FetchError> {
        let body = self.get_text(url, query).await?;
        serde_json::from_str(&body).map_err(|e| FetchError::Decode(e.to_string()))
    }

    pub async fn post_json(&self, url: &str, payload: &Value) -> Result<Value, FetchError> {
        let body = self.send(|| self.client.post(url).json(payload)).await?;
        serde_json::from_str(&body).map_err(|e| FetchError::Decode(e.to_string()))
    }

    async fn send<F>(&self, build: F) -> Result<String, FetchError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.retry_delay * 2u32.pow((attempt - 1).min(5));
                tracing::warn!(
                    source_id = %self.key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_err.as_ref().map(|e: &FetchError| e.to_string()).unwrap_or_default(),
                    "retrying request"
                );
                tokio::time::sleep(delay).await;
            }

            self.limiter.acquire(&self.key, self.limit).await;

            match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.text().await?);
                    }

                    if status.as_u16() == 429 {
                        last_err = Some(FetchError::RateLimited);
                        continue;
                    }

                    let body = response.text().await.unwrap_or_default();
                    let err = FetchError::Status {
                        status: status.as_u16(),
                        body,
                    };
                    if status.is_server_error() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    last_err = Some(FetchError::Network(e));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| FetchError::Decode("request failed after retries".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(max_retries: u32) -> SourceClient {
        let http = HttpConfig {
            user_agent: "casewatch-test".into(),
            timeout_secs: 5,
            max_retries,
            retry_delay_ms: 5,
        };
        let limit = RateLimit {
            requests_per_minute: 600,
            burst: 50,
        };
        SourceClient::new("test", limit, Arc::new(RateLimiter::new()), &http).unwrap()
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("https://a.org/", "/x"), "https://a.org/x");
        assert_eq!(join_url("https://a.org", "x/y"), "https://a.org/x/y");
        assert_eq!(join_url("https://a.org", "https://b.org/z"), "https://b.org/z");
    }

    #[tokio::test]
    async fn test_retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cases"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cases"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .with_priority(2)
            .mount(&server)
            .await;

        let body = client(3)
            .get_text(&format!("{}/cases", server.uri()), &[])
            .await
            .unwrap();
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(3)
            .get_text(&format!("{}/missing", server.uri()), &[])
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let err = client(2).get_text(&server.uri(), &[]).await.unwrap_err();
        assert!(matches!(err, FetchError::RateLimited));
    }

    #[tokio::test]
    async fn test_get_json_sends_query_and_decodes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("q", "miami"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let value = client(0)
            .get_json(&format!("{}/search", server.uri()), &[("q", "miami")])
            .await
            .unwrap();
        assert_eq!(value["ok"], true);

        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;
        let err = client(0)
            .get_json(&format!("{}/broken", server.uri()), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
    }
}
