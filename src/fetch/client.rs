use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::time::sleep;

use crate::config::{PipelineSettings, Source};
use crate::error::{AppError, Result};

use super::backoff::RetryPolicy;
use super::cache::ResponseCache;
use super::rate_limit::RateLimiter;
use super::request::{prepare_request, PreparedRequest};

/// Unparsed payload of one successful request.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub url: String,
    pub status: u16,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
    pub attempts: u32,
    pub from_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("request could not be built: {0}")]
    InvalidRequest(String),
}

impl FetchError {
    /// Timeouts, connection failures, 429 and 5xx are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network(_) | FetchError::Timeout(_) => true,
            FetchError::HttpStatus(code) => *code == 429 || (500..600).contains(code),
            FetchError::InvalidRequest(_) => false,
        }
    }
}

impl From<FetchError> for AppError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Network(msg) => AppError::Network(msg),
            FetchError::Timeout(after) => {
                AppError::Network(format!("request timed out after {after:?}"))
            }
            FetchError::HttpStatus(status) if status == 429 || status >= 500 => {
                AppError::HttpServerOrRateLimit { status }
            }
            FetchError::HttpStatus(status) => AppError::HttpClient { status },
            FetchError::InvalidRequest(msg) => AppError::Config(msg),
        }
    }
}

/// Final failure of a fetch together with the attempts spent on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error} after {attempts} attempt(s)")]
pub struct FetchFailure {
    pub error: FetchError,
    pub attempts: u32,
}

impl From<FetchFailure> for AppError {
    fn from(failure: FetchFailure) -> Self {
        failure.error.into()
    }
}

struct AttemptFailure {
    error: FetchError,
    retry_after: Option<Duration>,
}

/// HTTP client with per-group rate limiting, retries with jittered exponential backoff,
/// and an optional response cache.
pub struct FetchClient {
    http: Client,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    cache: Option<ResponseCache>,
}

impl FetchClient {
    pub fn new(limiter: Arc<RateLimiter>, policy: RetryPolicy) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("series-cli/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            limiter,
            policy,
            cache: None,
        })
    }

    pub fn from_settings(settings: &PipelineSettings) -> Result<Self> {
        let mut limiter = RateLimiter::new(settings.min_request_interval());
        for (group, interval_ms) in &settings.rate_group_intervals_ms {
            limiter = limiter.with_group_interval(group, Duration::from_millis(*interval_ms));
        }

        let client = Self::new(Arc::new(limiter), RetryPolicy::from_settings(settings))?;
        Ok(match settings.cache_ttl() {
            Some(ttl) => client.with_cache(settings.cache_capacity, ttl),
            None => client,
        })
    }

    pub fn with_cache(mut self, capacity: usize, ttl: Duration) -> Self {
        self.cache = Some(ResponseCache::new(capacity, ttl));
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn cache(&self) -> Option<&ResponseCache> {
        self.cache.as_ref()
    }

    /// Fetch the source's payload, retrying transient failures up to the policy's attempt budget.
    pub async fn fetch(
        &self,
        source: &Source,
        timeout: Duration,
    ) -> std::result::Result<RawResponse, FetchFailure> {
        let request = prepare_request(source).map_err(|err| FetchFailure {
            error: FetchError::InvalidRequest(err.to_string()),
            attempts: 0,
        })?;

        if let Some(hit) = self.cache.as_ref().and_then(|cache| cache.get(&request.url)) {
            info!("fetch {}: served from cache", source.name);
            return Ok(hit);
        }

        let max_attempts = self.policy.max_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.limiter.acquire(&source.rate_group).await;

            match self.send_once(&request, timeout).await {
                Ok((status, body)) => {
                    info!(
                        "fetch {} attempt {}/{}: HTTP {}",
                        source.name, attempt, max_attempts, status
                    );
                    let response = RawResponse {
                        url: request.url.clone(),
                        status,
                        body,
                        fetched_at: Utc::now(),
                        attempts: attempt,
                        from_cache: false,
                    };
                    if let Some(cache) = &self.cache {
                        cache.insert(&request.url, &response);
                    }
                    return Ok(response);
                }
                Err(failure) => {
                    if !failure.error.is_transient() || attempt >= max_attempts {
                        warn!(
                            "fetch {} attempt {}/{} failed: {}; giving up",
                            source.name, attempt, max_attempts, failure.error
                        );
                        return Err(FetchFailure {
                            error: failure.error,
                            attempts: attempt,
                        });
                    }

                    let mut delay = self.policy.next_delay(attempt);
                    if let Some(hint) = failure.retry_after {
                        delay = delay.max(hint).min(self.policy.max_delay);
                    }
                    warn!(
                        "fetch {} attempt {}/{} failed: {}; retrying in {:?}",
                        source.name, attempt, max_attempts, failure.error, delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    async fn send_once(
        &self,
        request: &PreparedRequest,
        timeout: Duration,
    ) -> std::result::Result<(u16, String), AttemptFailure> {
        let response = self
            .http
            .get(&request.url)
            .headers(request.headers.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| classify_transport(err, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = (status == StatusCode::TOO_MANY_REQUESTS)
                .then(|| {
                    response
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|value| value.to_str().ok())
                        .and_then(|value| value.trim().parse::<u64>().ok())
                        .map(Duration::from_secs)
                })
                .flatten();
            return Err(AttemptFailure {
                error: FetchError::HttpStatus(status.as_u16()),
                retry_after,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|err| classify_transport(err, timeout))?;
        Ok((status.as_u16(), body))
    }
}

fn classify_transport(err: reqwest::Error, timeout: Duration) -> AttemptFailure {
    let error = if err.is_timeout() {
        FetchError::Timeout(timeout)
    } else {
        FetchError::Network(err.to_string())
    };
    AttemptFailure {
        error,
        retry_after: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use std::time::Instant;

    fn client(max_attempts: u32, base_ms: u64) -> FetchClient {
        let policy = RetryPolicy::new(max_attempts, Duration::from_millis(base_ms));
        FetchClient::new(Arc::new(RateLimiter::new(Duration::ZERO)), policy).unwrap()
    }

    fn source_for(server: &MockServer, path: &str) -> Source {
        Source::new("probe", &server.url(path), "main.temp", "celsius").unwrap()
    }

    #[test]
    fn classifies_transient_errors() {
        assert!(FetchError::HttpStatus(503).is_transient());
        assert!(FetchError::HttpStatus(429).is_transient());
        assert!(FetchError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!FetchError::HttpStatus(404).is_transient());
        assert!(!FetchError::InvalidRequest("x".into()).is_transient());
    }

    #[test]
    fn maps_into_error_taxonomy() {
        assert!(matches!(
            AppError::from(FetchError::HttpStatus(503)),
            AppError::HttpServerOrRateLimit { status: 503 }
        ));
        assert!(matches!(
            AppError::from(FetchError::HttpStatus(429)),
            AppError::HttpServerOrRateLimit { status: 429 }
        ));
        assert!(matches!(
            AppError::from(FetchError::HttpStatus(403)),
            AppError::HttpClient { status: 403 }
        ));
        assert!(matches!(
            AppError::from(FetchError::Timeout(Duration::from_secs(1))),
            AppError::Network(_)
        ));
    }

    #[tokio::test]
    async fn returns_body_on_success() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/weather");
                then.status(200).body(r#"{"main":{"temp":23.5}}"#);
            })
            .await;

        let response = client(3, 10)
            .fetch(&source_for(&server, "/weather"), Duration::from_secs(5))
            .await
            .expect("fetch succeeds");

        mock.assert_async().await;
        assert_eq!(response.status, 200);
        assert_eq!(response.attempts, 1);
        assert!(response.body.contains("23.5"));
    }

    #[tokio::test]
    async fn retries_server_errors_up_to_budget() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/flaky");
                then.status(503);
            })
            .await;

        let started = Instant::now();
        let err = client(3, 20)
            .fetch(&source_for(&server, "/flaky"), Duration::from_secs(5))
            .await
            .expect_err("fetch should fail");

        assert_eq!(err.error, FetchError::HttpStatus(503));
        assert_eq!(err.attempts, 3);
        assert_eq!(mock.hits_async().await, 3);
        // 20ms then 40ms of backoff at minimum.
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert!(matches!(
            AppError::from(err),
            AppError::HttpServerOrRateLimit { status: 503 }
        ));
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/missing");
                then.status(404);
            })
            .await;

        let err = client(3, 10)
            .fetch(&source_for(&server, "/missing"), Duration::from_secs(5))
            .await
            .expect_err("fetch should fail");

        assert_eq!(err.error, FetchError::HttpStatus(404));
        assert_eq!(err.attempts, 1);
        assert_eq!(mock.hits_async().await, 1);
    }

    #[tokio::test]
    async fn times_out_slow_upstream() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/slow");
                then.status(200).body("{}").delay(Duration::from_millis(500));
            })
            .await;

        let err = client(2, 10)
            .fetch(&source_for(&server, "/slow"), Duration::from_millis(50))
            .await
            .expect_err("fetch should time out");

        assert_eq!(err.error, FetchError::Timeout(Duration::from_millis(50)));
        assert_eq!(err.attempts, 2);
        assert_eq!(mock.hits_async().await, 2);
    }

    #[tokio::test]
    async fn cache_short_circuits_repeat_requests() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/cached");
                then.status(200).body("[]");
            })
            .await;

        let client = client(1, 10).with_cache(16, Duration::from_secs(60));
        let source = source_for(&server, "/cached");

        let first = client.fetch(&source, Duration::from_secs(5)).await.unwrap();
        let second = client.fetch(&source, Duration::from_secs(5)).await.unwrap();

        assert_eq!(mock.hits_async().await, 1);
        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(first.fetched_at, second.fetched_at);
    }
}
