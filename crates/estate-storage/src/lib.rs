//! Cache persistence, import persistence and HTTP fetch utilities for the estate workspace.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::{Method, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

pub mod cache;
pub mod repository;

pub use cache::{CacheEntry, CacheStore, MemoryCacheStore, PgCacheStore, StorageError};
pub use repository::{MemoryPropertyRepository, PgPropertyRepository, PropertyRepository};

pub const CRATE_NAME: &str = "estate-storage";

/// Schema for the cache and import tables.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
    Unauthorized,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        RetryDisposition::Unauthorized
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Spreads `requests` evenly over `window`, allowing the full amount as a burst.
    pub fn per_window(requests: u32, window: Duration) -> Self {
        let requests = requests.max(1);
        Self {
            capacity: requests,
            refill_every: window / requests,
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucketState {
    fn refill(&mut self, capacity: u32, refill_every: Duration) {
        let elapsed = self.last_refill.elapsed();
        if elapsed >= refill_every && refill_every.as_millis() > 0 {
            let refills = (elapsed.as_millis() / refill_every.as_millis()) as u32;
            self.tokens = (self.tokens.saturating_add(refills)).min(capacity);
            self.last_refill = Instant::now();
        }
    }
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Waits until a token is available.
    pub async fn take(&self) {
        loop {
            if self.try_take().await {
                return;
            }
            tokio::time::sleep(self.refill_every).await;
        }
    }

    /// Takes a token if one is available without waiting.
    pub async fn try_take(&self) -> bool {
        let mut state = self.state.lock().await;
        state.refill(self.capacity, self.refill_every);
        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            false
        }
    }
}

/// One token bucket per caller key (client address, API key, ...).
///
/// A caller idle for a full refill period would be back at capacity, so its
/// bucket is dropped and recreated on the next request.
#[derive(Debug)]
pub struct KeyedRateLimiter {
    config: TokenBucketConfig,
    idle_after: Duration,
    state: Mutex<KeyedState>,
}

#[derive(Debug)]
struct KeyedState {
    buckets: HashMap<String, (Arc<SimpleTokenBucket>, Instant)>,
    last_sweep: Instant,
}

impl KeyedRateLimiter {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            config,
            idle_after: config.refill_every.saturating_mul(config.capacity.max(1)),
            state: Mutex::new(KeyedState {
                buckets: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub async fn check(&self, key: &str) -> bool {
        let bucket = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            if now.duration_since(state.last_sweep) >= self.idle_after {
                let idle_after = self.idle_after;
                state
                    .buckets
                    .retain(|_, (_, seen)| now.duration_since(*seen) < idle_after);
                state.last_sweep = now;
            }
            let (bucket, seen) = state.buckets.entry(key.to_string()).or_insert_with(|| {
                let bucket = SimpleTokenBucket::new(self.config.capacity, self.config.refill_every);
                (Arc::new(bucket), now)
            });
            *seen = now;
            bucket.clone()
        };
        bucket.try_take().await
    }

    /// Number of callers currently holding a bucket.
    pub async fn tracked_callers(&self) -> usize {
        self.state.lock().await.buckets.len()
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub bearer_token: Option<String>,
    pub json_body: Option<JsonValue>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            bearer_token: None,
            json_body: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: JsonValue) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            bearer_token: None,
            json_body: Some(body),
        }
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Result<JsonValue, FetchError> {
        serde_json::from_slice(&self.body).map_err(|e| FetchError::Decode {
            url: self.final_url.clone(),
            message: e.to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        snippet: String,
    },
    #[error("credentials rejected with status {status} for {url}")]
    Unauthorized { status: u16, url: String },
    #[error("undecodable response from {url}: {message}")]
    Decode { url: String, message: String },
}

/// Drops the query string so API keys passed as parameters never reach the logs.
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.to_string()
        }
        Err(_) => raw.split('?').next().unwrap_or_default().to_string(),
    }
}

fn body_snippet(body: &[u8]) -> String {
    String::from_utf8_lossy(body).chars().take(200).collect()
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_bytes(
        &self,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        self.send(source_id, &HttpRequest::get(url)).await
    }

    pub async fn fetch_json(
        &self,
        source_id: &str,
        request: &HttpRequest,
    ) -> Result<JsonValue, FetchError> {
        self.send(source_id, request).await?.json()
    }

    pub async fn send(
        &self,
        source_id: &str,
        request: &HttpRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!(
            "http_fetch",
            source_id,
            method = %request.method,
            url = %redact_url(&request.url)
        );
        self.send_with_retries(request).instrument(span).await
    }

    async fn send_with_retries(
        &self,
        request: &HttpRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            let mut builder = self.client.request(request.method.clone(), &request.url);
            if let Some(token) = &request.bearer_token {
                builder = builder.bearer_auth(token);
            }
            if let Some(body) = &request.json_body {
                builder = builder.json(body);
            }
            let retries_left = attempt < self.backoff.max_retries;

            let resp = match builder.send().await {
                Ok(resp) => resp,
                Err(err)
                    if retries_left
                        && classify_reqwest_error(&err) == RetryDisposition::Retryable =>
                {
                    debug!(attempt, error = %err, "retrying after transport error");
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                    continue;
                }
                Err(err) => return Err(FetchError::Request(err)),
            };

            let status = resp.status();
            let final_url = redact_url(resp.url().as_str());
            if status.is_success() {
                let body = resp.bytes().await?.to_vec();
                return Ok(FetchedResponse {
                    status,
                    final_url,
                    body,
                });
            }

            match classify_status(status) {
                RetryDisposition::Unauthorized => {
                    return Err(FetchError::Unauthorized {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                RetryDisposition::Retryable if retries_left => {
                    let delay = retry_after(resp.headers())
                        .map(|d| d.min(self.backoff.max_delay))
                        .unwrap_or_else(|| self.backoff.delay_for_attempt(attempt));
                    debug!(
                        attempt,
                        status = status.as_u16(),
                        delay_ms = delay.as_millis() as u64,
                        "retrying after status"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                _ => {}
            }

            let body = resp.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                snippet: body_snippet(&body),
            });
        }
    }
}

/// Seconds form of `Retry-After`; HTTP-date values are ignored.
fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn retry_after_seconds_are_honoured() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(reqwest::header::RETRY_AFTER, "3".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(3)));
        headers.insert(
            reqwest::header::RETRY_AFTER,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn credential_statuses_are_not_retried() {
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::Unauthorized);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::Unauthorized);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[test]
    fn redaction_strips_api_keys() {
        assert_eq!(
            redact_url("https://api.scraperapi.com/?api_key=secret&url=https%3A%2F%2Fexample.com"),
            "https://api.scraperapi.com/"
        );
        assert_eq!(redact_url("not a url?api_key=x"), "not a url");
    }

    #[tokio::test]
    async fn token_bucket_allows_burst_then_refuses() {
        let bucket = SimpleTokenBucket::new(2, Duration::from_secs(60));
        assert!(bucket.try_take().await);
        assert!(bucket.try_take().await);
        assert!(!bucket.try_take().await);
    }

    #[tokio::test]
    async fn keyed_limiter_tracks_callers_independently() {
        let limiter =
            KeyedRateLimiter::new(TokenBucketConfig::per_window(1, Duration::from_secs(900)));
        assert!(limiter.check("10.0.0.1").await);
        assert!(!limiter.check("10.0.0.1").await);
        assert!(limiter.check("10.0.0.2").await);
        assert_eq!(limiter.tracked_callers().await, 2);
    }

    #[tokio::test]
    async fn keyed_limiter_forgets_idle_callers() {
        let limiter =
            KeyedRateLimiter::new(TokenBucketConfig::per_window(2, Duration::from_millis(40)));
        for i in 0..50 {
            assert!(limiter.check(&format!("10.0.1.{i}")).await);
        }
        assert_eq!(limiter.tracked_callers().await, 50);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.check("10.0.2.1").await);
        assert_eq!(limiter.tracked_callers().await, 1);
    }

    #[tokio::test]
    async fn keyed_limiter_keeps_active_callers_limited() {
        let limiter =
            KeyedRateLimiter::new(TokenBucketConfig::per_window(1, Duration::from_secs(900)));
        assert!(limiter.check("10.0.0.1").await);
        for _ in 0..5 {
            assert!(!limiter.check("10.0.0.1").await);
        }
        assert_eq!(limiter.tracked_callers().await, 1);
    }

    #[test]
    fn per_window_spreads_refills() {
        let cfg = TokenBucketConfig::per_window(100, Duration::from_secs(900));
        assert_eq!(cfg.capacity, 100);
        assert_eq!(cfg.refill_every, Duration::from_secs(9));
    }
}
