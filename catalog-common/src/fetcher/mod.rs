//! Remote calls against the catalog and geocoding APIs.
//!
//! Both fetchers share the same composition: an `ApiClient` that sends every attempt through the
//! run's `RateLimiter` and wraps the whole call in the `RetryPolicy`.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use http::StatusCode;
use reqwest::header;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::error::FetchError;
use crate::metrics_consts::{FAILURES_TOTAL, REQUESTS_TOTAL, REQUEST_DURATION_SECONDS};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;

pub mod catalog;
pub mod geocode;

pub use catalog::{CatalogFetcher, CatalogPage, PageQuery, PartialFetch};
pub use geocode::GeocodeFetcher;

/// One HTTP round trip against an upstream API, returning parsed output or a typed failure.
#[async_trait]
pub trait Fetcher: Send + Sync {
    type Query: Send + 'static;
    type Output: Send;

    async fn fetch(&self, query: Self::Query) -> Result<Self::Output, FetchError>;
}

/// Counters updated concurrently by every call made through one `ApiClient`.
#[derive(Debug, Default)]
pub struct FetchCounters {
    pub requests: AtomicU64,
    pub retries: AtomicU64,
    pub failures: AtomicU64,
}

/// A snapshot of the counters owned by a fetcher, read-only to the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FetchStats {
    /// HTTP requests actually sent, retries included.
    pub requests: u64,
    /// Retries consumed after transient failures.
    pub retries: u64,
    /// Calls that ended in a failure, whatever its class.
    pub failures: u64,
    pub pages: u64,
    /// Catalog entries that could not be parsed.
    pub records_skipped: u64,
    /// Catalog entries dropped because their code was already seen.
    pub duplicates_dropped: u64,
}

/// Static description of one upstream API.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Name used for rate limiting, logs and metric labels.
    pub name: String,
    pub base_url: Url,
    pub timeout: time::Duration,
    pub user_agent: String,
}

/// An HTTP client bound to one API, sharing the run's rate limiter, retry policy and
/// cancellation token.
#[derive(Clone)]
pub struct ApiClient {
    name: String,
    base_url: Url,
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    retry_policy: RetryPolicy,
    cancel: CancellationToken,
    counters: Arc<FetchCounters>,
}

impl ApiClient {
    pub fn new(
        config: ApiConfig,
        limiter: Arc<RateLimiter>,
        retry_policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Result<Self, reqwest::Error> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(config.user_agent)
            .timeout(config.timeout)
            .build()?;

        // Url::join drops the last path segment unless the base ends with a slash.
        let mut base_url = config.base_url;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            name: config.name,
            base_url,
            client,
            limiter,
            retry_policy,
            cancel,
            counters: Arc::new(FetchCounters::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn counters(&self) -> &FetchCounters {
        &self.counters
    }

    /// Counters so far, with the catalog-only fields left at zero.
    pub fn stats(&self) -> FetchStats {
        FetchStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            ..Default::default()
        }
    }

    /// GET `path` relative to the base URL and parse the body as JSON.
    ///
    /// Every attempt waits on the rate limiter before it is sent, so retries are spaced too.
    pub async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value, FetchError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|error| FetchError::Permanent {
                api: self.name.clone(),
                status: None,
                reason: format!("invalid endpoint {path}: {error}"),
            })?;

        let result = self
            .retry_policy
            .execute(&self.cancel, &self.counters.retries, |attempt| {
                let url = url.clone();
                async move {
                    self.limiter.acquire(&self.name).await;
                    debug!(api = self.name.as_str(), attempt, %url, "sending request");
                    self.send(url, query).await
                }
            })
            .await;

        if let Err(error) = &result {
            if !matches!(error, FetchError::Cancelled) {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                let labels = [("api", self.name.clone())];
                metrics::counter!(FAILURES_TOTAL, &labels).increment(1);
            }
        }

        result
    }

    async fn send(&self, url: Url, query: &[(&str, String)]) -> Result<Value, FetchError> {
        let labels = [("api", self.name.clone())];
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(REQUESTS_TOTAL, &labels).increment(1);

        let now = tokio::time::Instant::now();
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|error| self.request_error(error))?;
        metrics::histogram!(REQUEST_DURATION_SECONDS, &labels).record(now.elapsed().as_secs_f64());

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after_header(response.headers());
            let reason = format!("unexpected status {status}");

            return Err(if is_retryable_status(status) {
                FetchError::Transient {
                    api: self.name.clone(),
                    status: Some(status),
                    reason,
                    retry_after,
                }
            } else {
                FetchError::Permanent {
                    api: self.name.clone(),
                    status: Some(status),
                    reason,
                }
            });
        }

        response.json::<Value>().await.map_err(|error| {
            if error.is_decode() {
                FetchError::Malformed {
                    api: self.name.clone(),
                    reason: error.to_string(),
                }
            } else {
                self.request_error(error)
            }
        })
    }

    /// Classify a failure that happened before a status code was available, or while reading
    /// the body. Timeouts and dropped connections are worth retrying; malformed requests are not.
    fn request_error(&self, error: reqwest::Error) -> FetchError {
        if error.is_builder() || error.is_redirect() {
            FetchError::Permanent {
                api: self.name.clone(),
                status: None,
                reason: error.to_string(),
            }
        } else {
            FetchError::Transient {
                api: self.name.clone(),
                status: None,
                reason: error.to_string(),
                retry_after: None,
            }
        }
    }
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Attempt to parse a Retry-After header, returning None if not possible.
/// Retry-After can specify a date in RFC2822 or a number of seconds; we try to parse both.
fn parse_retry_after_header(header_map: &header::HeaderMap) -> Option<time::Duration> {
    let retry_after = header_map.get(header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(u) = retry_after.parse::<u64>() {
        return Some(time::Duration::from_secs(u));
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let duration =
            chrono::DateTime::<chrono::offset::Utc>::from(dt) - chrono::offset::Utc::now();

        // This can only fail when negative, in which case we return None.
        return duration.to_std().ok();
    }

    None
}
