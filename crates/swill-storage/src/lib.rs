//! Review cache and user-mapping persistence, plus the throttled HTTP fetcher
//! the Untappd client sits on.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryStore;
pub use postgres::{connect_pool, PgStore};
pub use store::{like_pattern, ReviewStore, ReviewTransaction, StoreError, UserMappingStore};

pub const CRATE_NAME: &str = "swill-storage";

/// Marker Cloudflare puts in the body of a rate-limited Untappd response.
pub const RATE_LIMIT_BODY_MARKER: &str = "error code: 1015";
/// Header Untappd uses to report the calls left in the current hour.
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
const LOW_REMAINING_CALLS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn is_rate_limited_body(body: &[u8]) -> bool {
    String::from_utf8_lossy(body).contains(RATE_LIMIT_BODY_MARKER)
}

/// What to do with one completed HTTP exchange.
#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Deliver,
    Retry(&'static str),
    RateLimited,
    Reject,
}

/// Untappd answers 200 with a Cloudflare page when the key is throttled, so the
/// body is checked before the status is trusted.
fn judge(status: StatusCode, body: &[u8]) -> Verdict {
    if status == StatusCode::TOO_MANY_REQUESTS || is_rate_limited_body(body) {
        return Verdict::RateLimited;
    }
    if status.is_success() {
        return Verdict::Deliver;
    }
    match classify_status(status) {
        RetryDisposition::Retryable => Verdict::Retry("server error"),
        RetryDisposition::NonRetryable => Verdict::Reject,
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
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let shift = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Requests allowed in flight at once across the whole process.
    pub max_in_flight: usize,
    pub backoff: BackoffPolicy,
    /// Client-side cap on calls per hour; `None` leaves throttling to Untappd.
    pub calls_per_hour: Option<u32>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 4,
            backoff: BackoffPolicy::default(),
            calls_per_hour: None,
        }
    }
}

/// Hourly allowance of API calls, refilled one call at a time.
#[derive(Debug)]
pub struct CallBudget {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<BudgetState>,
}

#[derive(Debug, Clone, Copy)]
struct BudgetState {
    available: u32,
    last_refill: Instant,
}

impl CallBudget {
    pub fn per_hour(calls: u32) -> Self {
        let calls = calls.max(1);
        Self::new(calls, Duration::from_secs(3600) / calls)
    }

    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(BudgetState {
                available: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Waits until a call is available and spends it.
    pub async fn spend(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed();
                if !self.refill_every.is_zero() && elapsed >= self.refill_every {
                    let earned = elapsed.as_nanos() / self.refill_every.as_nanos();
                    let earned = u32::try_from(earned).unwrap_or(u32::MAX);
                    state.available = state.available.saturating_add(earned).min(self.capacity);
                    state.last_refill = Instant::now();
                }
                if state.available > 0 {
                    state.available -= 1;
                    return;
                }
                self.refill_every.saturating_sub(state.last_refill.elapsed())
            };
            debug!(?wait, "hourly call budget spent, waiting");
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

/// Shared reqwest client for the Untappd API: caps concurrent requests, can
/// hold calls to an hourly budget, and retries transient failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    budget: Option<CallBudget>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    /// Request path only; the query string carries credentials.
    pub path: String,
    pub body: Vec<u8>,
    pub rate_limit_remaining: Option<u32>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// `source` has its URL stripped; the query string carries credentials.
    #[error("request to {path} failed: {source}")]
    Request {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {path}")]
    HttpStatus { status: u16, path: String },
    #[error("rate limited on {path}")]
    RateLimited { path: String },
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    fn request(path: String, err: reqwest::Error) -> Self {
        Self::Request {
            path,
            source: err.without_url(),
        }
    }
}

fn path_of(url: &str) -> &str {
    let without_query = url.split('?').next().unwrap_or_default();
    match without_query.find("://") {
        Some(scheme_end) => {
            let rest = &without_query[scheme_end + 3..];
            rest.find('/').map_or("/", |slash| &rest[slash..])
        }
        None => without_query,
    }
}

fn remaining_calls(headers: &HeaderMap) -> Option<u32> {
    headers
        .get(RATE_LIMIT_REMAINING_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
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

        Ok(Self {
            client,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            budget: config.calls_per_hour.map(CallBudget::per_hour),
            backoff: config.backoff,
        })
    }

    /// GET `url`. Only its path is recorded on the span.
    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let path = path_of(url).to_string();
        let span = info_span!("untappd_get", path = %path);
        self.fetch_with_retries(url, path).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str, path: String) -> Result<FetchedResponse, FetchError> {
        let _permit = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;

        let mut attempt = 0;
        loop {
            if let Some(budget) = &self.budget {
                budget.spend().await;
            }

            let reason = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let rate_limit_remaining = remaining_calls(resp.headers());
                    let body = match resp.bytes().await {
                        Ok(bytes) => bytes.to_vec(),
                        Err(err) => return Err(FetchError::request(path, err)),
                    };
                    if let Some(remaining) = rate_limit_remaining.filter(|n| *n < LOW_REMAINING_CALLS) {
                        warn!(remaining, "Untappd hourly allowance nearly spent");
                    }
                    match judge(status, &body) {
                        Verdict::Deliver => {
                            return Ok(FetchedResponse {
                                status,
                                path,
                                body,
                                rate_limit_remaining,
                            })
                        }
                        // Retrying a throttled key only burns more of the allowance.
                        Verdict::RateLimited => return Err(FetchError::RateLimited { path }),
                        Verdict::Reject => {
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                path,
                            })
                        }
                        Verdict::Retry(reason) if attempt < self.backoff.max_retries => reason,
                        Verdict::Retry(_) => {
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                path,
                            })
                        }
                    }
                }
                Err(err)
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries =>
                {
                    "transport error"
                }
                Err(err) => return Err(FetchError::request(path, err)),
            };

            let delay = self.backoff.delay_for_attempt(attempt);
            warn!(attempt, reason, ?delay, "retrying Untappd request");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(64), Duration::from_millis(350));
    }

    #[test]
    fn throttled_responses_are_never_retried() {
        assert_eq!(
            judge(StatusCode::OK, b"<html>error code: 1015</html>"),
            Verdict::RateLimited
        );
        assert_eq!(judge(StatusCode::TOO_MANY_REQUESTS, b""), Verdict::RateLimited);
        assert_eq!(
            judge(StatusCode::OK, br#"{"meta":{"code":200},"response":{}}"#),
            Verdict::Deliver
        );
        assert_eq!(judge(StatusCode::BAD_GATEWAY, b""), Verdict::Retry("server error"));
        assert_eq!(judge(StatusCode::NOT_FOUND, b""), Verdict::Reject);
    }

    #[test]
    fn only_the_path_of_a_credentialed_url_is_kept() {
        assert_eq!(
            path_of("https://api.untappd.com/v4/user/beers/alice?client_id=x&client_secret=y"),
            "/v4/user/beers/alice"
        );
        assert_eq!(path_of("http://localhost:8080?q=1"), "/");
    }

    #[tokio::test]
    async fn transport_errors_never_carry_credentials() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            backoff: BackoffPolicy {
                max_retries: 0,
                ..BackoffPolicy::default()
            },
            ..HttpClientConfig::default()
        })
        .expect("fetcher");

        let err = fetcher
            .fetch_bytes("http://127.0.0.1:1/v4/user/beers/alice?limit=1&client_id=ID&client_secret=SEKRET")
            .await
            .expect_err("nothing listens on port 1");

        assert!(matches!(err, FetchError::Request { .. }));
        let shown = err.to_string();
        assert!(shown.contains("/v4/user/beers/alice"), "{shown}");
        assert!(!shown.contains("SEKRET"), "{shown}");
        assert!(!format!("{err:?}").contains("SEKRET"));
    }

    #[test]
    fn remaining_calls_header_is_parsed() {
        let mut headers = HeaderMap::new();
        assert_eq!(remaining_calls(&headers), None);
        headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from_static("42"));
        assert_eq!(remaining_calls(&headers), Some(42));
        headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from_static("soon"));
        assert_eq!(remaining_calls(&headers), None);
    }

    #[tokio::test(start_paused = true)]
    async fn call_budget_waits_for_refill_once_spent() {
        let budget = CallBudget::new(2, Duration::from_secs(1));
        let started = Instant::now();
        budget.spend().await;
        budget.spend().await;
        assert!(started.elapsed() < Duration::from_millis(10));
        budget.spend().await;
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[test]
    fn hourly_budget_spreads_refills_over_the_hour() {
        let budget = CallBudget::per_hour(100);
        assert_eq!(budget.capacity, 100);
        assert_eq!(budget.refill_every, Duration::from_secs(36));
    }
}
