//! Blocking HTTP transport shared by all download workers.
//!
//! `PoliteClient` spaces requests by a configurable delay (across threads), retries
//! transient failures with a fixed backoff, and sends an optional cookie header.
//! The rest of the crate only sees the [Fetch] trait.

use crate::scraper::error::ScraperError;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE, CONTENT_TYPE, COOKIE};
use reqwest::StatusCode;
use std::time::{Duration, Instant};
use tracing::debug;

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:123.0) Gecko/20100101 Firefox/123.0";
const DEFAULT_ACCEPT_LANGUAGE: &str = "zh-CN,zh;q=0.8,zh-TW;q=0.7,zh-HK;q=0.5,en-US;q=0.3,en;q=0.2";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_TIMEOUT_SECS: u64 = 25;
const MAX_REDIRECTS: usize = 10;

/// Default number of attempts for get_with_retry (initial plus retries).
pub const DEFAULT_RETRY_COUNT: u32 = 3;
/// Default fixed backoff in seconds between attempts.
pub const DEFAULT_BACKOFF_SECS: u64 = 10;
/// Backoff for HTTP 429 (rate limit): wait longer so the server can recover.
const BACKOFF_429_SECS: [u64; 4] = [30, 60, 90, 120];

/// A successful (2xx) response body with its declared content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl Fetched {
    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Fetches a URL. Non-success statuses are errors.
///
/// Implementations must be shareable across download workers.
pub trait Fetch: Sync {
    fn fetch(&self, url: &str) -> Result<Fetched, ScraperError>;
}

/// Blocking HTTP client that enforces a delay between requests.
#[derive(Debug)]
pub struct PoliteClient {
    inner: reqwest::blocking::Client,
    delay: Duration,
    next_slot: Mutex<Option<Instant>>,
    retry_count: u32,
    backoff_secs: Vec<u64>,
}

impl PoliteClient {
    /// Build a polite client with default User-Agent, timeouts, and no delay.
    pub fn new() -> Result<Self, ScraperError> {
        Self::builder().build()
    }

    pub fn builder() -> PoliteClientBuilder {
        PoliteClientBuilder::default()
    }

    /// Perform a GET request with retries for transient failures.
    ///
    /// Retries on timeout, connection errors, HTTP 5xx, and HTTP 429. Other errors and
    /// statuses are returned immediately. After the last attempt the final response
    /// or error is returned as is.
    pub fn get_with_retry(
        &self,
        url: &str,
    ) -> Result<reqwest::blocking::Response, reqwest::Error> {
        let max_attempts = self.retry_count.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let last_attempt = attempt >= max_attempts;
            self.wait_turn();
            let rate_limited = match self.inner.get(url).send() {
                Ok(response) => {
                    let status = response.status();
                    let rate_limited = status == StatusCode::TOO_MANY_REQUESTS;
                    if !(status.is_server_error() || rate_limited) || last_attempt {
                        return Ok(response);
                    }
                    debug!(url, status = status.as_u16(), attempt, "retrying after HTTP status");
                    rate_limited
                }
                Err(e) => {
                    if !(e.is_timeout() || e.is_connect()) || last_attempt {
                        return Err(e);
                    }
                    debug!(url, attempt, error = %e, "retrying after network error");
                    false
                }
            };
            std::thread::sleep(self.backoff_for(attempt, rate_limited));
        }
    }

    fn backoff_for(&self, attempt: u32, rate_limited: bool) -> Duration {
        let i = attempt.saturating_sub(1) as usize;
        let secs = if rate_limited {
            BACKOFF_429_SECS
                .get(i)
                .or(BACKOFF_429_SECS.last())
                .copied()
                .unwrap_or(60)
        } else {
            self.backoff_secs
                .get(i)
                .or(self.backoff_secs.last())
                .copied()
                .unwrap_or(DEFAULT_BACKOFF_SECS)
        };
        Duration::from_secs(secs)
    }

    /// Reserve the next request slot and sleep until it arrives.
    fn wait_turn(&self) {
        if self.delay.is_zero() {
            return;
        }
        let slot = {
            let mut next = self.next_slot.lock();
            let now = Instant::now();
            let slot = match *next {
                Some(t) if t > now => t,
                _ => now,
            };
            *next = Some(slot + self.delay);
            slot
        };
        let now = Instant::now();
        if slot > now {
            std::thread::sleep(slot - now);
        }
    }
}

impl Fetch for PoliteClient {
    fn fetch(&self, url: &str) -> Result<Fetched, ScraperError> {
        let response = self
            .get_with_retry(url)
            .map_err(|e| ScraperError::Network {
                url: url.to_string(),
                source: e,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ScraperError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
                context: None,
            });
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let bytes = response.bytes().map_err(|e| ScraperError::BodyRead {
            url: url.to_string(),
            source: e,
        })?;
        Ok(Fetched {
            content_type,
            bytes: bytes.to_vec(),
        })
    }
}

/// Builder for PoliteClient with optional User-Agent, cookie, delay, timeout, and retry settings.
#[derive(Debug)]
pub struct PoliteClientBuilder {
    user_agent: Option<String>,
    cookie: Option<String>,
    delay_millis: u64,
    timeout_secs: u64,
    retry_count: u32,
    retry_backoff_secs: Vec<u64>,
}

impl Default for PoliteClientBuilder {
    fn default() -> Self {
        Self {
            user_agent: None,
            cookie: None,
            delay_millis: 0,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_backoff_secs: vec![DEFAULT_BACKOFF_SECS],
        }
    }
}

impl PoliteClientBuilder {
    /// Set a custom User-Agent. If not set, a browser-like default is used.
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Send this raw `Cookie` header value with every request (e.g. `ews_key=..;ews_token=..`).
    pub fn cookie(mut self, cookie: impl Into<String>) -> Self {
        let cookie = cookie.into();
        self.cookie = if cookie.trim().is_empty() {
            None
        } else {
            Some(cookie.trim().to_string())
        };
        self
    }

    /// Minimum spacing between requests in milliseconds, shared by all threads. Default 0.
    pub fn delay_millis(mut self, millis: u64) -> Self {
        self.delay_millis = millis;
        self
    }

    /// Set request timeout in seconds. Default 25.
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Set number of HTTP attempts for transient failures (default 3).
    pub fn retry_count(mut self, n: u32) -> Self {
        self.retry_count = n.max(1);
        self
    }

    /// Backoff in seconds before each retry. If shorter than needed, the last value is reused.
    pub fn retry_backoff_secs(mut self, secs: Vec<u64>) -> Self {
        self.retry_backoff_secs = secs;
        self
    }

    pub fn build(self) -> Result<PoliteClient, ScraperError> {
        let user_agent = self
            .user_agent
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static(DEFAULT_ACCEPT_LANGUAGE),
        );
        if let Some(cookie) = &self.cookie {
            let value = HeaderValue::from_str(cookie).map_err(|e| ScraperError::ClientBuild {
                reason: format!("invalid cookie header: {}", e),
            })?;
            headers.insert(COOKIE, value);
        }
        let inner = reqwest::blocking::Client::builder()
            .cookie_store(true)
            .user_agent(user_agent)
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(self.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| ScraperError::ClientBuild {
                reason: e.to_string(),
            })?;
        let backoff_secs = if self.retry_backoff_secs.is_empty() {
            vec![DEFAULT_BACKOFF_SECS]
        } else {
            self.retry_backoff_secs
        };
        Ok(PoliteClient {
            inner,
            delay: Duration::from_millis(self.delay_millis),
            next_slot: Mutex::new(None),
            retry_count: self.retry_count,
            backoff_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetched_text_is_lossy_utf8() {
        let fetched = Fetched {
            content_type: None,
            bytes: vec![b'o', b'k', 0xff],
        };
        assert_eq!(fetched.text(), "ok\u{fffd}");
    }

    #[test]
    fn backoff_is_fixed_and_reuses_last_value() -> Result<(), ScraperError> {
        let client = PoliteClient::builder()
            .retry_backoff_secs(vec![10])
            .build()?;
        assert_eq!(client.backoff_for(1, false), Duration::from_secs(10));
        assert_eq!(client.backoff_for(5, false), Duration::from_secs(10));
        assert_eq!(client.backoff_for(1, true), Duration::from_secs(30));
        assert_eq!(client.backoff_for(9, true), Duration::from_secs(120));
        Ok(())
    }

    #[test]
    fn empty_backoff_falls_back_to_default() -> Result<(), ScraperError> {
        let client = PoliteClient::builder().retry_backoff_secs(vec![]).build()?;
        assert_eq!(
            client.backoff_for(1, false),
            Duration::from_secs(DEFAULT_BACKOFF_SECS)
        );
        Ok(())
    }

    #[test]
    fn invalid_cookie_is_a_build_error() {
        let result = PoliteClient::builder().cookie("a=b\nc").build();
        assert!(matches!(result, Err(ScraperError::ClientBuild { .. })));
    }

    #[test]
    fn blank_cookie_is_ignored() -> Result<(), ScraperError> {
        PoliteClient::builder().cookie("   ").build()?;
        Ok(())
    }

    #[test]
    fn wait_turn_spaces_consecutive_requests() -> Result<(), ScraperError> {
        let client = PoliteClient::builder().delay_millis(30).build()?;
        let start = Instant::now();
        client.wait_turn();
        client.wait_turn();
        client.wait_turn();
        assert!(start.elapsed() >= Duration::from_millis(60));
        Ok(())
    }
}
