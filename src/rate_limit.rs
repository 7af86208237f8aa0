//! Rate-limit header parsing.
//!
//! When enabled in the [`RetryPolicy`](crate::RetryPolicy), a 429 response
//! that advertises when the limit resets stretches the backoff before the
//! next attempt. It never makes a request eligible for retry on its own.

use http::HeaderMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wait hints extracted from rate-limit headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitInfo {
    /// From `Retry-After` (delay-seconds or HTTP date).
    pub retry_after: Option<Duration>,

    /// From `X-RateLimit-Reset` or `RateLimit-Reset` (Unix seconds).
    pub reset_at: Option<SystemTime>,
}

impl RateLimitInfo {
    /// Parses rate-limit headers.
    ///
    /// # Examples
    ///
    /// ```
    /// use bulkwire::rate_limit::RateLimitInfo;
    /// use http::HeaderMap;
    /// use std::time::Duration;
    ///
    /// let mut headers = HeaderMap::new();
    /// headers.insert("retry-after", "2".parse().unwrap());
    ///
    /// let info = RateLimitInfo::from_headers(&headers);
    /// assert_eq!(info.retry_after, Some(Duration::from_secs(2)));
    /// ```
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            retry_after: parse_retry_after(headers),
            reset_at: parse_reset(headers, "x-ratelimit-reset")
                .or_else(|| parse_reset(headers, "ratelimit-reset")),
        }
    }

    /// Returns how long the server asked us to wait, capped at `max_wait`.
    ///
    /// `Retry-After` wins over a reset timestamp. Returns `None` when
    /// neither header is present or the reset time already passed.
    pub fn delay(&self, max_wait: Duration) -> Option<Duration> {
        let wait = match (self.retry_after, self.reset_at) {
            (Some(retry_after), _) => retry_after,
            (None, Some(reset_at)) => reset_at.duration_since(SystemTime::now()).ok()?,
            (None, None) => return None,
        };
        Some(wait.min(max_wait))
    }
}

/// Whether and how long to honour rate-limit headers on 429 responses.
///
/// # Examples
///
/// ```
/// use bulkwire::rate_limit::RateLimitConfig;
/// use std::time::Duration;
///
/// let config = RateLimitConfig::enabled().max_wait(Duration::from_secs(30));
/// assert!(config.enabled);
/// assert!(!RateLimitConfig::default().enabled);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Whether 429 responses may stretch the backoff. Off by default.
    pub enabled: bool,

    /// Upper bound on any header-derived wait.
    pub max_wait: Duration,
}

/// Cap on header-derived waits unless configured otherwise.
pub const DEFAULT_MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_wait: DEFAULT_MAX_RATE_LIMIT_WAIT,
        }
    }
}

impl RateLimitConfig {
    /// Honours rate-limit headers, waiting at most a minute.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            max_wait: DEFAULT_MAX_RATE_LIMIT_WAIT,
        }
    }

    /// Sets the longest wait a header may impose.
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok()).map(str::trim)
}

/// `Retry-After` is either delay-seconds or an HTTP date.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = header_str(headers, "retry-after")?;
    match value.parse::<u64>() {
        Ok(seconds) => Some(Duration::from_secs(seconds)),
        Err(_) => httpdate::parse_http_date(value)
            .ok()?
            .duration_since(SystemTime::now())
            .ok(),
    }
}

fn parse_reset(headers: &HeaderMap, name: &str) -> Option<SystemTime> {
    header_str(headers, name)?
        .parse::<u64>()
        .ok()
        .map(|seconds| UNIX_EPOCH + Duration::from_secs(seconds))
}
