//! Retry eligibility and backoff.
//!
//! [`RetryPolicy`] is a pure decision function: given a request, the outcome
//! of its latest attempt and the number of retries so far, it says whether
//! to try again and how long to wait first.

use crate::rate_limit::{RateLimitConfig, RateLimitInfo};
use crate::request::RequestDescriptor;
use crate::response::RawResponse;
use crate::Result;
use http::{Method, StatusCode};
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;

/// Retries allowed after the first attempt unless configured otherwise.
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Fixed delay before each retry unless configured otherwise.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Methods retried without being allow-listed.
pub const IDEMPOTENT_METHODS: [Method; 5] = [
    Method::GET,
    Method::HEAD,
    Method::OPTIONS,
    Method::DELETE,
    Method::PUT,
];

/// How long to wait between attempts.
///
/// # Examples
///
/// ```
/// use bulkwire::RetryStrategy;
/// use std::time::Duration;
///
/// let fixed = RetryStrategy::Fixed { delay: Duration::from_millis(250) };
/// assert_eq!(fixed.delay_for_retry(2), Some(Duration::from_millis(250)));
///
/// let exponential = RetryStrategy::ExponentialBackoff {
///     initial_delay: Duration::from_millis(100),
///     max_delay: Duration::from_secs(5),
///     jitter: false,
/// };
/// assert_eq!(exponential.delay_for_retry(3), Some(Duration::from_millis(800)));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// Never retry.
    None,

    /// Wait the same delay before every retry.
    Fixed {
        /// The delay between attempts.
        delay: Duration,
    },

    /// Wait `initial_delay * 2^retry_count`, capped at `max_delay`.
    ExponentialBackoff {
        /// The delay before the first retry.
        initial_delay: Duration,
        /// The maximum delay between retries.
        max_delay: Duration,
        /// Scale each delay by a random factor in `0.5..=1.0`.
        jitter: bool,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::Fixed {
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryStrategy {
    /// Returns the delay before retry number `retry_count` (0 = first retry),
    /// or `None` if this strategy never retries.
    pub fn delay_for_retry(&self, retry_count: usize) -> Option<Duration> {
        match self {
            RetryStrategy::None => None,
            RetryStrategy::Fixed { delay } => Some(*delay),
            RetryStrategy::ExponentialBackoff {
                initial_delay,
                max_delay,
                jitter,
            } => {
                let multiplier = 2u32.saturating_pow(retry_count.min(31) as u32);
                let delay = initial_delay.saturating_mul(multiplier).min(*max_delay);

                if *jitter {
                    let jitter_factor = rand::thread_rng().gen_range(0.5..=1.0);
                    Some(delay.mul_f64(jitter_factor))
                } else {
                    Some(delay)
                }
            }
        }
    }
}

/// Endpoints that are safe to repeat although their method is not idempotent.
///
/// Entries match case-insensitively anywhere in the request path, so
/// `/assets/list` covers `/api/v1/projects/p/assets/list`.
///
/// # Examples
///
/// ```
/// use bulkwire::EndpointList;
/// use http::Method;
///
/// let endpoints = EndpointList::new()
///     .with(Method::POST, "/assets/list")
///     .with(Method::POST, "/assets/byids");
///
/// assert!(endpoints.matches(&Method::POST, "/api/v1/projects/demo/Assets/List"));
/// assert!(!endpoints.matches(&Method::POST, "/api/v1/projects/demo/assets"));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointList {
    endpoints: HashMap<Method, Vec<String>>,
}

impl EndpointList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// The read-only bulk endpoints most resource APIs expose as POST.
    pub fn bulk_reads() -> Self {
        ["/list", "/byids", "/search", "/aggregate"]
            .into_iter()
            .fold(Self::new(), |list, path| list.with(Method::POST, path))
    }

    /// Adds an endpoint for `method`.
    pub fn with(mut self, method: Method, path: impl Into<String>) -> Self {
        self.endpoints
            .entry(method)
            .or_default()
            .push(path.into().to_ascii_lowercase());
        self
    }

    /// Adds every endpoint in `other`.
    pub fn extend(mut self, other: EndpointList) -> Self {
        for (method, paths) in other.endpoints {
            self.endpoints.entry(method).or_default().extend(paths);
        }
        self
    }

    /// Returns `true` if `path` contains one of the entries for `method`.
    pub fn matches(&self, method: &Method, path: &str) -> bool {
        let Some(endpoints) = self.endpoints.get(method) else {
            return false;
        };
        let path = path.to_ascii_lowercase();
        endpoints.iter().any(|endpoint| path.contains(endpoint.as_str()))
    }
}

/// Decides whether a failed attempt may be repeated.
///
/// [`RetryPolicy`] is the standard implementation. A custom predicate given
/// to [`ClientBuilder::retry_predicate`](crate::ClientBuilder::retry_predicate)
/// is consulted only after the policy allowed the retry, so it can narrow
/// eligibility but never widen it.
///
/// # Examples
///
/// ```
/// use bulkwire::{RawResponse, RequestDescriptor, Result, RetryPredicate};
///
/// struct RetryOnlyServiceUnavailable;
///
/// impl RetryPredicate for RetryOnlyServiceUnavailable {
///     fn should_retry(
///         &self,
///         _request: &RequestDescriptor,
///         outcome: &Result<RawResponse>,
///         _retry_count: usize,
///     ) -> bool {
///         matches!(outcome, Ok(response) if response.status.as_u16() == 503)
///     }
/// }
/// ```
pub trait RetryPredicate: Send + Sync {
    /// Returns `true` if the request should be sent again.
    ///
    /// `retry_count` is the number of retries already made (0 after the
    /// first attempt).
    fn should_retry(
        &self,
        request: &RequestDescriptor,
        outcome: &Result<RawResponse>,
        retry_count: usize,
    ) -> bool;
}

/// The retry rules for one client.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: usize,

    /// Delay between attempts.
    pub strategy: RetryStrategy,

    /// Non-idempotent endpoints that may still be retried.
    pub idempotent_endpoints: EndpointList,

    /// Whether 429 responses may stretch the delay.
    pub rate_limit: RateLimitConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            strategy: RetryStrategy::default(),
            idempotent_endpoints: EndpointList::new(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the defaults: 3 retries, 250 ms fixed delay, no
    /// allow-listed POST endpoints.
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    pub fn never() -> Self {
        Self {
            max_retries: 0,
            strategy: RetryStrategy::None,
            ..Self::default()
        }
    }

    /// Sets the retry cap.
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the backoff strategy.
    pub fn strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Allow-lists a POST endpoint.
    pub fn idempotent_post(mut self, path: impl Into<String>) -> Self {
        self.idempotent_endpoints = self.idempotent_endpoints.with(Method::POST, path);
        self
    }

    /// Allow-lists every endpoint in `endpoints`.
    pub fn idempotent_endpoints(mut self, endpoints: EndpointList) -> Self {
        self.idempotent_endpoints = self.idempotent_endpoints.extend(endpoints);
        self
    }

    /// Sets rate-limit header handling.
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    /// Returns `true` for 1xx, 429 and 5xx.
    pub fn is_retryable_status(status: StatusCode) -> bool {
        status.is_informational()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
    }

    /// Returns `true` if repeating `request` has no extra side effects.
    pub fn is_retryable_request(&self, request: &RequestDescriptor) -> bool {
        IDEMPOTENT_METHODS.contains(&request.method)
            || self
                .idempotent_endpoints
                .matches(&request.method, &request.path)
    }

    /// Returns `true` while another retry is allowed by the cap and strategy.
    pub fn has_retries_left(&self, retry_count: usize) -> bool {
        retry_count < self.max_retries && self.strategy.delay_for_retry(retry_count).is_some()
    }

    /// The wait before retry number `retry_count`.
    ///
    /// With rate-limit handling enabled, a 429 outcome carrying a reset hint
    /// waits for that hint instead, when it is longer.
    pub fn backoff_delay(&self, retry_count: usize, outcome: &Result<RawResponse>) -> Duration {
        let base = self
            .strategy
            .delay_for_retry(retry_count)
            .unwrap_or(Duration::ZERO);

        if !self.rate_limit.enabled {
            return base;
        }

        match outcome {
            Ok(response) if response.status == StatusCode::TOO_MANY_REQUESTS => {
                RateLimitInfo::from_headers(&response.headers)
                    .delay(self.rate_limit.max_wait)
                    .map_or(base, |advertised| advertised.max(base))
            }
            _ => base,
        }
    }
}

impl RetryPredicate for RetryPolicy {
    fn should_retry(
        &self,
        request: &RequestDescriptor,
        outcome: &Result<RawResponse>,
        retry_count: usize,
    ) -> bool {
        if !self.has_retries_left(retry_count) {
            return false;
        }
        if !self.is_retryable_request(request) {
            return false;
        }
        match outcome {
            Ok(response) => Self::is_retryable_status(response.status),
            Err(error) => error.is_transport_failure(),
        }
    }
}
