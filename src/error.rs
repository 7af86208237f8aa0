//! Error types for resilient API calls.
//!
//! Every failure the execution core can produce is a variant of [`Error`].
//! Transport failures, HTTP errors, authentication failures and partially
//! failed bulk operations are kept apart so callers can tell "the network is
//! down" from "you are logged out" from "the server rejected some of your
//! items".

use crate::batch::BatchError;
use crate::response::RawResponse;
use http::{HeaderMap, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Header the API uses to identify a request in its own logs.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// The main error type for API calls.
///
/// # Examples
///
/// ```no_run
/// use bulkwire::{Client, Error};
///
/// # async fn example() -> Result<(), Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com")?
///     .build()?;
///
/// match client.get::<serde_json::Value>("/assets/42").await {
///     Ok(response) => println!("Asset: {:?}", response.data),
///     Err(Error::Authentication { reason, .. }) => eprintln!("Logged out: {}", reason),
///     Err(Error::Http(err)) => eprintln!("Rejected with {}: {}", err.status, err.message()),
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No HTTP response was obtained (connection refused, DNS failure, reset).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The transport gave up waiting for a response.
    #[error("Request timed out")]
    Timeout,

    /// The server answered with a non-2xx status.
    #[error("{0}")]
    Http(HttpError),

    /// The session expired and could not be renewed.
    ///
    /// `response` is the 401 that started the re-authentication.
    #[error("Authentication required ({reason}): {response}")]
    Authentication {
        /// Why the session could not be renewed.
        reason: AuthFailure,
        /// The original unauthenticated response.
        response: HttpError,
    },

    /// An explicit call to renew the session failed.
    #[error("Re-authentication failed: {0}")]
    Reauthentication(Arc<Error>),

    /// Some chunks of a bulk operation failed.
    ///
    /// The typed form is [`BatchError`]; this variant carries it with items
    /// and results converted to JSON values.
    #[error("{0}")]
    Batch(Box<BatchError<Value, Value>>),

    /// A successful response body did not decode as the declared kind or type.
    #[error("Failed to deserialize response (status {status}): {serde_error}")]
    DeserializationFailed {
        /// The raw response body that failed to deserialize
        raw_response: String,
        /// The serde error message
        serde_error: String,
        /// The HTTP status code
        status: StatusCode,
    },

    /// Invalid configuration was provided.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Failed to serialize the request body or a query value.
    #[error("Failed to serialize request: {0}")]
    SerializationFailed(String),

    /// An invalid URL was provided or produced.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl Error {
    /// Returns `true` when no HTTP response was obtained.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout)
    }

    /// Returns `true` when the caller has to log in again.
    pub fn is_auth_required(&self) -> bool {
        matches!(self, Error::Authentication { .. } | Error::Reauthentication(_))
    }

    /// Returns the HTTP status code if this error has one.
    ///
    /// For batch errors this is the status of the first failing chunk.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Http(err) => Some(err.status),
            Error::Authentication { response, .. } => Some(response.status),
            Error::DeserializationFailed { status, .. } => Some(*status),
            Error::Batch(err) => err.status,
            _ => None,
        }
    }

    /// Returns the raw response body if this error has one.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            Error::Http(err) => Some(&err.raw_response),
            Error::Authentication { response, .. } => Some(&response.raw_response),
            Error::DeserializationFailed { raw_response, .. } => Some(raw_response),
            _ => None,
        }
    }

    /// Returns the request id the server attached to the failing response.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Error::Http(err) => err.request_id.as_deref(),
            Error::Authentication { response, .. } => response.request_id.as_deref(),
            Error::Batch(err) => err.request_id.as_deref(),
            _ => None,
        }
    }

    /// Returns the structured API error body, if the server sent one.
    pub fn api_detail(&self) -> Option<&ApiErrorDetail> {
        match self {
            Error::Http(err) => err.detail.as_ref(),
            Error::Authentication { response, .. } => response.detail.as_ref(),
            _ => None,
        }
    }
}

/// Why a re-authentication did not produce a usable credential.
#[derive(thiserror::Error, Debug, Clone)]
pub enum AuthFailure {
    /// No re-authentication procedure is configured.
    #[error("no re-authentication procedure configured")]
    NotConfigured,

    /// The procedure chose not to renew the session.
    #[error("re-authentication skipped")]
    Skipped,

    /// The procedure returned the credential that was just rejected.
    #[error("re-authentication returned the rejected credential")]
    CredentialUnchanged,

    /// The procedure itself failed.
    #[error("re-authentication failed: {0}")]
    Failed(Arc<Error>),
}

/// A non-2xx response.
///
/// If the body follows the API's `{"error": {...}}` shape the parsed form is
/// available in [`HttpError::detail`].
#[derive(Debug, Clone)]
pub struct HttpError {
    /// The HTTP status code
    pub status: StatusCode,
    /// The response headers
    pub headers: HeaderMap,
    /// The raw response body
    pub raw_response: String,
    /// Value of the `x-request-id` response header
    pub request_id: Option<String>,
    /// The structured error body, when present
    pub detail: Option<ApiErrorDetail>,
}

/// The API's structured error body.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ApiErrorDetail {
    /// Human readable message.
    #[serde(default)]
    pub message: String,
    /// Items referenced by the request that do not exist.
    #[serde(default)]
    pub missing: Option<Vec<Value>>,
    /// Items in the request that violate a uniqueness constraint.
    #[serde(default)]
    pub duplicated: Option<Vec<Value>>,
    /// Anything else the server chose to report.
    #[serde(default)]
    pub extra: Option<Value>,
}

#[derive(Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorDetail,
}

impl HttpError {
    /// Builds an error from its parts, parsing the structured body if possible.
    pub fn new(status: StatusCode, headers: HeaderMap, raw_response: impl Into<String>) -> Self {
        let raw_response = raw_response.into();
        let detail = serde_json::from_str::<ApiErrorEnvelope>(&raw_response)
            .ok()
            .map(|envelope| envelope.error);
        let request_id = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        Self {
            status,
            headers,
            raw_response,
            request_id,
            detail,
        }
    }

    /// Converts a response that the caller will not accept into an error.
    pub fn from_response(response: RawResponse) -> Self {
        Self::new(response.status, response.headers, response.body.into_raw())
    }

    /// The server's message, or the raw body when there is no structured one.
    pub fn message(&self) -> &str {
        match &self.detail {
            Some(detail) if !detail.message.is_empty() => &detail.message,
            _ => &self.raw_response,
        }
    }

    /// Items the server reported as missing.
    pub fn missing(&self) -> &[Value] {
        self.detail
            .as_ref()
            .and_then(|detail| detail.missing.as_deref())
            .unwrap_or(&[])
    }

    /// Items the server reported as duplicated.
    pub fn duplicated(&self) -> &[Value] {
        self.detail
            .as_ref()
            .and_then(|detail| detail.duplicated.as_deref())
            .unwrap_or(&[])
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} | code: {}", self.message(), self.status.as_u16())?;
        if let Some(request_id) = &self.request_id {
            write!(f, " | X-Request-ID: {}", request_id)?;
        }
        Ok(())
    }
}

/// A specialized `Result` type for API calls.
pub type Result<T> = std::result::Result<T, Error>;
