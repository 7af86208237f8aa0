//! Response types.
//!
//! [`RawResponse`] is what a single exchange produces, with the body decoded
//! according to the request's [`ResponseKind`](crate::ResponseKind).
//! [`Response`] is the typed form handed to callers of
//! [`Client::call`](crate::Client::call).

use crate::{Error, Result};
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

/// A decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// A JSON document (`null` for an empty body).
    Json(Value),
    /// A text body.
    Text(String),
    /// Raw bytes.
    Binary(Vec<u8>),
}

impl ResponseBody {
    /// Deserializes the body into `T`.
    ///
    /// Text bodies decode as a JSON string and binary bodies as an array of
    /// bytes, so `String` and `Vec<u8>` work for those kinds. Large binary
    /// bodies are better taken with [`into_bytes`](Self::into_bytes).
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeserializationFailed`] if the body does not match `T`.
    pub fn decode<T: DeserializeOwned>(self, status: StatusCode) -> Result<T> {
        let decoded = match &self {
            ResponseBody::Json(value) => T::deserialize(value),
            ResponseBody::Text(text) => T::deserialize(&Value::String(text.clone())),
            ResponseBody::Binary(bytes) => T::deserialize(&Value::from(bytes.clone())),
        };

        decoded.map_err(|e| {
            let raw_response = self.into_raw();
            tracing::error!(error = %e, raw_response = %raw_response, "Failed to deserialize response");
            Error::DeserializationFailed {
                raw_response,
                serde_error: e.to_string(),
                status,
            }
        })
    }

    /// The body as raw bytes, without going through a JSON value.
    ///
    /// JSON bodies yield their serialized text; an empty JSON body yields no
    /// bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            ResponseBody::Binary(bytes) => bytes,
            other => other.into_raw().into_bytes(),
        }
    }

    /// The body as text, for error reports. An empty JSON body is `""`.
    pub(crate) fn into_raw(self) -> String {
        match self {
            ResponseBody::Json(Value::Null) => String::new(),
            ResponseBody::Json(value) => value.to_string(),
            ResponseBody::Text(text) => text,
            ResponseBody::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        }
    }
}

/// The outcome of one exchange that produced an HTTP response.
///
/// The status may be anything; success is decided by the layers above the
/// transport.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// The HTTP status code.
    pub status: StatusCode,

    /// The response headers.
    pub headers: HeaderMap,

    /// The decoded body.
    pub body: ResponseBody,

    /// Number of transport calls it took to get this response.
    pub attempts: usize,
}

impl RawResponse {
    /// Creates a response observed on the first attempt.
    pub fn new(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        Self {
            status,
            headers,
            body,
            attempts: 1,
        }
    }

    /// Returns `true` for 2xx statuses.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns a header value by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }
}

/// A successful, typed response.
///
/// # Examples
///
/// ```no_run
/// use bulkwire::Client;
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Asset {
///     id: u64,
///     name: String,
/// }
///
/// # async fn example() -> Result<(), bulkwire::Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com")?
///     .build()?;
///
/// let response = client.get::<Asset>("/assets/123").await?;
///
/// println!("Asset: {}", response.data.name);
/// println!("Request took {:?}", response.latency);
/// println!("Attempts: {}", response.attempts);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Response<T> {
    /// The deserialized response data.
    pub data: T,

    /// The HTTP status code of the response.
    pub status: StatusCode,

    /// The response headers.
    pub headers: HeaderMap,

    /// Time from the first attempt until the final response, including any
    /// backoff and re-authentication.
    pub latency: Duration,

    /// Number of transport calls made for the final exchange.
    pub attempts: usize,
}

impl<T> Response<T> {
    /// Creates a new `Response`.
    pub fn new(
        data: T,
        status: StatusCode,
        headers: HeaderMap,
        latency: Duration,
        attempts: usize,
    ) -> Self {
        Self {
            data,
            status,
            headers,
            latency,
            attempts,
        }
    }

    /// Maps the response data, keeping the metadata.
    ///
    /// # Examples
    ///
    /// ```
    /// # use bulkwire::Response;
    /// # use http::{HeaderMap, StatusCode};
    /// # use std::time::Duration;
    /// let response = Response::new(42, StatusCode::OK, HeaderMap::new(), Duration::ZERO, 1);
    ///
    /// let string_response = response.map(|n| n.to_string());
    /// assert_eq!(string_response.data, "42");
    /// ```
    pub fn map<U, F>(self, f: F) -> Response<U>
    where
        F: FnOnce(T) -> U,
    {
        Response {
            data: f(self.data),
            status: self.status,
            headers: self.headers,
            latency: self.latency,
            attempts: self.attempts,
        }
    }

    /// Returns `true` if the request required retries.
    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }

    /// Returns a reference to a header value by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }
}

impl<T> AsRef<T> for Response<T> {
    fn as_ref(&self) -> &T {
        &self.data
    }
}

impl<T> std::ops::Deref for Response<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}
