//! Request descriptors.
//!
//! A [`RequestDescriptor`] is the unit the execution core retries and
//! replays. Its method, path, query and body never change between attempts;
//! only the credential headers added by the authenticated client may differ.

use crate::{Error, Result};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use serde_json::Value;
use url::Url;

/// How the response body should be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseKind {
    /// Parse as JSON. An empty body decodes to `null`.
    #[default]
    Json,
    /// Keep as UTF-8 text.
    Text,
    /// Keep the raw bytes.
    Binary,
}

/// Everything needed to perform one logical HTTP exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    /// The HTTP method (GET, POST, etc.).
    pub method: Method,

    /// Path relative to the client's base URL, or an absolute `http(s)://` URL.
    pub path: String,

    /// Additional headers for this request.
    pub headers: HeaderMap,

    /// Query parameters, in the order they are sent.
    pub query_params: Vec<(String, String)>,

    /// JSON body, if any.
    pub body: Option<Value>,

    /// How to decode the response.
    pub response_kind: ResponseKind,

    retry_enabled: bool,
}

impl RequestDescriptor {
    /// Creates a new descriptor with the given method and path.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            query_params: Vec::new(),
            body: None,
            response_kind: ResponseKind::Json,
            retry_enabled: true,
        }
    }

    /// Adds a header to the request.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Sets a query parameter, replacing any earlier value for the same key.
    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.query_params.retain(|(k, _)| *k != key);
        self.query_params.push((key, value.into()));
        self
    }

    /// Adds multiple query parameters to the request.
    pub fn with_query_params(mut self, params: impl IntoIterator<Item = (String, String)>) -> Self {
        for (key, value) in params {
            self = self.with_query_param(key, value);
        }
        self
    }

    /// Sets a structured query parameter.
    ///
    /// Strings are sent as-is; objects, arrays and numbers are sent as their
    /// JSON encoding.
    pub fn with_query_json<T: Serialize>(self, key: impl Into<String>, value: &T) -> Result<Self> {
        let value =
            serde_json::to_value(value).map_err(|e| Error::SerializationFailed(e.to_string()))?;
        let encoded = match value {
            Value::String(s) => s,
            other => other.to_string(),
        };
        Ok(self.with_query_param(key, encoded))
    }

    /// Serializes `body` as the JSON request body.
    pub fn with_json_body<T: Serialize>(mut self, body: &T) -> Result<Self> {
        let value =
            serde_json::to_value(body).map_err(|e| Error::SerializationFailed(e.to_string()))?;
        self.body = Some(value);
        Ok(self)
    }

    /// Sets an already-built JSON body.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Declares how the response body should be decoded.
    pub fn with_response_kind(mut self, kind: ResponseKind) -> Self {
        self.response_kind = kind;
        self
    }

    /// Marks the request as never retried, whatever the retry policy says.
    pub fn without_retry(mut self) -> Self {
        self.retry_enabled = false;
        self
    }

    /// Returns `false` if [`without_retry`](Self::without_retry) was called.
    pub fn is_retry_enabled(&self) -> bool {
        self.retry_enabled
    }

    /// Returns `true` if the path is a full URL rather than a base-relative path.
    pub fn is_absolute(&self) -> bool {
        let lower = self.path.to_ascii_lowercase();
        lower.starts_with("http://") || lower.starts_with("https://")
    }

    /// Resolves the full request URL against `base_url`, query included.
    ///
    /// Relative paths are appended to the base URL, so a base of
    /// `https://host/api/v1` and a path of `/assets` give
    /// `https://host/api/v1/assets`. Trailing slashes on the path are dropped.
    pub fn resolve_url(&self, base_url: &Url) -> Result<Url> {
        let mut url = if self.is_absolute() {
            Url::parse(&self.path)?
        } else {
            let base = base_url.as_str().trim_end_matches('/');
            let path = self.path.trim_end_matches('/');
            let separator = if path.starts_with('/') { "" } else { "/" };
            Url::parse(&format!("{}{}{}", base, separator, path))?
        };

        if !self.query_params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.query_params {
                pairs.append_pair(key, value);
            }
        }

        Ok(url)
    }
}

impl Default for RequestDescriptor {
    fn default() -> Self {
        Self::new(Method::GET, "")
    }
}

/// Returns `true` if both URLs share scheme, host and port.
pub(crate) fn is_same_origin(base_url: &Url, target: &Url) -> bool {
    base_url.origin() == target.origin()
}
