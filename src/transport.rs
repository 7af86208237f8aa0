//! Single HTTP exchanges.
//!
//! A [`Transport`] performs exactly one network call per `execute` and
//! reports whatever status came back. Retries, credentials and status-based
//! failure decisions live in the layers above it.

use crate::request::{RequestDescriptor, ResponseKind};
use crate::response::{RawResponse, ResponseBody};
use crate::{Error, Result};
use async_trait::async_trait;
use http::StatusCode;
use serde_json::Value;
use std::time::Duration;
use url::Url;

/// Performs one HTTP exchange.
///
/// Implement this to plug in another HTTP stack or a scripted test double.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request` once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] or [`Error::Timeout`] when no response was
    /// obtained, and [`Error::DeserializationFailed`] when a 2xx body does
    /// not decode as the declared [`ResponseKind`]. Non-2xx statuses are
    /// returned as `Ok`.
    async fn execute(&self, request: &RequestDescriptor) -> Result<RawResponse>;
}

/// The default transport, backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http_client: reqwest::Client,
    base_url: Url,
    timeout: Option<Duration>,
}

impl ReqwestTransport {
    /// Creates a transport resolving relative paths against `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(base_url: Url, timeout: Option<Duration>) -> Result<Self> {
        let http_client = reqwest::Client::builder().build().map_err(|e| {
            Error::ConfigurationError(format!("Failed to build HTTP client: {}", e))
        })?;

        Ok(Self {
            http_client,
            base_url,
            timeout,
        })
    }

    fn decode_body(status: StatusCode, kind: ResponseKind, bytes: &[u8]) -> Result<ResponseBody> {
        match kind {
            ResponseKind::Json => {
                if bytes.iter().all(u8::is_ascii_whitespace) {
                    return Ok(ResponseBody::Json(Value::Null));
                }
                match serde_json::from_slice::<Value>(bytes) {
                    Ok(value) => Ok(ResponseBody::Json(value)),
                    // Error pages from proxies are often HTML; keep them readable.
                    Err(_) if !status.is_success() => Ok(ResponseBody::Text(
                        String::from_utf8_lossy(bytes).into_owned(),
                    )),
                    Err(e) => Err(Error::DeserializationFailed {
                        raw_response: String::from_utf8_lossy(bytes).into_owned(),
                        serde_error: e.to_string(),
                        status,
                    }),
                }
            }
            ResponseKind::Text => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => Ok(ResponseBody::Text(text)),
                Err(_) if !status.is_success() => Ok(ResponseBody::Text(
                    String::from_utf8_lossy(bytes).into_owned(),
                )),
                Err(e) => Err(Error::DeserializationFailed {
                    raw_response: String::from_utf8_lossy(bytes).into_owned(),
                    serde_error: e.to_string(),
                    status,
                }),
            },
            ResponseKind::Binary => Ok(ResponseBody::Binary(bytes.to_vec())),
        }
    }

    fn map_send_error(error: reqwest::Error) -> Error {
        if error.is_timeout() {
            Error::Timeout
        } else {
            Error::Network(error)
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: &RequestDescriptor) -> Result<RawResponse> {
        let url = request.resolve_url(&self.base_url)?;

        tracing::debug!(
            method = %request.method,
            url = %url,
            "Executing HTTP request"
        );

        let mut builder = self.http_client.request(request.method.clone(), url);

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(Self::map_send_error)?;

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.bytes().await.map_err(Self::map_send_error)?;
        let body = Self::decode_body(status, request.response_kind, &bytes)?;

        Ok(RawResponse::new(status, headers, body))
    }
}
