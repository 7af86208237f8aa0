//! The public entry point.
//!
//! The [`Client`] owns the full execution chain (transport, retries,
//! credentials) and offers typed calls, chunked bulk writes and paginated
//! listing on top of it. Use [`ClientBuilder`] to configure and create
//! clients.

use crate::{
    auth::{AuthSession, AuthenticatedClient, Reauthenticator},
    batch::{self, BatchError, BatchOptions},
    pagination::{Page, Paginator},
    rate_limit::RateLimitConfig,
    request::{RequestDescriptor, ResponseKind},
    response::RawResponse,
    retry::{RetryPolicy, RetryPredicate, RetryStrategy},
    retrying::RetryingClient,
    transport::{ReqwestTransport, Transport},
    Error, Response, Result,
};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// Name of the cursor parameter on list endpoints.
const CURSOR_PARAM: &str = "cursor";

/// A client for a resource-oriented JSON API.
///
/// The client is cheap to clone; clones share the connection pool, the
/// retry configuration and the authentication session.
///
/// # Examples
///
/// ```no_run
/// use bulkwire::{Client, EndpointList, RetryPolicy};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Clone)]
/// struct NewAsset {
///     name: String,
/// }
///
/// #[derive(Serialize, Deserialize)]
/// struct Asset {
///     id: u64,
///     name: String,
/// }
///
/// # async fn example() -> Result<(), bulkwire::Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com/api/v1/projects/demo")?
///     .bearer_token("initial-token")
///     .retry_policy(RetryPolicy::new().idempotent_endpoints(EndpointList::bulk_reads()))
///     .build()?;
///
/// // Single request
/// let asset = client.get::<Asset>("/assets/123").await?;
/// println!("Asset: {}", asset.data.name);
///
/// // Bulk write, 1000 items per request
/// let new_assets: Vec<NewAsset> = (0..2500)
///     .map(|i| NewAsset { name: format!("asset-{}", i) })
///     .collect();
/// let created: Vec<Asset> = client
///     .post_items("/assets", &new_assets, bulkwire::BatchOptions::new(1000)?)
///     .await?;
/// println!("Created {} assets", created.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    auth: AuthenticatedClient,
}

#[derive(Serialize, Deserialize)]
struct ItemsEnvelope<T> {
    items: Vec<T>,
}

impl Client {
    /// Creates a new `ClientBuilder` for configuring a client.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use bulkwire::Client;
    ///
    /// # async fn example() -> Result<(), bulkwire::Error> {
    /// let client = Client::builder()
    ///     .base_url("https://api.example.com")?
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// The base URL relative paths are resolved against.
    pub fn base_url(&self) -> &Url {
        self.inner.auth.base_url()
    }

    /// Sends `request` through retries and credential handling.
    ///
    /// # Errors
    ///
    /// Any non-2xx final status is an error: [`Error::Authentication`] for a
    /// 401 the session could not recover from, [`Error::Http`] otherwise.
    pub async fn execute(&self, request: &RequestDescriptor) -> Result<RawResponse> {
        let start_time = Instant::now();
        let response = self.inner.auth.execute(request).await?;

        tracing::debug!(
            method = %request.method,
            path = %request.path,
            latency_ms = start_time.elapsed().as_millis() as u64,
            "Request completed"
        );

        Ok(response)
    }

    /// Sends `request` and decodes the body as `T`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use bulkwire::{Client, RequestDescriptor};
    /// use http::Method;
    /// use serde::Deserialize;
    ///
    /// #[derive(Deserialize)]
    /// struct Aggregate { count: u64 }
    ///
    /// # async fn example() -> Result<(), bulkwire::Error> {
    /// let client = Client::builder()
    ///     .base_url("https://api.example.com")?
    ///     .build()?;
    ///
    /// let request = RequestDescriptor::new(Method::POST, "/assets/aggregate")
    ///     .with_json_body(&serde_json::json!({"filter": {}}))?;
    /// let response = client.call::<Vec<Aggregate>>(request).await?;
    /// println!("{} assets", response.data[0].count);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn call<T>(&self, request: RequestDescriptor) -> Result<Response<T>>
    where
        T: DeserializeOwned,
    {
        let start_time = Instant::now();
        let RawResponse {
            status,
            headers,
            body,
            attempts,
        } = self.execute(&request).await?;

        let data = body.decode::<T>(status)?;
        Ok(Response::new(
            data,
            status,
            headers,
            start_time.elapsed(),
            attempts,
        ))
    }

    /// Sends `request` expecting a binary body and returns its bytes as-is.
    ///
    /// The request's [`ResponseKind`] is forced to `Binary`.
    pub async fn download(&self, request: RequestDescriptor) -> Result<Response<Vec<u8>>> {
        let start_time = Instant::now();
        let request = request.with_response_kind(ResponseKind::Binary);
        let RawResponse {
            status,
            headers,
            body,
            attempts,
        } = self.execute(&request).await?;

        Ok(Response::new(
            body.into_bytes(),
            status,
            headers,
            start_time.elapsed(),
            attempts,
        ))
    }

    /// Makes a GET request to the specified path.
    pub async fn get<T>(&self, path: impl Into<String>) -> Result<Response<T>>
    where
        T: DeserializeOwned,
    {
        self.call(RequestDescriptor::new(Method::GET, path)).await
    }

    /// Makes a POST request to the specified path with a JSON body.
    ///
    /// POST is only retried when the path is allow-listed in the client's
    /// [`RetryPolicy`].
    pub async fn post<B, T>(&self, path: impl Into<String>, body: &B) -> Result<Response<T>>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        self.call(RequestDescriptor::new(Method::POST, path).with_json_body(body)?)
            .await
    }

    /// Makes a PUT request to the specified path with a JSON body.
    pub async fn put<B, T>(&self, path: impl Into<String>, body: &B) -> Result<Response<T>>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        self.call(RequestDescriptor::new(Method::PUT, path).with_json_body(body)?)
            .await
    }

    /// Makes a PATCH request to the specified path with a JSON body.
    pub async fn patch<B, T>(&self, path: impl Into<String>, body: &B) -> Result<Response<T>>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        self.call(RequestDescriptor::new(Method::PATCH, path).with_json_body(body)?)
            .await
    }

    /// Makes a DELETE request to the specified path.
    pub async fn delete<T>(&self, path: impl Into<String>) -> Result<Response<T>>
    where
        T: DeserializeOwned,
    {
        self.call(RequestDescriptor::new(Method::DELETE, path)).await
    }

    /// Posts `items` in chunks, each as `{"items": [...]}`, and returns the
    /// `items` of every response in input order.
    ///
    /// # Errors
    ///
    /// If any chunk fails the other chunks still complete, and the
    /// [`BatchError`] tells which input items were written.
    pub async fn post_items<T, R>(
        &self,
        path: &str,
        items: &[T],
        options: impl Into<BatchOptions>,
    ) -> std::result::Result<Vec<R>, BatchError<T, R>>
    where
        T: Serialize + Clone,
        R: DeserializeOwned,
    {
        batch::execute_batch(items, options, |chunk| async move {
            let request = RequestDescriptor::new(Method::POST, path)
                .with_json_body(&ItemsEnvelope { items: chunk })?;
            let response = self.call::<ItemsEnvelope<R>>(request).await?;
            Ok(response.data.items)
        })
        .await
    }

    /// Lists a cursor-paginated endpoint.
    ///
    /// Nothing is sent until the paginator is polled. GET requests carry the
    /// cursor as the `cursor` query parameter, other methods as the `cursor`
    /// field of the JSON body. Responses are read as
    /// `{"items": [...], "nextCursor": "..."}`.
    pub fn list<T>(&self, request: RequestDescriptor) -> Paginator<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let client = self.clone();
        Paginator::new(move |cursor: Option<String>| {
            let client = client.clone();
            let request = apply_cursor(request.clone(), cursor);
            async move {
                let response = client.call::<Page<T>>(request?).await?;
                Ok(response.data)
            }
        })
    }

    /// The current bearer credential.
    pub fn bearer_token(&self) -> Option<String> {
        self.inner.auth.session().credential()
    }

    /// Replaces the bearer credential sent on same-origin requests.
    pub fn set_bearer_token(&self, token: impl Into<String>) {
        self.inner.auth.session().set_credential(Some(token.into()));
    }

    /// Stops sending a bearer credential.
    pub fn clear_bearer_token(&self) {
        self.inner.auth.session().set_credential(None);
    }

    /// Runs the re-authentication procedure now and stores the result.
    ///
    /// Joins a renewal already in flight. Without a configured
    /// [`Reauthenticator`] this returns the current credential.
    pub async fn authenticate(&self) -> Result<Option<String>> {
        self.inner.auth.authenticate().await
    }
}

/// Adds `cursor` to a list request in the place its method expects.
fn apply_cursor(request: RequestDescriptor, cursor: Option<String>) -> Result<RequestDescriptor> {
    let Some(cursor) = cursor else {
        return Ok(request);
    };

    if request.method == Method::GET {
        return Ok(request.with_query_param(CURSOR_PARAM, cursor));
    }

    let body = match request.body.clone() {
        None | Some(Value::Null) => {
            let mut fields = serde_json::Map::new();
            fields.insert(CURSOR_PARAM.to_string(), Value::String(cursor));
            Value::Object(fields)
        }
        Some(Value::Object(mut fields)) => {
            fields.insert(CURSOR_PARAM.to_string(), Value::String(cursor));
            Value::Object(fields)
        }
        Some(_) => {
            return Err(Error::ConfigurationError(
                "List request body must be a JSON object".to_string(),
            ))
        }
    };
    Ok(request.with_body(body))
}

/// Builder for configuring and creating a [`Client`].
///
/// # Examples
///
/// ```no_run
/// use bulkwire::{auth::reauthenticate_with, ClientBuilder, RetryPolicy, RetryStrategy};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), bulkwire::Error> {
/// let client = ClientBuilder::new()
///     .base_url("https://api.example.com")?
///     .timeout(Duration::from_secs(30))
///     .retry_policy(
///         RetryPolicy::new()
///             .strategy(RetryStrategy::ExponentialBackoff {
///                 initial_delay: Duration::from_millis(250),
///                 max_delay: Duration::from_secs(5),
///                 jitter: true,
///             })
///             .idempotent_post("/assets/byids"),
///     )
///     .reauthenticator(reauthenticate_with(|| async {
///         Ok(Some("renewed-token".to_string()))
///     }))
///     .default_header("User-Agent", "my-app/1.0")?
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    base_url: Option<Url>,
    default_headers: HeaderMap,
    retry_policy: RetryPolicy,
    retry_predicate: Option<Arc<dyn RetryPredicate>>,
    timeout: Option<Duration>,
    bearer_token: Option<String>,
    reauthenticator: Option<Arc<dyn Reauthenticator>>,
    auth_exempt_paths: Option<Vec<String>>,
    transport: Option<Arc<dyn Transport>>,
}

impl ClientBuilder {
    /// Creates a new `ClientBuilder` with default settings.
    pub fn new() -> Self {
        Self {
            base_url: None,
            default_headers: HeaderMap::new(),
            retry_policy: RetryPolicy::default(),
            retry_predicate: None,
            timeout: None,
            bearer_token: None,
            reauthenticator: None,
            auth_exempt_paths: None,
            transport: None,
        }
    }

    /// Sets the base URL for all requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.base_url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Adds a header sent on every same-origin request.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn default_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.default_headers.insert(name, value);
        Ok(self)
    }

    /// Sets the initial bearer credential.
    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Sets the procedure that renews an expired session.
    pub fn reauthenticator(mut self, reauthenticator: impl Reauthenticator + 'static) -> Self {
        self.reauthenticator = Some(Arc::new(reauthenticator));
        self
    }

    /// Replaces the paths whose 401 responses never trigger
    /// re-authentication (by default `/login/status` and `/logout/url`).
    pub fn auth_exempt_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.auth_exempt_paths = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets the backoff strategy, keeping the rest of the retry policy.
    pub fn retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_policy = self.retry_policy.strategy(strategy);
        self
    }

    /// Adds a predicate that can refuse retries the retry policy allows.
    ///
    /// The policy is always consulted first, so the predicate cannot make a
    /// non-allow-listed POST or a 4xx response retryable.
    pub fn retry_predicate(mut self, predicate: impl RetryPredicate + 'static) -> Self {
        self.retry_predicate = Some(Arc::new(predicate));
        self
    }

    /// Sets rate-limit header handling.
    ///
    /// Disabled by default. When enabled, a 429 that advertises when the
    /// limit resets waits until then (up to `max_wait`) before retrying.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use bulkwire::{Client, rate_limit::RateLimitConfig};
    /// use std::time::Duration;
    ///
    /// # async fn example() -> Result<(), bulkwire::Error> {
    /// let client = Client::builder()
    ///     .base_url("https://api.example.com")?
    ///     .rate_limit_config(RateLimitConfig::enabled().max_wait(Duration::from_secs(30)))
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn rate_limit_config(mut self, config: RateLimitConfig) -> Self {
        self.retry_policy = self.retry_policy.rate_limit(config);
        self
    }

    /// Sets the per-attempt timeout of the default transport.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replaces the default `reqwest` transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Builds the configured `Client`.
    ///
    /// # Errors
    ///
    /// Returns an error if no base URL was provided or if the HTTP client
    /// cannot be created.
    pub fn build(self) -> Result<Client> {
        let base_url = self
            .base_url
            .ok_or_else(|| Error::ConfigurationError("Base URL is required".to_string()))?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(base_url.clone(), self.timeout)?),
        };

        let mut retrying = RetryingClient::new(transport, self.retry_policy);
        if let Some(predicate) = self.retry_predicate {
            retrying = retrying.with_predicate(predicate);
        }

        let session = Arc::new(AuthSession::new(self.bearer_token));
        let mut auth = AuthenticatedClient::new(retrying, base_url, session)
            .with_default_headers(self.default_headers);
        if let Some(reauthenticator) = self.reauthenticator {
            auth = auth.with_reauthenticator(reauthenticator);
        }
        if let Some(paths) = self.auth_exempt_paths {
            auth = auth.with_exempt_paths(paths);
        }

        Ok(Client {
            inner: Arc::new(ClientInner { auth }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
