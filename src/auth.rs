//! Credential injection and single-flight re-authentication.
//!
//! The [`AuthenticatedClient`] adds the session's bearer credential to
//! same-origin requests and strips it from everything else. When a request
//! comes back 401 it renews the session through the configured
//! [`Reauthenticator`] and replays the request once.
//!
//! Concurrent requests that hit 401 while a renewal is in flight wait on the
//! same renewal instead of starting their own. The check for a pending
//! renewal and the registration of a new one happen under one lock with no
//! await in between.

use crate::error::{AuthFailure, HttpError};
use crate::request::{is_same_origin, RequestDescriptor};
use crate::response::RawResponse;
use crate::retrying::RetryingClient;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use http::header::AUTHORIZATION;
use http::{HeaderMap, HeaderValue, StatusCode};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use url::Url;

/// Paths whose 401 responses never trigger re-authentication.
pub const DEFAULT_AUTH_EXEMPT_PATHS: [&str; 2] = ["/login/status", "/logout/url"];

/// Obtains a fresh credential after the session expired.
///
/// Return `Ok(None)` to skip renewal; the waiting requests then fail with
/// [`Error::Authentication`].
#[async_trait]
pub trait Reauthenticator: Send + Sync {
    /// Produces a new bearer credential, or `None` to give up.
    async fn reauthenticate(&self) -> Result<Option<String>>;
}

/// Adapts an async closure into a [`Reauthenticator`].
pub struct FnReauthenticator<F>(F);

/// Wraps `f` so it can be used as a [`Reauthenticator`].
///
/// # Examples
///
/// ```
/// use bulkwire::auth::reauthenticate_with;
///
/// let reauth = reauthenticate_with(|| async { Ok(Some("fresh-token".to_string())) });
/// # let _ = reauth;
/// ```
pub fn reauthenticate_with<F, Fut>(f: F) -> FnReauthenticator<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<String>>> + Send,
{
    FnReauthenticator(f)
}

#[async_trait]
impl<F, Fut> Reauthenticator for FnReauthenticator<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<String>>> + Send,
{
    async fn reauthenticate(&self) -> Result<Option<String>> {
        (self.0)().await
    }
}

/// Result of one renewal, shared by every caller that waited on it.
#[derive(Debug, Clone)]
pub enum ReauthOutcome {
    /// A new credential was obtained and stored in the session.
    Renewed(String),
    /// The procedure declined to renew.
    Skipped,
    /// The procedure failed.
    Failed(Arc<Error>),
}

type PendingReauth = Shared<BoxFuture<'static, ReauthOutcome>>;

#[derive(Default)]
struct SessionState {
    credential: Option<String>,
    pending: Option<(u64, PendingReauth)>,
    generation: u64,
}

/// The current credential and the renewal in flight, if any.
#[derive(Default)]
pub struct AuthSession {
    state: Mutex<SessionState>,
}

impl AuthSession {
    /// Creates a session, optionally already logged in.
    pub fn new(credential: Option<String>) -> Self {
        Self {
            state: Mutex::new(SessionState {
                credential,
                ..SessionState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current bearer credential.
    pub fn credential(&self) -> Option<String> {
        self.lock().credential.clone()
    }

    /// Replaces the credential.
    pub fn set_credential(&self, credential: Option<String>) {
        self.lock().credential = credential;
    }

    /// Returns `true` while a renewal is running.
    pub fn is_reauthenticating(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Renews the session, joining a renewal already in flight.
    ///
    /// Only the first caller invokes `reauthenticator`; everyone else awaits
    /// the same future and receives the same outcome.
    pub async fn reauthenticate(&self, reauthenticator: Arc<dyn Reauthenticator>) -> ReauthOutcome {
        let (id, pending) = {
            let mut state = self.lock();
            match &state.pending {
                Some((id, pending)) => (*id, pending.clone()),
                None => {
                    state.generation += 1;
                    let id = state.generation;
                    let pending = async move {
                        tracing::info!("Session expired; re-authenticating");
                        match reauthenticator.reauthenticate().await {
                            Ok(Some(credential)) => ReauthOutcome::Renewed(credential),
                            Ok(None) => ReauthOutcome::Skipped,
                            Err(error) => ReauthOutcome::Failed(Arc::new(error)),
                        }
                    }
                    .boxed()
                    .shared();
                    state.pending = Some((id, pending.clone()));
                    (id, pending)
                }
            }
        };

        let outcome = pending.await;

        let mut state = self.lock();
        if matches!(&state.pending, Some((pending_id, _)) if *pending_id == id) {
            state.pending = None;
            match &outcome {
                ReauthOutcome::Renewed(credential) => {
                    tracing::info!("Re-authentication succeeded");
                    state.credential = Some(credential.clone());
                }
                ReauthOutcome::Skipped => tracing::warn!("Re-authentication skipped"),
                ReauthOutcome::Failed(error) => {
                    tracing::warn!(error = %error, "Re-authentication failed")
                }
            }
        }

        outcome
    }
}

/// How one exchange ended, from the point of view of the auth layer.
enum Exchange {
    Success(RawResponse),
    Failed(HttpError),
    AuthRequired(HttpError),
}

/// Wraps a [`RetryingClient`] with credential handling.
#[derive(Clone)]
pub struct AuthenticatedClient {
    inner: RetryingClient,
    base_url: Url,
    default_headers: HeaderMap,
    session: Arc<AuthSession>,
    reauthenticator: Option<Arc<dyn Reauthenticator>>,
    exempt_paths: Vec<String>,
}

impl AuthenticatedClient {
    /// Creates a client with the default exempt paths and no re-authenticator.
    pub fn new(inner: RetryingClient, base_url: Url, session: Arc<AuthSession>) -> Self {
        Self {
            inner,
            base_url,
            default_headers: HeaderMap::new(),
            session,
            reauthenticator: None,
            exempt_paths: DEFAULT_AUTH_EXEMPT_PATHS
                .iter()
                .map(|path| path.to_string())
                .collect(),
        }
    }

    /// Headers added to every same-origin request.
    pub fn with_default_headers(mut self, headers: HeaderMap) -> Self {
        self.default_headers = headers;
        self
    }

    /// Sets the procedure used to renew an expired session.
    pub fn with_reauthenticator(mut self, reauthenticator: Arc<dyn Reauthenticator>) -> Self {
        self.reauthenticator = Some(reauthenticator);
        self
    }

    /// Replaces the paths whose 401s are returned as-is.
    pub fn with_exempt_paths(mut self, paths: Vec<String>) -> Self {
        self.exempt_paths = paths
            .into_iter()
            .map(|path| path.to_ascii_lowercase())
            .collect();
        self
    }

    /// The session shared with the owning client.
    pub fn session(&self) -> &Arc<AuthSession> {
        &self.session
    }

    /// The base URL requests are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Renews the session now, joining any renewal in flight.
    pub async fn authenticate(&self) -> Result<Option<String>> {
        let Some(reauthenticator) = self.reauthenticator.clone() else {
            return Ok(self.session.credential());
        };
        match self.session.reauthenticate(reauthenticator).await {
            ReauthOutcome::Renewed(credential) => Ok(Some(credential)),
            ReauthOutcome::Skipped => Ok(None),
            ReauthOutcome::Failed(error) => Err(Error::Reauthentication(error)),
        }
    }

    /// Sends `request` with the current credential, renewing the session and
    /// replaying once if the server answers 401.
    ///
    /// # Errors
    ///
    /// Non-2xx responses become [`Error::Http`]; a 401 that cannot be
    /// recovered becomes [`Error::Authentication`]. Transport failures pass
    /// through unchanged.
    pub async fn execute(&self, request: &RequestDescriptor) -> Result<RawResponse> {
        let sent_with = self.session.credential();
        let response = self.send(request, sent_with.as_deref()).await?;

        match self.classify(request, response)? {
            Exchange::Success(response) => Ok(response),
            Exchange::Failed(error) => Err(Error::Http(error)),
            Exchange::AuthRequired(error) => self.recover(request, sent_with, error).await,
        }
    }

    async fn recover(
        &self,
        request: &RequestDescriptor,
        sent_with: Option<String>,
        unauthorized: HttpError,
    ) -> Result<RawResponse> {
        let credential = match self.session.credential() {
            // Someone else already renewed the session after we sent.
            Some(current) if Some(&current) != sent_with.as_ref() => {
                tracing::debug!(path = %request.path, "Replaying with credential renewed elsewhere");
                current
            }
            _ => self.renew(sent_with.as_deref(), unauthorized.clone()).await?,
        };

        tracing::debug!(method = %request.method, path = %request.path, "Replaying request after re-authentication");
        let response = self.send(request, Some(&credential)).await?;

        match self.classify(request, response)? {
            Exchange::Success(response) => Ok(response),
            Exchange::Failed(error) | Exchange::AuthRequired(error) => Err(Error::Http(error)),
        }
    }

    async fn renew(&self, sent_with: Option<&str>, unauthorized: HttpError) -> Result<String> {
        let Some(reauthenticator) = self.reauthenticator.clone() else {
            return Err(Error::Authentication {
                reason: AuthFailure::NotConfigured,
                response: unauthorized,
            });
        };

        match self.session.reauthenticate(reauthenticator).await {
            ReauthOutcome::Renewed(credential) if Some(credential.as_str()) == sent_with => {
                Err(Error::Authentication {
                    reason: AuthFailure::CredentialUnchanged,
                    response: unauthorized,
                })
            }
            ReauthOutcome::Renewed(credential) => Ok(credential),
            ReauthOutcome::Skipped => Err(Error::Authentication {
                reason: AuthFailure::Skipped,
                response: unauthorized,
            }),
            ReauthOutcome::Failed(error) => Err(Error::Authentication {
                reason: AuthFailure::Failed(error),
                response: unauthorized,
            }),
        }
    }

    fn classify(&self, request: &RequestDescriptor, response: RawResponse) -> Result<Exchange> {
        if response.is_success() {
            tracing::info!(
                method = %request.method,
                path = %request.path,
                status = response.status.as_u16(),
                attempts = response.attempts,
                "Received HTTP response"
            );
            return Ok(Exchange::Success(response));
        }

        let status = response.status;
        let error = HttpError::from_response(response);

        if status == StatusCode::UNAUTHORIZED
            && !self.is_exempt(&request.path)
            && self.is_same_origin(request)?
        {
            tracing::info!(path = %request.path, "Received 401 Unauthorized");
            return Ok(Exchange::AuthRequired(error));
        }

        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), path = %request.path, response = %error.raw_response, "Server error (5xx)");
        } else {
            tracing::error!(status = status.as_u16(), path = %request.path, response = %error.raw_response, "Client error (4xx)");
        }
        Ok(Exchange::Failed(error))
    }

    fn is_exempt(&self, path: &str) -> bool {
        let path = path.to_ascii_lowercase();
        self.exempt_paths
            .iter()
            .any(|exempt| path.contains(exempt.as_str()))
    }

    fn is_same_origin(&self, request: &RequestDescriptor) -> Result<bool> {
        if !request.is_absolute() {
            return Ok(true);
        }
        let target = request.resolve_url(&self.base_url)?;
        Ok(is_same_origin(&self.base_url, &target))
    }

    /// Builds the attempt actually sent: default headers and credential for
    /// same-origin targets, no credential of any kind otherwise.
    fn prepare(&self, request: &RequestDescriptor, credential: Option<&str>) -> Result<RequestDescriptor> {
        let mut prepared = request.clone();

        if !self.is_same_origin(request)? {
            prepared.headers.remove(AUTHORIZATION);
            return Ok(prepared);
        }

        for (name, value) in &self.default_headers {
            if !prepared.headers.contains_key(name) {
                prepared.headers.insert(name.clone(), value.clone());
            }
        }

        if let Some(credential) = credential {
            let value = HeaderValue::try_from(format!("Bearer {}", credential)).map_err(|e| {
                Error::ConfigurationError(format!("Invalid bearer credential: {}", e))
            })?;
            prepared.headers.insert(AUTHORIZATION, value);
        }

        Ok(prepared)
    }

    async fn send(&self, request: &RequestDescriptor, credential: Option<&str>) -> Result<RawResponse> {
        let prepared = self.prepare(request, credential)?;
        self.inner.execute(&prepared).await
    }
}
