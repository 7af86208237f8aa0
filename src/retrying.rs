//! The retry loop around a [`Transport`].

use crate::request::RequestDescriptor;
use crate::response::RawResponse;
use crate::retry::{RetryPolicy, RetryPredicate};
use crate::transport::Transport;
use crate::Result;
use std::sync::Arc;

/// Wraps a transport and repeats retryable exchanges.
///
/// Each call to [`execute`](Self::execute) starts its own retry count at
/// zero, so no state leaks between requests. A request is sent at most
/// `max_retries + 1` times.
#[derive(Clone)]
pub struct RetryingClient {
    transport: Arc<dyn Transport>,
    policy: Arc<RetryPolicy>,
    predicate: Option<Arc<dyn RetryPredicate>>,
}

impl RetryingClient {
    /// Creates a client retrying according to `policy`.
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy: Arc::new(policy),
            predicate: None,
        }
    }

    /// Adds a predicate that can veto retries the policy allows. It never
    /// makes a request eligible that the policy refuses.
    pub fn with_predicate(mut self, predicate: Arc<dyn RetryPredicate>) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// The policy governing cap and backoff.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn should_retry(
        &self,
        request: &RequestDescriptor,
        outcome: &Result<RawResponse>,
        retry_count: usize,
    ) -> bool {
        request.is_retry_enabled()
            && self.policy.should_retry(request, outcome, retry_count)
            && self
                .predicate
                .as_ref()
                .map_or(true, |predicate| predicate.should_retry(request, outcome, retry_count))
    }

    /// Sends `request`, retrying while the policy allows it.
    ///
    /// Returns the last outcome: a 2xx response, a response the policy
    /// refused to retry, or the final transport failure.
    pub async fn execute(&self, request: &RequestDescriptor) -> Result<RawResponse> {
        let mut retry_count = 0;

        loop {
            let outcome = self.transport.execute(request).await;
            let succeeded = matches!(&outcome, Ok(response) if response.is_success());

            if succeeded || !self.should_retry(request, &outcome, retry_count) {
                return outcome.map(|mut response| {
                    response.attempts = retry_count + 1;
                    response
                });
            }

            let delay = self.policy.backoff_delay(retry_count, &outcome);
            match &outcome {
                Ok(response) => tracing::warn!(
                    method = %request.method,
                    path = %request.path,
                    status = response.status.as_u16(),
                    attempt = retry_count + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying request after retryable status"
                ),
                Err(error) => tracing::warn!(
                    method = %request.method,
                    path = %request.path,
                    error = %error,
                    attempt = retry_count + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying request after transport failure"
                ),
            }

            tokio::time::sleep(delay).await;
            retry_count += 1;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::response::ResponseBody;
    use crate::retry::RetryStrategy;
    use crate::Error;
    use async_trait::async_trait;
    use http::{HeaderMap, Method, StatusCode};
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays a fixed script of statuses; repeats the last one when exhausted.
    pub(crate) struct ScriptedTransport {
        script: Mutex<VecDeque<u16>>,
        last: u16,
        pub(crate) calls: AtomicUsize,
    }

    impl ScriptedTransport {
        pub(crate) fn new(script: &[u16]) -> Self {
            Self {
                script: Mutex::new(script.iter().copied().collect()),
                last: *script.last().unwrap_or(&200),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn execute(&self, _request: &RequestDescriptor) -> Result<RawResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let status = self.script.lock().unwrap().pop_front().unwrap_or(self.last);
            Ok(RawResponse::new(
                StatusCode::from_u16(status).unwrap(),
                HeaderMap::new(),
                ResponseBody::Json(Value::Null),
            ))
        }
    }

    struct FailingTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for FailingTransport {
        async fn execute(&self, _request: &RequestDescriptor) -> Result<RawResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Timeout)
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new().strategy(RetryStrategy::Fixed {
            delay: Duration::from_millis(1),
        })
    }

    #[tokio::test]
    async fn always_failing_get_is_sent_cap_plus_one_times() {
        let transport = Arc::new(ScriptedTransport::new(&[500]));
        let client = RetryingClient::new(transport.clone(), fast_policy());

        let response = client
            .execute(&RequestDescriptor::new(Method::GET, "/assets"))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.attempts, 4);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn recovers_after_transient_errors() {
        let transport = Arc::new(ScriptedTransport::new(&[503, 429, 200]));
        let client = RetryingClient::new(transport.clone(), fast_policy());

        let response = client
            .execute(&RequestDescriptor::new(Method::GET, "/assets"))
            .await
            .unwrap();

        assert!(response.is_success());
        assert_eq!(response.attempts, 3);
    }

    #[tokio::test]
    async fn non_allow_listed_post_is_sent_once() {
        let transport = Arc::new(ScriptedTransport::new(&[500]));
        let client = RetryingClient::new(transport.clone(), fast_policy());

        client
            .execute(&RequestDescriptor::new(Method::POST, "/assets"))
            .await
            .unwrap();

        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn opted_out_request_is_sent_once() {
        let transport = Arc::new(ScriptedTransport::new(&[500]));
        let client = RetryingClient::new(transport.clone(), fast_policy());

        client
            .execute(&RequestDescriptor::new(Method::GET, "/assets").without_retry())
            .await
            .unwrap();

        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_failure_surfaces_after_retries() {
        let transport = Arc::new(FailingTransport {
            calls: AtomicUsize::new(0),
        });
        let client = RetryingClient::new(transport.clone(), fast_policy().max_retries(2));

        let err = client
            .execute(&RequestDescriptor::new(Method::DELETE, "/assets/1"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    struct RetryEverything;

    impl RetryPredicate for RetryEverything {
        fn should_retry(&self, _: &RequestDescriptor, _: &Result<RawResponse>, _: usize) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn custom_predicate_cannot_widen_eligibility() {
        let transport = Arc::new(ScriptedTransport::new(&[500]));
        let client = RetryingClient::new(transport.clone(), fast_policy())
            .with_predicate(Arc::new(RetryEverything));

        client
            .execute(&RequestDescriptor::new(Method::POST, "/assets"))
            .await
            .unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        let transport = Arc::new(ScriptedTransport::new(&[400]));
        let client = RetryingClient::new(transport.clone(), fast_policy())
            .with_predicate(Arc::new(RetryEverything));

        client
            .execute(&RequestDescriptor::new(Method::GET, "/assets"))
            .await
            .unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn custom_predicate_can_veto_retries() {
        struct OnlyServiceUnavailable;
        impl RetryPredicate for OnlyServiceUnavailable {
            fn should_retry(&self, _: &RequestDescriptor, outcome: &Result<RawResponse>, _: usize) -> bool {
                matches!(outcome, Ok(response) if response.status == StatusCode::SERVICE_UNAVAILABLE)
            }
        }

        let transport = Arc::new(ScriptedTransport::new(&[502]));
        let client = RetryingClient::new(transport.clone(), fast_policy())
            .with_predicate(Arc::new(OnlyServiceUnavailable));

        client
            .execute(&RequestDescriptor::new(Method::GET, "/assets"))
            .await
            .unwrap();

        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }
}
