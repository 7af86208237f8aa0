//! Integration tests using wiremock to simulate the API.

use bulkwire::auth::reauthenticate_with;
use bulkwire::rate_limit::RateLimitConfig;
use bulkwire::{
    AuthFailure, BatchOptions, Client, EndpointList, Error, RequestDescriptor, RetryPolicy,
    RetryStrategy,
};
use http::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct Asset {
    id: u32,
    external_id: String,
}

fn asset(id: u32) -> Asset {
    Asset {
        id,
        external_id: format!("asset-{}", id),
    }
}

fn fast_retries() -> RetryPolicy {
    RetryPolicy::new().strategy(RetryStrategy::Fixed {
        delay: Duration::from_millis(10),
    })
}

/// Honours `RUST_LOG` so failing runs can be replayed with request logs.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn client_for(server: &MockServer) -> Client {
    init_tracing();
    Client::builder()
        .base_url(server.uri())
        .unwrap()
        .retry_policy(fast_retries())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_successful_get_request() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/assets/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(asset(1)))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);

    let response = client.get::<Asset>("/assets/1").await.unwrap();

    assert_eq!(response.data, asset(1));
    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(response.attempts, 1);
    assert!(!response.was_retried());
}

#[tokio::test]
async fn test_successful_post_request() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/assets"))
        .and(body_partial_json(json!({"externalId": "asset-7"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(asset(7)))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);

    let response = client
        .post::<_, Asset>("/assets", &json!({"externalId": "asset-7"}))
        .await
        .unwrap();

    assert_eq!(response.data.id, 7);
    assert_eq!(response.status.as_u16(), 201);
}

#[tokio::test]
async fn test_http_error_4xx_carries_api_detail() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/assets/404"))
        .respond_with(
            ResponseTemplate::new(400)
                .insert_header("x-request-id", "req-123")
                .set_body_json(json!({
                    "error": {"code": 400, "message": "Ids not found", "missing": [{"id": 404}]}
                })),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);

    let result = client.get::<Asset>("/assets/404").await;

    match result {
        Err(Error::Http(err)) => {
            assert_eq!(err.status.as_u16(), 400);
            assert_eq!(err.message(), "Ids not found");
            assert_eq!(err.missing(), &[json!({"id": 404})]);
            assert_eq!(err.request_id.as_deref(), Some("req-123"));
            assert_eq!(err.to_string(), "Ids not found | code: 400 | X-Request-ID: req-123");
        }
        other => panic!("Expected Http error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_deserialization_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/assets/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"unexpected": true})))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);

    let result = client.get::<Asset>("/assets/1").await;

    match result {
        Err(Error::DeserializationFailed {
            raw_response,
            status,
            ..
        }) => {
            assert_eq!(status.as_u16(), 200);
            assert!(raw_response.contains("unexpected"));
        }
        other => panic!("Expected DeserializationFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_get_is_retried_until_success() {
    let mock_server = MockServer::start().await;
    let attempt_count = Arc::new(AtomicUsize::new(0));
    let attempt_count_clone = attempt_count.clone();

    // First two requests fail, third succeeds
    Mock::given(method("GET"))
        .and(path("/assets/1"))
        .respond_with(move |_req: &wiremock::Request| {
            match attempt_count_clone.fetch_add(1, Ordering::SeqCst) {
                0 => ResponseTemplate::new(503).set_body_string("Unavailable"),
                1 => ResponseTemplate::new(429).set_body_string("Slow down"),
                _ => ResponseTemplate::new(200).set_body_json(asset(1)),
            }
        })
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);

    let response = client.get::<Asset>("/assets/1").await.unwrap();

    assert_eq!(response.data.id, 1);
    assert_eq!(response.attempts, 3);
    assert!(response.was_retried());
    assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_always_failing_get_is_sent_four_times() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/assets/1"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Server error"))
        .expect(4)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);

    let result = client.get::<Asset>("/assets/1").await;

    match result {
        Err(Error::Http(err)) => assert_eq!(err.status.as_u16(), 500),
        other => panic!("Expected Http error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_post_outside_allow_list_is_not_retried() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/assets"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Server error"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);

    let result = client.post::<_, Value>("/assets", &json!({"items": []})).await;

    assert_eq!(result.unwrap_err().status().map(|s| s.as_u16()), Some(500));
}

#[tokio::test]
async fn test_allow_listed_post_is_retried() {
    let mock_server = MockServer::start().await;
    let attempt_count = Arc::new(AtomicUsize::new(0));
    let attempt_count_clone = attempt_count.clone();

    Mock::given(method("POST"))
        .and(path("/assets/byids"))
        .respond_with(move |_req: &wiremock::Request| {
            if attempt_count_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(502)
            } else {
                ResponseTemplate::new(200).set_body_json(json!({"items": [asset(1)]}))
            }
        })
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .retry_policy(fast_retries().idempotent_endpoints(EndpointList::bulk_reads()))
        .build()
        .unwrap();

    let response = client
        .post::<_, Value>("/assets/byids", &json!({"items": [{"id": 1}]}))
        .await
        .unwrap();

    assert_eq!(response.attempts, 2);
    assert_eq!(attempt_count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retry_after_header_is_honored() {
    let mock_server = MockServer::start().await;
    let attempt_count = Arc::new(AtomicUsize::new(0));
    let attempt_count_clone = attempt_count.clone();

    Mock::given(method("GET"))
        .and(path("/assets/1"))
        .respond_with(move |_req: &wiremock::Request| {
            if attempt_count_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(429).insert_header("retry-after", "1")
            } else {
                ResponseTemplate::new(200).set_body_json(asset(1))
            }
        })
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .retry_policy(fast_retries())
        .rate_limit_config(RateLimitConfig::enabled().max_wait(Duration::from_secs(5)))
        .build()
        .unwrap();

    let start = Instant::now();
    let response = client.get::<Asset>("/assets/1").await.unwrap();

    assert_eq!(response.attempts, 2);
    assert!(start.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
async fn test_default_headers_and_bearer_token() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/assets/1"))
        .and(header("x-app", "inventory"))
        .and(header("authorization", "Bearer token-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(asset(1)))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .default_header("X-App", "inventory")
        .unwrap()
        .bearer_token("token-1")
        .build()
        .unwrap();

    client.get::<Asset>("/assets/1").await.unwrap();
}

#[tokio::test]
async fn test_query_parameters() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/events"))
        .and(query_param("limit", "10"))
        .and(query_param("filter", r#"{"type":"alarm"}"#))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);

    let request = RequestDescriptor::new(Method::GET, "/events")
        .with_query_param("limit", "10")
        .with_query_json("filter", &json!({"type": "alarm"}))
        .unwrap();
    let response = client.call::<Value>(request).await.unwrap();

    assert_eq!(response.data, json!({"items": []}));
}

#[tokio::test]
async fn test_concurrent_401s_share_one_reauthentication() {
    let mock_server = MockServer::start().await;
    let reauth_count = Arc::new(AtomicUsize::new(0));

    // Mounted first, so it wins whenever the renewed token is presented.
    Mock::given(method("GET"))
        .and(path("/assets/1"))
        .and(header("authorization", "Bearer renewed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(asset(1)))
        .expect(5)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/assets/1"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({"error": {"message": "Unauthorized"}})),
        )
        .mount(&mock_server)
        .await;

    let counter = reauth_count.clone();
    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .bearer_token("expired")
        .reauthenticator(reauthenticate_with(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, Error>(Some("renewed".to_string()))
            }
        }))
        .build()
        .unwrap();

    let results =
        futures::future::join_all((0..5).map(|_| client.get::<Asset>("/assets/1"))).await;

    for result in results {
        assert_eq!(result.unwrap().data.id, 1);
    }
    assert_eq!(reauth_count.load(Ordering::SeqCst), 1);
    assert_eq!(client.bearer_token().as_deref(), Some("renewed"));
}

#[tokio::test]
async fn test_skipped_reauthentication_rejects_without_replay() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/assets/1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .bearer_token("expired")
        .reauthenticator(reauthenticate_with(|| async { Ok::<_, Error>(None) }))
        .build()
        .unwrap();

    let result = client.get::<Asset>("/assets/1").await;

    match result {
        Err(Error::Authentication { reason, response }) => {
            assert!(matches!(reason, AuthFailure::Skipped));
            assert_eq!(response.status.as_u16(), 401);
        }
        other => panic!("Expected Authentication error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_failing_reauthentication_rejects_every_waiter() {
    let mock_server = MockServer::start().await;
    let reauth_count = Arc::new(AtomicUsize::new(0));

    Mock::given(method("GET"))
        .and(path("/assets/1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(3)
        .mount(&mock_server)
        .await;

    let counter = reauth_count.clone();
    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .bearer_token("expired")
        .reauthenticator(reauthenticate_with(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err::<Option<String>, _>(Error::ConfigurationError("idp down".to_string()))
            }
        }))
        .build()
        .unwrap();

    let results =
        futures::future::join_all((0..3).map(|_| client.get::<Asset>("/assets/1"))).await;

    for result in results {
        match result {
            Err(Error::Authentication { reason: AuthFailure::Failed(cause), response }) => {
                assert!(matches!(*cause, Error::ConfigurationError(ref m) if m == "idp down"));
                assert_eq!(response.status.as_u16(), 401);
            }
            other => panic!("Expected failed re-authentication, got {:?}", other),
        }
    }
    assert_eq!(reauth_count.load(Ordering::SeqCst), 1);
    assert_eq!(client.bearer_token().as_deref(), Some("expired"));
}

#[tokio::test]
async fn test_explicit_authenticate_stores_renewed_token() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/assets/1"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(asset(1)))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .reauthenticator(reauthenticate_with(|| async {
            Ok::<_, Error>(Some("fresh".to_string()))
        }))
        .build()
        .unwrap();

    assert_eq!(client.authenticate().await.unwrap().as_deref(), Some("fresh"));
    assert_eq!(client.bearer_token().as_deref(), Some("fresh"));

    let response = client.get::<Asset>("/assets/1").await.unwrap();
    assert_eq!(response.attempts, 1);
}

#[tokio::test]
async fn test_explicit_authenticate_surfaces_failure() {
    let mock_server = MockServer::start().await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .bearer_token("current")
        .reauthenticator(reauthenticate_with(|| async {
            Err::<Option<String>, _>(Error::ConfigurationError("idp down".to_string()))
        }))
        .build()
        .unwrap();

    let err = client.authenticate().await.unwrap_err();

    assert!(matches!(err, Error::Reauthentication(ref cause) if matches!(**cause, Error::ConfigurationError(_))));
    assert!(err.is_auth_required());
    assert_eq!(client.bearer_token().as_deref(), Some("current"));
}

#[tokio::test]
async fn test_download_returns_raw_bytes() {
    let mock_server = MockServer::start().await;
    let payload: Vec<u8> = (0..=255).collect();

    Mock::given(method("GET"))
        .and(path("/files/1/content"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);

    let response = client
        .download(RequestDescriptor::new(Method::GET, "/files/1/content"))
        .await
        .unwrap();

    assert_eq!(response.data, payload);
}

#[tokio::test]
async fn test_login_status_401_does_not_reauthenticate() {
    let mock_server = MockServer::start().await;
    let reauth_count = Arc::new(AtomicUsize::new(0));

    Mock::given(method("GET"))
        .and(path("/login/status"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;

    let counter = reauth_count.clone();
    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .reauthenticator(reauthenticate_with(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(Some("renewed".to_string()))
            }
        }))
        .build()
        .unwrap();

    let result = client.get::<Value>("/login/status").await;

    assert!(matches!(result, Err(Error::Http(ref err)) if err.status.as_u16() == 401));
    assert_eq!(reauth_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cross_origin_request_never_carries_credential() {
    let api = MockServer::start().await;
    let other = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/files/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&other)
        .await;

    let client = Client::builder()
        .base_url(api.uri())
        .unwrap()
        .default_header("X-App", "inventory")
        .unwrap()
        .bearer_token("secret")
        .build()
        .unwrap();

    client
        .get::<Value>(format!("{}/files/1", other.uri()))
        .await
        .unwrap();

    let received = other.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert!(received[0].headers.get("authorization").is_none());
    assert!(received[0].headers.get("x-app").is_none());
}

#[tokio::test]
async fn test_get_list_follows_cursor_in_query() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/assets"))
        .and(query_param("cursor", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [asset(3)]
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/assets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [asset(1), asset(2)],
            "nextCursor": "page-2"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);

    let mut assets = client.list::<Asset>(RequestDescriptor::new(Method::GET, "/assets"));
    let all = assets.collect_all().await.unwrap();

    assert_eq!(all, vec![asset(1), asset(2), asset(3)]);
    assert!(assets.is_exhausted());
    assert_eq!(assets.next().await.unwrap(), None);
}

#[tokio::test]
async fn test_post_list_carries_cursor_in_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/assets/list"))
        .and(body_partial_json(json!({"cursor": "page-2", "limit": 2})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [asset(3), asset(4)]
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/assets/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [asset(1), asset(2)],
            "nextCursor": "page-2"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    let request = RequestDescriptor::new(Method::POST, "/assets/list")
        .with_json_body(&json!({"limit": 2}))
        .unwrap();

    let first_three = client.list::<Asset>(request).collect_up_to(3).await.unwrap();

    assert_eq!(first_three, vec![asset(1), asset(2), asset(3)]);
}

#[tokio::test]
async fn test_post_items_reports_partial_failure() {
    let mock_server = MockServer::start().await;

    // Echoes the chunk with ids, except chunks containing "dup".
    Mock::given(method("POST"))
        .and(path("/assets"))
        .respond_with(|req: &wiremock::Request| {
            let body: Value = serde_json::from_slice(&req.body).unwrap();
            let items = body["items"].as_array().unwrap();
            if items.iter().any(|item| item["externalId"] == "dup") {
                return ResponseTemplate::new(409)
                    .insert_header("x-request-id", "req-dup")
                    .set_body_json(json!({
                        "error": {"code": 409, "message": "Duplicate", "duplicated": [{"externalId": "dup"}]}
                    }));
            }
            let created: Vec<Value> = items
                .iter()
                .map(|item| json!({"id": 1, "externalId": item["externalId"]}))
                .collect();
            ResponseTemplate::new(200).set_body_json(json!({ "items": created }))
        })
        .expect(3)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    let items: Vec<Value> = ["a", "b", "dup", "c", "d", "e"]
        .iter()
        .map(|id| json!({"externalId": id}))
        .collect();

    let err = client
        .post_items::<Value, Asset>("/assets", &items, BatchOptions::new(2).unwrap())
        .await
        .unwrap_err();

    assert_eq!(err.succeeded(), &[items[0].clone(), items[1].clone(), items[4].clone(), items[5].clone()]);
    assert_eq!(err.failed(), &[items[2].clone(), items[3].clone()]);
    let created: Vec<&str> = err.responses().iter().map(|a| a.external_id.as_str()).collect();
    assert_eq!(created, vec!["a", "b", "d", "e"]);
    assert_eq!(err.duplicated, vec![json!({"externalId": "dup"})]);
    assert_eq!(err.status.map(|s| s.as_u16()), Some(409));
    assert_eq!(err.request_ids, vec!["req-dup".to_string()]);

    let err: Error = err.into();
    assert_eq!(err.request_id(), Some("req-dup"));
}

#[tokio::test]
async fn test_post_items_returns_results_in_input_order() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/assets"))
        .respond_with(|req: &wiremock::Request| {
            let body: Value = serde_json::from_slice(&req.body).unwrap();
            let created: Vec<Value> = body["items"]
                .as_array()
                .unwrap()
                .iter()
                .map(|item| json!({"id": item["n"], "externalId": format!("asset-{}", item["n"])}))
                .collect();
            ResponseTemplate::new(200).set_body_json(json!({ "items": created }))
        })
        .expect(4)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    let items: Vec<Value> = (0..10).map(|n| json!({ "n": n })).collect();

    let created: Vec<Asset> = client
        .post_items("/assets", &items, BatchOptions::new(3).unwrap())
        .await
        .unwrap();

    assert_eq!(created, (0..10).map(asset).collect::<Vec<_>>());
}
