//! # Bulkwire - resilient execution for resource-oriented HTTP APIs
//!
//! Bulkwire sits between typed resource code and the network. It splits bulk
//! writes into API-sized chunks and runs them concurrently, reports exactly
//! which items a partially failed bulk call wrote, retries the requests that
//! are safe to repeat, renews an expired session once no matter how many
//! requests noticed, and walks cursor-paginated lists lazily.
//!
//! ## Quick Start
//!
//! ```no_run
//! use bulkwire::{auth::reauthenticate_with, BatchOptions, Client, RequestDescriptor};
//! use http::Method;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Clone)]
//! struct NewEvent {
//!     external_id: String,
//! }
//!
//! #[derive(Serialize, Deserialize)]
//! struct Event {
//!     id: u64,
//!     external_id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), bulkwire::Error> {
//!     let client = Client::builder()
//!         .base_url("https://api.example.com/api/v1/projects/demo")?
//!         .bearer_token("initial-token")
//!         .reauthenticator(reauthenticate_with(|| async {
//!             // Log in again and return the new token.
//!             Ok(Some("renewed-token".to_string()))
//!         }))
//!         .build()?;
//!
//!     // Bulk create, 1000 items per request, chunks in parallel
//!     let events: Vec<NewEvent> = (0..5000)
//!         .map(|i| NewEvent { external_id: format!("event-{}", i) })
//!         .collect();
//!     let created: Vec<Event> = client
//!         .post_items("/events", &events, BatchOptions::new(1000)?)
//!         .await?;
//!     println!("Created {} events", created.len());
//!
//!     // Lazy listing
//!     let mut listed = client.list::<Event>(
//!         RequestDescriptor::new(Method::GET, "/events").with_query_param("limit", "1000"),
//!     );
//!     let first_hundred = listed.collect_up_to(100).await?;
//!     println!("First page starts at {:?}", first_hundred.first().map(|e| e.id));
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Layers
//!
//! Every request goes through the same chain:
//!
//! - [`Transport`] performs one HTTP exchange ([`ReqwestTransport`] by default)
//! - [`RetryingClient`] repeats retryable exchanges per the [`RetryPolicy`]
//! - [`AuthenticatedClient`] injects the credential, renews the session on 401
//!   and replays once
//! - [`Client`] decodes typed responses and drives [`batch`] and
//!   [`pagination`]
//!
//! ## Partial failures
//!
//! A bulk call never hides the chunks that succeeded:
//!
//! ```no_run
//! use bulkwire::Client;
//! use serde_json::{json, Value};
//!
//! # async fn example(client: Client) {
//! let items = vec![json!({"externalId": "a"}), json!({"externalId": "b"})];
//! match client.post_items::<Value, Value>("/assets", &items, bulkwire::BatchOptions::new(1).unwrap()).await {
//!     Ok(created) => println!("Created {}", created.len()),
//!     Err(err) => {
//!         println!("Written: {:?}", err.succeeded());
//!         println!("Not written: {:?}", err.failed());
//!         println!("Duplicated: {:?}", err.duplicated);
//!     }
//! }
//! # }
//! ```
//!
//! ## Retries
//!
//! GET, HEAD, OPTIONS, DELETE and PUT are retried on 1xx, 429 and 5xx
//! responses and on transport failures, at most 3 times with a fixed 250 ms
//! delay. POST is only retried for allow-listed endpoints:
//!
//! ```no_run
//! use bulkwire::{Client, EndpointList, RetryPolicy, RetryStrategy};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), bulkwire::Error> {
//! let client = Client::builder()
//!     .base_url("https://api.example.com")?
//!     .retry_policy(
//!         RetryPolicy::new()
//!             .idempotent_endpoints(EndpointList::bulk_reads())
//!             .strategy(RetryStrategy::ExponentialBackoff {
//!                 initial_delay: Duration::from_millis(250),
//!                 max_delay: Duration::from_secs(5),
//!                 jitter: true,
//!             }),
//!     )
//!     .build()?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod batch;
mod client;
mod error;
pub mod pagination;
pub mod rate_limit;
pub mod request;
mod response;
pub mod retry;
pub mod retrying;
pub mod timestamp;
pub mod transport;

pub use auth::{AuthSession, AuthenticatedClient, Reauthenticator};
pub use batch::{BatchError, BatchMode, BatchOptions, BatchResult};
pub use client::{Client, ClientBuilder};
pub use error::{ApiErrorDetail, AuthFailure, Error, HttpError, Result};
pub use pagination::{Page, Paginator};
pub use request::{RequestDescriptor, ResponseKind};
pub use response::{RawResponse, Response, ResponseBody};
pub use retry::{EndpointList, RetryPolicy, RetryPredicate, RetryStrategy};
pub use retrying::RetryingClient;
pub use transport::{ReqwestTransport, Transport};
