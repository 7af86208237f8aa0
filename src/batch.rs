//! Chunked bulk operations with partial-failure reporting.
//!
//! The API caps how many items one request may carry, so bulk writes and
//! deletes are split into contiguous chunks and dispatched together.
//! Results come back in input order no matter which chunk finishes first,
//! and a failing chunk never hides the chunks that succeeded.

use crate::{Error, Result};
use futures::stream::{self, StreamExt};
use http::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;

/// A contiguous slice of a batch's input.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk<T> {
    /// Index of the chunk's first item in the original input.
    pub offset: usize,
    /// The items, in input order.
    pub items: Vec<T>,
}

/// Splits `items` into contiguous chunks of at most `chunk_size` items.
///
/// # Examples
///
/// ```
/// use bulkwire::batch::partition;
/// use std::num::NonZeroUsize;
///
/// let chunks = partition(&[1, 2, 3, 4, 5], NonZeroUsize::new(2).unwrap());
/// assert_eq!(chunks.len(), 3);
/// assert_eq!(chunks[2].offset, 4);
/// assert_eq!(chunks[2].items, vec![5]);
/// ```
pub fn partition<T: Clone>(items: &[T], chunk_size: NonZeroUsize) -> Vec<Chunk<T>> {
    items
        .chunks(chunk_size.get())
        .enumerate()
        .map(|(index, items)| Chunk {
            offset: index * chunk_size.get(),
            items: items.to_vec(),
        })
        .collect()
}

/// How chunks are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// All chunks in flight at once, or at most `limit` at a time.
    Concurrent {
        /// Upper bound on chunks in flight; `None` dispatches everything.
        limit: Option<NonZeroUsize>,
    },
    /// One chunk at a time. The first failure stops the batch and the
    /// remaining chunks are reported as failed without being sent.
    Sequential,
}

impl Default for BatchMode {
    fn default() -> Self {
        BatchMode::Concurrent { limit: None }
    }
}

/// Chunk size and dispatch mode for one bulk call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    /// Maximum items per request.
    pub chunk_size: NonZeroUsize,
    /// How chunks are dispatched.
    pub mode: BatchMode,
}

impl BatchOptions {
    /// Concurrent dispatch with the given chunk size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationError`] if `chunk_size` is zero.
    pub fn new(chunk_size: usize) -> Result<Self> {
        let chunk_size = NonZeroUsize::new(chunk_size)
            .ok_or_else(|| Error::ConfigurationError("Chunk size must be positive".to_string()))?;
        Ok(Self::from(chunk_size))
    }

    /// Sets the dispatch mode.
    pub fn mode(mut self, mode: BatchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Bounds the number of chunks in flight.
    pub fn max_in_flight(self, limit: NonZeroUsize) -> Self {
        self.mode(BatchMode::Concurrent { limit: Some(limit) })
    }

    /// Dispatches chunks one after another.
    pub fn sequential(self) -> Self {
        self.mode(BatchMode::Sequential)
    }
}

impl From<NonZeroUsize> for BatchOptions {
    fn from(chunk_size: NonZeroUsize) -> Self {
        Self {
            chunk_size,
            mode: BatchMode::default(),
        }
    }
}

/// The error of one failed chunk.
#[derive(Debug)]
pub struct ChunkError {
    /// Index of the chunk's first item in the original input.
    pub offset: usize,
    /// Number of items in the chunk.
    pub len: usize,
    /// Why the chunk failed.
    pub error: Error,
}

/// Everything a partially failed batch produced.
#[derive(Debug)]
pub struct BatchResult<T, R> {
    /// Input items of succeeded chunks, in input order.
    pub succeeded: Vec<T>,
    /// Input items of failed or never-sent chunks, in input order.
    pub failed: Vec<T>,
    /// Results of succeeded chunks, in input order.
    pub responses: Vec<R>,
    /// One entry per failed chunk, in chunk order.
    pub errors: Vec<ChunkError>,
}

impl<T, R> Default for BatchResult<T, R> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
            responses: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// A bulk operation in which at least one chunk failed.
///
/// The derived fields summarize the per-chunk errors the way a single
/// request's error would: `status` and `request_id` come from the first
/// failing chunk; `missing` and `duplicated` are concatenated across all of
/// them.
#[derive(Debug)]
pub struct BatchError<T, R> {
    /// The partitioned outcome.
    pub result: BatchResult<T, R>,
    /// Status of the first failing chunk.
    pub status: Option<StatusCode>,
    /// Request id of the first failing chunk.
    pub request_id: Option<String>,
    /// Status of every failing chunk that had one.
    pub statuses: Vec<StatusCode>,
    /// Request id of every failing chunk that had one.
    pub request_ids: Vec<String>,
    /// Missing items reported across all failing chunks.
    pub missing: Vec<Value>,
    /// Duplicated items reported across all failing chunks.
    pub duplicated: Vec<Value>,
}

impl<T, R> BatchError<T, R> {
    /// Summarizes a result with at least one failed chunk.
    pub fn new(result: BatchResult<T, R>) -> Self {
        let mut error = Self {
            status: result.errors.first().and_then(|e| e.error.status()),
            request_id: result
                .errors
                .first()
                .and_then(|e| e.error.request_id())
                .map(str::to_string),
            statuses: Vec::new(),
            request_ids: Vec::new(),
            missing: Vec::new(),
            duplicated: Vec::new(),
            result,
        };

        for chunk in &error.result.errors {
            if let Some(status) = chunk.error.status() {
                error.statuses.push(status);
            }
            if let Some(request_id) = chunk.error.request_id() {
                error.request_ids.push(request_id.to_string());
            }
            if let Some(detail) = chunk.error.api_detail() {
                error
                    .missing
                    .extend(detail.missing.iter().flatten().cloned());
                error
                    .duplicated
                    .extend(detail.duplicated.iter().flatten().cloned());
            }
        }

        error
    }

    /// Input items that were written.
    pub fn succeeded(&self) -> &[T] {
        &self.result.succeeded
    }

    /// Input items that were not written.
    pub fn failed(&self) -> &[T] {
        &self.result.failed
    }

    /// Results returned for the written items.
    pub fn responses(&self) -> &[R] {
        &self.result.responses
    }

    /// Per-chunk errors.
    pub fn errors(&self) -> &[ChunkError] {
        &self.result.errors
    }

    /// Converts items and results to JSON so the error fits in [`Error`].
    ///
    /// An item that fails to serialize keeps its position as `null` and is
    /// logged at warn level with its index.
    pub fn into_json(self) -> BatchError<Value, Value>
    where
        T: Serialize,
        R: Serialize,
    {
        fn to_values<X: Serialize>(list: &'static str, items: Vec<X>) -> Vec<Value> {
            items
                .into_iter()
                .enumerate()
                .map(|(index, item)| {
                    serde_json::to_value(item).unwrap_or_else(|e| {
                        tracing::warn!(list, index, error = %e, "Batch item could not be converted to JSON");
                        Value::Null
                    })
                })
                .collect()
        }

        BatchError {
            result: BatchResult {
                succeeded: to_values("succeeded", self.result.succeeded),
                failed: to_values("failed", self.result.failed),
                responses: to_values("responses", self.result.responses),
                errors: self.result.errors,
            },
            status: self.status,
            request_id: self.request_id,
            statuses: self.statuses,
            request_ids: self.request_ids,
            missing: self.missing,
            duplicated: self.duplicated,
        }
    }
}

impl<T, R> fmt::Display for BatchError<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.result.succeeded.len() + self.result.failed.len();
        write!(
            f,
            "The API failed to process {} of {} items ({} failed chunk(s))",
            self.result.failed.len(),
            total,
            self.result.errors.len()
        )?;
        if let Some(first) = self.result.errors.first() {
            write!(f, "; first error at item {}: {}", first.offset, first.error)?;
        }
        Ok(())
    }
}

impl<T: fmt::Debug, R: fmt::Debug> std::error::Error for BatchError<T, R> {}

impl<T: Serialize, R: Serialize> From<BatchError<T, R>> for Error {
    fn from(error: BatchError<T, R>) -> Self {
        Error::Batch(Box::new(error.into_json()))
    }
}

/// Runs a bulk operation in chunks of `options.chunk_size`.
///
/// `dispatch` sends one chunk and returns one result per item, in the
/// chunk's order. On full success the results of all chunks are returned
/// concatenated in input order. Otherwise every chunk still runs (except in
/// [`BatchMode::Sequential`]) and a [`BatchError`] describes which items
/// were written and which were not.
///
/// # Examples
///
/// ```
/// use bulkwire::batch::{execute_batch, BatchOptions};
///
/// # async fn example() -> Result<(), bulkwire::Error> {
/// let options = BatchOptions::new(2)?;
/// let doubled = execute_batch(&[1, 2, 3], options, |chunk| async move {
///     Ok(chunk.into_iter().map(|n| n * 2).collect::<Vec<i32>>())
/// })
/// .await?;
/// assert_eq!(doubled, vec![2, 4, 6]);
/// # Ok(())
/// # }
/// ```
pub async fn execute_batch<T, R, F, Fut>(
    items: &[T],
    options: impl Into<BatchOptions>,
    dispatch: F,
) -> std::result::Result<Vec<R>, BatchError<T, R>>
where
    T: Clone,
    F: Fn(Vec<T>) -> Fut,
    Fut: Future<Output = Result<Vec<R>>>,
{
    let options = options.into();
    let chunks = partition(items, options.chunk_size);

    tracing::debug!(
        items = items.len(),
        chunks = chunks.len(),
        chunk_size = options.chunk_size.get(),
        "Dispatching batch"
    );

    let outcomes: Vec<Result<Vec<R>>> = match options.mode {
        BatchMode::Concurrent { limit: None } => {
            futures::future::join_all(chunks.iter().map(|chunk| dispatch(chunk.items.clone())))
                .await
        }
        BatchMode::Concurrent { limit: Some(limit) } => {
            stream::iter(chunks.iter().map(|chunk| dispatch(chunk.items.clone())))
                .buffered(limit.get())
                .collect()
                .await
        }
        BatchMode::Sequential => {
            let mut outcomes = Vec::with_capacity(chunks.len());
            for chunk in &chunks {
                let outcome = dispatch(chunk.items.clone()).await;
                let failed = outcome.is_err();
                outcomes.push(outcome);
                if failed {
                    break;
                }
            }
            outcomes
        }
    };

    let mut result = BatchResult::default();
    let mut outcomes = outcomes.into_iter();

    for chunk in chunks {
        match outcomes.next() {
            Some(Ok(responses)) => {
                result.succeeded.extend(chunk.items);
                result.responses.extend(responses);
            }
            Some(Err(error)) => {
                tracing::warn!(
                    chunk_offset = chunk.offset,
                    chunk_len = chunk.items.len(),
                    error = %error,
                    "Batch chunk failed"
                );
                result.errors.push(ChunkError {
                    offset: chunk.offset,
                    len: chunk.items.len(),
                    error,
                });
                result.failed.extend(chunk.items);
            }
            // Not dispatched after an earlier sequential failure.
            None => result.failed.extend(chunk.items),
        }
    }

    if result.errors.is_empty() {
        tracing::info!(items = result.succeeded.len(), "Batch completed");
        Ok(result.responses)
    } else {
        tracing::warn!(
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            failed_chunks = result.errors.len(),
            "Batch partially failed"
        );
        Err(BatchError::new(result))
    }
}
