//! Cursor-driven list results as a lazy, forward-only sequence.

use crate::Result;
use futures::future::BoxFuture;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::ops::ControlFlow;

/// One page of a list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    /// The page's items, in server order.
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    /// Cursor for the following page; absent on the last page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    /// A page followed by `next_cursor`, or the last page if `None`.
    pub fn new(items: Vec<T>, next_cursor: Option<String>) -> Self {
        Self { items, next_cursor }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Cursor {
    NotStarted,
    Next(String),
    Exhausted,
}

type FetchPage<T> = Box<dyn FnMut(Option<String>) -> BoxFuture<'static, Result<Page<T>>> + Send>;

/// Lazily walks a cursor-paginated list.
///
/// Pages are fetched only when the caller asks for more items than are
/// buffered. Once the server stops returning a cursor the paginator is
/// exhausted for good; call the list operation again to start over.
///
/// # Examples
///
/// ```no_run
/// use bulkwire::{Client, RequestDescriptor};
/// use http::Method;
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Asset { id: u64 }
///
/// # async fn example() -> Result<(), bulkwire::Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com")?
///     .build()?;
///
/// let mut assets = client.list::<Asset>(RequestDescriptor::new(Method::GET, "/assets"));
/// while let Some(asset) = assets.next().await? {
///     println!("{}", asset.id);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Paginator<T> {
    fetch: FetchPage<T>,
    cursor: Cursor,
    buffer: VecDeque<T>,
    pages_fetched: usize,
}

impl<T> Paginator<T> {
    /// Creates a paginator around `fetch`, which receives the cursor of the
    /// page to load (`None` for the first page).
    pub fn new<F, Fut>(mut fetch: F) -> Self
    where
        F: FnMut(Option<String>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Page<T>>> + Send + 'static,
    {
        Self {
            fetch: Box::new(move |cursor| Box::pin(fetch(cursor))),
            cursor: Cursor::NotStarted,
            buffer: VecDeque::new(),
            pages_fetched: 0,
        }
    }

    /// Returns `true` once every page was fetched and every item handed out.
    pub fn is_exhausted(&self) -> bool {
        self.cursor == Cursor::Exhausted && self.buffer.is_empty()
    }

    /// Number of pages fetched so far.
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    async fn fetch_page(&mut self) -> Result<Option<Vec<T>>> {
        let cursor = match &self.cursor {
            Cursor::NotStarted => None,
            Cursor::Next(cursor) => Some(cursor.clone()),
            Cursor::Exhausted => return Ok(None),
        };

        // On failure the cursor stays put so the same page can be retried.
        let page = (self.fetch)(cursor).await?;
        self.pages_fetched += 1;
        self.cursor = match page.next_cursor {
            Some(next) if !next.is_empty() => Cursor::Next(next),
            _ => Cursor::Exhausted,
        };

        tracing::debug!(
            page = self.pages_fetched,
            items = page.items.len(),
            exhausted = self.cursor == Cursor::Exhausted,
            "Fetched page"
        );

        Ok(Some(page.items))
    }

    /// Returns the next item, fetching a page if the buffer is empty.
    ///
    /// # Errors
    ///
    /// Returns the page fetch's error. The paginator can be polled again
    /// afterwards and will request the same page.
    pub async fn next(&mut self) -> Result<Option<T>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Ok(Some(item));
            }
            match self.fetch_page().await? {
                Some(items) => self.buffer.extend(items),
                None => return Ok(None),
            }
        }
    }

    /// Returns the remaining items of the current page, or the next page.
    ///
    /// Empty pages in the middle of a list are returned as empty vectors;
    /// `None` means the list is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<T>>> {
        if !self.buffer.is_empty() {
            return Ok(Some(self.buffer.drain(..).collect()));
        }
        self.fetch_page().await
    }

    /// Feeds items to `handler` until it breaks or the list ends.
    pub async fn for_each_item<F>(&mut self, mut handler: F) -> Result<()>
    where
        F: FnMut(T) -> ControlFlow<()>,
    {
        while let Some(item) = self.next().await? {
            if handler(item).is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Collects at most `limit` items.
    ///
    /// No page is fetched once `limit` items are available. Items of the
    /// last fetched page beyond `limit` stay buffered for later calls.
    pub async fn collect_up_to(&mut self, limit: usize) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while items.len() < limit {
            match self.next().await? {
                Some(item) => items.push(item),
                None => break,
            }
        }
        Ok(items)
    }

    /// Drains every remaining page.
    pub async fn collect_all(&mut self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(page) = self.next_page().await? {
            items.extend(page);
        }
        Ok(items)
    }

    /// Converts the paginator into a stream of items.
    ///
    /// The stream ends after yielding the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> {
        stream::unfold(Some(self), |state| async move {
            let mut paginator = state?;
            match paginator.next().await {
                Ok(Some(item)) => Some((Ok(item), Some(paginator))),
                Ok(None) => None,
                Err(error) => Some((Err(error), None)),
            }
        })
    }
}

impl<T> std::fmt::Debug for Paginator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Paginator")
            .field("cursor", &self.cursor)
            .field("buffered", &self.buffer.len())
            .field("pages_fetched", &self.pages_fetched)
            .finish()
    }
}
