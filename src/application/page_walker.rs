//! Lazy pagination over one resource kind
//!
//! The first page carries the item total; the page count is computed from
//! it once. A failed first fetch yields nothing, a failed later fetch ends
//! the sequence after the pages already yielded. Callers compare the pages
//! they received with `Page::total_pages` themselves.

use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::fmt::Display;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{PageRequest, PaginationCalculator, ResourceKind};

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub request: PageRequest,
    pub total_pages: u32,
    pub total_items: u64,
    pub payload: Value,
}

impl Page {
    /// 1-based
    pub const fn index(&self) -> u32 {
        self.request.page_index
    }
}

#[derive(Debug, Clone)]
pub struct PageWalker {
    kind: ResourceKind,
    item_key: String,
    calculator: PaginationCalculator,
    resume_after: u32,
    cancel: Option<CancellationToken>,
}

struct Walk<F, T> {
    kind: ResourceKind,
    item_key: String,
    calculator: PaginationCalculator,
    resume_after: u32,
    cancel: Option<CancellationToken>,
    fetch_page: F,
    extract_total: T,
    first: Option<Value>,
    started: bool,
    next_index: u32,
    total_pages: u32,
    total_items: u64,
}

impl<F, Fut, E, T> Walk<F, T>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<Value, E>>,
    E: Display,
    T: Fn(&Value) -> u64,
{
    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    fn page(&self, index: u32, payload: Value) -> Page {
        Page {
            request: PageRequest {
                kind: self.kind,
                item_key: self.item_key.clone(),
                page_index: index,
                page_size: self.calculator.page_size(),
            },
            total_pages: self.total_pages,
            total_items: self.total_items,
            payload,
        }
    }

    async fn advance(&mut self) -> Option<Page> {
        if !self.started {
            self.started = true;
            let first = match self.first.take() {
                Some(first) => first,
                None => {
                    if self.is_cancelled() {
                        return None;
                    }
                    match (self.fetch_page)(1).await {
                        Ok(first) => first,
                        Err(e) => {
                            warn!(kind = %self.kind, item = %self.item_key, "First page unavailable: {}", e);
                            return None;
                        }
                    }
                }
            };

            self.total_items = (self.extract_total)(&first);
            self.total_pages = self.calculator.total_pages(self.total_items);
            self.next_index = self.resume_after.max(1).saturating_add(1);
            debug!(kind = %self.kind, item = %self.item_key, total_items = self.total_items, total_pages = self.total_pages, "Pagination computed");

            if self.total_pages == 0 {
                return None;
            }
            if self.resume_after == 0 {
                return Some(self.page(1, first));
            }
        }

        if self.next_index > self.total_pages || self.is_cancelled() {
            return None;
        }

        let index = self.next_index;
        match (self.fetch_page)(index).await {
            Ok(payload) => {
                self.next_index += 1;
                Some(self.page(index, payload))
            }
            Err(e) => {
                warn!(
                    kind = %self.kind,
                    item = %self.item_key,
                    page = index,
                    total_pages = self.total_pages,
                    "Page fetch failed, stopping walk: {}",
                    e
                );
                None
            }
        }
    }
}

impl PageWalker {
    pub const fn new(kind: ResourceKind, page_size: u32) -> Self {
        Self {
            kind,
            item_key: String::new(),
            calculator: PaginationCalculator::new(page_size),
            resume_after: 0,
            cancel: None,
        }
    }

    /// Collection key or listing id the pages belong to
    #[must_use]
    pub fn for_item(mut self, item_key: impl Into<String>) -> Self {
        self.item_key = item_key.into();
        self
    }

    /// Stop before fetching the next page once the token fires
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Skip pages `1..=page`; the first page is still fetched for its total
    #[must_use]
    pub const fn resume_after(mut self, page: u32) -> Self {
        self.resume_after = page;
        self
    }

    pub const fn page_size(&self) -> u32 {
        self.calculator.page_size()
    }

    /// Walk from page 1
    pub fn walk<'a, F, Fut, E, T>(&self, fetch_page: F, extract_total: T) -> BoxStream<'a, Page>
    where
        F: Fn(u32) -> Fut + Send + 'a,
        Fut: Future<Output = Result<Value, E>> + Send + 'a,
        E: Display + Send + 'a,
        T: Fn(&Value) -> u64 + Send + 'a,
    {
        self.start(None, fetch_page, extract_total)
    }

    /// Walk with a first page the caller already fetched
    pub fn walk_from_first<'a, F, Fut, E, T>(&self, first: Value, fetch_page: F, extract_total: T) -> BoxStream<'a, Page>
    where
        F: Fn(u32) -> Fut + Send + 'a,
        Fut: Future<Output = Result<Value, E>> + Send + 'a,
        E: Display + Send + 'a,
        T: Fn(&Value) -> u64 + Send + 'a,
    {
        self.start(Some(first), fetch_page, extract_total)
    }

    fn start<'a, F, Fut, E, T>(&self, first: Option<Value>, fetch_page: F, extract_total: T) -> BoxStream<'a, Page>
    where
        F: Fn(u32) -> Fut + Send + 'a,
        Fut: Future<Output = Result<Value, E>> + Send + 'a,
        E: Display + Send + 'a,
        T: Fn(&Value) -> u64 + Send + 'a,
    {
        let walk = Walk {
            kind: self.kind,
            item_key: self.item_key.clone(),
            calculator: self.calculator,
            resume_after: self.resume_after,
            cancel: self.cancel.clone(),
            fetch_page,
            extract_total,
            first,
            started: false,
            next_index: 1,
            total_pages: 0,
            total_items: 0,
        };

        stream::unfold(walk, |mut walk| async move {
            let page = walk.advance().await?;
            Some((page, walk))
        })
        .boxed()
    }
}
