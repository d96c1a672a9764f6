//! Backend pagination
//!
//! Backends page their inventories in different ways: some return short
//! pages at the end, some declare a total item count, some a page count.
//! [`Pages`] turns a page-fetching closure into a lazy, finite sequence that
//! stops on whichever signal the backend provides, with a hard page cap for
//! backends that violate their own contract.

use crate::error::{ProvisionError, Result};
use crate::poll::ensure_active;
use std::future::Future;
use std::marker::PhantomData;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Default page size requested from backends
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Upper bound on pages fetched in one scan
pub const MAX_PAGES: u32 = 1000;

/// A request for one page (numbers are 1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub number: u32,
    pub size: u32,
}

impl PageRequest {
    /// Zero-based offset of the first item on this page
    pub fn offset(&self) -> u64 {
        u64::from(self.number.saturating_sub(1)) * u64::from(self.size)
    }
}

/// One page returned by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Total number of items, when the backend reports it
    pub total_items: Option<u64>,
    /// Total number of pages, when the backend reports it
    pub total_pages: Option<u32>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            total_items: None,
            total_pages: None,
        }
    }

    /// A complete, unpaginated listing
    pub fn complete(items: Vec<T>) -> Self {
        let total = items.len() as u64;
        Self::new(items).with_total_items(total)
    }

    pub fn with_total_items(mut self, total: u64) -> Self {
        self.total_items = Some(total);
        self
    }

    pub fn with_total_pages(mut self, total: u32) -> Self {
        self.total_pages = Some(total);
        self
    }

    /// Whether this page is the final one for `request`
    pub fn is_last(&self, request: &PageRequest) -> bool {
        let len = self.items.len() as u64;
        if len == 0 || len < u64::from(request.size) {
            return true;
        }
        if let Some(total) = self.total_items {
            if request.offset() + len >= total {
                return true;
            }
        }
        if let Some(pages) = self.total_pages {
            if request.number >= pages {
                return true;
            }
        }
        false
    }
}

/// Lazy sequence of pages produced by a fetch closure
///
/// A `Pages` value is consumed by one scan; build a new one to restart.
pub struct Pages<T, F> {
    fetch: F,
    size: u32,
    next: Option<u32>,
    cancel: Option<CancellationToken>,
    _item: PhantomData<fn() -> T>,
}

impl<T, F, Fut> Pages<T, F>
where
    F: FnMut(PageRequest) -> Fut,
    Fut: Future<Output = Result<Page<T>>>,
{
    pub fn new(size: u32, fetch: F) -> Self {
        Self {
            fetch,
            size: size.max(1),
            next: Some(1),
            cancel: None,
            _item: PhantomData,
        }
    }

    /// Check this token before every page request
    pub fn with_cancel(mut self, cancel: &CancellationToken) -> Self {
        self.cancel = Some(cancel.clone());
        self
    }

    /// Fetch the next page, or `None` once the sequence is exhausted
    pub async fn next_page(&mut self) -> Result<Option<Vec<T>>> {
        let Some(number) = self.next else {
            return Ok(None);
        };

        if number > MAX_PAGES {
            warn!(pages = MAX_PAGES, "Backend pagination did not terminate");
            self.next = None;
            return Err(ProvisionError::backend(
                "paginate",
                format!("pagination exceeded {} pages", MAX_PAGES),
            ));
        }

        if let Some(cancel) = &self.cancel {
            ensure_active(cancel)?;
        }

        let request = PageRequest {
            number,
            size: self.size,
        };
        let page = (self.fetch)(request).await?;
        self.next = if page.is_last(&request) {
            None
        } else {
            Some(number + 1)
        };

        trace!(page = number, items = page.items.len(), last = self.next.is_none(), "Fetched page");
        Ok(Some(page.items))
    }

    /// Return the first item mapped to `Some` by `f`, stopping early
    pub async fn find_map<U, M>(mut self, mut f: M) -> Result<Option<U>>
    where
        M: FnMut(T) -> Option<U>,
    {
        while let Some(items) = self.next_page().await? {
            if let Some(found) = items.into_iter().find_map(&mut f) {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Collect every item of every page
    pub async fn try_collect(mut self) -> Result<Vec<T>> {
        let mut all = Vec::new();
        while let Some(items) = self.next_page().await? {
            all.extend(items);
        }
        Ok(all)
    }
}
