//! Paginated fetch contract.
//!
//! The remote catalog is reached through a [`PageSource`]: give it a
//! resource id and a cursor, get back one page of raw records and the next
//! cursor. The loop that walks pages, honors throttling and enforces the
//! inter-request delay lives in the native crate; this module holds the
//! contract types and the [`CursorGuard`] that keeps that loop finite.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::FetchError;
use crate::models::{Cursor, RawRecord};

/// One page as reported by the remote service.
#[derive(Debug, Clone, Default)]
pub struct PageResponse {
    pub records: Vec<RawRecord>,
    pub next_cursor: Option<Cursor>,
    /// The service asked us to slow down; `records` is meaningless.
    pub rate_limited: bool,
    /// Server-provided backoff, when it sent one.
    pub retry_after: Option<Duration>,
}

impl PageResponse {
    pub fn page(records: Vec<RawRecord>, next_cursor: Option<Cursor>) -> Self {
        Self {
            records,
            next_cursor,
            ..Self::default()
        }
    }

    pub fn throttled(retry_after: Option<Duration>) -> Self {
        Self {
            rate_limited: true,
            retry_after,
            ..Self::default()
        }
    }
}

/// A remote enumeration endpoint.
///
/// Implementations perform exactly one request per call and must bound it
/// with a finite timeout. A throttling answer is returned as
/// `Ok(PageResponse { rate_limited: true, .. })`, not as an error.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(
        &self,
        resource_id: &str,
        cursor: Option<&Cursor>,
        page_size: usize,
    ) -> Result<PageResponse, FetchError>;

    /// The cursor sent when `fetch_page` is called without one, if the
    /// source sends any. The fetch loop treats it as already seen.
    fn initial_cursor(&self) -> Option<&str> {
        None
    }
}

/// Why a paginated fetch stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxRecords,
    EmptyPage,
    NoNextCursor,
    CursorRepeated,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::MaxRecords => "max_records",
            StopReason::EmptyPage => "empty_page",
            StopReason::NoNextCursor => "no_next_cursor",
            StopReason::CursorRepeated => "cursor_repeated",
        }
    }
}

/// Everything gathered for one resource.
#[derive(Debug, Clone)]
pub struct FetchedPages {
    pub records: Vec<RawRecord>,
    pub pages: usize,
    pub stop: StopReason,
}

/// Remembers every cursor seen during one paginated fetch.
#[derive(Debug, Default)]
pub struct CursorGuard {
    seen: HashSet<Cursor>,
}

impl CursorGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `cursor`; returns `false` if it was already seen, meaning the
    /// server is cycling and iteration must stop.
    pub fn admit(&mut self, cursor: &str) -> bool {
        self.seen.insert(cursor.to_string())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
