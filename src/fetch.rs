//! Paginated fetch loop.
//!
//! Walks a [`PageSource`] for one resource until one of the stop conditions
//! holds: the record cap is reached, a page comes back empty, there is no
//! next cursor, or the next cursor was already seen during this call. The
//! cursor the source sends for the first page counts as seen.
//!
//! Throttling is retried exactly once per page after sleeping the server's
//! `retry_after` (or the configured backoff). Transient errors are retried
//! up to `max_transient_retries` times per page. Everything else surfaces
//! to the caller as a [`FetchError`].

use std::time::Duration;

use harvest_ledger_core::error::FetchError;
use harvest_ledger_core::fetch::{
    CursorGuard, FetchedPages, PageResponse, PageSource, StopReason,
};
use harvest_ledger_core::models::Cursor;

use crate::config::FetchConfig;

#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub page_size: usize,
    pub max_records: Option<usize>,
    /// Pause between successive page requests for the same resource.
    pub min_request_delay: Duration,
    /// Wait used after throttling without `retry_after`, and between transient retries.
    pub backoff: Duration,
    pub max_transient_retries: u32,
}

impl FetchPolicy {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            page_size: config.page_size,
            max_records: config.max_records,
            min_request_delay: Duration::from_millis(config.min_request_delay_ms),
            backoff: Duration::from_millis(config.backoff_ms),
            max_transient_retries: config.max_transient_retries,
        }
    }
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self::from_config(&FetchConfig::default())
    }
}

pub async fn fetch_all(
    source: &dyn PageSource,
    resource_id: &str,
    policy: &FetchPolicy,
) -> Result<FetchedPages, FetchError> {
    let mut records = Vec::new();
    let mut guard = CursorGuard::new();
    if let Some(first) = source.initial_cursor() {
        guard.admit(first);
    }
    let mut cursor: Option<Cursor> = None;
    let mut pages = 0usize;

    let stop = loop {
        if pages > 0 && !policy.min_request_delay.is_zero() {
            tokio::time::sleep(policy.min_request_delay).await;
        }

        let page = fetch_page_with_retry(source, resource_id, cursor.as_ref(), policy).await?;
        pages += 1;

        if page.records.is_empty() {
            break StopReason::EmptyPage;
        }

        for record in page.records {
            if policy.max_records.is_some_and(|cap| records.len() >= cap) {
                break;
            }
            records.push(record);
        }
        if policy.max_records.is_some_and(|cap| records.len() >= cap) {
            break StopReason::MaxRecords;
        }

        match page.next_cursor {
            None => break StopReason::NoNextCursor,
            Some(next) if next.is_empty() => break StopReason::NoNextCursor,
            Some(next) => {
                if !guard.admit(&next) {
                    break StopReason::CursorRepeated;
                }
                cursor = Some(next);
            }
        }
    };

    tracing::debug!(
        resource = resource_id,
        pages,
        records = records.len(),
        stop = stop.as_str(),
        "fetch finished"
    );

    Ok(FetchedPages {
        records,
        pages,
        stop,
    })
}

async fn fetch_page_with_retry(
    source: &dyn PageSource,
    resource_id: &str,
    cursor: Option<&Cursor>,
    policy: &FetchPolicy,
) -> Result<PageResponse, FetchError> {
    let mut throttled = false;
    let mut transient_attempts = 0u32;

    loop {
        let retry_after = match source.fetch_page(resource_id, cursor, policy.page_size).await {
            Ok(page) if !page.rate_limited => return Ok(page),
            Ok(page) => page.retry_after,
            Err(FetchError::RateLimited { retry_after }) => retry_after,
            Err(FetchError::Transient(msg)) if transient_attempts < policy.max_transient_retries => {
                transient_attempts += 1;
                tracing::warn!(
                    resource = resource_id,
                    attempt = transient_attempts,
                    error = %msg,
                    "transient fetch error, retrying"
                );
                tokio::time::sleep(policy.backoff).await;
                continue;
            }
            Err(e) => return Err(e),
        };

        if throttled {
            return Err(FetchError::RateLimited { retry_after });
        }
        throttled = true;
        let wait = retry_after.unwrap_or(policy.backoff);
        tracing::warn!(
            resource = resource_id,
            wait_ms = wait.as_millis() as u64,
            "rate limited, backing off"
        );
        tokio::time::sleep(wait).await;
    }
}
