//! HTTP page source.
//!
//! Requests `GET {base_url}/{resource_id}?cursor=..&num_per_page=..` plus any
//! extra `[fetch.query]` parameters. The first page sends the configured
//! `initial_cursor`. Two response shapes are understood:
//!
//! ```json
//! { "records": [ {..}, .. ], "next_cursor": "AoJ4..", "rate_limited": false }
//! { "reviews": [ {..}, .. ], "cursor": "AoJ4.." }
//! ```
//!
//! Status mapping:
//!
//! | Response | Result |
//! |----------|--------|
//! | 429, or `rate_limited: true` | throttled page, `Retry-After` seconds honored |
//! | 5xx, timeout or reset (also while reading the body), connect failure | [`FetchError::Transient`] |
//! | other 4xx, unparseable body | [`FetchError::Malformed`] |

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

use harvest_ledger_core::error::FetchError;
use harvest_ledger_core::fetch::{PageResponse, PageSource};
use harvest_ledger_core::models::{Cursor, RawRecord};

use crate::config::FetchConfig;

const RECORD_FIELDS: &[&str] = &["records", "reviews"];
const CURSOR_FIELDS: &[&str] = &["next_cursor", "cursor"];

pub struct HttpPageSource {
    client: reqwest::Client,
    base_url: String,
    initial_cursor: String,
    query: Vec<(String, String)>,
}

impl HttpPageSource {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            initial_cursor: config.initial_cursor.clone(),
            query: config
                .query
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        })
    }

    fn url_for(&self, resource_id: &str) -> String {
        format!("{}/{}", self.base_url, resource_id)
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch_page(
        &self,
        resource_id: &str,
        cursor: Option<&Cursor>,
        page_size: usize,
    ) -> Result<PageResponse, FetchError> {
        let cursor = cursor.map(String::as_str).unwrap_or(&self.initial_cursor);
        let page_size = page_size.to_string();

        let resp = self
            .client
            .get(self.url_for(resource_id))
            .query(&self.query)
            .query(&[("cursor", cursor), ("num_per_page", page_size.as_str())])
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Ok(PageResponse::throttled(retry_after(resp.headers())));
        }
        if status.is_server_error() {
            return Err(FetchError::Transient(format!("server returned {}", status)));
        }
        if !status.is_success() {
            return Err(FetchError::Malformed(format!("server returned {}", status)));
        }

        let header_wait = retry_after(resp.headers());
        // A timeout or reset while reading the body is a network failure,
        // not a bad response.
        let bytes = resp.bytes().await.map_err(classify_request_error)?;
        let body: Value = serde_json::from_slice(&bytes)
            .map_err(|e| FetchError::Malformed(format!("invalid JSON body: {}", e)))?;
        parse_page(&body, header_wait)
    }

    fn initial_cursor(&self) -> Option<&str> {
        Some(&self.initial_cursor)
    }
}

/// JSON is parsed separately, so a decode error here means reading the
/// body failed.
fn classify_request_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() || e.is_decode() {
        FetchError::Transient(e.to_string())
    } else {
        FetchError::Malformed(e.to_string())
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Interpret one decoded response body.
pub fn parse_page(body: &Value, retry_after: Option<Duration>) -> Result<PageResponse, FetchError> {
    let obj = body
        .as_object()
        .ok_or_else(|| FetchError::Malformed("response is not a JSON object".to_string()))?;

    if obj.get("rate_limited").and_then(Value::as_bool) == Some(true) {
        let wait = obj
            .get("retry_after")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .or(retry_after);
        return Ok(PageResponse::throttled(wait));
    }

    let items = match RECORD_FIELDS.iter().find_map(|f| obj.get(*f)) {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => {
            return Err(FetchError::Malformed(
                "response has no records array".to_string(),
            ))
        }
        Some(other) => {
            return Err(FetchError::Malformed(format!(
                "records is not an array: {}",
                other
            )))
        }
    };

    let mut records: Vec<RawRecord> = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Object(map) => records.push(map.clone()),
            other => {
                return Err(FetchError::Malformed(format!(
                    "record is not an object: {}",
                    other
                )))
            }
        }
    }

    let next_cursor = CURSOR_FIELDS
        .iter()
        .find_map(|f| obj.get(*f))
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(str::to_string);

    Ok(PageResponse::page(records, next_cursor))
}
