//! Page transport: query construction, HTTP fetch and failure classification.
//!
//! The scheduler only depends on the [`PageFetcher`] trait. [`HttpPageFetcher`] is the
//! production implementation; tests substitute scripted fetchers.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::config::QueryConfig;
use crate::error::{Error, FetchError, Result};
use crate::types::{BatchRange, OrderingKey, ServiceMetadata};

/// Raw response body of a successful page request
pub type RawPayload = Vec<u8>;

/// Abstraction over page fetching, enabling testability.
///
/// Implementations must classify every failure as [`FetchError::Transient`] or
/// [`FetchError::Permanent`]; the scheduler never looks at HTTP status codes itself.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch the records of `range` and return the raw payload
    async fn fetch_page(
        &self,
        metadata: &ServiceMetadata,
        range: BatchRange,
    ) -> std::result::Result<RawPayload, FetchError>;
}

/// Build the shared HTTP client from query settings
pub fn build_client(query: &QueryConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(query.request_timeout)
        .connect_timeout(Duration::from_secs(30))
        .danger_accept_invalid_certs(!query.verify_tls)
        .user_agent(concat!("arcgis-harvest/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(Error::Network)
}

/// Production [`PageFetcher`] issuing ArcGIS `query` requests over HTTP.
pub struct HttpPageFetcher {
    client: reqwest::Client,
    query: QueryConfig,
}

impl HttpPageFetcher {
    /// Create a fetcher sharing `client`
    pub fn new(client: reqwest::Client, query: QueryConfig) -> Self {
        Self { client, query }
    }

    /// Build the query URL for one batch
    pub fn page_url(
        &self,
        metadata: &ServiceMetadata,
        range: BatchRange,
    ) -> std::result::Result<url::Url, FetchError> {
        page_url(&self.query, metadata, range)
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch_page(
        &self,
        metadata: &ServiceMetadata,
        range: BatchRange,
    ) -> std::result::Result<RawPayload, FetchError> {
        let url = self.page_url(metadata, range)?;

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(%url, status = status.as_u16(), body = %truncate(&body, 256), "Page request rejected");
            return Err(classify_status(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(classify_reqwest_error)?
            .to_vec();

        check_page_payload(&body)?;
        Ok(body)
    }
}

/// Build the query URL for `range` according to the service's paging strategy
pub fn page_url(
    query: &QueryConfig,
    metadata: &ServiceMetadata,
    range: BatchRange,
) -> std::result::Result<url::Url, FetchError> {
    let mut url = url::Url::parse(&format!("{}/query", metadata.base_url))
        .map_err(|e| FetchError::Permanent(format!("invalid service URL: {}", e)))?;

    {
        let mut pairs = url.query_pairs_mut();
        match &metadata.ordering_key {
            OrderingKey::Offset { order_by } => {
                pairs
                    .append_pair("where", "1=1")
                    .append_pair("resultOffset", &range.start.to_string())
                    .append_pair("resultRecordCount", &range.len().to_string());
                if let Some(field) = order_by {
                    pairs.append_pair("orderByFields", field);
                }
            }
            OrderingKey::ObjectId { field, min_oid, .. } => {
                let low = min_oid.saturating_add(range.start as i64);
                let high = min_oid.saturating_add(range.end as i64 - 1);
                pairs.append_pair(
                    "where",
                    &format!("{field} >= {low} AND {field} <= {high}"),
                );
            }
        }
        pairs.append_pair("outFields", &query.out_fields);
        if !metadata.is_table() {
            pairs.append_pair("returnGeometry", "true");
            if let Some(sr) = query.out_sr {
                pairs.append_pair("outSR", &sr.to_string());
            }
        }
        pairs.append_pair("f", query.format.as_param());
    }

    Ok(url)
}

/// Classify a non-success HTTP status
///
/// Rate limiting (429), request timeouts (408) and server errors (5xx) are transient;
/// everything else is permanent.
pub fn classify_status(status: u16) -> FetchError {
    match status {
        408 | 429 => FetchError::Transient(format!("HTTP {status}")),
        500..=599 => FetchError::Transient(format!("HTTP {status}")),
        _ => FetchError::Permanent(format!("HTTP {status}")),
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> FetchError {
    if e.is_builder() || e.is_redirect() {
        FetchError::Permanent(e.to_string())
    } else {
        // timeouts, connect failures, resets, truncated bodies
        FetchError::Transient(e.to_string())
    }
}

/// Extract an ArcGIS `{"error": {"code", "message"}}` object, if present
pub(crate) fn service_error(json: &Value) -> Option<(Option<i64>, String)> {
    let error = json.get("error")?;
    let code = error.get("code").and_then(Value::as_i64);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown service error")
        .to_string();
    Some((code, message))
}

/// Validate that a 200 response is a feature page
///
/// ArcGIS reports many failures as HTTP 200 with an `error` object. Those are classified
/// by their embedded code; a body that is neither an error nor a feature collection is
/// permanent.
pub fn check_page_payload(body: &[u8]) -> std::result::Result<(), FetchError> {
    let json: Value = serde_json::from_slice(body)
        .map_err(|e| FetchError::Permanent(format!("response is not valid JSON: {}", e)))?;

    if json.get("features").is_some_and(Value::is_array) {
        return Ok(());
    }

    match service_error(&json) {
        Some((Some(code), message)) => {
            let err = classify_status(code.clamp(0, u16::MAX as i64) as u16);
            Err(match err {
                FetchError::Transient(_) => {
                    FetchError::Transient(format!("service error {code}: {message}"))
                }
                FetchError::Permanent(_) => {
                    FetchError::Permanent(format!("service error {code}: {message}"))
                }
            })
        }
        Some((None, message)) => Err(FetchError::Transient(format!("service error: {message}"))),
        None => Err(FetchError::Permanent(
            "response was not an error but no features found".to_string(),
        )),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
