//! Service capability discovery.
//!
//! Runs once per harvest, before any batch is planned. Issues the layer description
//! request, the record count request and, for services without pagination, an object-id
//! span request. There are no retries here: a probe failure aborts the run and the caller
//! may simply re-invoke it.

use serde_json::Value;

use crate::config::QueryConfig;
use crate::error::ProbeError;
use crate::transport::service_error;
use crate::types::{OrderingKey, ServiceMetadata};

const FIELD_TYPE_OID: &str = "esriFieldTypeOID";

/// Discover paging capabilities of the layer at `base_url`
///
/// A service reporting zero records yields metadata with `total_count == 0`, not an error.
pub async fn probe(
    client: &reqwest::Client,
    base_url: &str,
    query: &QueryConfig,
) -> Result<ServiceMetadata, ProbeError> {
    let base_url = base_url.trim_end_matches('/');

    let layer = get_json(client, base_url, &[("f", "json")]).await?;
    let description = LayerDescription::from_json(base_url, &layer)?;

    let count_url = format!("{base_url}/query");
    let count_json = get_json(
        client,
        &count_url,
        &[("where", "1=1"), ("returnCountOnly", "true"), ("f", "json")],
    )
    .await?;
    let total_count = count_json
        .get("count")
        .and_then(Value::as_u64)
        .ok_or_else(|| ProbeError::Malformed {
            url: count_url.clone(),
            reason: "missing or negative 'count'".to_string(),
        })?;

    let ordering_key = if description.supports_pagination {
        OrderingKey::Offset {
            order_by: description.oid_field.clone(),
        }
    } else if let Some(field) = description.oid_field.clone() {
        let (min_oid, max_oid) = if total_count == 0 {
            (0, -1)
        } else if description.supports_statistics {
            oid_span_from_statistics(client, base_url, &field).await?
        } else {
            oid_span_from_ids(client, base_url).await?
        };
        OrderingKey::ObjectId {
            field,
            min_oid,
            max_oid,
        }
    } else {
        return Err(ProbeError::NoPagingStrategy {
            url: base_url.to_string(),
        });
    };

    let max_page_size = description.max_record_count.min(query.page_size_cap).max(1);

    let metadata = ServiceMetadata {
        base_url: base_url.to_string(),
        name: description.name,
        max_page_size,
        total_count,
        ordering_key,
        geometry_type: description.geometry_type,
    };

    if metadata.total_count == 0 {
        tracing::warn!(service = %metadata.name, "Service reports zero records");
    }
    tracing::info!(
        service = %metadata.name,
        total_count = metadata.total_count,
        max_page_size = metadata.max_page_size,
        ordering = ?metadata.ordering_key,
        "Probed service"
    );

    Ok(metadata)
}

/// Fields of the layer description the harvester cares about
#[derive(Debug)]
struct LayerDescription {
    name: String,
    max_record_count: u64,
    supports_pagination: bool,
    supports_statistics: bool,
    geometry_type: Option<String>,
    oid_field: Option<String>,
}

impl LayerDescription {
    fn from_json(url: &str, json: &Value) -> Result<Self, ProbeError> {
        let malformed = |reason: &str| ProbeError::Malformed {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let max_record_count = match json.get("maxRecordCount") {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| malformed("missing or invalid 'maxRecordCount'"))?;
        if max_record_count == 0 {
            return Err(malformed("'maxRecordCount' is zero"));
        }

        let name = json
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("layer")
            .to_string();

        // Newer servers nest these flags under advancedQueryCapabilities
        let capabilities = json
            .get("advancedQueryCapabilities")
            .filter(|v| v.as_object().is_some_and(|o| !o.is_empty()))
            .unwrap_or(json);
        let flag = |key: &str| capabilities.get(key).and_then(Value::as_bool).unwrap_or(false);

        let is_table = json.get("type").and_then(Value::as_str) == Some("Table");
        let geometry_type = if is_table {
            None
        } else {
            json.get("geometryType")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let oid_field = json
            .get("fields")
            .and_then(Value::as_array)
            .and_then(|fields| {
                fields.iter().find_map(|field| {
                    (field.get("type").and_then(Value::as_str) == Some(FIELD_TYPE_OID))
                        .then(|| field.get("name").and_then(Value::as_str))
                        .flatten()
                        .map(str::to_string)
                })
            })
            .or_else(|| {
                json.get("objectIdField")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });

        Ok(Self {
            name,
            max_record_count,
            supports_pagination: flag("supportsPagination"),
            supports_statistics: flag("supportsStatistics"),
            geometry_type,
            oid_field,
        })
    }
}

async fn oid_span_from_statistics(
    client: &reqwest::Client,
    base_url: &str,
    field: &str,
) -> Result<(i64, i64), ProbeError> {
    let url = format!("{base_url}/query");
    let statistics = serde_json::json!([
        { "statisticType": "min", "onStatisticField": field, "outStatisticFieldName": "MIN_VALUE" },
        { "statisticType": "max", "onStatisticField": field, "outStatisticFieldName": "MAX_VALUE" },
    ])
    .to_string();
    let json = get_json(
        client,
        &url,
        &[
            ("where", "1=1"),
            ("outStatistics", statistics.as_str()),
            ("f", "json"),
        ],
    )
    .await?;

    let attributes = json
        .pointer("/features/0/attributes")
        .ok_or_else(|| ProbeError::Malformed {
            url: url.clone(),
            reason: "statistics response has no features".to_string(),
        })?;
    // Some servers lower-case statistic aliases
    let read = |key: &str| {
        attributes
            .get(key)
            .or_else(|| attributes.get(key.to_lowercase()))
            .and_then(Value::as_i64)
    };
    match (read("MIN_VALUE"), read("MAX_VALUE")) {
        (Some(min), Some(max)) => Ok((min, max)),
        _ => Err(ProbeError::Malformed {
            url,
            reason: "statistics response lacks MIN_VALUE/MAX_VALUE".to_string(),
        }),
    }
}

async fn oid_span_from_ids(
    client: &reqwest::Client,
    base_url: &str,
) -> Result<(i64, i64), ProbeError> {
    let url = format!("{base_url}/query");
    let json = get_json(
        client,
        &url,
        &[("where", "1=1"), ("returnIdsOnly", "true"), ("f", "json")],
    )
    .await?;

    let ids = json
        .get("objectIds")
        .and_then(Value::as_array)
        .ok_or_else(|| ProbeError::Malformed {
            url: url.clone(),
            reason: "missing 'objectIds'".to_string(),
        })?;
    let ids: Vec<i64> = ids.iter().filter_map(Value::as_i64).collect();
    match (ids.iter().min(), ids.iter().max()) {
        (Some(min), Some(max)) => Ok((*min, *max)),
        _ => Err(ProbeError::Malformed {
            url,
            reason: "'objectIds' is empty".to_string(),
        }),
    }
}

async fn get_json(
    client: &reqwest::Client,
    url: &str,
    params: &[(&str, &str)],
) -> Result<Value, ProbeError> {
    let response = client
        .get(url)
        .query(params)
        .send()
        .await
        .map_err(|e| ProbeError::Unreachable {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(ProbeError::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| ProbeError::Unreachable {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    let json: Value = serde_json::from_slice(&bytes).map_err(|e| ProbeError::Malformed {
        url: url.to_string(),
        reason: format!("invalid JSON: {}", e),
    })?;

    if let Some((code, message)) = service_error(&json) {
        return Err(ProbeError::Service {
            code: code.unwrap_or(-1),
            message,
        });
    }

    Ok(json)
}
