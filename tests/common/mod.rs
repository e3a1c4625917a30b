//! Common test utilities for arcgis-harvest integration tests

#![allow(dead_code)]

use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use arcgis_harvest::{Config, RetryConfig};

/// Path of the fake layer on the mock server
pub const LAYER_PATH: &str = "/arcgis/rest/services/Parcels/FeatureServer/0";

/// Paging style of a fake layer
#[derive(Clone, Copy, Debug)]
pub enum Paging {
    /// `resultOffset` / `resultRecordCount`
    Offset,
    /// `where OBJECTID >= low AND OBJECTID <= high`, ids starting at `min_oid`
    ObjectId { min_oid: u64 },
}

/// A fake layer with `total` records and ids `first_id..first_id + total`
#[derive(Clone, Copy, Debug)]
pub struct FakeLayer {
    pub total: u64,
    pub max_record_count: u64,
    pub paging: Paging,
}

impl FakeLayer {
    fn first_id(&self) -> u64 {
        match self.paging {
            Paging::Offset => 1,
            Paging::ObjectId { min_oid } => min_oid,
        }
    }

    fn description(&self) -> Value {
        let pagination = matches!(self.paging, Paging::Offset);
        json!({
            "name": "Parcels",
            "type": "Feature Layer",
            "geometryType": "esriGeometryPoint",
            "maxRecordCount": self.max_record_count,
            "advancedQueryCapabilities": {
                "supportsPagination": pagination,
                "supportsStatistics": true
            },
            "fields": [
                { "name": "OBJECTID", "type": "esriFieldTypeOID" },
                { "name": "OWNER", "type": "esriFieldTypeString" }
            ]
        })
    }

    /// Ids served by a page request, derived from its query parameters
    fn ids_for(&self, request: &Request) -> Vec<u64> {
        let param = |name: &str| {
            request
                .url
                .query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
        };
        let last_id = self.first_id() + self.total;
        match self.paging {
            Paging::Offset => {
                let offset: u64 = param("resultOffset").and_then(|v| v.parse().ok()).unwrap_or(0);
                let count: u64 = param("resultRecordCount")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(self.max_record_count);
                let start = self.first_id() + offset;
                (start..(start + count).min(last_id)).collect()
            }
            Paging::ObjectId { .. } => {
                let clause = param("where").unwrap_or_default();
                let bounds: Vec<u64> = clause
                    .split_whitespace()
                    .filter_map(|token| token.parse().ok())
                    .collect();
                match bounds.as_slice() {
                    [low, high] => (*low..=*high).filter(|id| *id < last_id).collect(),
                    _ => Vec::new(),
                }
            }
        }
    }
}

impl Respond for FakeLayer {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let geojson = request
            .url
            .query_pairs()
            .any(|(k, v)| k == "f" && v == "geojson");
        if geojson {
            return self.respond_geojson(request);
        }
        let features: Vec<Value> = self
            .ids_for(request)
            .into_iter()
            .map(|id| {
                json!({
                    "attributes": { "OBJECTID": id, "OWNER": format!("owner-{id}") },
                    "geometry": { "x": -93.0 - id as f64 / 1000.0, "y": 45.0 }
                })
            })
            .collect();
        ResponseTemplate::new(200).set_body_json(json!({
            "objectIdFieldName": "OBJECTID",
            "geometryType": "esriGeometryPoint",
            "spatialReference": { "wkid": 4269 },
            "fields": [{ "name": "OBJECTID", "type": "esriFieldTypeOID" }],
            "features": features,
            "exceededTransferLimit": true
        }))
    }
}

impl FakeLayer {
    fn respond_geojson(&self, request: &Request) -> ResponseTemplate {
        let features: Vec<Value> = self
            .ids_for(request)
            .into_iter()
            .map(|id| {
                json!({
                    "type": "Feature",
                    "id": id,
                    "geometry": { "type": "Point", "coordinates": [-93.0 - id as f64 / 1000.0, 45.0] },
                    "properties": { "OBJECTID": id, "OWNER": format!("owner-{id}") }
                })
            })
            .collect();
        ResponseTemplate::new(200).set_body_json(json!({
            "type": "FeatureCollection",
            "features": features,
            "properties": { "exceededTransferLimit": true }
        }))
    }
}

/// Mount the layer description, count, statistics and page endpoints for `layer`
pub async fn mount_layer(server: &MockServer, layer: FakeLayer) {
    Mock::given(method("GET"))
        .and(path(LAYER_PATH))
        .and(query_param("f", "json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(layer.description()))
        .mount(server)
        .await;

    let query_path = format!("{LAYER_PATH}/query");
    Mock::given(method("GET"))
        .and(path(query_path.as_str()))
        .and(query_param("returnCountOnly", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "count": layer.total })))
        .with_priority(1)
        .mount(server)
        .await;

    let first = layer.first_id();
    Mock::given(method("GET"))
        .and(path(query_path.as_str()))
        .and(wiremock::matchers::query_param_contains("outStatistics", "MAX_VALUE"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "features": [{ "attributes": {
                "MIN_VALUE": first,
                "MAX_VALUE": first + layer.total.saturating_sub(1)
            } }]
        })))
        .with_priority(1)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(query_path.as_str()))
        .respond_with(layer)
        .mount(server)
        .await;
}

/// Make the page request at `offset` answer with `template` `times` times
pub async fn fail_offset(server: &MockServer, offset: u64, template: ResponseTemplate, times: u64) {
    Mock::given(method("GET"))
        .and(path(format!("{LAYER_PATH}/query").as_str()))
        .and(query_param("resultOffset", offset.to_string().as_str()))
        .respond_with(template)
        .up_to_n_times(times)
        .with_priority(2)
        .mount(server)
        .await;
}

/// Harvest configuration pointing at the mock server, writing below `root`
pub fn test_config(server: &MockServer, root: &Path) -> Config {
    let mut config = Config::new(format!("{}{LAYER_PATH}", server.uri()));
    config.scheduler.max_concurrency = 4;
    config.output.temp_dir = root.join("temp_files");
    config.output.output_path = Some(root.join("output_files").join("parcels.json"));
    config.retry = RetryConfig {
        max_attempts: 3,
        backoff_base: Duration::from_millis(5),
        backoff_cap: Duration::from_millis(20),
        jitter: true,
    };
    config
}

/// OBJECTIDs of the features in a consolidated output file
pub fn output_ids(path: &Path) -> Vec<u64> {
    let doc: Value = serde_json::from_slice(&std::fs::read(path).expect("read output"))
        .expect("output is valid JSON");
    doc["features"]
        .as_array()
        .expect("features array")
        .iter()
        .map(|f| f["attributes"]["OBJECTID"].as_u64().expect("numeric OBJECTID"))
        .collect()
}

/// OBJECTIDs of the features in a consolidated GeoJSON output file
pub fn geojson_output_ids(path: &Path) -> Vec<u64> {
    let doc: Value = serde_json::from_slice(&std::fs::read(path).expect("read output"))
        .expect("output is valid JSON");
    doc["features"]
        .as_array()
        .expect("features array")
        .iter()
        .map(|f| f["properties"]["OBJECTID"].as_u64().expect("numeric OBJECTID"))
        .collect()
}
