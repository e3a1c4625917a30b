//! End-to-end harvests against a mock ArcGIS REST service
//!
//! These tests drive the public entry points over real HTTP:
//! - Offset pagination and object-id windows
//! - Transient failures (HTTP 503, embedded service errors) retried to success
//! - Refusal to finalize when a batch fails permanently
//! - Resume after an interrupted run

mod common;

use common::{
    FakeLayer, Paging, fail_offset, geojson_output_ids, mount_layer, output_ids, test_config,
};
use arcgis_harvest::{
    CancellationToken, ConsolidationError, Error, Event, Harvester, ProbeError, ResponseFormat,
    run,
};
use serde_json::{Value, json};
use tempfile::TempDir;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn harvests_offset_paginated_service() {
    let server = MockServer::start().await;
    mount_layer(
        &server,
        FakeLayer {
            total: 250,
            max_record_count: 100,
            paging: Paging::Offset,
        },
    )
    .await;
    let root = TempDir::new().unwrap();
    let config = test_config(&server, root.path());

    let report = run(config).await.unwrap();

    assert_eq!(report.service, "Parcels");
    assert_eq!(report.total_batches, 3);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.feature_count, 250);
    assert_eq!(report.exit_code(), 0);

    let output = report.output_path.unwrap();
    assert_eq!(output_ids(&output), (1..=250).collect::<Vec<_>>());

    let doc: Value = serde_json::from_slice(&std::fs::read(&output).unwrap()).unwrap();
    assert_eq!(doc["spatialReference"], json!({ "wkid": 4269 }));
    assert!(doc.get("exceededTransferLimit").is_none());
}

#[tokio::test]
async fn harvests_object_id_windows() {
    let server = MockServer::start().await;
    mount_layer(
        &server,
        FakeLayer {
            total: 120,
            max_record_count: 50,
            paging: Paging::ObjectId { min_oid: 1000 },
        },
    )
    .await;
    let root = TempDir::new().unwrap();

    let report = run(test_config(&server, root.path())).await.unwrap();

    assert_eq!(report.total_batches, 3);
    assert_eq!(
        output_ids(&report.output_path.unwrap()),
        (1000..1120).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn harvests_geojson_pages() {
    let server = MockServer::start().await;
    mount_layer(
        &server,
        FakeLayer {
            total: 150,
            max_record_count: 100,
            paging: Paging::Offset,
        },
    )
    .await;
    let root = TempDir::new().unwrap();
    let mut config = test_config(&server, root.path());
    config.query.format = ResponseFormat::Geojson;

    let report = run(config).await.unwrap();

    assert_eq!(report.feature_count, 150);
    let output = report.output_path.unwrap();
    assert_eq!(geojson_output_ids(&output), (1..=150).collect::<Vec<_>>());

    let doc: Value = serde_json::from_slice(&std::fs::read(&output).unwrap()).unwrap();
    assert_eq!(doc["type"], "FeatureCollection");
    assert!(doc.get("properties").is_none(), "truncation flag is not carried over");

    let geojson_requests = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.query_pairs().any(|(k, v)| k == "f" && v == "geojson"))
        .count();
    assert_eq!(geojson_requests, 2);
}

#[tokio::test]
async fn retries_server_errors_and_embedded_service_errors() {
    let server = MockServer::start().await;
    mount_layer(
        &server,
        FakeLayer {
            total: 300,
            max_record_count: 100,
            paging: Paging::Offset,
        },
    )
    .await;
    fail_offset(&server, 100, ResponseTemplate::new(503), 2).await;
    fail_offset(
        &server,
        200,
        ResponseTemplate::new(200).set_body_json(json!({
            "error": { "code": 500, "message": "Error performing query operation" }
        })),
        1,
    )
    .await;
    let root = TempDir::new().unwrap();

    let harvester = Harvester::new(test_config(&server, root.path())).unwrap();
    let mut events = harvester.subscribe();
    let report = harvester.run().await.unwrap();

    assert_eq!(report.succeeded, 3);
    assert!(report.failed.is_empty());
    assert_eq!(
        output_ids(&report.output_path.unwrap()),
        (1..=300).collect::<Vec<_>>()
    );

    let mut retries = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Event::BatchRetrying { index, .. } = event {
            retries.push(index);
        }
    }
    retries.sort_unstable();
    assert_eq!(retries, vec![1, 1, 2]);
}

#[tokio::test]
async fn refuses_output_when_a_batch_fails_permanently() {
    let server = MockServer::start().await;
    mount_layer(
        &server,
        FakeLayer {
            total: 250,
            max_record_count: 100,
            paging: Paging::Offset,
        },
    )
    .await;
    fail_offset(&server, 100, ResponseTemplate::new(400), 10).await;
    let root = TempDir::new().unwrap();
    let config = test_config(&server, root.path());
    let output_path = config.output.output_path.clone().unwrap();

    let err = run(config).await.unwrap_err();

    match err {
        Error::Consolidation(ConsolidationError::FailedBatches { failed }) => {
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].index, 1);
            assert!(failed[0].error.contains("HTTP 400"), "{}", failed[0].error);
        }
        other => panic!("expected FailedBatches, got {other:?}"),
    }
    assert!(!output_path.exists());

    let page_requests = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.query_pairs().any(|(k, v)| k == "resultOffset" && v == "100"))
        .count();
    assert_eq!(page_requests, 1, "permanent failures are not retried");
}

#[tokio::test]
async fn best_effort_output_marks_report_with_gaps() {
    let server = MockServer::start().await;
    mount_layer(
        &server,
        FakeLayer {
            total: 250,
            max_record_count: 100,
            paging: Paging::Offset,
        },
    )
    .await;
    fail_offset(&server, 0, ResponseTemplate::new(404), 10).await;
    let root = TempDir::new().unwrap();
    let mut config = test_config(&server, root.path());
    config.output.best_effort_finalize = true;

    let report = run(config).await.unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].index, 0);
    assert_eq!(report.feature_count, 150);
    assert_eq!(
        output_ids(&report.output_path.unwrap()),
        (101..=250).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn resumes_after_cancelled_run() {
    let server = MockServer::start().await;
    mount_layer(
        &server,
        FakeLayer {
            total: 400,
            max_record_count: 100,
            paging: Paging::Offset,
        },
    )
    .await;
    let root = TempDir::new().unwrap();
    let mut config = test_config(&server, root.path());
    config.output.resume = true;
    config.scheduler.max_concurrency = 1;

    // Cancel as soon as the second batch has been stored
    let harvester = Harvester::new(config.clone()).unwrap();
    let mut events = harvester.subscribe();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if matches!(event, Event::BatchSucceeded { index: 1, .. }) {
                trigger.cancel();
                break;
            }
        }
    });
    let first = harvester.run_with_cancel(cancel).await.unwrap();
    assert!(first.cancelled);
    assert!(first.output_path.is_none());
    assert!(first.succeeded >= 2);

    server.reset().await;
    mount_layer(
        &server,
        FakeLayer {
            total: 400,
            max_record_count: 100,
            paging: Paging::Offset,
        },
    )
    .await;

    let second = run(config).await.unwrap();

    assert_eq!(second.resumed, first.succeeded);
    assert_eq!(
        output_ids(&second.output_path.unwrap()),
        (1..=400).collect::<Vec<_>>()
    );
    let refetched = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.query_pairs().any(|(k, _)| k == "resultOffset"))
        .count();
    assert_eq!(refetched, 4 - first.succeeded);
}

#[tokio::test]
async fn probe_failure_aborts_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(".*"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": { "code": 499, "message": "Token Required" }
        })))
        .mount(&server)
        .await;
    let root = TempDir::new().unwrap();

    let err = run(test_config(&server, root.path())).await.unwrap_err();

    assert!(matches!(err, Error::Probe(ProbeError::Service { code: 499, .. })));
    assert_eq!(err.error_code(), "probe_service_error");
}
