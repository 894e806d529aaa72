//! End-to-end scrape → index → tracker API tests.

mod support;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::routing::post;
use axum::{Json, Router};
use snapfleet::config::{StaticTargets, TargetGroup};
use snapfleet::discovery;
use snapfleet::fetch::TrackerClient;
use snapfleet::index::SnapshotIndex;
use snapfleet::metrics::Metrics;
use snapfleet::scraper::{Collector, Prober, Scraper};

use support::{hash_for_slot, spawn_sidecar, TestServer};

const SIDECAR_COUNT: usize = 4;

/// Four sidecars, a scraper at 50 ms, a collector, and a tracker client: the
/// index converges on exactly one source per sidecar, newest first.
#[tokio::test(flavor = "multi_thread")]
async fn scrapes_fleet_and_serves_best_snapshots() -> Result<()> {
    let mut sidecars = Vec::new();
    let mut targets = Vec::new();
    for slot in 100..100 + SIDECAR_COUNT as u64 {
        let (server, ledger) = spawn_sidecar(&[slot]).await;
        targets.push(server.host_port());
        sidecars.push((server, ledger));
    }

    let group = TargetGroup {
        group: "test".to_owned(),
        scheme: "http".to_owned(),
        static_targets: Some(StaticTargets {
            targets: targets.clone(),
        }),
        ..TargetGroup::default()
    };

    let index = Arc::new(SnapshotIndex::new());
    let metrics = Arc::new(Metrics::new());
    let collector = Collector::start(Arc::clone(&index), Arc::clone(&metrics));
    let scraper = Scraper::new(Prober::new(&group)?, discovery::new_from_config(&group)?);
    scraper.start(collector.probes(), Duration::from_millis(50));

    // Give the scraper up to 1.25s to observe every sidecar.
    let mut converged = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        if index.get_best(None, None).len() == SIDECAR_COUNT {
            converged = true;
            break;
        }
    }
    assert!(converged, "scrape did not converge in time");
    scraper.close().await;

    let tracker_server = TestServer::launch(snapfleet::tracker::router(
        Arc::clone(&index),
        "http://127.0.0.1:1",
        10_000,
    ))
    .await;
    let client = TrackerClient::new(tracker_server.url());

    let sources = client.get_best_snapshots(-1).await?;
    assert_eq!(sources.len(), SIDECAR_COUNT);
    assert_eq!(
        sources.iter().map(|s| s.info.slot).collect::<Vec<_>>(),
        [103, 102, 101, 100]
    );
    for source in &sources {
        assert!(!source.target.is_empty());
        assert!(targets
            .iter()
            .any(|target| source.target == format!("http://{target}")));
        assert_eq!(source.info.files.len(), 1);
        let file = &source.info.files[0];
        assert_eq!(file.hash.to_string(), hash_for_slot(source.info.slot));
        assert!(file.mod_time.is_some());
        assert_eq!(source.info.total_size, 1);
    }

    // A full snapshot anchors a chain at its own slot.
    let at_slot = client.get_snapshot_at_slot(103).await?;
    assert_eq!(at_slot.len(), 1);
    assert_eq!(at_slot[0].info.slot, 103);
    assert!(client.get_snapshot_at_slot(42).await?.is_empty());

    tracker_server.shutdown().await;
    collector.close().await;
    for (server, _ledger) in sidecars {
        server.shutdown().await;
    }
    Ok(())
}

/// A stalled collector must not wedge the scraper: a fresh tick supersedes
/// the stuck round and `close` still completes. Late results are simply
/// dropped.
#[tokio::test(flavor = "multi_thread")]
async fn stalled_collector_does_not_deadlock_scraper() -> Result<()> {
    let (server, _ledger) = spawn_sidecar(&[100]).await;
    let group = TargetGroup {
        group: "test".to_owned(),
        scheme: "http".to_owned(),
        static_targets: Some(StaticTargets {
            targets: vec![server.host_port()],
        }),
        ..TargetGroup::default()
    };

    // Nobody consumes this channel; every send blocks until its tick is
    // superseded or the scraper is closed.
    let (sink, _stalled_rx) = tokio::sync::mpsc::channel(1);
    let scraper = Scraper::new(Prober::new(&group)?, discovery::new_from_config(&group)?);
    scraper.start(sink, Duration::from_millis(50));

    tokio::time::sleep(Duration::from_millis(300)).await;
    tokio::time::timeout(Duration::from_secs(5), scraper.close())
        .await
        .expect("scraper close deadlocked on a stalled collector");

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn best_snapshots_clamps_max() -> Result<()> {
    let index = Arc::new(SnapshotIndex::new());
    for slot in 0..30u64 {
        index.upsert_by_target(
            "test",
            &format!("http://node-{slot}:13080"),
            vec![snapfleet::types::SnapshotInfo {
                slot: 1000 + slot,
                base_slot: 1000 + slot,
                hash: hash_for_slot(slot).parse().unwrap(),
                files: Vec::new(),
                total_size: 0,
            }],
            chrono::Utc::now(),
        );
    }
    let server = TestServer::launch(snapfleet::tracker::router(
        Arc::clone(&index),
        "http://127.0.0.1:1",
        10_000,
    ))
    .await;
    let client = TrackerClient::new(server.url());

    assert_eq!(client.get_best_snapshots(-1).await?.len(), 25);
    assert_eq!(client.get_best_snapshots(3).await?.len(), 3);
    assert_eq!(client.get_best_snapshots(9999).await?.len(), 25);

    server.shutdown().await;
    Ok(())
}

async fn spawn_rpc_returning_slot(slot: u64) -> TestServer {
    let app = Router::new().route(
        "/",
        post(move || async move {
            Json(serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": slot}))
        }),
    );
    TestServer::launch(app).await
}

#[tokio::test]
async fn health_reflects_index_and_rpc_state() -> Result<()> {
    let http = reqwest::Client::new();

    // Empty index: 500 regardless of RPC reachability.
    let index = Arc::new(SnapshotIndex::new());
    let server = TestServer::launch(snapfleet::tracker::router(
        Arc::clone(&index),
        "http://127.0.0.1:1",
        10_000,
    ))
    .await;
    let response = http
        .get(format!("{}/v1/health", server.url()))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["health"], "no snapshots found");
    server.shutdown().await;

    // Populated index but unreachable RPC: 502.
    index.upsert_by_target(
        "test",
        "http://a:13080",
        vec![snapfleet::types::SnapshotInfo {
            slot: 5000,
            base_slot: 5000,
            hash: hash_for_slot(5000).parse().unwrap(),
            files: Vec::new(),
            total_size: 0,
        }],
        chrono::Utc::now(),
    );
    let server = TestServer::launch(snapfleet::tracker::router(
        Arc::clone(&index),
        "http://127.0.0.1:1",
        10_000,
    ))
    .await;
    let response = http
        .get(format!("{}/v1/health", server.url()))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["health"], "rpc unhealthy");
    assert_eq!(body["max_snapshot"], 5000);
    server.shutdown().await;

    // Healthy: chain head within max_snapshot_age of the best snapshot.
    let rpc = spawn_rpc_returning_slot(5100).await;
    let server = TestServer::launch(snapfleet::tracker::router(
        Arc::clone(&index),
        &rpc.url(),
        10_000,
    ))
    .await;
    let response = http
        .get(format!("{}/v1/health", server.url()))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["health"], "healthy");
    assert_eq!(body["current_slot"], 5100);
    server.shutdown().await;

    // Snapshot too old: chain head far beyond the allowed age.
    let far_rpc = spawn_rpc_returning_slot(50_000).await;
    let server = TestServer::launch(snapfleet::tracker::router(
        Arc::clone(&index),
        &far_rpc.url(),
        10_000,
    ))
    .await;
    let response = http
        .get(format!("{}/v1/health", server.url()))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["health"], "snapshot too old");
    server.shutdown().await;

    rpc.shutdown().await;
    far_rpc.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn internal_listener_serves_metrics_and_reload() -> Result<()> {
    let metrics = Arc::new(Metrics::new());
    metrics.probes_total.inc();
    let (reload_tx, mut reload_rx) = tokio::sync::mpsc::channel(1);
    let server =
        TestServer::launch(snapfleet::tracker::internal_router(metrics, reload_tx)).await;
    let http = reqwest::Client::new();

    let rendered = http
        .get(format!("{}/metrics", server.url()))
        .send()
        .await?
        .text()
        .await?;
    assert!(rendered.contains("snapfleet_probes_total 1"));

    let reload = http
        .post(format!("{}/reload", server.url()))
        .send()
        .await?;
    assert_eq!(reload.status(), reqwest::StatusCode::OK);
    assert!(reload_rx.try_recv().is_ok(), "reload signal not raised");

    // GET on /reload is not allowed.
    let bad_method = http.get(format!("{}/reload", server.url())).send().await?;
    assert_eq!(bad_method.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);

    server.shutdown().await;
    Ok(())
}
