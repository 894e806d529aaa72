//! Central tracker: query API over the snapshot index, plus the internal
//! operational listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;

use crate::errors::{FleetError, FleetResult};
use crate::index::{SnapshotEntry, SnapshotIndex};
use crate::metrics::Metrics;
use crate::types::SnapshotSource;

/// Most entries a single best-snapshots query may return.
const MAX_BEST_SNAPSHOTS: usize = 25;

#[derive(Clone)]
struct TrackerState {
    index: Arc<SnapshotIndex>,
    rpc: ChainRpcClient,
    max_snapshot_age: u64,
}

/// Builds the public tracker API router.
pub fn router(index: Arc<SnapshotIndex>, rpc_url: &str, max_snapshot_age: u64) -> Router {
    let state = TrackerState {
        index,
        rpc: ChainRpcClient::new(rpc_url),
        max_snapshot_age,
    };
    Router::new()
        .route("/v1/snapshots", get(get_snapshots))
        .route("/v1/best_snapshots", get(get_best_snapshots))
        .route("/v1/health", get(health))
        .with_state(state)
}

/// Serves the public tracker API until the listener fails.
pub async fn serve(
    index: Arc<SnapshotIndex>,
    rpc_url: &str,
    max_snapshot_age: u64,
    addr: SocketAddr,
) -> FleetResult<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(?addr, "tracker listening");
    axum::serve(listener, router(index, rpc_url, max_snapshot_age))
        .await
        .map_err(|err| FleetError::Io(std::io::Error::other(err)))
}

fn to_sources(entries: Vec<Arc<SnapshotEntry>>) -> Vec<SnapshotSource> {
    entries
        .iter()
        .map(|entry| SnapshotSource {
            info: entry.info.clone(),
            target: entry.target.clone(),
            updated_at: entry.updated_at,
        })
        .collect()
}

#[derive(Deserialize)]
struct SnapshotsQuery {
    #[serde(default)]
    slot: u64,
}

async fn get_snapshots(
    State(state): State<TrackerState>,
    Query(query): Query<SnapshotsQuery>,
) -> Json<Vec<SnapshotSource>> {
    let entries = if query.slot == 0 {
        state.index.get_all()
    } else {
        state.index.get_at_slot(query.slot, None)
    };
    Json(to_sources(entries))
}

#[derive(Deserialize)]
struct BestSnapshotsQuery {
    #[serde(default)]
    max: i64,
}

async fn get_best_snapshots(
    State(state): State<TrackerState>,
    Query(query): Query<BestSnapshotsQuery>,
) -> Json<Vec<SnapshotSource>> {
    let max = if query.max < 0 || query.max > MAX_BEST_SNAPSHOTS as i64 {
        MAX_BEST_SNAPSHOTS
    } else {
        query.max as usize
    };
    Json(to_sources(state.index.get_best(Some(max), None)))
}

#[derive(Serialize)]
struct HealthResponse {
    max_snapshot: u64,
    current_slot: u64,
    health: &'static str,
}

async fn health(State(state): State<TrackerState>) -> (StatusCode, Json<HealthResponse>) {
    let entries = state.index.get_best(Some(1), None);
    let Some(best) = entries.first() else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(HealthResponse {
                max_snapshot: 0,
                current_slot: 0,
                health: "no snapshots found",
            }),
        );
    };
    let max_snapshot = best.info.slot;

    let current_slot = match state.rpc.get_slot().await {
        Ok(slot) => slot,
        Err(_) => {
            return (
                StatusCode::BAD_GATEWAY,
                Json(HealthResponse {
                    max_snapshot,
                    current_slot: 0,
                    health: "rpc unhealthy",
                }),
            )
        }
    };

    if current_slot.saturating_sub(max_snapshot) > state.max_snapshot_age {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                max_snapshot,
                current_slot,
                health: "snapshot too old",
            }),
        );
    }
    (
        StatusCode::OK,
        Json(HealthResponse {
            max_snapshot,
            current_slot,
            health: "healthy",
        }),
    )
}

/// Minimal JSON-RPC client for the chain's `getSlot` call.
#[derive(Clone)]
struct ChainRpcClient {
    client: reqwest::Client,
    url: String,
}

#[derive(Deserialize)]
struct GetSlotResponse {
    result: Option<u64>,
}

impl ChainRpcClient {
    fn new(url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .expect("rpc client");
        ChainRpcClient {
            client,
            url: url.to_owned(),
        }
    }

    async fn get_slot(&self) -> FleetResult<u64> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getSlot",
            "params": [{"commitment": "finalized"}],
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|err| FleetError::http("get slot", err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FleetError::remote("get slot", status));
        }
        let parsed: GetSlotResponse = response
            .json()
            .await
            .map_err(|err| FleetError::Protocol(format!("get slot: {err}")))?;
        parsed
            .result
            .ok_or_else(|| FleetError::Protocol("get slot: missing result".to_owned()))
    }
}

#[derive(Clone)]
struct InternalState {
    metrics: Arc<Metrics>,
    reload: mpsc::Sender<()>,
}

/// Builds the internal operational router (`/reload`, `/metrics`).
pub fn internal_router(metrics: Arc<Metrics>, reload: mpsc::Sender<()>) -> Router {
    let state = InternalState { metrics, reload };
    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/reload", post(trigger_reload))
        .with_state(state)
}

/// Serves the internal listener until it fails.
pub async fn serve_internal(
    metrics: Arc<Metrics>,
    reload: mpsc::Sender<()>,
    addr: SocketAddr,
) -> FleetResult<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(?addr, "internal listener ready");
    axum::serve(listener, internal_router(metrics, reload))
        .await
        .map_err(|err| FleetError::Io(std::io::Error::other(err)))
}

async fn render_metrics(State(state): State<InternalState>) -> String {
    state.metrics.render()
}

async fn trigger_reload(State(state): State<InternalState>) -> &'static str {
    // A full queue means a reload is already pending.
    let _ = state.reload.try_send(());
    "reloaded\n"
}
