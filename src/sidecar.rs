//! Per-node HTTP service exposing the local snapshot inventory.

use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tracing::{error, info};

use crate::errors::{FleetError, FleetResult};
use crate::inventory;
use crate::types::{is_allowed_extension, parse_snapshot_file_name, SnapshotInfo};

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

#[derive(Clone)]
struct SidecarState {
    ledger_dir: Arc<PathBuf>,
}

/// Builds the sidecar API router.
pub fn router(ledger_dir: PathBuf) -> Router {
    let state = SidecarState {
        ledger_dir: Arc::new(ledger_dir),
    };
    Router::new()
        .route("/v1/snapshots", get(list_snapshots))
        .route("/v1/snapshot.tar.bz2", get(best_snapshot_bz2))
        .route("/v1/snapshot.tar.zst", get(best_snapshot_zst))
        .route("/v1/snapshot/:name", get(download_snapshot))
        .with_state(state)
}

/// Serves the sidecar API until the listener fails.
pub async fn serve(ledger_dir: PathBuf, addr: SocketAddr) -> FleetResult<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(?addr, "sidecar listening");
    axum::serve(listener, router(ledger_dir))
        .await
        .map_err(|err| FleetError::Io(std::io::Error::other(err)))
}

async fn list_snapshots(
    State(state): State<SidecarState>,
) -> Result<Json<Vec<SnapshotInfo>>, StatusCode> {
    let ledger_dir = Arc::clone(&state.ledger_dir);
    let infos = tokio::task::spawn_blocking(move || inventory::list_snapshots(&ledger_dir))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map_err(|err| {
            error!(%err, "failed to list snapshots");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(infos))
}

async fn best_snapshot_bz2(
    State(state): State<SidecarState>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    best_snapshot(state, method, headers, ".tar.bz2").await
}

async fn best_snapshot_zst(
    State(state): State<SidecarState>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    best_snapshot(state, method, headers, ".tar.zst").await
}

/// Serves the best full snapshot carrying the requested extension.
async fn best_snapshot(
    state: SidecarState,
    method: Method,
    headers: HeaderMap,
    ext: &str,
) -> Response {
    let ledger_dir = Arc::clone(&state.ledger_dir);
    let files = match tokio::task::spawn_blocking(move || inventory::list_snapshot_files(&ledger_dir))
        .await
    {
        Ok(Ok(files)) => files,
        Ok(Err(err)) => {
            error!(%err, "failed to list snapshot files");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    match files
        .iter()
        .find(|file| file.is_full() && file.ext == ext)
    {
        Some(best) => serve_snapshot(state, method, headers, best.file_name.clone()).await,
        None => (StatusCode::ACCEPTED, "no snapshot available").into_response(),
    }
}

async fn download_snapshot(
    State(state): State<SidecarState>,
    method: Method,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Response {
    // Reject odd requests before touching the file system.
    let Some(snapshot) = parse_snapshot_file_name(&name) else {
        info!(snapshot = %name, "ignoring snapshot request due to odd name");
        return snapshot_not_found();
    };
    if !is_allowed_extension(&snapshot.ext) {
        info!(snapshot = %name, "ignoring snapshot request due to odd extension");
        return snapshot_not_found();
    }

    serve_snapshot(state, method, headers, name).await
}

async fn serve_snapshot(
    state: SidecarState,
    method: Method,
    headers: HeaderMap,
    name: String,
) -> Response {
    let path = state.ledger_dir.join(&name);
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(snapshot = %name, "requested snapshot not found");
            return snapshot_not_found();
        }
        Err(err) => {
            error!(snapshot = %name, %err, "failed to open file");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let meta = match file.metadata().await {
        Ok(meta) => meta,
        Err(err) => {
            error!(snapshot = %name, %err, "stat failed on snapshot");
            return snapshot_not_found();
        }
    };
    let size = meta.len();

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Ok(mod_time) = meta.modified() {
        let formatted = DateTime::<Utc>::from(mod_time)
            .format(HTTP_DATE_FORMAT)
            .to_string();
        if let Ok(value) = HeaderValue::from_str(&formatted) {
            response_headers.insert(header::LAST_MODIFIED, value);
        }
    }

    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .map(|value| parse_range(value, size));

    let (status, start, length) = match range {
        None | Some(RangeSpec::Whole) => (StatusCode::OK, 0, size),
        Some(RangeSpec::Satisfiable { start, end }) => {
            let value = format!("bytes {start}-{end}/{size}");
            response_headers.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&value).expect("content-range header"),
            );
            (StatusCode::PARTIAL_CONTENT, start, end - start + 1)
        }
        Some(RangeSpec::Unsatisfiable) => {
            let value = format!("bytes */{size}");
            response_headers.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&value).expect("content-range header"),
            );
            response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(0u64));
            return (
                StatusCode::RANGE_NOT_SATISFIABLE,
                response_headers,
                Body::empty(),
            )
                .into_response();
        }
    };
    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));

    if method == Method::HEAD {
        return (status, response_headers, Body::empty()).into_response();
    }

    if start > 0 {
        if let Err(err) = file.seek(SeekFrom::Start(start)).await {
            error!(snapshot = %name, %err, "failed to seek snapshot");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }
    let stream = ReaderStream::new(file.take(length));
    (status, response_headers, Body::from_stream(stream)).into_response()
}

fn snapshot_not_found() -> Response {
    (StatusCode::NOT_FOUND, "snapshot not found").into_response()
}

enum RangeSpec {
    /// No usable range; serve the whole file with `200`.
    Whole,
    Satisfiable {
        start: u64,
        end: u64,
    },
    Unsatisfiable,
}

/// Parses a single-range `Range` header against a resource of `size` bytes.
///
/// Multi-range requests and malformed specs degrade to serving the whole
/// file; a syntactically valid range beyond the end is unsatisfiable.
fn parse_range(value: &str, size: u64) -> RangeSpec {
    let Some(spec) = value.strip_prefix("bytes=") else {
        return RangeSpec::Whole;
    };
    if spec.contains(',') {
        return RangeSpec::Whole;
    }
    let Some((start_raw, end_raw)) = spec.split_once('-') else {
        return RangeSpec::Whole;
    };

    if start_raw.is_empty() {
        // Suffix range: the final N bytes.
        let Ok(suffix) = end_raw.parse::<u64>() else {
            return RangeSpec::Whole;
        };
        if suffix == 0 || size == 0 {
            return RangeSpec::Unsatisfiable;
        }
        let length = suffix.min(size);
        return RangeSpec::Satisfiable {
            start: size - length,
            end: size - 1,
        };
    }

    let Ok(start) = start_raw.parse::<u64>() else {
        return RangeSpec::Whole;
    };
    if start >= size {
        return RangeSpec::Unsatisfiable;
    }
    let end = if end_raw.is_empty() {
        size - 1
    } else {
        match end_raw.parse::<u64>() {
            Ok(end) => end.min(size - 1),
            Err(_) => return RangeSpec::Whole,
        }
    };
    if end < start {
        return RangeSpec::Unsatisfiable;
    }
    RangeSpec::Satisfiable { start, end }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn satisfiable(value: &str, size: u64) -> Option<(u64, u64)> {
        match parse_range(value, size) {
            RangeSpec::Satisfiable { start, end } => Some((start, end)),
            _ => None,
        }
    }

    #[test]
    fn parses_byte_ranges() {
        assert_eq!(satisfiable("bytes=0-49", 100), Some((0, 49)));
        assert_eq!(satisfiable("bytes=50-", 100), Some((50, 99)));
        assert_eq!(satisfiable("bytes=-10", 100), Some((90, 99)));
        // End clamps to the resource size.
        assert_eq!(satisfiable("bytes=90-200", 100), Some((90, 99)));
        // Suffix longer than the file covers the whole file.
        assert_eq!(satisfiable("bytes=-500", 100), Some((0, 99)));
    }

    #[test]
    fn rejects_out_of_bounds_ranges() {
        assert!(matches!(
            parse_range("bytes=100-", 100),
            RangeSpec::Unsatisfiable
        ));
        assert!(matches!(
            parse_range("bytes=20-10", 100),
            RangeSpec::Unsatisfiable
        ));
        assert!(matches!(parse_range("bytes=-0", 100), RangeSpec::Unsatisfiable));
    }

    #[test]
    fn degrades_unusable_specs_to_whole_file() {
        assert!(matches!(parse_range("items=0-1", 100), RangeSpec::Whole));
        assert!(matches!(
            parse_range("bytes=0-1,5-9", 100),
            RangeSpec::Whole
        ));
        assert!(matches!(parse_range("bytes=abc-", 100), RangeSpec::Whole));
    }
}
