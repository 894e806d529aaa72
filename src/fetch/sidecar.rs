//! Typed client for the sidecar API.

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{ACCEPT, LAST_MODIFIED};
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::errors::{FleetError, FleetResult};
use crate::types::SnapshotInfo;

/// Observes one snapshot download.
///
/// [`ProgressHook::begin`] is called exactly once per download; the returned
/// sink sees every chunk and is dropped exactly once when the download ends,
/// successfully or not.
pub trait ProgressHook: Send + Sync {
    fn begin(&self, name: &str, size: u64) -> Box<dyn ProgressSink>;
}

pub trait ProgressSink: Send {
    fn advance(&mut self, bytes: u64);
}

/// Progress hook that ignores all events.
pub struct NoopProgress;

impl ProgressHook for NoopProgress {
    fn begin(&self, _name: &str, _size: u64) -> Box<dyn ProgressSink> {
        Box::new(NoopSink)
    }
}

struct NoopSink;

impl ProgressSink for NoopSink {
    fn advance(&mut self, _bytes: u64) {}
}

/// Progress hook that logs a line per completed download.
pub fn log_progress_hook() -> Arc<dyn ProgressHook> {
    Arc::new(LogProgress)
}

struct LogProgress;

impl ProgressHook for LogProgress {
    fn begin(&self, name: &str, size: u64) -> Box<dyn ProgressSink> {
        info!(snapshot = name, size, "download starting");
        Box::new(LogSink {
            name: name.to_owned(),
            transferred: 0,
        })
    }
}

struct LogSink {
    name: String,
    transferred: u64,
}

impl ProgressSink for LogSink {
    fn advance(&mut self, bytes: u64) {
        self.transferred += bytes;
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        info!(
            snapshot = %self.name,
            transferred = self.transferred,
            "download finished"
        );
    }
}

/// Client for one node's sidecar API.
#[derive(Clone)]
pub struct SidecarClient {
    client: reqwest::Client,
    base_url: String,
    progress: Arc<dyn ProgressHook>,
}

impl SidecarClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        SidecarClient::with_client(reqwest::Client::new(), base_url)
    }

    /// Builds a client reusing an existing HTTP client, e.g. the prober's
    /// pooled one.
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        SidecarClient {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            progress: Arc::new(NoopProgress),
        }
    }

    pub fn with_progress_hook(mut self, hook: Arc<dyn ProgressHook>) -> Self {
        self.progress = hook;
        self
    }

    /// Fetches the node's snapshot inventory.
    pub async fn list_snapshots(&self) -> FleetResult<Vec<SnapshotInfo>> {
        let url = format!("{}/v1/snapshots", self.base_url);
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| FleetError::http("list snapshots", err))?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(FleetError::remote("list snapshots", status));
        }
        response
            .json()
            .await
            .map_err(|err| FleetError::Protocol(format!("list snapshots: {err}")))
    }

    /// Opens a download of one snapshot file.
    ///
    /// The returned stream is guaranteed to carry a known content length.
    pub async fn stream_snapshot(&self, name: &str) -> FleetResult<SnapshotStream> {
        let url = format!("{}/v1/snapshot/{name}", self.base_url);
        debug!(snapshot_url = %url, "downloading snapshot");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FleetError::http("download snapshot", err))?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(FleetError::remote("download snapshot", status));
        }
        let Some(length) = response.content_length() else {
            return Err(FleetError::Protocol("content length unknown".to_owned()));
        };
        Ok(SnapshotStream { response, length })
    }

    /// Downloads a snapshot into `dest_dir` atomically.
    ///
    /// The body is written to `.tmp.<name>` and renamed over the final name
    /// only after the copy fully succeeded; the file's mtime is then set to
    /// the server's `Last-Modified` on a best-effort basis.
    pub async fn download_snapshot_file(&self, dest_dir: &Path, name: &str) -> FleetResult<()> {
        let stream = self.stream_snapshot(name).await?;
        let length = stream.content_length();
        let mod_time = stream.last_modified();

        let tmp_path = dest_dir.join(format!(".tmp.{name}"));
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        let mut sink = self.progress.begin(name, length);
        let mut body = stream.into_byte_stream();

        let copied: FleetResult<()> = async {
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|err| FleetError::http("download snapshot", err))?;
                file.write_all(&chunk).await?;
                sink.advance(chunk.len() as u64);
            }
            file.flush().await?;
            Ok(())
        }
        .await;
        drop(sink);
        drop(file);
        if let Err(err) = copied {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        let dest_path = dest_dir.join(name);
        tokio::fs::rename(&tmp_path, &dest_path).await?;

        if let Some(mod_time) = mod_time {
            let _ = set_mod_time(&dest_path, mod_time);
        }
        Ok(())
    }
}

fn set_mod_time(path: &Path, mod_time: DateTime<Utc>) -> std::io::Result<()> {
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.set_modified(SystemTime::from(mod_time))
}

/// An open snapshot download with validated headers.
pub struct SnapshotStream {
    response: reqwest::Response,
    length: u64,
}

impl SnapshotStream {
    pub fn content_length(&self) -> u64 {
        self.length
    }

    /// The server's `Last-Modified` header, when present and well-formed.
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        let value = self.response.headers().get(LAST_MODIFIED)?;
        let raw = value.to_str().ok()?;
        DateTime::parse_from_rfc2822(raw)
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc))
    }

    pub fn into_byte_stream(self) -> BoxStream<'static, reqwest::Result<bytes::Bytes>> {
        self.response.bytes_stream().boxed()
    }
}
