//! Shared helpers for integration tests: fake ledger dirs and test servers.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::time::SystemTime;

use axum::Router;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Arbitrary but consistent timestamp applied to fake snapshot files.
pub fn dummy_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2022, 4, 27, 15, 33, 20).unwrap()
}

/// A temp dir resembling a node's ledger dir.
pub struct FakeLedger {
    dir: TempDir,
}

impl FakeLedger {
    pub fn new() -> Self {
        FakeLedger {
            dir: TempDir::new().expect("tempdir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Adds a one-byte snapshot file stamped with [`dummy_time`].
    pub fn add_fake_file(&self, name: &str) {
        self.add_file_with_contents(name, b"x");
    }

    pub fn add_file_with_contents(&self, name: &str, contents: &[u8]) {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).expect("write fake snapshot");
        set_mod_time(&path, dummy_time());
    }
}

pub fn set_mod_time(path: &Path, mod_time: DateTime<Utc>) {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .expect("open for utime");
    file.set_modified(SystemTime::from(mod_time))
        .expect("set mtime");
}

/// Base58 hash deterministically derived from a slot number, like the fake
/// snapshots the sidecar tests serve.
pub fn hash_for_slot(slot: u64) -> String {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&slot.to_le_bytes());
    bs58::encode(bytes).into_string()
}

/// Canonical fake full-snapshot name for a slot.
pub fn full_snapshot_name(slot: u64) -> String {
    format!("snapshot-{slot}-{}.tar.bz2", hash_for_slot(slot))
}

/// An axum server bound to an ephemeral port with graceful shutdown.
pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn launch(app: Router) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
        });
        TestServer {
            addr,
            shutdown: shutdown_tx,
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn host_port(&self) -> String {
        self.addr.to_string()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

/// Spawns a sidecar with a fake ledger holding one full snapshot per slot.
pub async fn spawn_sidecar(slots: &[u64]) -> (TestServer, FakeLedger) {
    let ledger = FakeLedger::new();
    for &slot in slots {
        ledger.add_fake_file(&full_snapshot_name(slot));
    }
    let server = TestServer::launch(snapfleet::sidecar::router(ledger.path().to_path_buf())).await;
    (server, ledger)
}
