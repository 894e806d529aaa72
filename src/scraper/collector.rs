use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::ProbeResult;
use crate::index::SnapshotIndex;
use crate::metrics::Metrics;

/// Single consumer of probe results, and the only writer of the index.
///
/// A failed probe is logged and skipped, leaving the target's previous
/// entries in place; a successful probe replaces the target's entries with
/// exactly the observed snapshot list.
pub struct Collector {
    sender: mpsc::Sender<ProbeResult>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Collector {
    pub fn start(index: Arc<SnapshotIndex>, metrics: Arc<Metrics>) -> Self {
        // Rendezvous-sized channel: back-pressure is bounded by the probes
        // in flight, and a superseded tick releases its blocked senders.
        let (sender, receiver) = mpsc::channel(1);
        let task = tokio::spawn(run(index, metrics, receiver));
        Collector {
            sender,
            task: Mutex::new(Some(task)),
        }
    }

    /// A send-handle for scrapers to feed.
    pub fn probes(&self) -> mpsc::Sender<ProbeResult> {
        self.sender.clone()
    }

    /// Drains the channel and stops. All scraper-held send-handles must be
    /// gone by now, or this waits for them.
    pub async fn close(self) {
        let Collector { sender, task } = self;
        drop(sender);
        let handle = task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run(
    index: Arc<SnapshotIndex>,
    metrics: Arc<Metrics>,
    mut receiver: mpsc::Receiver<ProbeResult>,
) {
    while let Some(result) = receiver.recv().await {
        metrics.probes_total.inc();
        match result.result {
            Err(err) => {
                metrics.probe_failures_total.inc();
                warn!(target = %result.target, %err, "scrape failed");
            }
            Ok(infos) => {
                debug!(
                    target = %result.target,
                    num_snapshots = infos.len(),
                    "scrape success"
                );
                index.upsert_by_target(&result.group, &result.target, infos, result.time);
                metrics.index_entries.set(index.len() as i64);
            }
        }
    }
}
