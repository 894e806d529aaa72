//! Periodic fan-out scraping of sidecar inventories.

mod collector;
mod manager;
mod prober;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::discovery::Discoverer;
use crate::errors::{FleetError, FleetResult};
use crate::types::SnapshotInfo;

pub use collector::Collector;
pub use manager::ScraperManager;
pub use prober::Prober;

/// Outcome of one probe against one target.
pub struct ProbeResult {
    pub group: String,
    pub target: String,
    pub time: DateTime<Utc>,
    pub result: FleetResult<Vec<SnapshotInfo>>,
}

/// Periodically probes every discovered target of one group, feeding results
/// into the collector's channel.
///
/// A new tick supersedes the previous one: probes still in flight are
/// cancelled, and their pending sends are released, so a slow peer or a
/// stalled collector cannot block the next round.
pub struct Scraper {
    prober: Arc<Prober>,
    discoverer: Arc<dyn Discoverer>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Scraper {
    pub fn new(prober: Prober, discoverer: Arc<dyn Discoverer>) -> Self {
        Scraper {
            prober: Arc::new(prober),
            discoverer,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Starts the scrape loop. The first round runs immediately.
    pub fn start(&self, results: mpsc::Sender<ProbeResult>, interval: Duration) {
        let prober = Arc::clone(&self.prober);
        let discoverer = Arc::clone(&self.discoverer);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(run(prober, discoverer, cancel, results, interval));
        *self.task.lock() = Some(handle);
    }

    /// Cancels the scrape loop and waits for it to wind down.
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run(
    prober: Arc<Prober>,
    discoverer: Arc<dyn Discoverer>,
    cancel: CancellationToken,
    results: mpsc::Sender<ProbeResult>,
    interval: Duration,
) {
    info!(group = prober.group(), "starting scraper");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The interval's first tick completes immediately; consume it so the
    // round started below gets a full interval before being superseded.
    ticker.tick().await;

    loop {
        let tick = cancel.child_token();
        let round = tokio::spawn(scrape(
            Arc::clone(&prober),
            Arc::clone(&discoverer),
            tick.clone(),
            results.clone(),
        ));

        tokio::select! {
            _ = cancel.cancelled() => {
                tick.cancel();
                let _ = round.await;
                break;
            }
            _ = ticker.tick() => {
                // Supersede the running round; it unwinds on its own.
                tick.cancel();
            }
        }
    }

    info!(group = prober.group(), "stopping scraper");
}

async fn scrape(
    prober: Arc<Prober>,
    discoverer: Arc<dyn Discoverer>,
    cancel: CancellationToken,
    results: mpsc::Sender<ProbeResult>,
) {
    let discovery_start = Instant::now();
    let targets = tokio::select! {
        _ = cancel.cancelled() => return,
        discovered = discoverer.discover_targets() => match discovered {
            Ok(targets) => targets,
            Err(err) => {
                error!(group = prober.group(), %err, "service discovery failed");
                return;
            }
        }
    };

    let scrape_start = Instant::now();
    debug!(
        group = prober.group(),
        discovery_duration = ?discovery_start.elapsed(),
        num_targets = targets.len(),
        "scrape starting"
    );

    let mut probes = JoinSet::new();
    for target in targets {
        let prober = Arc::clone(&prober);
        let results = results.clone();
        let cancel = cancel.clone();
        probes.spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(FleetError::Cancelled),
                probed = prober.probe(&target) => probed,
            };
            if matches!(outcome, Err(FleetError::Cancelled)) {
                return;
            }
            let result = ProbeResult {
                group: prober.group().to_owned(),
                target: format!("{}://{}", prober.scheme(), target),
                time: Utc::now(),
                result: outcome,
            };
            // A superseded tick must not stay blocked on a stalled collector.
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = results.send(result) => {}
            }
        });
    }
    while probes.join_next().await.is_some() {}

    debug!(
        group = prober.group(),
        scrape_duration = ?scrape_start.elapsed(),
        "scrape finished"
    );
}
