use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use snapfleet::config::Config;
use snapfleet::fetch::{self, FetchParams};
use snapfleet::index::SnapshotIndex;
use snapfleet::metrics::Metrics;
use snapfleet::scraper::{Collector, ScraperManager};
use snapfleet::{sidecar, tracker};

/// Index entries older than this many scrape intervals are swept.
const STALE_SWEEP_FACTOR: u32 = 5;

#[derive(Parser)]
#[command(author, version, about = "Snapshot distribution fabric for blockchain clusters")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the local snapshot inventory of a node
    Sidecar {
        /// Path to the ledger dir holding snapshot archives
        #[arg(long, value_name = "DIR")]
        ledger: PathBuf,

        #[arg(long, default_value = "0.0.0.0:13080")]
        listen: SocketAddr,
    },
    /// Scrape sidecars across the fleet and answer snapshot queries
    Tracker {
        /// Path to the YAML config file
        #[arg(long, value_name = "PATH")]
        config: PathBuf,

        #[arg(long, default_value = "0.0.0.0:8458")]
        listen: SocketAddr,

        /// Listen address for /reload and /metrics; do not expose publicly
        #[arg(long, default_value = "127.0.0.1:8457")]
        internal_listen: SocketAddr,

        /// Chain RPC endpoint used by the health check
        #[arg(long, value_name = "URL", default_value = "http://127.0.0.1:8899")]
        rpc: String,

        /// Slots a snapshot may trail the chain head before health degrades
        #[arg(long, default_value_t = 10_000)]
        max_snapshot_age: u64,
    },
    /// Fetch the freshest usable snapshot from the fleet
    Fetch {
        /// Path to the ledger dir downloads land in
        #[arg(long, value_name = "DIR")]
        ledger: PathBuf,

        /// Tracker URL to query for snapshot sources
        #[arg(long, value_name = "URL")]
        tracker: String,

        /// Minimum slot distance before a download pays off
        #[arg(long, default_value_t = 500)]
        min_age: u64,

        /// Maximum slots a candidate snapshot may trail the best one
        #[arg(long, default_value_t = 10_000)]
        max_age: u64,

        /// Global deadline for the whole fetch run
        #[arg(long, value_name = "DURATION", default_value = "10m", value_parser = humantime::parse_duration)]
        download_timeout: Duration,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Sidecar { ledger, listen } => run_sidecar(ledger, listen).await,
        Commands::Tracker {
            config,
            listen,
            internal_listen,
            rpc,
            max_snapshot_age,
        } => run_tracker(config, listen, internal_listen, rpc, max_snapshot_age).await,
        Commands::Fetch {
            ledger,
            tracker,
            min_age,
            max_age,
            download_timeout,
        } => {
            run_fetch(
                FetchParams {
                    ledger_dir: ledger,
                    tracker_url: tracker,
                    min_age,
                    max_age,
                },
                download_timeout,
            )
            .await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_sidecar(ledger: PathBuf, listen: SocketAddr) -> Result<()> {
    tokio::select! {
        served = sidecar::serve(ledger, listen) => served.map_err(Into::into),
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    }
}

async fn run_tracker(
    config_path: PathBuf,
    listen: SocketAddr,
    internal_listen: SocketAddr,
    rpc: String,
    max_snapshot_age: u64,
) -> Result<()> {
    let config = Config::load(&config_path)?;
    let scrape_interval = config.scrape_interval;

    let index = Arc::new(SnapshotIndex::new());
    let metrics = Arc::new(Metrics::new());
    let collector = Collector::start(Arc::clone(&index), Arc::clone(&metrics));

    // The scrape manager lives in its own task so /reload and SIGHUP can
    // rebuild it without racing the servers. On shutdown the task resets the
    // manager, which closes every scraper and releases their send-handles,
    // letting the collector drain out.
    let (reload_tx, mut reload_rx) = mpsc::channel::<()>(1);
    let shutdown = CancellationToken::new();
    let manager_shutdown = shutdown.clone();
    let probes = collector.probes();
    let reload_task = tokio::spawn(async move {
        let mut manager = ScraperManager::new(probes);
        manager.update(&config).await;
        loop {
            tokio::select! {
                _ = manager_shutdown.cancelled() => break,
                received = reload_rx.recv() => {
                    if received.is_none() {
                        break;
                    }
                    match Config::load(&config_path) {
                        Ok(config) => {
                            info!("reloading configuration");
                            manager.update(&config).await;
                        }
                        Err(err) => error!(%err, "failed to reload config"),
                    }
                }
            }
        }
        manager.reset().await;
    });

    #[cfg(unix)]
    spawn_sighup_reload(reload_tx.clone());

    let sweep_index = Arc::clone(&index);
    tokio::spawn(async move {
        let cutoff_age = scrape_interval * STALE_SWEEP_FACTOR;
        let mut ticker = tokio::time::interval(scrape_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let cutoff = chrono::Utc::now()
                - chrono::Duration::from_std(cutoff_age).unwrap_or(chrono::Duration::zero());
            let swept = sweep_index.delete_older_than(cutoff);
            if swept > 0 {
                warn!(swept, "removed stale index entries");
            }
        }
    });

    let internal = tokio::spawn(tracker::serve_internal(
        Arc::clone(&metrics),
        reload_tx,
        internal_listen,
    ));
    let public = tokio::spawn({
        let index = Arc::clone(&index);
        async move { tracker::serve(index, &rpc, max_snapshot_age, listen).await }
    });

    let result = tokio::select! {
        served = internal => served.map_err(anyhow::Error::from).and_then(|inner| inner.map_err(Into::into)),
        served = public => served.map_err(anyhow::Error::from).and_then(|inner| inner.map_err(Into::into)),
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    shutdown.cancel();
    let _ = reload_task.await;
    collector.close().await;
    result
}

#[cfg(unix)]
fn spawn_sighup_reload(reload: mpsc::Sender<()>) {
    tokio::spawn(async move {
        let Ok(mut hangup) = signal::unix::signal(signal::unix::SignalKind::hangup()) else {
            warn!("unable to install SIGHUP handler");
            return;
        };
        while hangup.recv().await.is_some() {
            let _ = reload.try_send(());
        }
    });
}

async fn run_fetch(params: FetchParams, download_timeout: Duration) -> Result<()> {
    let cancel = CancellationToken::new();
    let work = fetch::run(&params, &cancel);

    tokio::select! {
        finished = tokio::time::timeout(download_timeout, work) => match finished {
            Ok(result) => result.map_err(Into::into),
            Err(_) => {
                cancel.cancel();
                Err(anyhow!("download timeout of {download_timeout:?} exceeded"))
            }
        },
        _ = signal::ctrl_c() => {
            cancel.cancel();
            Err(anyhow!("interrupted"))
        }
    }
}
