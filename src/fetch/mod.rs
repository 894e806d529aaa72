//! Fetch decision engine and the snapshot download flow built on it.

mod sidecar;
mod tracker;

use std::path::{Path, PathBuf};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::{FleetError, FleetResult};
use crate::inventory;
use crate::types::{SnapshotFile, SnapshotInfo, SnapshotSource};

pub use sidecar::{NoopProgress, ProgressHook, ProgressSink, SidecarClient, SnapshotStream};
pub use tracker::TrackerClient;

/// Recommended next action after comparing local and remote snapshot state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Advice {
    /// Download both a full and an incremental snapshot.
    Fetch,
    /// Download a full snapshot; the local base is too old.
    FetchFull,
    /// The local full snapshot still anchors the best remote chain; only an
    /// incremental top-up is needed.
    FetchIncremental,
    /// The best remote snapshot is older than local state.
    RemoteIsOlder,
    /// No remote snapshot is available at all.
    NothingFound,
    /// Local state is fresh enough; do not download.
    UpToDate,
}

/// Decides whether a snapshot download is worthwhile.
///
/// `min_age` is the minimum slot distance between remote and local before a
/// download pays off; `max_age` bounds how far behind the best remote
/// snapshot a candidate may be. The returned `min_slot` is the lowest slot
/// any chosen download must beat (0 when no download is advised).
pub fn decide(
    local: &[SnapshotInfo],
    remote: &[SnapshotSource],
    min_age: u64,
    max_age: u64,
) -> (u64, Advice) {
    let Some(best_remote) = remote.first() else {
        return (0, Advice::NothingFound);
    };

    let remote_slot = best_remote.info.slot;
    let (local_slot, local_base_slot) = local
        .first()
        .map(|info| (info.slot, info.base_slot))
        .unwrap_or((0, 0));

    // Signed difference: remote may legitimately be behind local.
    if (remote_slot as i64) - (local_slot as i64) < (min_age as i64) {
        return (0, Advice::UpToDate);
    }

    let min_slot = remote_slot.saturating_sub(max_age);

    if local_base_slot < best_remote.info.base_slot {
        return (min_slot, Advice::FetchFull);
    }
    if local_base_slot == best_remote.info.base_slot {
        let full_hash_matches = local
            .first()
            .into_iter()
            .flat_map(|info| info.files.iter())
            .filter(|file| file.is_full())
            .any(|local_full| {
                best_remote
                    .info
                    .files
                    .iter()
                    .any(|remote_file| {
                        remote_file.is_full() && remote_file.hash == local_full.hash
                    })
            });
        if full_hash_matches {
            return (min_slot, Advice::FetchIncremental);
        }
    }
    if local_base_slot > best_remote.info.base_slot {
        return (min_slot, Advice::RemoteIsOlder);
    }
    (min_slot, Advice::Fetch)
}

/// Parameters for one fetch run.
pub struct FetchParams {
    pub ledger_dir: PathBuf,
    pub tracker_url: String,
    pub min_age: u64,
    pub max_age: u64,
}

/// Runs the full fetch flow: inventory, tracker query, decision, downloads.
///
/// Downloads run in parallel; the first failure cancels its siblings. The
/// caller's `cancel` token aborts everything.
pub async fn run(params: &FetchParams, cancel: &CancellationToken) -> FleetResult<()> {
    let local = inventory::list_snapshots(&params.ledger_dir)?;
    if let Some(best) = local.first() {
        info!(slot = best.slot, "found local snapshot");
    } else {
        info!("no local snapshot found");
    }

    let tracker = TrackerClient::new(params.tracker_url.as_str());
    let remote = tracker.get_best_snapshots(-1).await?;
    let (min_slot, advice) = decide(&local, &remote, params.min_age, params.max_age);
    info!(?advice, min_slot, "fetch decision");

    let source = match advice {
        Advice::NothingFound => return Err(FleetError::NoSnapshot),
        Advice::UpToDate => {
            info!("local snapshot is up-to-date");
            return Ok(());
        }
        Advice::RemoteIsOlder => {
            info!("remote snapshots are older than local state");
            return Ok(());
        }
        Advice::FetchIncremental => {
            // Only chains anchored at our local full snapshot are usable.
            let anchor = local.first().map(|info| info.base_slot).unwrap_or(0);
            let anchored = tracker.get_snapshot_at_slot(anchor).await?;
            match pick_source(anchored, min_slot) {
                Some(source) => source,
                None => {
                    warn!(anchor, "no usable incremental source, falling back to full fetch");
                    pick_source(remote, min_slot).ok_or(FleetError::NoSnapshot)?
                }
            }
        }
        Advice::Fetch | Advice::FetchFull => {
            pick_source(remote, min_slot).ok_or(FleetError::NoSnapshot)?
        }
    };

    let local_names: Vec<String> = local
        .iter()
        .flat_map(|info| info.files.iter())
        .map(|file| file.file_name.clone())
        .collect();
    let files: Vec<SnapshotFile> = source
        .info
        .files
        .iter()
        .filter(|file| !local_names.contains(&file.file_name))
        .cloned()
        .collect();
    if files.is_empty() {
        info!("every file of the chosen chain is already present");
        return Ok(());
    }

    info!(
        target = %source.target,
        slot = source.info.slot,
        files = files.len(),
        total_size = source.info.total_size,
        "downloading snapshot chain"
    );
    download_files(&source.target, &params.ledger_dir, files, cancel).await
}

fn pick_source(sources: Vec<SnapshotSource>, min_slot: u64) -> Option<SnapshotSource> {
    sources.into_iter().find(|source| source.info.slot >= min_slot)
}

async fn download_files(
    target: &str,
    dest_dir: &Path,
    files: Vec<SnapshotFile>,
    cancel: &CancellationToken,
) -> FleetResult<()> {
    let client = SidecarClient::new(target).with_progress_hook(sidecar::log_progress_hook());
    let job_cancel = cancel.child_token();
    let mut jobs = JoinSet::new();
    for file in files {
        let client = client.clone();
        let dest_dir = dest_dir.to_path_buf();
        let job_cancel = job_cancel.clone();
        jobs.spawn(async move {
            tokio::select! {
                _ = job_cancel.cancelled() => Err(FleetError::Cancelled),
                res = client.download_snapshot_file(&dest_dir, &file.file_name) => res,
            }
        });
    }

    let mut first_error = None;
    while let Some(joined) = jobs.join_next().await {
        let result = joined.unwrap_or(Err(FleetError::Cancelled));
        if let Err(err) = result {
            if first_error.is_none() {
                // Cancel the sibling downloads; keep draining for cleanup.
                job_cancel.cancel();
                first_error = Some(err);
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
