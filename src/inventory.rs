//! Scans a ledger directory for snapshot archives and reconstructs the
//! snapshot chains they form.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::errors::FleetResult;
use crate::types::{parse_snapshot_file_name, SnapshotFile, SnapshotInfo};

/// Lists all snapshot files in a ledger dir, best first.
///
/// Files that fail to stat are skipped; a directory read failure is fatal.
pub fn list_snapshot_files(ledger_dir: &Path) -> FleetResult<Vec<SnapshotFile>> {
    let mut files = scan_snapshot_files(ledger_dir)?;
    files.sort_by(SnapshotFile::cmp_preference);
    Ok(files)
}

/// Lists all complete snapshot chains in a ledger dir, best first.
///
/// Every file acts as a potential chain tail; chains that do not bottom out
/// at a full snapshot are discarded.
pub fn list_snapshots(ledger_dir: &Path) -> FleetResult<Vec<SnapshotInfo>> {
    let mut files = scan_snapshot_files(ledger_dir)?;
    // Ascending position order makes the full snapshot the first match at any
    // slot during chain lookup.
    files.sort_by(SnapshotFile::cmp_position);

    let mut infos: Vec<SnapshotInfo> = files
        .iter()
        .filter_map(|tail| build_snapshot_info(&files, tail))
        .collect();
    infos.sort_by(SnapshotInfo::cmp_preference);
    Ok(infos)
}

fn scan_snapshot_files(ledger_dir: &Path) -> FleetResult<Vec<SnapshotFile>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(ledger_dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(_) => continue,
        };
        if !file_type.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(mut file) = parse_snapshot_file_name(name) else {
            continue;
        };
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        file.size = meta.len();
        file.mod_time = meta.modified().ok().map(DateTime::<Utc>::from);
        files.push(file);
    }
    Ok(files)
}

/// Reconstructs the chain ending at `tail`.
///
/// `files` must be sorted in position order. Returns `None` when a link is
/// missing before a full snapshot is reached.
fn build_snapshot_info(files: &[SnapshotFile], tail: &SnapshotFile) -> Option<SnapshotInfo> {
    let mut chain = vec![tail.clone()];
    let mut total_size = tail.size;
    loop {
        let base = chain.last().map(|file| file.base_slot).unwrap_or(0);
        if base == 0 {
            break;
        }
        let idx = files.partition_point(|file| file.slot < base);
        let link = files.get(idx).filter(|file| file.slot == base)?;
        total_size += link.size;
        chain.push(link.clone());
    }
    chain.reverse();
    Some(SnapshotInfo {
        slot: tail.slot,
        base_slot: chain[0].slot,
        hash: tail.hash,
        files: chain,
        total_size,
    })
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;

    use tempfile::TempDir;

    use super::*;

    const HASH: &str = "AvFf9oS8A8U78HdjT9YG2sTTThLHJZmhaMn2g8vkWYnr";

    fn fake_ledger(names: &[String]) -> TempDir {
        let dir = TempDir::new().expect("tempdir");
        for name in names {
            let mut file = File::create(dir.path().join(name)).expect("create");
            file.write_all(b"x").expect("write");
        }
        dir
    }

    fn chain_ledger() -> TempDir {
        fake_ledger(&[
            format!("snapshot-50-{HASH}.tar.bz2"),
            format!("incremental-snapshot-50-100-{HASH}.tar.zst"),
            format!("snapshot-100-{HASH}.tar.bz2"),
            format!("incremental-snapshot-100-200-{HASH}.tar.zst"),
            format!("incremental-snapshot-200-300-{HASH}.tar.zst"),
            format!("incremental-snapshot-99999-1010101-{HASH}.tar.zst"),
        ])
    }

    #[test]
    fn reconstructs_chains_best_first() {
        let dir = chain_ledger();
        let infos = list_snapshots(dir.path()).expect("list");

        let tails: Vec<(u64, u64)> = infos
            .iter()
            .map(|info| (info.slot, info.base_slot))
            .collect();
        // The orphan incremental at 1010101 has no full under it and is
        // dropped; the full at 100 outranks the incremental chain at 100.
        assert_eq!(tails, [(300, 100), (200, 100), (100, 100), (100, 50), (50, 50)]);

        let sizes: Vec<u64> = infos.iter().map(|info| info.total_size).collect();
        assert_eq!(sizes, [3, 2, 1, 2, 1]);

        let top = &infos[0];
        assert_eq!(
            top.files
                .iter()
                .map(|file| file.file_name.as_str())
                .collect::<Vec<_>>(),
            [
                format!("snapshot-100-{HASH}.tar.bz2"),
                format!("incremental-snapshot-100-200-{HASH}.tar.zst"),
                format!("incremental-snapshot-200-300-{HASH}.tar.zst"),
            ]
        );
    }

    #[test]
    fn chains_are_complete_and_ordered() {
        let dir = chain_ledger();
        let infos = list_snapshots(dir.path()).expect("list");
        assert!(!infos.is_empty());

        for info in &infos {
            let files = &info.files;
            assert_eq!(files[0].base_slot, 0, "chain head must be full");
            for pair in files.windows(2) {
                assert_eq!(pair[1].base_slot, pair[0].slot, "broken link");
            }
            assert_eq!(info.slot, files.last().unwrap().slot);
            assert_eq!(info.base_slot, files[0].slot);
            assert_eq!(info.total_size, files.iter().map(|f| f.size).sum::<u64>());
        }

        for pair in infos.windows(2) {
            assert_ne!(
                pair[0].cmp_preference(&pair[1]),
                std::cmp::Ordering::Greater,
                "chains out of order"
            );
        }
    }

    #[test]
    fn skips_unparseable_files_and_dirs() {
        let dir = fake_ledger(&[format!("snapshot-7-{HASH}.tar.bz2")]);
        std::fs::create_dir(dir.path().join("rocksdb")).unwrap();
        File::create(dir.path().join("genesis.bin")).unwrap();

        let files = list_snapshot_files(dir.path()).expect("list");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].slot, 7);
        assert_eq!(files[0].size, 1);
        assert!(files[0].mod_time.is_some());
    }

    #[test]
    fn missing_directory_is_fatal() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(list_snapshots(&missing).is_err());
    }
}
