use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SnapshotHash;

/// Archive extensions a snapshot file may carry.
pub const ALLOWED_EXTENSIONS: [&str; 5] = [".tar", ".tar.bz2", ".tar.gz", ".tar.zst", ".tar.xz"];

pub fn is_allowed_extension(ext: &str) -> bool {
    ALLOWED_EXTENSIONS.contains(&ext)
}

/// A single snapshot archive on disk, either full or incremental.
///
/// `base_slot == 0` marks a full snapshot; an incremental snapshot extends
/// the full snapshot at `base_slot` up to `slot`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub file_name: String,
    pub slot: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub base_slot: u64,
    pub hash: SnapshotHash,
    pub ext: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mod_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: u64,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl SnapshotFile {
    pub fn is_full(&self) -> bool {
        self.base_slot == 0
    }

    /// Re-composes the canonical file name from the parsed fields.
    ///
    /// For every name accepted by [`parse_snapshot_file_name`] this returns a
    /// byte-identical string.
    pub fn canonical_name(&self) -> String {
        if self.is_full() {
            format!("snapshot-{}-{}{}", self.slot, self.hash, self.ext)
        } else {
            format!(
                "incremental-snapshot-{}-{}-{}{}",
                self.base_slot, self.slot, self.hash, self.ext
            )
        }
    }

    /// Preference order: best snapshot first.
    ///
    /// Higher slot wins; at equal slot a full snapshot beats any incremental
    /// (and a lower base beats a higher one); the hash breaks remaining ties
    /// ascending.
    pub fn cmp_preference(&self, other: &Self) -> Ordering {
        other
            .slot
            .cmp(&self.slot)
            .then(self.base_slot.cmp(&other.base_slot))
            .then(self.hash.cmp(&other.hash))
    }

    /// Positional order used for chain lookup: ascending `(slot, base_slot,
    /// hash)` so that the first entry at a given slot is the full snapshot.
    pub fn cmp_position(&self, other: &Self) -> Ordering {
        self.slot
            .cmp(&other.slot)
            .then(self.base_slot.cmp(&other.base_slot))
            .then(self.hash.cmp(&other.hash))
    }
}

/// A complete snapshot lineage: one full snapshot optionally extended by
/// incrementals, ordered oldest to newest.
///
/// `slot` and `hash` mirror the newest file in the chain; `base_slot` is the
/// chain anchor, i.e. the slot of the full snapshot at `files[0]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub slot: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub base_slot: u64,
    pub hash: SnapshotHash,
    pub files: Vec<SnapshotFile>,
    #[serde(rename = "size")]
    pub total_size: u64,
}

impl SnapshotInfo {
    /// The full snapshot anchoring the chain.
    pub fn full(&self) -> Option<&SnapshotFile> {
        self.files.first().filter(|file| file.is_full())
    }

    /// The newest file in the chain.
    pub fn tail(&self) -> Option<&SnapshotFile> {
        self.files.last()
    }

    /// Preference order between chains, best first, judged by their tails.
    pub fn cmp_preference(&self, other: &Self) -> Ordering {
        match (self.tail(), other.tail()) {
            (Some(a), Some(b)) => a.cmp_preference(b),
            _ => other
                .slot
                .cmp(&self.slot)
                .then(self.base_slot.cmp(&other.base_slot)),
        }
    }
}

/// A snapshot chain annotated with the peer serving it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSource {
    #[serde(flatten)]
    pub info: SnapshotInfo,
    pub target: String,
    pub updated_at: DateTime<Utc>,
}

/// Parses a snapshot file name into its fields.
///
/// Accepted grammars:
///
/// ```text
/// snapshot-<slot>-<base58 hash><ext>
/// incremental-snapshot-<base_slot>-<slot>-<base58 hash><ext>
/// ```
///
/// The extension is the last two dotted suffixes concatenated. Returns `None`
/// for names with whitespace in the stem, unparseable slot numbers, hashes
/// that are not 32 bytes of base58, incrementals whose slot does not exceed
/// their base slot, and unrecognized prefixes.
pub fn parse_snapshot_file_name(name: &str) -> Option<SnapshotFile> {
    let mut stem = name;
    let mut ext = String::new();
    for _ in 0..2 {
        if let Some(idx) = stem.rfind('.') {
            ext.insert_str(0, &stem[idx..]);
            stem = &stem[..idx];
        }
    }
    if stem.chars().any(char::is_whitespace) {
        return None;
    }

    if let Some(rest) = stem.strip_prefix("incremental-snapshot-") {
        let mut parts = rest.splitn(3, '-');
        let base_slot: u64 = parts.next()?.parse().ok()?;
        let slot: u64 = parts.next()?.parse().ok()?;
        let hash: SnapshotHash = parts.next()?.parse().ok()?;
        if slot <= base_slot {
            return None;
        }
        Some(SnapshotFile {
            file_name: name.to_owned(),
            slot,
            base_slot,
            hash,
            ext,
            mod_time: None,
            size: 0,
        })
    } else if let Some(rest) = stem.strip_prefix("snapshot-") {
        let mut parts = rest.splitn(2, '-');
        let slot: u64 = parts.next()?.parse().ok()?;
        let hash: SnapshotHash = parts.next()?.parse().ok()?;
        Some(SnapshotFile {
            file_name: name.to_owned(),
            slot,
            base_slot: 0,
            hash,
            ext,
            mod_time: None,
            size: 0,
        })
    } else {
        None
    }
}
