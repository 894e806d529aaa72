//! In-memory index of snapshot observations across the fleet.
//!
//! The index is process-lifetime only. Writers mutate the primary map and
//! both secondary indexes under one write lock, so readers never observe a
//! partially applied probe replacement. Internal inconsistency between the
//! primary map and a secondary index is a programmer bug and panics.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::types::SnapshotInfo;

/// One snapshot chain as observed on one target by one probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub group: String,
    pub target: String,
    pub info: SnapshotInfo,
    pub updated_at: DateTime<Utc>,
}

/// Primary key. Both the slot and the chain anchor are stored
/// bitwise-inverted so that ascending map iteration yields the newest chains
/// first, with a full chain (whose anchor equals its slot) ahead of any
/// incremental chain at the same slot.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct EntryKey {
    group: String,
    target: String,
    inv_slot: u64,
    inv_base_slot: u64,
}

impl EntryKey {
    fn new(group: &str, target: &str, info: &SnapshotInfo) -> Self {
        EntryKey {
            group: group.to_owned(),
            target: target.to_owned(),
            inv_slot: !info.slot,
            inv_base_slot: !info.base_slot,
        }
    }
}

/// Secondary index key ordered newest-first across all targets.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct SlotKey {
    inv_slot: u64,
    inv_base_slot: u64,
    group: String,
    target: String,
}

/// Secondary index key grouping chains by their anchor (full) slot.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct BaseKey {
    base_slot: u64,
    inv_slot: u64,
    group: String,
    target: String,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<EntryKey, Arc<SnapshotEntry>>,
    by_slot: BTreeSet<SlotKey>,
    by_base: BTreeSet<BaseKey>,
}

impl Inner {
    fn insert(&mut self, entry: SnapshotEntry) -> bool {
        let key = EntryKey::new(&entry.group, &entry.target, &entry.info);
        let replaced = self.remove(&key).is_some();
        self.by_slot.insert(slot_key(&key));
        self.by_base.insert(base_key(&key));
        self.entries.insert(key, Arc::new(entry));
        replaced
    }

    fn remove(&mut self, key: &EntryKey) -> Option<Arc<SnapshotEntry>> {
        let entry = self.entries.remove(key)?;
        if !self.by_slot.remove(&slot_key(key)) {
            panic!("snapshot index corrupted: slot index out of sync");
        }
        if !self.by_base.remove(&base_key(key)) {
            panic!("snapshot index corrupted: base-slot index out of sync");
        }
        Some(entry)
    }

    fn target_keys(&self, group: &str, target: &str) -> Vec<EntryKey> {
        let lower = EntryKey {
            group: group.to_owned(),
            target: target.to_owned(),
            inv_slot: 0,
            inv_base_slot: 0,
        };
        self.entries
            .range((Bound::Included(lower), Bound::Unbounded))
            .take_while(|(key, _)| key.group == group && key.target == target)
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn get(&self, key: &EntryKey) -> Arc<SnapshotEntry> {
        self.entries
            .get(key)
            .cloned()
            .unwrap_or_else(|| panic!("snapshot index corrupted: dangling secondary key"))
    }
}

fn slot_key(key: &EntryKey) -> SlotKey {
    SlotKey {
        inv_slot: key.inv_slot,
        inv_base_slot: key.inv_base_slot,
        group: key.group.clone(),
        target: key.target.clone(),
    }
}

fn base_key(key: &EntryKey) -> BaseKey {
    BaseKey {
        base_slot: !key.inv_base_slot,
        inv_slot: key.inv_slot,
        group: key.group.clone(),
        target: key.target.clone(),
    }
}

/// Transactional in-memory store of [`SnapshotEntry`] records.
#[derive(Default)]
pub struct SnapshotIndex {
    inner: RwLock<Inner>,
}

impl SnapshotIndex {
    pub fn new() -> Self {
        SnapshotIndex::default()
    }

    /// Replaces every entry owned by `(group, target)` with the given chains
    /// in one transaction. Returns the number of entries now present for the
    /// target.
    pub fn upsert_by_target(
        &self,
        group: &str,
        target: &str,
        infos: Vec<SnapshotInfo>,
        updated_at: DateTime<Utc>,
    ) -> usize {
        let mut inner = self.inner.write();
        for key in inner.target_keys(group, target) {
            inner.remove(&key);
        }
        let mut inserted = 0;
        for info in infos {
            inner.insert(SnapshotEntry {
                group: group.to_owned(),
                target: target.to_owned(),
                info,
                updated_at,
            });
            inserted += 1;
        }
        inserted
    }

    /// Deletes all entries owned by `(group, target)`. Returns the number
    /// deleted.
    pub fn delete_by_target(&self, group: &str, target: &str) -> usize {
        let mut inner = self.inner.write();
        let keys = inner.target_keys(group, target);
        let deleted = keys.len();
        for key in keys {
            inner.remove(&key);
        }
        deleted
    }

    /// Deletes entries whose probe observation is older than `cutoff`.
    pub fn delete_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut inner = self.inner.write();
        let stale: Vec<EntryKey> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.updated_at < cutoff)
            .map(|(key, _)| key.clone())
            .collect();
        let deleted = stale.len();
        for key in stale {
            inner.remove(&key);
        }
        deleted
    }

    /// Returns the best snapshots fleet-wide, newest first. `max` limits the
    /// result size; `group` restricts the scan to one target group.
    pub fn get_best(&self, max: Option<usize>, group: Option<&str>) -> Vec<Arc<SnapshotEntry>> {
        let inner = self.inner.read();
        let mut entries = Vec::new();
        for key in inner.by_slot.iter() {
            if let Some(group) = group {
                if key.group != group {
                    continue;
                }
            }
            if let Some(max) = max {
                if entries.len() >= max {
                    break;
                }
            }
            entries.push(inner.get(&EntryKey {
                group: key.group.clone(),
                target: key.target.clone(),
                inv_slot: key.inv_slot,
                inv_base_slot: key.inv_base_slot,
            }));
        }
        entries
    }

    /// Returns all chains anchored at the given full-snapshot slot, newest
    /// first.
    pub fn get_at_slot(&self, slot: u64, group: Option<&str>) -> Vec<Arc<SnapshotEntry>> {
        let inner = self.inner.read();
        let lower = BaseKey {
            base_slot: slot,
            inv_slot: 0,
            group: String::new(),
            target: String::new(),
        };
        inner
            .by_base
            .range((Bound::Included(lower), Bound::Unbounded))
            .take_while(|key| key.base_slot == slot)
            .filter(|key| group.map_or(true, |group| key.group == group))
            .map(|key| {
                inner.get(&EntryKey {
                    group: key.group.clone(),
                    target: key.target.clone(),
                    inv_slot: key.inv_slot,
                    inv_base_slot: !key.base_slot,
                })
            })
            .collect()
    }

    /// Returns every entry owned by `(group, target)`, newest first.
    pub fn get_by_target(&self, group: &str, target: &str) -> Vec<Arc<SnapshotEntry>> {
        let inner = self.inner.read();
        inner
            .target_keys(group, target)
            .iter()
            .map(|key| inner.get(key))
            .collect()
    }

    /// Returns every entry in the index, newest first.
    pub fn get_all(&self) -> Vec<Arc<SnapshotEntry>> {
        self.get_best(None, None)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
