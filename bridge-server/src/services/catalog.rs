use crate::models::backup::{BackupRecord, Side, SideSet, SourceSnapshot};
use crate::services::linker::{self, LinkVia};
use std::collections::{BTreeMap, BTreeSet};

/// The in-memory projection of every backup across both stores.
///
/// A record exists only while at least one side holds a copy; every mutation
/// that empties a record's presence removes it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotCatalog {
    records: BTreeMap<String, BackupRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub added: usize,
    /// Ids known before that neither side lists any more.
    pub removed: Vec<String>,
    pub fuzzy_links: usize,
    pub unlinked_remote: usize,
    /// Ids whose remote copy carries a protected tag that disagrees with the record.
    pub retag: Vec<String>,
}

impl SnapshotCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = BackupRecord>) -> Self {
        let records = records
            .into_iter()
            .filter(|r| !r.presence.is_empty())
            .map(|r| (r.id.clone(), r))
            .collect();
        Self { records }
    }

    pub fn get(&self, id: &str) -> Option<&BackupRecord> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut BackupRecord> {
        self.records.get_mut(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &BackupRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn count_on(&self, side: Side) -> usize {
        self.records.values().filter(|r| r.presence.contains(side)).count()
    }

    pub fn to_vec(&self) -> Vec<BackupRecord> {
        self.records.values().cloned().collect()
    }

    /// Rebuilds presence from fresh listings of both stores.
    ///
    /// The listings are authoritative for where copies are. What the engine and
    /// the user decided earlier (protection, restore requests, retired sides,
    /// last errors) carries over for every id that is still listed. A record
    /// first seen in this refresh adopts the protected tag of its remote copy,
    /// so protection survives losing the state database.
    pub fn refresh(
        &mut self,
        local: &[SourceSnapshot],
        remote: &[SourceSnapshot],
        tolerance_secs: u64,
    ) -> RefreshSummary {
        let linked = linker::link(&self.records, local, remote, tolerance_secs);
        let mut previous = std::mem::take(&mut self.records);
        let mut summary = RefreshSummary::default();
        let mut fresh = BTreeSet::new();

        for entry in linked {
            match entry.via {
                LinkVia::NameAndTime => summary.fuzzy_links += 1,
                LinkVia::Unlinked => summary.unlinked_remote += 1,
                _ => {}
            }

            let record = match self.records.entry(entry.id.clone()) {
                std::collections::btree_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::btree_map::Entry::Vacant(e) => {
                    let record = match previous.remove(&entry.id) {
                        Some(mut old) => {
                            old.presence = SideSet::EMPTY;
                            old.handles.clear();
                            old
                        }
                        None => {
                            summary.added += 1;
                            fresh.insert(entry.id.clone());
                            let mut record = BackupRecord::from_snapshot(entry.id.clone(), &entry.snapshot);
                            // The backup it copies is tracked under its own id, so
                            // remote retention may clean this one up.
                            if entry.via == LinkVia::Duplicate {
                                record.retired.insert(Side::Local);
                            }
                            record
                        }
                    };
                    e.insert(record)
                }
            };

            // The local store owns the snapshot's identity and metadata.
            if entry.snapshot.side == Side::Local {
                record.name = entry.snapshot.name.clone();
                record.created_at = entry.snapshot.created_at;
                record.size_bytes = entry.snapshot.size_bytes;
            }
            if entry.snapshot.side == Side::Remote {
                if entry.snapshot.protected && fresh.contains(&entry.id) {
                    record.protected = true;
                }
                if entry.snapshot.protected != record.protected {
                    summary.retag.push(entry.id.clone());
                }
            }
            record.add_copy(entry.snapshot.side, entry.snapshot.handle.clone());
        }

        for id in previous.into_keys() {
            tracing::debug!(backup_id = %id, "Backup no longer listed on either side");
            summary.removed.push(id);
        }
        summary
    }

    /// Records a confirmed copy on `side`.
    pub fn add_copy(&mut self, snapshot: &SourceSnapshot, id: &str) -> &BackupRecord {
        let record = self
            .records
            .entry(id.to_string())
            .or_insert_with(|| BackupRecord::from_snapshot(id, snapshot));
        record.add_copy(snapshot.side, snapshot.handle.clone());
        record
    }

    /// Records that `side` no longer holds a copy. Returns the record if it still exists anywhere.
    pub fn remove_copy(&mut self, id: &str, side: Side) -> Option<&BackupRecord> {
        let empty = match self.records.get_mut(id) {
            Some(record) => {
                record.remove_copy(side);
                record.presence.is_empty()
            }
            None => return None,
        };
        if empty {
            self.records.remove(id);
            return None;
        }
        self.records.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn local(id: &str, secs: i64) -> SourceSnapshot {
        SourceSnapshot {
            side: Side::Local,
            handle: id.into(),
            backup_id: Some(id.into()),
            name: format!("Full {id}"),
            created_at: at(secs),
            size_bytes: 10,
            protected: false,
        }
    }

    fn remote(handle: &str, id: &str, secs: i64) -> SourceSnapshot {
        SourceSnapshot {
            side: Side::Remote,
            handle: handle.into(),
            backup_id: Some(id.into()),
            name: format!("Full {id}"),
            created_at: at(secs),
            size_bytes: 10,
            protected: false,
        }
    }

    #[test]
    fn test_refresh_merges_both_sides() {
        let mut catalog = SnapshotCatalog::new();
        let summary = catalog.refresh(
            &[local("b1", 0), local("b2", 10)],
            &[remote("f1", "b1", 0), remote("f3", "b3", 20)],
            1,
        );

        assert_eq!(summary.added, 3);
        assert_eq!(catalog.get("b1").unwrap().presence, SideSet::BOTH);
        assert!(catalog.get("b2").unwrap().presence.only(Side::Local));
        assert!(catalog.get("b3").unwrap().presence.only(Side::Remote));
        assert_eq!(catalog.get("b1").unwrap().handle(Side::Remote), Some("f1"));
    }

    #[test]
    fn test_refresh_keeps_decisions_and_drops_vanished() {
        let mut catalog = SnapshotCatalog::new();
        catalog.refresh(&[local("b1", 0), local("b2", 10)], &[remote("f1", "b1", 0)], 1);
        {
            let b1 = catalog.get_mut("b1").unwrap();
            b1.protected = true;
            b1.last_error = Some("quota".into());
        }

        let summary = catalog.refresh(&[], &[remote("f1", "b1", 0)], 1);
        assert_eq!(summary.removed, vec!["b2".to_string()]);
        assert!(catalog.get("b2").is_none());
        let b1 = catalog.get("b1").unwrap();
        assert!(b1.protected);
        assert_eq!(b1.last_error.as_deref(), Some("quota"));
        assert!(b1.presence.only(Side::Remote));
    }

    #[test]
    fn test_remove_last_copy_removes_record() {
        let mut catalog = SnapshotCatalog::new();
        catalog.refresh(&[local("b1", 0)], &[remote("f1", "b1", 0)], 1);

        assert!(catalog.remove_copy("b1", Side::Remote).is_some());
        assert!(catalog.remove_copy("b1", Side::Local).is_none());
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_add_copy_creates_or_extends() {
        let mut catalog = SnapshotCatalog::new();
        catalog.add_copy(&local("b1", 0), "b1");
        let record = catalog.add_copy(&remote("f1", "b1", 0), "b1");
        assert_eq!(record.presence, SideSet::BOTH);
        assert_eq!(catalog.count_on(Side::Remote), 1);
    }

    #[test]
    fn test_new_record_adopts_remote_protected_tag() {
        let mut tagged = remote("f1", "b1", 0);
        tagged.protected = true;
        let mut catalog = SnapshotCatalog::new();
        let summary = catalog.refresh(&[local("b1", 0)], &[tagged.clone()], 1);

        assert!(catalog.get("b1").unwrap().protected);
        assert!(summary.retag.is_empty());

        // Once known, the record decides; a stale tag is reported for rewriting.
        catalog.get_mut("b1").unwrap().protected = false;
        let summary = catalog.refresh(&[local("b1", 0)], &[tagged], 1);
        assert!(!catalog.get("b1").unwrap().protected);
        assert_eq!(summary.retag, vec!["b1".to_string()]);
    }

    #[test]
    fn test_duplicate_remote_copy_is_not_wanted_locally() {
        let mut catalog = SnapshotCatalog::new();
        catalog.refresh(&[local("b1", 0)], &[remote("f1", "b1", 0), remote("f2", "b1", 0)], 1);

        let extra = catalog.get("f2").unwrap();
        assert!(extra.presence.only(Side::Remote));
        assert!(extra.retired.contains(Side::Local));
        assert!(catalog.get("b1").unwrap().retired.is_empty());
    }
}
