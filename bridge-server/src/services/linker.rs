//! Assigns every listed snapshot the canonical backup id it belongs to.
//!
//! Local snapshots carry their id. A remote copy is linked, in order of trust:
//! by the `backup_id` tag it was uploaded with, by a remote handle recorded in
//! the state store, by name and creation time matching a local snapshot, and
//! failing all of those it stands alone under its own handle.

use crate::models::backup::{BackupRecord, Side, SourceSnapshot};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkVia {
    Local,
    Tag,
    KnownHandle,
    NameAndTime,
    Unlinked,
    /// A further remote copy of an id that already has one.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Linked {
    pub id: String,
    pub snapshot: SourceSnapshot,
    pub via: LinkVia,
}

pub fn link(
    known: &BTreeMap<String, BackupRecord>,
    local: &[SourceSnapshot],
    remote: &[SourceSnapshot],
    tolerance_secs: u64,
) -> Vec<Linked> {
    let mut linked: Vec<Linked> = local
        .iter()
        .map(|s| Linked {
            id: s.backup_id.clone().unwrap_or_else(|| s.handle.clone()),
            snapshot: s.clone(),
            via: LinkVia::Local,
        })
        .collect();

    let known_remote: BTreeMap<&str, &str> = known
        .values()
        .filter_map(|r| r.handle(Side::Remote).map(|h| (h, r.id.as_str())))
        .collect();

    // Ids that already have a remote copy; a second copy of the same backup
    // keeps its own identity so retention can clean it up.
    let mut claimed: HashSet<String> = HashSet::new();

    // Tagged copies first so a fuzzy match never steals a tagged id.
    let mut ordered: Vec<&SourceSnapshot> = remote.iter().collect();
    ordered.sort_by_key(|s| (s.backup_id.is_none(), s.created_at, s.handle.clone()));

    for snap in ordered {
        let (mut id, mut via) = if let Some(tag) = &snap.backup_id {
            (tag.clone(), LinkVia::Tag)
        } else if let Some(id) = known_remote.get(snap.handle.as_str()) {
            (id.to_string(), LinkVia::KnownHandle)
        } else if let Some(id) = match_by_name(snap, local, known, &claimed, tolerance_secs) {
            (id, LinkVia::NameAndTime)
        } else {
            (snap.handle.clone(), LinkVia::Unlinked)
        };

        if !claimed.insert(id.clone()) {
            tracing::warn!(backup_id = %id, handle = %snap.handle, "Duplicate remote copy; tracking it separately");
            id = snap.handle.clone();
            via = LinkVia::Duplicate;
            claimed.insert(id.clone());
        }
        if via == LinkVia::NameAndTime {
            tracing::debug!(backup_id = %id, handle = %snap.handle, "Linked remote copy by name and time");
        }
        linked.push(Linked {
            id,
            snapshot: snap.clone(),
            via,
        });
    }
    linked
}

fn match_by_name(
    snap: &SourceSnapshot,
    local: &[SourceSnapshot],
    known: &BTreeMap<String, BackupRecord>,
    claimed: &HashSet<String>,
    tolerance_secs: u64,
) -> Option<String> {
    let close = |name: &str, at: chrono::DateTime<chrono::Utc>| {
        name == snap.name && (at - snap.created_at).num_seconds().unsigned_abs() <= tolerance_secs
    };

    let from_local = local
        .iter()
        .filter(|l| close(&l.name, l.created_at))
        .map(|l| l.backup_id.clone().unwrap_or_else(|| l.handle.clone()));
    let from_known = known
        .values()
        .filter(|r| r.handle(Side::Remote).is_none() && close(&r.name, r.created_at))
        .map(|r| r.id.clone());

    let mut candidates: Vec<String> = from_local.chain(from_known).filter(|id| !claimed.contains(id)).collect();
    candidates.sort();
    candidates.dedup();
    // Ambiguous matches are left unlinked rather than guessed.
    if candidates.len() == 1 {
        candidates.pop()
    } else {
        None
    }
}
