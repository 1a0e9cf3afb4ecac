use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One of the two snapshot stores the bridge keeps in step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    pub const ALL: [Side; 2] = [Side::Local, Side::Remote];

    pub fn other(self) -> Side {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Local => "local",
            Side::Remote => "remote",
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s {
            "local" => Some(Side::Local),
            "remote" => Some(Side::Remote),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subset of {LOCAL, REMOTE}.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SideSet {
    pub local: bool,
    pub remote: bool,
}

impl SideSet {
    pub const EMPTY: SideSet = SideSet { local: false, remote: false };
    pub const BOTH: SideSet = SideSet { local: true, remote: true };

    pub fn of(side: Side) -> Self {
        let mut set = Self::EMPTY;
        set.insert(side);
        set
    }

    pub fn contains(&self, side: Side) -> bool {
        match side {
            Side::Local => self.local,
            Side::Remote => self.remote,
        }
    }

    pub fn insert(&mut self, side: Side) {
        match side {
            Side::Local => self.local = true,
            Side::Remote => self.remote = true,
        }
    }

    pub fn remove(&mut self, side: Side) {
        match side {
            Side::Local => self.local = false,
            Side::Remote => self.remote = false,
        }
    }

    pub fn union(self, other: SideSet) -> SideSet {
        SideSet {
            local: self.local || other.local,
            remote: self.remote || other.remote,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.local && !self.remote
    }

    pub fn len(&self) -> usize {
        self.local as usize + self.remote as usize
    }

    /// True when `side` is the only member.
    pub fn only(&self, side: Side) -> bool {
        self.contains(side) && !self.contains(side.other())
    }

    pub fn iter(&self) -> impl Iterator<Item = Side> + '_ {
        Side::ALL.into_iter().filter(move |s| self.contains(*s))
    }
}

/// One store's view of a snapshot, as returned by an adapter listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub side: Side,
    /// Store-specific handle (local slug, remote file id).
    pub handle: String,
    /// Canonical backup id, when the store carries one.
    pub backup_id: Option<String>,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    /// Protected tag stored with the copy. Only the remote store keeps one.
    #[serde(default)]
    pub protected: bool,
}

/// Metadata travelling with a snapshot's bytes when it is copied across.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub backup_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub protected: bool,
}

/// One logical backup, unified across both stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub presence: SideSet,
    /// Store handle per side; keys always equal `presence`.
    pub handles: BTreeMap<Side, String>,
    pub protected: bool,
    /// Requested locally even though not protected (restore).
    pub restore_requested: bool,
    /// Sides that no longer want a copy: deleted on purpose in a completed cycle,
    /// or never wanted locally (an extra remote copy of another backup).
    pub retired: SideSet,
    pub last_error: Option<String>,
}

impl BackupRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, created_at: DateTime<Utc>, size_bytes: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            created_at,
            size_bytes,
            presence: SideSet::EMPTY,
            handles: BTreeMap::new(),
            protected: false,
            restore_requested: false,
            retired: SideSet::EMPTY,
            last_error: None,
        }
    }

    pub fn from_snapshot(id: impl Into<String>, snapshot: &SourceSnapshot) -> Self {
        Self::new(id, snapshot.name.clone(), snapshot.created_at, snapshot.size_bytes)
    }

    pub fn handle(&self, side: Side) -> Option<&str> {
        self.handles.get(&side).map(String::as_str)
    }

    pub fn add_copy(&mut self, side: Side, handle: impl Into<String>) {
        self.handles.insert(side, handle.into());
        self.presence.insert(side);
        self.retired.remove(side);
    }

    pub fn remove_copy(&mut self, side: Side) {
        self.handles.remove(&side);
        self.presence.remove(side);
    }

    /// Sides this record should be on, independent of what is there now.
    pub fn pinned(&self) -> SideSet {
        let mut pinned = SideSet::EMPTY;
        if self.protected {
            pinned = SideSet::BOTH;
        }
        if self.restore_requested {
            pinned.insert(Side::Local);
        }
        pinned
    }

    pub fn meta(&self) -> SnapshotMeta {
        SnapshotMeta {
            backup_id: self.id.clone(),
            name: self.name.clone(),
            created_at: self.created_at,
            size_bytes: self.size_bytes,
            protected: self.protected,
        }
    }
}
