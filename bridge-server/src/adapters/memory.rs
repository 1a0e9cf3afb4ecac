//! In-memory snapshot store with fault injection.
//!
//! Used by the test suites to drive full cycles without a supervisor or a
//! cloud drive, and to script transient/permanent failures per operation.

use super::{SnapshotAdapter, SnapshotStream};
use crate::error::{AdapterError, PermanentReason};
use crate::models::backup::{Side, SnapshotMeta, SourceSnapshot};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

/// Reads hand out stored bytes in pieces of this size.
pub const READ_PIECE: usize = 4 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    List,
    Create,
    Read,
    Write,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail this many matching calls, then succeed.
    Transient { times: u32 },
    /// Fail every matching call.
    Permanent(PermanentReason),
}

#[derive(Debug)]
struct FaultRule {
    op: Op,
    target: Option<String>,
    fault: Fault,
}

#[derive(Debug)]
struct Stored {
    snapshot: SourceSnapshot,
    data: Bytes,
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: BTreeMap<String, Stored>,
    faults: Vec<FaultRule>,
    calls: HashMap<Op, usize>,
    next_handle: u64,
    revoked: bool,
    delay: Duration,
}

impl MemoryState {
    fn check(&mut self, op: Op, keys: &[&str]) -> Result<(), AdapterError> {
        *self.calls.entry(op).or_default() += 1;
        if self.revoked {
            return Err(AdapterError::unauthorized("credentials revoked"));
        }
        for rule in self.faults.iter_mut() {
            if rule.op != op {
                continue;
            }
            if let Some(target) = &rule.target {
                if !keys.contains(&target.as_str()) {
                    continue;
                }
            }
            match &mut rule.fault {
                Fault::Transient { times } if *times > 0 => {
                    *times -= 1;
                    return Err(AdapterError::transient(format!("injected {op:?} failure")));
                }
                Fault::Transient { .. } => {}
                Fault::Permanent(reason) => {
                    return Err(AdapterError::permanent(*reason, format!("injected {op:?} failure")));
                }
            }
        }
        Ok(())
    }

    fn keys_for(&self, handle: &str) -> Vec<String> {
        let mut keys = vec![handle.to_string()];
        if let Some(id) = self
            .objects
            .get(handle)
            .and_then(|o| o.snapshot.backup_id.clone())
        {
            keys.push(id);
        }
        keys
    }

    fn next_handle(&mut self, side: Side) -> String {
        self.next_handle += 1;
        match side {
            Side::Local => format!("snap-{}", self.next_handle),
            Side::Remote => format!("file-{}", self.next_handle),
        }
    }
}

pub struct MemoryAdapter {
    side: Side,
    state: Mutex<MemoryState>,
}

impl MemoryAdapter {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn local() -> Self {
        Self::new(Side::Local)
    }

    pub fn remote() -> Self {
        Self::new(Side::Remote)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A panicking test thread must not wedge the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a snapshot tagged with its backup id.
    pub fn seed(&self, backup_id: &str, name: &str, created_at: DateTime<Utc>) -> SourceSnapshot {
        self.insert(Some(backup_id), name, created_at)
    }

    /// Adds a remote copy that carries no backup id (uploaded by hand or by an older version).
    pub fn seed_untagged(&self, name: &str, created_at: DateTime<Utc>) -> SourceSnapshot {
        self.insert(None, name, created_at)
    }

    fn insert(&self, backup_id: Option<&str>, name: &str, created_at: DateTime<Utc>) -> SourceSnapshot {
        let mut state = self.lock();
        let handle = match (self.side, backup_id) {
            (Side::Local, Some(id)) => id.to_string(),
            _ => state.next_handle(self.side),
        };
        let data = Bytes::from(format!("snapshot:{}", backup_id.unwrap_or(name)));
        let snapshot = SourceSnapshot {
            side: self.side,
            handle: handle.clone(),
            backup_id: backup_id.map(str::to_string),
            name: name.to_string(),
            created_at,
            size_bytes: data.len() as u64,
            protected: false,
        };
        state.objects.insert(
            handle,
            Stored {
                snapshot: snapshot.clone(),
                data,
            },
        );
        snapshot
    }

    /// Sets the protected tag on every copy of `backup_id`, as a user editing
    /// the store directly would.
    pub fn tag_protected(&self, backup_id: &str, protected: bool) {
        for stored in self.lock().objects.values_mut() {
            if stored.snapshot.backup_id.as_deref() == Some(backup_id) {
                stored.snapshot.protected = protected;
            }
        }
    }

    /// The protected tag on the first copy of `backup_id`.
    pub fn protected_tag(&self, backup_id: &str) -> Option<bool> {
        self.lock()
            .objects
            .values()
            .find(|o| o.snapshot.backup_id.as_deref() == Some(backup_id))
            .map(|o| o.snapshot.protected)
    }

    pub fn inject(&self, op: Op, target: Option<&str>, fault: Fault) {
        self.lock().faults.push(FaultRule {
            op,
            target: target.map(str::to_string),
            fault,
        });
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Every call from now on fails as unauthorized.
    pub fn revoke(&self) {
        self.lock().revoked = true;
    }

    /// Every call sleeps this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = delay;
    }

    pub fn calls(&self, op: Op) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn snapshots(&self) -> Vec<SourceSnapshot> {
        self.lock().objects.values().map(|o| o.snapshot.clone()).collect()
    }

    /// Number of copies tagged with `backup_id`.
    pub fn copies_of(&self, backup_id: &str) -> usize {
        self.lock()
            .objects
            .values()
            .filter(|o| o.snapshot.backup_id.as_deref() == Some(backup_id))
            .count()
    }

    pub fn contains(&self, backup_id: &str) -> bool {
        self.copies_of(backup_id) > 0
    }

    async fn pause(&self) {
        let delay = self.lock().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl SnapshotAdapter for MemoryAdapter {
    fn side(&self) -> Side {
        self.side
    }

    async fn list(&self) -> Result<Vec<SourceSnapshot>, AdapterError> {
        self.pause().await;
        let mut state = self.lock();
        state.check(Op::List, &[])?;
        Ok(state.objects.values().map(|o| o.snapshot.clone()).collect())
    }

    async fn create(&self, name: &str) -> Result<SourceSnapshot, AdapterError> {
        self.pause().await;
        {
            let mut state = self.lock();
            state.check(Op::Create, &[name])?;
            if self.side == Side::Remote {
                return Err(AdapterError::permanent(
                    PermanentReason::Rejected,
                    "remote store cannot create snapshots",
                ));
            }
        }
        let id = format!("new-{}", uuid::Uuid::new_v4().simple());
        Ok(self.insert(Some(&id), name, Utc::now()))
    }

    async fn read(&self, handle: &str) -> Result<SnapshotStream, AdapterError> {
        self.pause().await;
        let data = {
            let mut state = self.lock();
            let keys = state.keys_for(handle);
            let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
            state.check(Op::Read, &keys)?;
            state
                .objects
                .get(handle)
                .map(|o| o.data.clone())
                .ok_or_else(|| AdapterError::not_found(format!("no snapshot {handle}")))?
        };
        let pieces: Vec<Result<Bytes, AdapterError>> = (0..data.len())
            .step_by(READ_PIECE)
            .map(|start| Ok(data.slice(start..(start + READ_PIECE).min(data.len()))))
            .collect();
        Ok(stream::iter(pieces).boxed())
    }

    async fn write(&self, meta: &SnapshotMeta, mut data: SnapshotStream) -> Result<SourceSnapshot, AdapterError> {
        self.pause().await;
        self.lock().check(Op::Write, &[meta.backup_id.as_str()])?;
        let mut received = BytesMut::new();
        while let Some(piece) = data.next().await {
            received.extend_from_slice(&piece?);
        }
        let data = received.freeze();

        let mut state = self.lock();
        let handle = match self.side {
            Side::Local => meta.backup_id.clone(),
            Side::Remote => state.next_handle(Side::Remote),
        };
        let snapshot = SourceSnapshot {
            side: self.side,
            handle: handle.clone(),
            backup_id: Some(meta.backup_id.clone()),
            name: meta.name.clone(),
            created_at: meta.created_at,
            size_bytes: data.len() as u64,
            protected: self.side == Side::Remote && meta.protected,
        };
        state.objects.insert(
            handle,
            Stored {
                snapshot: snapshot.clone(),
                data,
            },
        );
        Ok(snapshot)
    }

    async fn update_meta(&self, handle: &str, meta: &SnapshotMeta) -> Result<(), AdapterError> {
        self.pause().await;
        let mut state = self.lock();
        let keys = state.keys_for(handle);
        let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
        state.check(Op::Update, &keys)?;
        let side = self.side;
        let stored = state
            .objects
            .get_mut(handle)
            .ok_or_else(|| AdapterError::not_found(format!("no snapshot {handle}")))?;
        stored.snapshot.protected = side == Side::Remote && meta.protected;
        Ok(())
    }

    async fn delete(&self, handle: &str) -> Result<(), AdapterError> {
        self.pause().await;
        let mut state = self.lock();
        let keys = state.keys_for(handle);
        let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
        state.check(Op::Delete, &keys)?;
        state
            .objects
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| AdapterError::not_found(format!("no snapshot {handle}")))
    }
}
