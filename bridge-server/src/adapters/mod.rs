//! Source adapters: one per snapshot store.
//!
//! Adapters classify every failure as transient or permanent at the boundary
//! and never retry on their own; retry policy lives in the executor.

pub mod credentials;
pub mod drive;
pub mod memory;
pub mod supervisor;

use crate::error::AdapterError;
use crate::models::backup::{Side, SnapshotMeta, SourceSnapshot};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

/// A snapshot's bytes in arrival order. Transfers pass this from one store to
/// the other so no side ever holds a whole snapshot in memory.
pub type SnapshotStream = BoxStream<'static, Result<Bytes, AdapterError>>;

#[async_trait]
pub trait SnapshotAdapter: Send + Sync {
    fn side(&self) -> Side;

    /// Reports missing configuration (for example, no credentials) before a cycle starts.
    fn check_configured(&self) -> Result<(), String> {
        Ok(())
    }

    /// Every snapshot currently held by this store.
    async fn list(&self) -> Result<Vec<SourceSnapshot>, AdapterError>;

    /// Creates a new snapshot in place. Only meaningful for the local store.
    async fn create(&self, name: &str) -> Result<SourceSnapshot, AdapterError>;

    /// Opens a snapshot's bytes by store handle.
    async fn read(&self, handle: &str) -> Result<SnapshotStream, AdapterError>;

    /// Stores a copy of a snapshot that lives on the other side.
    async fn write(&self, meta: &SnapshotMeta, data: SnapshotStream) -> Result<SourceSnapshot, AdapterError>;

    /// Brings a stored copy's metadata (the protected tag) in line with `meta`.
    /// Stores that keep no metadata of their own accept this as a no-op.
    async fn update_meta(&self, _handle: &str, _meta: &SnapshotMeta) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn delete(&self, handle: &str) -> Result<(), AdapterError>;
}
