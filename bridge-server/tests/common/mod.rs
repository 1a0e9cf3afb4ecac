#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use snapshot_bridge::adapters::memory::MemoryAdapter;
use snapshot_bridge::config::EngineSettings;
use snapshot_bridge::db::StateStore;
use snapshot_bridge::services::backoff::BackoffPolicy;
use snapshot_bridge::services::cycle::{CycleReport, Engine, Trigger};
use snapshot_bridge::services::executor::Adapters;
use snapshot_bridge::ws::events::EventBus;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A full engine over in-memory stores and an on-disk state database.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub local: Arc<MemoryAdapter>,
    pub remote: Arc<MemoryAdapter>,
    pub engine: Engine,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(&dir.path().join("bridge.db")).unwrap();
        let local = Arc::new(MemoryAdapter::local());
        let remote = Arc::new(MemoryAdapter::remote());
        let engine = Engine::new(
            Adapters::new(local.clone(), remote.clone()),
            store,
            EventBus::new(),
        );
        let harness = Self {
            dir,
            local,
            remote,
            engine,
        };
        harness
            .settings(|s| {
                s.backoff = BackoffPolicy {
                    base_ms: 10,
                    cap_ms: 1_000,
                    jitter: 0.2,
                };
                s.retention.local.max_count = None;
                s.retention.remote.max_count = None;
                s.call_timeout_secs = 5;
            })
            .await;
        harness
    }

    /// Reopens the same database with a fresh engine, as after a restart.
    pub fn restart(&self) -> Engine {
        let store = StateStore::open(&self.dir.path().join("bridge.db")).unwrap();
        Engine::new(
            Adapters::new(self.local.clone(), self.remote.clone()),
            store,
            EventBus::new(),
        )
    }

    pub fn store(&self) -> &StateStore {
        &self.engine.store
    }

    pub async fn settings(&self, f: impl FnOnce(&mut EngineSettings)) {
        let mut settings = self.engine.store.load_settings().await.unwrap();
        f(&mut settings);
        self.engine.store.save_settings(settings).await.unwrap();
    }

    pub async fn cycle(&self) -> CycleReport {
        self.engine.run_cycle(Trigger::Manual, &CancellationToken::new()).await
    }

    /// Seeds `id` on the given stores.
    pub fn seed(&self, id: &str, hours_old: i64, local: bool, remote: bool) {
        let created = hours_ago(hours_old);
        if local {
            self.local.seed(id, &format!("Full {id}"), created);
        }
        if remote {
            self.remote.seed(id, &format!("Full {id}"), created);
        }
    }
}

pub fn hours_ago(hours: i64) -> DateTime<Utc> {
    Utc::now() - Duration::hours(hours)
}
