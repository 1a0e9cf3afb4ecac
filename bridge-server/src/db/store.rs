//! Async face of the state store. Every call hops onto the blocking pool.

use crate::config::EngineSettings;
use crate::db::connection::{create_pool, DbPool};
use crate::db::migrate::migrate;
use crate::models::action::ActionPlanItem;
use crate::models::backup::BackupRecord;
use crate::models::cycle_log::{self, CycleLog, CycleTotals};
use crate::models::{backup_state, inflight, settings};
use rusqlite::Connection;
use std::path::Path;

#[derive(Clone)]
pub struct StateStore {
    db: DbPool,
}

impl StateStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Opens (creating if needed) and migrates the database at `path`.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let pool = create_pool(path)?;
        migrate(&pool)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &DbPool {
        &self.db
    }

    async fn run<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.get()?;
            f(&mut conn)
        })
        .await?
    }

    pub async fn load_catalog(&self) -> anyhow::Result<Vec<BackupRecord>> {
        self.run(|conn| backup_state::find_all(conn)).await
    }

    pub async fn find_record(&self, id: &str) -> anyhow::Result<Option<BackupRecord>> {
        let id = id.to_string();
        self.run(move |conn| backup_state::find_by_id(conn, &id)).await
    }

    pub async fn save_catalog(&self, records: Vec<BackupRecord>) -> anyhow::Result<()> {
        self.run(move |conn| backup_state::replace_all(conn, &records)).await
    }

    pub async fn save_record(&self, record: BackupRecord) -> anyhow::Result<()> {
        self.run(move |conn| backup_state::upsert(conn, &record)).await
    }

    pub async fn set_protected(&self, id: &str, protected: bool) -> anyhow::Result<bool> {
        let id = id.to_string();
        self.run(move |conn| backup_state::set_protected(conn, &id, protected)).await
    }

    pub async fn set_restore_requested(&self, id: &str, requested: bool) -> anyhow::Result<bool> {
        let id = id.to_string();
        self.run(move |conn| backup_state::set_restore_requested(conn, &id, requested))
            .await
    }

    pub async fn inflight(&self) -> anyhow::Result<Vec<ActionPlanItem>> {
        self.run(|conn| inflight::find_all(conn)).await
    }

    pub async fn mark_inflight(&self, item: ActionPlanItem) -> anyhow::Result<()> {
        self.run(move |conn| inflight::put(conn, &item)).await
    }

    pub async fn clear_inflight(&self, backup_id: &str) -> anyhow::Result<()> {
        let id = backup_id.to_string();
        self.run(move |conn| inflight::clear(conn, &id)).await
    }

    /// Terminal outcome of an action: the record's new state and the marker's
    /// removal land in one transaction.
    pub async fn complete_action(
        &self,
        backup_id: &str,
        record: Option<BackupRecord>,
    ) -> anyhow::Result<()> {
        let id = backup_id.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            match &record {
                Some(r) => backup_state::upsert(&tx, r)?,
                None => {
                    backup_state::delete(&tx, &id)?;
                }
            }
            inflight::clear(&tx, &id)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn load_settings(&self) -> anyhow::Result<EngineSettings> {
        self.run(|conn| settings::load_engine(conn)).await
    }

    pub async fn save_settings(&self, value: EngineSettings) -> anyhow::Result<()> {
        self.run(move |conn| settings::save_engine(conn, &value)).await
    }

    pub async fn start_cycle(&self, trigger: &str) -> anyhow::Result<i64> {
        let trigger = trigger.to_string();
        let now = chrono::Utc::now().to_rfc3339();
        self.run(move |conn| cycle_log::start(conn, &trigger, &now)).await
    }

    pub async fn finish_cycle(
        &self,
        id: i64,
        status: &str,
        totals: CycleTotals,
        error: Option<String>,
    ) -> anyhow::Result<()> {
        let status = status.to_string();
        self.run(move |conn| cycle_log::finish(conn, id, &status, &totals, error.as_deref()))
            .await
    }

    pub async fn recent_cycles(&self, limit: usize) -> anyhow::Result<Vec<CycleLog>> {
        self.run(move |conn| cycle_log::find_recent(conn, limit)).await
    }

    pub async fn last_failure(&self) -> anyhow::Result<Option<CycleLog>> {
        self.run(|conn| cycle_log::find_last_failure(conn)).await
    }
}
