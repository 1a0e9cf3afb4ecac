use crate::config::EngineSettings;
use crate::db::StateStore;
use crate::error::{AdapterError, CycleError};
use crate::models::action::ActionPlanItem;
use crate::models::backup::{Side, SourceSnapshot};
use crate::models::cycle_log::CycleTotals;
use crate::services::catalog::SnapshotCatalog;
use crate::services::executor::{Adapters, ExecutionReport, Executor, ExecutorConfig, Outcome};
use crate::services::{planner, recovery};
use crate::ws::events::{EngineEvent, EventBus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// What started a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Startup,
    Timer,
    Manual,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Startup => "startup",
            Trigger::Timer => "timer",
            Trigger::Manual => "manual",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Succeeded,
    PartialFailure,
    AuthorizationFailed,
    ConfigurationError,
    Failed,
    Cancelled,
}

impl CycleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CycleStatus::Succeeded => "succeeded",
            CycleStatus::PartialFailure => "partial_failure",
            CycleStatus::AuthorizationFailed => "authorization_failed",
            CycleStatus::ConfigurationError => "configuration_error",
            CycleStatus::Failed => "failed",
            CycleStatus::Cancelled => "cancelled",
        }
    }

    fn from_error(e: &CycleError) -> Self {
        match e {
            CycleError::Configuration(_) => CycleStatus::ConfigurationError,
            CycleError::Authorization(_) => CycleStatus::AuthorizationFailed,
            CycleError::Cancelled => CycleStatus::Cancelled,
            CycleError::Source { .. } | CycleError::Store(_) => CycleStatus::Failed,
        }
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Option<i64>,
    pub trigger: Trigger,
    pub status: CycleStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub plan: Vec<ActionPlanItem>,
    pub execution: ExecutionReport,
    pub created_snapshot: Option<String>,
    pub error: Option<String>,
}

impl CycleReport {
    pub fn totals(&self) -> CycleTotals {
        CycleTotals {
            succeeded: self.execution.succeeded(),
            failed: self.execution.failed(),
            deferred: self.execution.deferred(),
            dropped: self.execution.dropped(),
        }
    }
}

/// Work collected by a cycle before it stops, successful or not.
#[derive(Default)]
struct Progress {
    plan: Vec<ActionPlanItem>,
    execution: ExecutionReport,
    created_snapshot: Option<String>,
}

fn classify_listing(side: Side, e: AdapterError) -> CycleError {
    if e.is_unauthorized() {
        CycleError::Authorization(format!("{side} store rejected credentials: {e}"))
    } else {
        CycleError::Source { side, source: e }
    }
}

/// Fills `{date}` in a snapshot name template.
pub fn snapshot_name(template: &str, now: DateTime<Utc>) -> String {
    template.replace("{date}", &now.format("%Y-%m-%d %H:%M").to_string())
}

/// One reconciliation engine: both adapters, the state store and the event bus.
#[derive(Clone)]
pub struct Engine {
    pub adapters: Adapters,
    pub store: StateStore,
    pub events: EventBus,
}

impl Engine {
    pub fn new(adapters: Adapters, store: StateStore, events: EventBus) -> Self {
        Self {
            adapters,
            store,
            events,
        }
    }

    /// Runs discover, plan and execute once. Never fails as a whole: the
    /// outcome, including cycle-level errors, is in the report and the
    /// `cycles` table.
    pub async fn run_cycle(&self, trigger: Trigger, cancel: &CancellationToken) -> CycleReport {
        let started_at = Utc::now();
        let cycle_id = match self.store.start_cycle(trigger.as_str()).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::error!("[DB] Failed to record cycle start: {e:#}");
                None
            }
        };
        tracing::info!(trigger = %trigger, cycle_id = ?cycle_id, "Starting reconciliation cycle");
        self.events.publish(EngineEvent::CycleStarted {
            cycle_id: cycle_id.unwrap_or_default(),
            trigger: trigger.to_string(),
        });

        let mut progress = Progress::default();
        let result = self.reconcile(&mut progress, cancel).await;

        let (status, error) = match &result {
            Ok(()) => {
                let ex = &progress.execution;
                let status = if !ex.revoked.is_empty() {
                    CycleStatus::AuthorizationFailed
                } else if ex.cancelled {
                    CycleStatus::Cancelled
                } else if ex.failed() > 0 {
                    CycleStatus::PartialFailure
                } else {
                    CycleStatus::Succeeded
                };
                let error = ex.results.iter().rev().find_map(|r| match &r.outcome {
                    Outcome::Failed(e) => Some(format!("{}: {e}", r.item.backup_id)),
                    _ => None,
                });
                (status, error)
            }
            Err(e) => (CycleStatus::from_error(e), Some(e.to_string())),
        };

        let report = CycleReport {
            cycle_id,
            trigger,
            status,
            started_at,
            finished_at: Utc::now(),
            plan: progress.plan,
            execution: progress.execution,
            created_snapshot: progress.created_snapshot,
            error,
        };
        let totals = report.totals();

        match status {
            CycleStatus::Succeeded => tracing::info!(
                cycle_id = ?cycle_id,
                succeeded = totals.succeeded,
                "Reconciliation cycle finished"
            ),
            CycleStatus::Cancelled => tracing::info!(
                cycle_id = ?cycle_id,
                dropped = totals.dropped,
                "Reconciliation cycle cancelled"
            ),
            _ => tracing::error!(
                cycle_id = ?cycle_id,
                status = %status,
                succeeded = totals.succeeded,
                failed = totals.failed,
                deferred = totals.deferred,
                error = report.error.as_deref().unwrap_or(""),
                "Reconciliation cycle did not fully succeed"
            ),
        }

        if let Some(id) = cycle_id {
            if let Err(e) = self
                .store
                .finish_cycle(id, status.as_str(), totals.clone(), report.error.clone())
                .await
            {
                tracing::error!("[DB] Failed to record cycle result: {e:#}");
            }
        }
        self.events.publish(EngineEvent::CycleFinished {
            cycle_id: cycle_id.unwrap_or_default(),
            status: status.to_string(),
            succeeded: totals.succeeded,
            failed: totals.failed,
            deferred: totals.deferred,
            dropped: totals.dropped,
            error: report.error.clone(),
        });
        report
    }

    async fn reconcile(&self, progress: &mut Progress, cancel: &CancellationToken) -> Result<(), CycleError> {
        let settings = self.store.load_settings().await?;
        settings.validate()?;
        for side in Side::ALL {
            self.adapters
                .on(side)
                .check_configured()
                .map_err(|msg| CycleError::Configuration(format!("{side} store: {msg}")))?;
        }

        let mut local = self.adapters.local.list().await.map_err(|e| classify_listing(Side::Local, e))?;
        if let Some(created) = self.snapshot_if_due(&settings, &local).await {
            progress.created_snapshot = Some(created.handle.clone());
            local = self.adapters.local.list().await.map_err(|e| classify_listing(Side::Local, e))?;
        }
        let remote = self
            .adapters
            .remote
            .list()
            .await
            .map_err(|e| classify_listing(Side::Remote, e))?;

        let mut catalog = SnapshotCatalog::from_records(self.store.load_catalog().await?);
        let summary = catalog.refresh(&local, &remote, settings.link_tolerance_secs);
        tracing::info!(
            local = local.len(),
            remote = remote.len(),
            added = summary.added,
            removed = summary.removed.len(),
            fuzzy_links = summary.fuzzy_links,
            "Catalog refreshed"
        );
        if summary.unlinked_remote > 0 {
            tracing::warn!(count = summary.unlinked_remote, "Remote copies could not be linked to a local snapshot");
        }
        self.store.save_catalog(catalog.to_vec()).await?;
        // Replay history only covers backups that still exist.
        self.events.retain_backups(|id| catalog.get(id).is_some());

        let carried = recovery::recover(&mut catalog, &self.store).await?;
        if cancel.is_cancelled() {
            return Err(CycleError::Cancelled);
        }
        self.sync_protection(&catalog, &summary.retag, &settings).await;

        let plan = planner::plan(&catalog, &settings.retention, Utc::now(), &carried);
        tracing::info!(actions = plan.len(), "Action plan ready");
        progress.plan = plan.clone();

        let executor = Executor::new(&self.adapters, &self.store, &self.events, ExecutorConfig::from(&settings));
        progress.execution = executor.execute(&mut catalog, plan, cancel).await?;
        Ok(())
    }

    /// Rewrites remote protected tags that disagree with the catalog. A failed
    /// rewrite shows up again in the next refresh and is retried then.
    async fn sync_protection(&self, catalog: &SnapshotCatalog, ids: &[String], settings: &EngineSettings) {
        let timeout = std::time::Duration::from_secs(settings.call_timeout_secs);
        for id in ids {
            let Some(record) = catalog.get(id) else { continue };
            let Some(handle) = record.handle(Side::Remote) else { continue };
            let result = tokio::time::timeout(timeout, self.adapters.remote.update_meta(handle, &record.meta())).await;
            match result {
                Ok(Ok(())) => {
                    tracing::info!(backup_id = %id, protected = record.protected, "Updated remote protected tag")
                }
                Ok(Err(e)) => tracing::warn!(backup_id = %id, error = %e, "Could not update remote protected tag"),
                Err(_) => tracing::warn!(backup_id = %id, "Timed out updating remote protected tag"),
            }
        }
    }

    async fn snapshot_if_due(&self, settings: &EngineSettings, local: &[SourceSnapshot]) -> Option<SourceSnapshot> {
        let hours = settings.snapshot_interval_hours?;
        let now = Utc::now();
        let newest = local.iter().map(|s| s.created_at).max();
        if newest.is_some_and(|t| now - t < ChronoDuration::hours(hours as i64)) {
            return None;
        }
        match self.create_snapshot(&settings.snapshot_name_template).await {
            Ok(s) => Some(s),
            Err(e) => {
                // The cycle still reconciles what exists.
                tracing::error!(error = %e, "Scheduled snapshot creation failed");
                None
            }
        }
    }

    /// Asks the local store for a new snapshot named from `template`.
    pub async fn create_snapshot(&self, template: &str) -> Result<SourceSnapshot, AdapterError> {
        let name = snapshot_name(template, Utc::now());
        let created = self.adapters.local.create(&name).await?;
        tracing::info!(handle = %created.handle, name = %created.name, "Created local snapshot");
        Ok(created)
    }

    /// The plan a cycle would run against the last persisted catalog, without
    /// contacting either store.
    pub async fn preview_plan(&self) -> Result<Vec<ActionPlanItem>, CycleError> {
        let settings = self.store.load_settings().await?;
        settings.validate()?;
        let catalog = SnapshotCatalog::from_records(self.store.load_catalog().await?);
        let carried = self.store.inflight().await?;
        Ok(planner::plan(&catalog, &settings.retention, Utc::now(), &carried))
    }
}
