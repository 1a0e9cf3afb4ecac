//! Runs an action plan against the adapters.
//!
//! Workers perform single attempts and hand the result back; only the
//! coordinating loop touches the catalog, the state store and the retry state.
//! Transfers all reach a terminal state before the first deletion starts.

use crate::adapters::SnapshotAdapter;
use crate::config::EngineSettings;
use crate::db::StateStore;
use crate::error::{AdapterError, CycleError, PermanentReason};
use crate::models::action::{ActionKind, ActionPlanItem, DeleteReason};
use crate::models::backup::{BackupRecord, Side, SideSet, SourceSnapshot};
use crate::services::backoff::BackoffPolicy;
use crate::services::catalog::SnapshotCatalog;
use crate::ws::events::{EngineEvent, EventBus};
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// The two stores the engine reconciles.
#[derive(Clone)]
pub struct Adapters {
    pub local: Arc<dyn SnapshotAdapter>,
    pub remote: Arc<dyn SnapshotAdapter>,
}

impl Adapters {
    pub fn new(local: Arc<dyn SnapshotAdapter>, remote: Arc<dyn SnapshotAdapter>) -> Self {
        Self { local, remote }
    }

    pub fn on(&self, side: Side) -> &Arc<dyn SnapshotAdapter> {
        match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutorConfig {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub call_timeout: Duration,
}

impl From<&EngineSettings> for ExecutorConfig {
    fn from(s: &EngineSettings) -> Self {
        Self {
            concurrency: s.concurrency.max(1),
            max_attempts: s.max_attempts.max(1),
            backoff: s.backoff,
            call_timeout: s.call_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed(String),
    /// Held back this cycle; planned again next time.
    Deferred,
    /// Never finished: cancelled before it started or between attempts.
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionResult {
    pub item: ActionPlanItem,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub results: Vec<ActionResult>,
    /// Sides whose credentials were rejected during the run.
    pub revoked: SideSet,
    pub cancelled: bool,
}

impl ExecutionReport {
    fn push(&mut self, item: ActionPlanItem, outcome: Outcome) {
        self.results.push(ActionResult { item, outcome });
    }

    fn count(&self, f: impl Fn(&Outcome) -> bool) -> usize {
        self.results.iter().filter(|r| f(&r.outcome)).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|o| *o == Outcome::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Failed(_)))
    }

    pub fn deferred(&self) -> usize {
        self.count(|o| *o == Outcome::Deferred)
    }

    pub fn dropped(&self) -> usize {
        self.count(|o| *o == Outcome::Dropped)
    }

    pub fn result_for(&self, backup_id: &str) -> Option<&ActionResult> {
        self.results.iter().find(|r| r.item.backup_id == backup_id)
    }
}

/// A failed adapter call and the store it came from.
#[derive(Debug, Clone)]
struct Failure {
    side: Side,
    error: AdapterError,
}

enum Effect {
    Stored(SourceSnapshot),
    Removed,
}

enum AttemptResult {
    Done(Result<Effect, Failure>),
    /// Cancelled while waiting out a backoff delay.
    Interrupted,
    Panicked,
}

struct AttemptOutcome {
    item: ActionPlanItem,
    result: AttemptResult,
}

async fn call<T>(
    side: Side,
    timeout: Duration,
    fut: impl Future<Output = Result<T, AdapterError>>,
) -> Result<T, Failure> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(error)) => Err(Failure { side, error }),
        Err(_) => Err(Failure {
            side,
            error: AdapterError::transient(format!("{side} call timed out after {}s", timeout.as_secs())),
        }),
    }
}

async fn perform(
    adapters: &Adapters,
    item: &ActionPlanItem,
    record: &BackupRecord,
    timeout: Duration,
) -> Result<Effect, Failure> {
    let target = item.kind.target();
    if item.kind.is_delete() {
        let Some(handle) = record.handle(target) else {
            return Ok(Effect::Removed);
        };
        return match call(target, timeout, adapters.on(target).delete(handle)).await {
            Ok(()) => Ok(Effect::Removed),
            // Already gone is as good as deleted.
            Err(f) if f.error.reason() == Some(PermanentReason::NotFound) => Ok(Effect::Removed),
            Err(f) => Err(f),
        };
    }

    let source = target.other();
    let handle = record.handle(source).ok_or_else(|| Failure {
        side: source,
        error: AdapterError::not_found(format!("no {source} copy to transfer")),
    })?;
    // Bytes stream straight through; a read error mid-copy surfaces from the write.
    let data = call(source, timeout, adapters.on(source).read(handle)).await?;
    let stored = call(target, timeout, adapters.on(target).write(&record.meta(), data)).await?;
    Ok(Effect::Stored(stored))
}

async fn attempt(
    adapters: Adapters,
    item: ActionPlanItem,
    record: BackupRecord,
    delay: Option<Duration>,
    timeout: Duration,
    cancel: CancellationToken,
) -> AttemptOutcome {
    if let Some(delay) = delay {
        tokio::select! {
            _ = cancel.cancelled() => {
                return AttemptOutcome { item, result: AttemptResult::Interrupted };
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
    let result = perform(&adapters, &item, &record, timeout).await;
    AttemptOutcome {
        item,
        result: AttemptResult::Done(result),
    }
}

pub struct Executor<'a> {
    adapters: &'a Adapters,
    store: &'a StateStore,
    events: &'a EventBus,
    config: ExecutorConfig,
}

impl<'a> Executor<'a> {
    pub fn new(adapters: &'a Adapters, store: &'a StateStore, events: &'a EventBus, config: ExecutorConfig) -> Self {
        Self {
            adapters,
            store,
            events,
            config,
        }
    }

    /// Runs transfers, then deletions. Cancellation stops new work from
    /// starting; attempts already under way finish.
    pub async fn execute(
        &self,
        catalog: &mut SnapshotCatalog,
        plan: Vec<ActionPlanItem>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport, CycleError> {
        let mut report = ExecutionReport::default();
        let (transfers, deletes): (Vec<_>, Vec<_>) = plan.into_iter().partition(|i| !i.kind.is_delete());

        self.run_phase(catalog, transfers, &mut report, cancel).await?;

        let mut failed_into = [0usize; 2];
        for r in &report.results {
            if matches!(r.outcome, Outcome::Failed(_)) {
                failed_into[r.item.kind.target() as usize] += 1;
            }
        }
        let deletes = self.defer_replaced_deletes(catalog, deletes, failed_into, &mut report);

        self.run_phase(catalog, deletes, &mut report, cancel).await?;
        report.cancelled = cancel.is_cancelled();
        Ok(report)
    }

    /// Each failed transfer into a side keeps one count-driven deletion on
    /// that side (newest first) for a later cycle.
    fn defer_replaced_deletes(
        &self,
        catalog: &SnapshotCatalog,
        deletes: Vec<ActionPlanItem>,
        failed_into: [usize; 2],
        report: &mut ExecutionReport,
    ) -> Vec<ActionPlanItem> {
        let mut budget = failed_into;
        let mut order: Vec<usize> = (0..deletes.len()).collect();
        order.sort_by(|a, b| {
            let created = |i: usize| catalog.get(&deletes[i].backup_id).map(|r| r.created_at);
            created(*b).cmp(&created(*a))
        });

        let mut deferred = vec![false; deletes.len()];
        for i in order {
            let item = &deletes[i];
            let side = item.kind.target() as usize;
            if item.reason == Some(DeleteReason::Count) && budget[side] > 0 {
                budget[side] -= 1;
                deferred[i] = true;
            }
        }

        let mut kept = Vec::new();
        for (item, defer) in deletes.into_iter().zip(deferred) {
            if defer {
                tracing::warn!(
                    backup_id = %item.backup_id,
                    kind = %item.kind,
                    "Deferring deletion; a replacement transfer failed"
                );
                self.events.publish(EngineEvent::ActionDeferred {
                    backup_id: item.backup_id.clone(),
                    kind: item.kind,
                });
                report.push(item, Outcome::Deferred);
            } else {
                kept.push(item);
            }
        }
        kept
    }

    fn spawn(
        &self,
        running: &mut JoinSet<AttemptOutcome>,
        item: ActionPlanItem,
        record: BackupRecord,
        delay: Option<Duration>,
        cancel: &CancellationToken,
    ) {
        let adapters = self.adapters.clone();
        let timeout = self.config.call_timeout;
        let cancel = cancel.clone();
        let fallback = item.clone();
        running.spawn(async move {
            match AssertUnwindSafe(attempt(adapters, item, record, delay, timeout, cancel))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => AttemptOutcome {
                    item: fallback,
                    result: AttemptResult::Panicked,
                },
            }
        });
    }

    async fn run_phase(
        &self,
        catalog: &mut SnapshotCatalog,
        items: Vec<ActionPlanItem>,
        report: &mut ExecutionReport,
        cancel: &CancellationToken,
    ) -> Result<(), CycleError> {
        let mut queue: VecDeque<ActionPlanItem> = items.into();
        let mut running: JoinSet<AttemptOutcome> = JoinSet::new();
        let mut store_error: Option<anyhow::Error> = None;

        loop {
            while running.len() < self.config.concurrency && !cancel.is_cancelled() && store_error.is_none() {
                let Some(mut item) = queue.pop_front() else { break };

                if let Some(side) = item.kind.touches().iter().find(|s| report.revoked.contains(*s)) {
                    let msg = format!("{side} credentials were revoked earlier in this cycle");
                    if let Err(e) = self.fail(catalog, &mut item, msg.clone()).await {
                        store_error = Some(e);
                    }
                    report.push(item, Outcome::Failed(msg));
                    continue;
                }
                let Some(record) = catalog.get(&item.backup_id).cloned() else {
                    tracing::debug!(backup_id = %item.backup_id, "Backup vanished before its action started");
                    report.push(item, Outcome::Dropped);
                    continue;
                };

                // Carried over from before a restart with its attempts already spent.
                if item.attempt >= self.config.max_attempts {
                    let msg = format!("gave up after {} attempts", item.attempt);
                    if let Err(e) = self.fail(catalog, &mut item, msg.clone()).await {
                        store_error = Some(e);
                    }
                    report.push(item, Outcome::Failed(msg));
                    continue;
                }

                item.attempt += 1;
                if let Err(e) = self.store.mark_inflight(item.clone()).await {
                    tracing::error!(backup_id = %item.backup_id, "Failed to record in-flight marker: {e:#}");
                    item.attempt -= 1;
                    store_error = Some(e);
                    report.push(item, Outcome::Dropped);
                    break;
                }
                tracing::info!(backup_id = %item.backup_id, kind = %item.kind, attempt = item.attempt, "Starting action");
                self.events.publish(EngineEvent::ActionStarted {
                    backup_id: item.backup_id.clone(),
                    kind: item.kind,
                    attempt: item.attempt,
                });
                self.spawn(&mut running, item, record, None, cancel);
            }

            let Some(joined) = running.join_next().await else { break };
            let AttemptOutcome { mut item, result } = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Identity is lost; the marker stays for recovery.
                    tracing::error!("Action worker aborted: {e}");
                    continue;
                }
            };

            match result {
                AttemptResult::Interrupted => {
                    // The pending retry never ran.
                    item.attempt = item.attempt.saturating_sub(1);
                    if let Err(e) = self.store.mark_inflight(item.clone()).await {
                        store_error = Some(e);
                    }
                    tracing::info!(backup_id = %item.backup_id, kind = %item.kind, "Retry dropped by cancellation");
                    report.push(item, Outcome::Dropped);
                }
                AttemptResult::Panicked => {
                    tracing::error!(backup_id = %item.backup_id, kind = %item.kind, "Action worker panicked; leaving it for recovery");
                    report.push(item, Outcome::Dropped);
                }
                AttemptResult::Done(Ok(effect)) => {
                    if let Err(e) = self.succeed(catalog, &mut item, effect).await {
                        store_error = Some(e);
                    }
                    report.push(item, Outcome::Succeeded);
                }
                AttemptResult::Done(Err(failure)) => {
                    if failure.error.is_unauthorized() && !report.revoked.contains(failure.side) {
                        tracing::error!(side = %failure.side, "Credentials rejected; failing remaining {} actions", failure.side);
                        report.revoked.insert(failure.side);
                    }
                    let message = failure.error.to_string();

                    let retryable = failure.error.is_transient()
                        && item.attempt < self.config.max_attempts
                        && !cancel.is_cancelled()
                        && store_error.is_none();
                    if !retryable {
                        if let Err(e) = self.fail(catalog, &mut item, message.clone()).await {
                            store_error = Some(e);
                        }
                        report.push(item, Outcome::Failed(message));
                        continue;
                    }

                    let delay = self.config.backoff.delay(item.attempt);
                    item.retry_delays_ms.push(delay.as_millis() as u64);
                    item.last_error = Some(message.clone());
                    item.attempt += 1;
                    tracing::warn!(
                        backup_id = %item.backup_id,
                        kind = %item.kind,
                        attempt = item.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Transient failure; retrying"
                    );
                    self.events.publish(EngineEvent::ActionRetry {
                        backup_id: item.backup_id.clone(),
                        kind: item.kind,
                        attempt: item.attempt,
                        delay_ms: delay.as_millis() as u64,
                        error: message,
                    });
                    if let Err(e) = self.store.mark_inflight(item.clone()).await {
                        store_error = Some(e);
                    }
                    match catalog.get(&item.backup_id).cloned() {
                        Some(record) => self.spawn(&mut running, item, record, Some(delay), cancel),
                        None => report.push(item, Outcome::Dropped),
                    }
                }
            }
        }

        for item in queue {
            report.push(item, Outcome::Dropped);
        }
        match store_error {
            Some(e) => Err(CycleError::Store(e)),
            None => Ok(()),
        }
    }

    async fn succeed(&self, catalog: &mut SnapshotCatalog, item: &mut ActionPlanItem, effect: Effect) -> anyhow::Result<()> {
        let id = item.backup_id.clone();
        let side = item.kind.target();
        item.last_error = None;

        let record = match effect {
            Effect::Stored(snapshot) => {
                catalog.add_copy(&snapshot, &id);
                catalog.get_mut(&id).map(|r| {
                    r.last_error = None;
                    if item.kind == ActionKind::Download {
                        r.restore_requested = false;
                    }
                    r.clone()
                })
            }
            Effect::Removed => {
                if let Some(r) = catalog.get_mut(&id) {
                    r.retired.insert(side);
                    r.last_error = None;
                }
                catalog.remove_copy(&id, side).cloned()
            }
        };

        tracing::info!(backup_id = %id, kind = %item.kind, attempt = item.attempt, "Action completed");
        self.events.publish(EngineEvent::ActionCompleted {
            backup_id: id.clone(),
            kind: item.kind,
            attempt: item.attempt,
        });

        self.store.complete_action(&id, record).await?;
        if item.kind == ActionKind::Download {
            self.store.set_restore_requested(&id, false).await?;
        }
        Ok(())
    }

    async fn fail(&self, catalog: &mut SnapshotCatalog, item: &mut ActionPlanItem, message: String) -> anyhow::Result<()> {
        item.last_error = Some(message.clone());
        let record = catalog.get_mut(&item.backup_id).map(|r| {
            r.last_error = Some(message.clone());
            r.clone()
        });

        tracing::error!(
            backup_id = %item.backup_id,
            kind = %item.kind,
            attempt = item.attempt,
            error = %message,
            "Action failed"
        );
        self.events.publish(EngineEvent::ActionFailed {
            backup_id: item.backup_id.clone(),
            kind: item.kind,
            attempt: item.attempt,
            error: message,
        });

        match record {
            Some(r) => self.store.complete_action(&item.backup_id, Some(r)).await,
            None => self.store.clear_inflight(&item.backup_id).await,
        }
    }
}
