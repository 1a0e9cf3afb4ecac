//! Start-of-cycle handling of actions a previous run left in flight.
//!
//! A marker only says an action may have been under way. The fresh listings
//! decide whether it actually finished; unfinished ones are handed back to the
//! planner so their retry history continues.

use crate::db::StateStore;
use crate::models::action::{ActionKind, ActionPlanItem};
use crate::models::backup::BackupRecord;
use crate::services::catalog::SnapshotCatalog;

fn finished(item: &ActionPlanItem, record: Option<&BackupRecord>) -> bool {
    let side = item.kind.target();
    match item.kind {
        ActionKind::Upload | ActionKind::Download => record.is_some_and(|r| r.presence.contains(side)),
        ActionKind::DeleteLocal | ActionKind::DeleteRemote => !record.is_some_and(|r| r.presence.contains(side)),
    }
}

/// Resolves every in-flight marker against `catalog`, which must already
/// reflect fresh listings. Returns the actions still to be done.
pub async fn recover(catalog: &mut SnapshotCatalog, store: &StateStore) -> anyhow::Result<Vec<ActionPlanItem>> {
    let markers = store.inflight().await?;
    let mut carried = Vec::new();

    for item in markers {
        if !finished(&item, catalog.get(&item.backup_id)) {
            tracing::info!(
                backup_id = %item.backup_id,
                kind = %item.kind,
                attempt = item.attempt,
                "Interrupted action will be resumed"
            );
            store.clear_inflight(&item.backup_id).await?;
            carried.push(item);
            continue;
        }

        tracing::info!(backup_id = %item.backup_id, kind = %item.kind, "Interrupted action had completed");
        let record = catalog.get_mut(&item.backup_id).map(|r| {
            match item.kind {
                ActionKind::DeleteLocal | ActionKind::DeleteRemote => r.retired.insert(item.kind.target()),
                ActionKind::Download => r.restore_requested = false,
                ActionKind::Upload => {}
            }
            r.last_error = None;
            r.clone()
        });
        let gone = record.is_none();
        store.complete_action(&item.backup_id, record).await?;
        if item.kind == ActionKind::Download && !gone {
            store.set_restore_requested(&item.backup_id, false).await?;
        }
    }
    Ok(carried)
}
