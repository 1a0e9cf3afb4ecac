use crate::config::RetentionPolicy;
use crate::models::action::{ActionKind, ActionPlanItem};
use crate::models::backup::{BackupRecord, Side};
use crate::services::catalog::SnapshotCatalog;
use crate::services::retention::{self, Projected};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Builds the ordered action plan for one cycle.
///
/// Transfers come first, newest backup first, then deletions, oldest first.
/// There is at most one item per backup id. `carried` holds actions recovered
/// from an interrupted run; matching items continue their retry count.
pub fn plan(
    catalog: &SnapshotCatalog,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
    carried: &[ActionPlanItem],
) -> Vec<ActionPlanItem> {
    let records: Vec<&BackupRecord> = catalog.records().collect();

    let mut transfers: BTreeMap<&str, ActionKind> = BTreeMap::new();
    for record in &records {
        let missing_remote = !record.presence.contains(Side::Remote) && !record.retired.contains(Side::Remote);
        let wanted_local = !record.presence.contains(Side::Local) && record.pinned().contains(Side::Local);
        if missing_remote {
            transfers.insert(record.id.as_str(), ActionKind::Upload);
        } else if wanted_local {
            transfers.insert(record.id.as_str(), ActionKind::Download);
        }
    }

    // Retention sees the copies this plan is about to create, so a new upload
    // can push an older remote copy out. An upload retention would pick itself
    // still runs: its local copy may only go once the remote one was retired.
    let projected = project(&records, &transfers);
    let deletes = retention::evaluate(&projected, policy, now);

    let by_id: BTreeMap<&str, &BackupRecord> = records.iter().map(|r| (r.id.as_str(), *r)).collect();
    let mut ordered: Vec<(&BackupRecord, ActionKind)> = transfers
        .iter()
        .filter_map(|(id, kind)| by_id.get(id).map(|r| (*r, *kind)))
        .collect();
    ordered.sort_by(|(a, _), (b, _)| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

    let mut items: Vec<ActionPlanItem> = ordered
        .into_iter()
        .map(|(r, kind)| ActionPlanItem::new(kind, r.id.clone()))
        .collect();

    // A transfer wins over a delete of the same backup.
    for item in deletes {
        if transfers.contains_key(item.backup_id.as_str()) {
            tracing::debug!(backup_id = %item.backup_id, kind = %item.kind, "Dropping delete; a transfer is planned");
            continue;
        }
        items.push(item);
    }

    for item in items.iter_mut() {
        if let Some(earlier) = carried.iter().find(|c| c.backup_id == item.backup_id) {
            item.resume_from(earlier);
        }
    }
    items
}

fn project<'a>(records: &[&'a BackupRecord], transfers: &BTreeMap<&str, ActionKind>) -> Vec<Projected<'a>> {
    records
        .iter()
        .map(|r| {
            let mut presence = r.presence;
            if let Some(kind) = transfers.get(r.id.as_str()) {
                presence.insert(kind.target());
            }
            Projected { record: *r, presence }
        })
        .collect()
}
