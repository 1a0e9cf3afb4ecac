//! Which copies each side should delete to get back within its limits.
//!
//! Everything here is pure: the caller passes the presence it wants evaluated
//! (usually the catalog plus the copies a plan is about to create).

use crate::config::{RetentionLimits, RetentionPolicy};
use crate::models::action::{ActionPlanItem, DeleteReason};
use crate::models::backup::{BackupRecord, Side, SideSet};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

/// One record as a retention input.
#[derive(Debug, Clone, Copy)]
pub struct Projected<'a> {
    pub record: &'a BackupRecord,
    pub presence: SideSet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub id: String,
    pub reason: DeleteReason,
}

fn oldest_first(a: &BackupRecord, b: &BackupRecord) -> std::cmp::Ordering {
    a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
}

/// Copies on `side` to delete, oldest first, stopping once within limits.
///
/// Records pinned to `side` are never selected but still count toward the limit.
pub fn select(entries: &[Projected<'_>], side: Side, limits: RetentionLimits, now: DateTime<Utc>) -> Vec<Selection> {
    let mut on_side: Vec<&BackupRecord> = entries
        .iter()
        .filter(|p| p.presence.contains(side))
        .map(|p| p.record)
        .collect();
    on_side.sort_by(|a, b| oldest_first(a, b));

    let cutoff = limits.max_age_days.map(|days| now - Duration::days(days as i64));
    let mut remaining = on_side.len();
    let mut selected = Vec::new();

    for record in on_side {
        let over_count = limits.max_count.is_some_and(|max| remaining > max);
        let too_old = cutoff.is_some_and(|c| record.created_at < c);
        if !over_count && !too_old {
            // Everything after this is newer, so nothing else is too old either.
            break;
        }
        if record.pinned().contains(side) {
            continue;
        }
        selected.push(Selection {
            id: record.id.clone(),
            reason: if too_old { DeleteReason::Age } else { DeleteReason::Count },
        });
        remaining -= 1;
    }
    selected
}

/// Whether `record` should keep a copy on `side`.
///
/// A side stops wanting its copy only once it is retired: the engine deleted
/// it there in a completed cycle, or the record is an extra remote copy of
/// another backup. Pinned sides always want it.
pub fn wanted_on(record: &BackupRecord, side: Side) -> bool {
    record.pinned().contains(side) || !record.retired.contains(side)
}

/// Delete actions for both sides, guarded so a record never loses its last
/// copy unless the other side was retired in an earlier cycle, and never
/// loses both copies in one pass. Returned oldest first.
pub fn evaluate(entries: &[Projected<'_>], policy: &RetentionPolicy, now: DateTime<Utc>) -> Vec<ActionPlanItem> {
    let mut chosen: BTreeMap<&str, Vec<(Side, DeleteReason)>> = BTreeMap::new();
    for side in Side::ALL {
        for sel in select(entries, side, policy.limits(side), now) {
            if let Some(p) = entries.iter().find(|p| p.record.id == sel.id) {
                chosen.entry(p.record.id.as_str()).or_default().push((side, sel.reason));
            }
        }
    }

    let mut deletes: Vec<(&BackupRecord, ActionPlanItem)> = Vec::new();
    for entry in entries {
        let Some(sides) = chosen.get(entry.record.id.as_str()) else {
            continue;
        };
        let pick = if sides.len() > 1 {
            tracing::debug!(
                backup_id = %entry.record.id,
                first = %policy.delete_first,
                "Both sides selected; deferring the other side to a later cycle"
            );
            sides.iter().find(|(s, _)| *s == policy.delete_first)
        } else {
            sides.first()
        };
        let Some(&(side, reason)) = pick else {
            continue;
        };

        let mut after = entry.presence;
        after.remove(side);
        if after.is_empty() && wanted_on(entry.record, side.other()) {
            tracing::debug!(
                backup_id = %entry.record.id,
                side = %side,
                "Keeping last copy; the other side never retired it"
            );
            continue;
        }
        deletes.push((entry.record, ActionPlanItem::delete(side, entry.record.id.clone(), reason)));
    }

    deletes.sort_by(|(a, _), (b, _)| oldest_first(a, b));
    deletes.into_iter().map(|(_, item)| item).collect()
}
