use crate::models::action::{ActionKind, ActionPlanItem, DeleteReason};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};

// ── In-flight markers ──
//
// A row exists from just before an action's first attempt until it reaches a
// terminal outcome. Rows found at start-up mark actions with unknown outcome.

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn row_to_item(row: &Row) -> rusqlite::Result<ActionPlanItem> {
    let kind: String = row.get("kind")?;
    let kind = ActionKind::parse(&kind).ok_or_else(|| conversion_error(1, format!("unknown action kind {kind}")))?;
    let delays: String = row.get("retry_delays")?;
    let retry_delays_ms: Vec<u64> =
        serde_json::from_str(&delays).map_err(|e| conversion_error(4, e.to_string()))?;
    let reason = row
        .get::<_, Option<String>>("reason")?
        .and_then(|r| DeleteReason::parse(&r));

    Ok(ActionPlanItem {
        kind,
        backup_id: row.get("backup_id")?,
        attempt: row.get::<_, i64>("attempt")? as u32,
        last_error: row.get("last_error")?,
        retry_delays_ms,
        reason,
    })
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<ActionPlanItem>> {
    let mut stmt = conn.prepare("SELECT * FROM inflight_actions ORDER BY started_at ASC, backup_id ASC")?;
    let rows = stmt.query_map([], row_to_item)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Records (or advances) the marker. One marker per backup id.
pub fn put(conn: &Connection, item: &ActionPlanItem) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO inflight_actions (backup_id, kind, attempt, last_error, retry_delays, reason)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(backup_id) DO UPDATE SET
           kind = excluded.kind,
           attempt = excluded.attempt,
           last_error = excluded.last_error,
           retry_delays = excluded.retry_delays,
           reason = excluded.reason",
        params![
            item.backup_id,
            item.kind.as_str(),
            item.attempt as i64,
            item.last_error,
            serde_json::to_string(&item.retry_delays_ms)?,
            item.reason.map(|r| r.as_str()),
        ],
    )?;
    Ok(())
}

pub fn clear(conn: &Connection, backup_id: &str) -> anyhow::Result<()> {
    conn.execute("DELETE FROM inflight_actions WHERE backup_id = ?", params![backup_id])?;
    Ok(())
}
