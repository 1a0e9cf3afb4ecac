use rusqlite::{params, Connection, Row};
use serde::Serialize;

// ── Cycle history ──

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleLog {
    pub id: i64,
    pub trigger: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub succeeded: i64,
    pub failed: i64,
    pub deferred: i64,
    pub dropped: i64,
    pub error: Option<String>,
}

/// Counters written when a cycle finishes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleTotals {
    pub succeeded: usize,
    pub failed: usize,
    pub deferred: usize,
    pub dropped: usize,
}

fn row_to_log(row: &Row) -> rusqlite::Result<CycleLog> {
    Ok(CycleLog {
        id: row.get("id")?,
        trigger: row.get("trigger")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        status: row.get("status")?,
        succeeded: row.get("succeeded")?,
        failed: row.get("failed")?,
        deferred: row.get("deferred")?,
        dropped: row.get("dropped")?,
        error: row.get("error")?,
    })
}

pub fn start(conn: &Connection, trigger: &str, started_at: &str) -> anyhow::Result<i64> {
    conn.execute(
        "INSERT INTO cycles (trigger, started_at) VALUES (?1, ?2)",
        params![trigger, started_at],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn finish(
    conn: &Connection,
    id: i64,
    status: &str,
    totals: &CycleTotals,
    error: Option<&str>,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE cycles SET finished_at = ?1, status = ?2, succeeded = ?3, failed = ?4,
                           deferred = ?5, dropped = ?6, error = ?7
         WHERE id = ?8",
        params![
            chrono::Utc::now().to_rfc3339(),
            status,
            totals.succeeded as i64,
            totals.failed as i64,
            totals.deferred as i64,
            totals.dropped as i64,
            error,
            id,
        ],
    )?;
    Ok(())
}

pub fn find_recent(conn: &Connection, limit: usize) -> anyhow::Result<Vec<CycleLog>> {
    let mut stmt = conn.prepare("SELECT * FROM cycles ORDER BY started_at DESC, id DESC LIMIT ?")?;
    let rows = stmt.query_map(params![limit as i64], row_to_log)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Most recent cycle that did not succeed, for the status endpoint.
pub fn find_last_failure(conn: &Connection) -> anyhow::Result<Option<CycleLog>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM cycles WHERE status NOT IN ('running', 'succeeded')
         ORDER BY started_at DESC, id DESC LIMIT 1",
    )?;
    let mut rows = stmt.query_map([], row_to_log)?;
    Ok(rows.next().transpose()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::memory_conn;

    #[test]
    fn test_start_then_finish() {
        let conn = memory_conn();
        let first = start(&conn, "startup", "2024-05-01T00:00:00+00:00").unwrap();
        let second = start(&conn, "manual", "2024-05-01T01:00:00+00:00").unwrap();
        finish(
            &conn,
            first,
            "partial_failure",
            &CycleTotals { succeeded: 2, failed: 1, ..Default::default() },
            Some("1 action failed"),
        )
        .unwrap();

        let logs = find_recent(&conn, 10).unwrap();
        assert_eq!(logs.iter().map(|l| l.id).collect::<Vec<_>>(), vec![second, first]);
        assert_eq!(logs[1].succeeded, 2);
        assert_eq!(logs[1].status, "partial_failure");
        assert_eq!(logs[0].status, "running");

        let failure = find_last_failure(&conn).unwrap().unwrap();
        assert_eq!(failure.id, first);
    }
}
