use crate::models::backup::{BackupRecord, Side, SideSet};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, HashSet};

// ── Persisted catalog ──

pub(crate) fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_record(row: &Row) -> rusqlite::Result<BackupRecord> {
    let created_at = parse_ts(2, row.get("created_at")?)?;
    let local_handle: Option<String> = row.get("local_handle")?;
    let remote_handle: Option<String> = row.get("remote_handle")?;

    let mut handles = BTreeMap::new();
    let mut presence = SideSet::EMPTY;
    for (side, handle) in [(Side::Local, local_handle), (Side::Remote, remote_handle)] {
        if let Some(h) = handle {
            presence.insert(side);
            handles.insert(side, h);
        }
    }

    Ok(BackupRecord {
        id: row.get("id")?,
        name: row.get("name")?,
        created_at,
        size_bytes: row.get::<_, i64>("size_bytes")? as u64,
        presence,
        handles,
        protected: row.get::<_, i64>("protected")? != 0,
        restore_requested: row.get::<_, i64>("restore_requested")? != 0,
        retired: SideSet {
            local: row.get::<_, i64>("retired_local")? != 0,
            remote: row.get::<_, i64>("retired_remote")? != 0,
        },
        last_error: row.get("last_error")?,
    })
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<BackupRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM backups ORDER BY created_at DESC, id ASC")?;
    let rows = stmt.query_map([], row_to_record)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<BackupRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM backups WHERE id = ?")?;
    Ok(stmt.query_row(params![id], row_to_record).optional()?)
}

/// Writes what the engine observed. `protected` and `restore_requested` are
/// owned by the API and only set here when the row is new.
pub fn upsert(conn: &Connection, record: &BackupRecord) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO backups (id, name, created_at, size_bytes, local_handle, remote_handle,
                              protected, restore_requested, retired_local, retired_remote, last_error, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, datetime('now'))
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           created_at = excluded.created_at,
           size_bytes = excluded.size_bytes,
           local_handle = excluded.local_handle,
           remote_handle = excluded.remote_handle,
           retired_local = excluded.retired_local,
           retired_remote = excluded.retired_remote,
           last_error = excluded.last_error,
           updated_at = excluded.updated_at",
        params![
            record.id,
            record.name,
            record.created_at.to_rfc3339(),
            record.size_bytes as i64,
            record.handle(Side::Local),
            record.handle(Side::Remote),
            record.protected as i64,
            record.restore_requested as i64,
            record.retired.local as i64,
            record.retired.remote as i64,
            record.last_error,
        ],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    Ok(conn.execute("DELETE FROM backups WHERE id = ?", params![id])? > 0)
}

/// Makes the table match `records`: upserts all of them and drops every other row.
pub fn replace_all(conn: &mut Connection, records: &[BackupRecord]) -> anyhow::Result<()> {
    let tx = conn.transaction()?;
    let keep: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();

    let existing: Vec<String> = {
        let mut stmt = tx.prepare("SELECT id FROM backups")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>()?
    };
    for id in existing.iter().filter(|id| !keep.contains(id.as_str())) {
        tx.execute("DELETE FROM backups WHERE id = ?", params![id])?;
    }
    for record in records {
        upsert(&tx, record)?;
    }
    tx.commit()?;
    Ok(())
}

pub fn set_protected(conn: &Connection, id: &str, protected: bool) -> anyhow::Result<bool> {
    let n = conn.execute(
        "UPDATE backups SET protected = ?1, updated_at = datetime('now') WHERE id = ?2",
        params![protected as i64, id],
    )?;
    Ok(n > 0)
}

pub fn set_restore_requested(conn: &Connection, id: &str, requested: bool) -> anyhow::Result<bool> {
    let n = conn.execute(
        "UPDATE backups SET restore_requested = ?1, updated_at = datetime('now') WHERE id = ?2",
        params![requested as i64, id],
    )?;
    Ok(n > 0)
}
