use crate::db::connection::DbPool;

pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backups (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  created_at TEXT NOT NULL,
  size_bytes INTEGER NOT NULL DEFAULT 0,
  local_handle TEXT,
  remote_handle TEXT,
  protected INTEGER NOT NULL DEFAULT 0,
  restore_requested INTEGER NOT NULL DEFAULT 0,
  retired_local INTEGER NOT NULL DEFAULT 0,
  retired_remote INTEGER NOT NULL DEFAULT 0,
  last_error TEXT,
  updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS inflight_actions (
  backup_id TEXT PRIMARY KEY,
  kind TEXT NOT NULL CHECK(kind IN ('upload','download','delete_local','delete_remote')),
  attempt INTEGER NOT NULL DEFAULT 0,
  last_error TEXT,
  retry_delays TEXT NOT NULL DEFAULT '[]',
  reason TEXT CHECK(reason IS NULL OR reason IN ('count','age')),
  started_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cycles (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  trigger TEXT NOT NULL CHECK(trigger IN ('startup','timer','manual')),
  started_at TEXT NOT NULL,
  finished_at TEXT,
  status TEXT NOT NULL DEFAULT 'running',
  succeeded INTEGER NOT NULL DEFAULT 0,
  failed INTEGER NOT NULL DEFAULT 0,
  deferred INTEGER NOT NULL DEFAULT 0,
  dropped INTEGER NOT NULL DEFAULT 0,
  error TEXT
);

CREATE INDEX IF NOT EXISTS idx_backups_created_at ON backups(created_at);
CREATE INDEX IF NOT EXISTS idx_cycles_started_at ON cycles(started_at DESC);
"#;

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    // A cycle row still marked running belongs to a process that died mid-cycle.
    let orphaned = conn.execute(
        "UPDATE cycles SET status = 'interrupted', finished_at = datetime('now') WHERE status = 'running'",
        [],
    )?;
    if orphaned > 0 {
        tracing::warn!("[DB] Marked {} unfinished cycle(s) as interrupted", orphaned);
    }

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}
