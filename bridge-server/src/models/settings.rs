use crate::config::EngineSettings;
use rusqlite::{params, Connection};

const ENGINE_KEY: &str = "engine";

pub fn get(conn: &Connection, key: &str) -> anyhow::Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = ?")?;
    let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
    Ok(rows.next().transpose()?)
}

pub fn set(conn: &Connection, key: &str, value: &str) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

/// Stored engine settings, or defaults when nothing was saved yet.
pub fn load_engine(conn: &Connection) -> anyhow::Result<EngineSettings> {
    match get(conn, ENGINE_KEY)? {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Ok(EngineSettings::default()),
    }
}

pub fn save_engine(conn: &Connection, settings: &EngineSettings) -> anyhow::Result<()> {
    set(conn, ENGINE_KEY, &serde_json::to_string(settings)?)
}
