use rusqlite::{params, Connection};

use crate::db::DatabaseError;

/// Get a stored document by key. Returns None if not set.
pub fn get_slot(conn: &Connection, key: &str) -> Result<Option<String>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT value FROM learned_patterns WHERE key = ?1")?;
    match stmt.query_row([key], |row| row.get::<_, String>(0)) {
        Ok(val) => Ok(Some(val)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(DatabaseError::from(e)),
    }
}

/// Store a document under key (upsert).
pub fn set_slot(conn: &Connection, key: &str, value: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO learned_patterns (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
        params![key, value],
    )?;
    Ok(())
}
