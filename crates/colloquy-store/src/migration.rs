//! Versioned SQLite schema migrations.
//!
//! Each version is a SQL batch taking the schema from N-1 to N. Applied
//! versions are recorded in `schema_migrations`, so `migrate` is safe to
//! run on every open.

use rusqlite::{params, Connection};

use crate::error::{Result, StoreError};

/// Schema version this build expects.
pub const CURRENT_VERSION: u32 = 1;

/// Bring the database up to [`CURRENT_VERSION`].
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let applied: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if applied >= CURRENT_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for version in (applied + 1)..=CURRENT_VERSION {
        match version {
            1 => apply_v1(&tx)?,
            other => {
                return Err(StoreError::Migration(format!(
                    "no migration registered for version {other}"
                )))
            }
        }
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, now_millis()],
        )?;
    }
    tx.commit()?;

    Ok(())
}

/// v1: sessions and the append-only message log.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Session metadata. Rows are deactivated, never deleted.
        CREATE TABLE sessions (
            session_id TEXT PRIMARY KEY,      -- UUID, hyphenated
            name TEXT NOT NULL,
            user_id TEXT,
            created_at INTEGER NOT NULL,      -- Unix ms
            last_message_at INTEGER,          -- Unix ms of latest user/assistant append
            preview TEXT,                     -- truncated latest user/assistant content
            is_active INTEGER NOT NULL DEFAULT 1
        );

        -- Message log. Append-only; rowid is the per-session insertion order.
        CREATE TABLE messages (
            message_id TEXT PRIMARY KEY,      -- UUID, server-assigned
            session_id TEXT NOT NULL,
            role TEXT NOT NULL,               -- user | assistant | system
            content TEXT NOT NULL,
            agent_name TEXT,
            user_id TEXT,
            timestamp INTEGER NOT NULL,       -- Unix ms, non-decreasing per session
            metadata TEXT NOT NULL DEFAULT '{}'  -- JSON object
        );

        -- Indexes for common queries
        CREATE INDEX idx_messages_session_ts ON messages(session_id, timestamp);
        CREATE INDEX idx_sessions_user ON sessions(user_id);
        CREATE INDEX idx_sessions_activity ON sessions(is_active, last_message_at);
        "#,
    )?;

    Ok(())
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables = table_names(&conn);
        assert!(tables.contains(&"sessions".to_string()));
        assert!(tables.contains(&"messages".to_string()));
        assert!(tables.contains(&"schema_migrations".to_string()));
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        for _ in 0..3 {
            migrate(&mut conn).unwrap();
        }

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }
}
