use crate::paths::AppPaths;
use crate::Result;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::time::Duration;

pub fn open(paths: &AppPaths) -> Result<Connection> {
    paths.ensure_dirs()?;

    let conn = Connection::open_with_flags(
        paths.history_db_path(),
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
    )?;

    conn.busy_timeout(Duration::from_secs(10))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;

    Ok(conn)
}

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  url TEXT NOT NULL,
  title TEXT,
  created_at_ms INTEGER NOT NULL
);
"#,
    )?;

    // Older databases only carried url/title/timestamp; add the newer columns in place.
    for (column, ddl) in [
        ("format", "ALTER TABLE history ADD COLUMN format TEXT"),
        ("dest_path", "ALTER TABLE history ADD COLUMN dest_path TEXT"),
        (
            "operation",
            "ALTER TABLE history ADD COLUMN operation TEXT NOT NULL DEFAULT 'download'",
        ),
    ] {
        if !has_column(conn, "history", column)? {
            conn.execute(ddl, [])?;
        }
    }
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_history_created ON history(created_at_ms, id)",
        [],
    )?;

    let current_schema_version = 2;
    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key='schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(v) if v == current_schema_version.to_string() => {}
        _ => {
            conn.execute(
                "INSERT INTO meta(key, value) VALUES('schema_version', ?)
                 ON CONFLICT(key) DO UPDATE SET value=excluded.value",
                [current_schema_version.to_string()],
            )?;
        }
    }

    Ok(())
}

pub fn ensure_schema(paths: &AppPaths) -> Result<()> {
    let conn = open(paths)?;
    migrate(&conn)?;
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_backfills_columns_for_legacy_history_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        paths.ensure_dirs().expect("ensure dirs");

        {
            let conn = Connection::open(paths.history_db_path()).expect("open");
            conn.execute_batch(
                r#"
CREATE TABLE IF NOT EXISTS history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  url TEXT NOT NULL,
  title TEXT,
  created_at_ms INTEGER NOT NULL
);
INSERT INTO history(url, title, created_at_ms) VALUES ('https://example.com/a', 'A', 1);
"#,
            )
            .expect("create legacy history table");
        }

        let conn = open(&paths).expect("open migrated");
        migrate(&conn).expect("migrate");

        assert!(has_column(&conn, "history", "format").expect("format"));
        assert!(has_column(&conn, "history", "dest_path").expect("dest_path"));
        let operation: String = conn
            .query_row("SELECT operation FROM history WHERE title='A'", [], |row| {
                row.get(0)
            })
            .expect("operation");
        assert_eq!(operation, "download");
    }

    #[test]
    fn migrate_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let conn = open(&paths).expect("open");
        migrate(&conn).expect("first");
        migrate(&conn).expect("second");
        let version: String = conn
            .query_row(
                "SELECT value FROM meta WHERE key='schema_version'",
                [],
                |row| row.get(0),
            )
            .expect("version");
        assert_eq!(version, "2");
    }
}
