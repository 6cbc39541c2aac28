//! SQLite library database adapter.
//!
//! Knows exactly two things about the schema: which columns carry filesystem
//! paths, and how to dump a human-readable summary. Everything else is the
//! application's business.

use crate::adapters::DatabaseAdapter;
use crate::error::{Result, ToolkitError};
use rusqlite::{Connection, OpenFlags};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// (table, column) pairs that store absolute media paths.
const PATH_COLUMNS: &[(&str, &str)] = &[
    ("section_locations", "root_path"),
    ("media_parts", "file"),
];

pub struct SqliteLibraryAdapter;

impl SqliteLibraryAdapter {
    fn backup_path(db: &Path) -> PathBuf {
        let mut name = db.as_os_str().to_os_string();
        name.push(".backup");
        PathBuf::from(name)
    }

    fn apply_mappings(conn: &Connection, mappings: &BTreeMap<String, String>) -> Result<u64> {
        let mut changed = 0u64;
        for &(table, column) in PATH_COLUMNS {
            if !table_exists(conn, table)? {
                continue;
            }
            let sql = format!(
                "UPDATE {table} SET {column} = REPLACE({column}, ?1, ?2) WHERE {column} LIKE ?3"
            );
            for (old_prefix, new_prefix) in mappings {
                let rows = conn
                    .execute(
                        &sql,
                        rusqlite::params![old_prefix, new_prefix, format!("{old_prefix}%")],
                    )
                    .map_err(|e| ToolkitError::Database(e.to_string()))?;
                changed += rows as u64;
            }
        }
        Ok(changed)
    }
}

impl DatabaseAdapter for SqliteLibraryAdapter {
    fn remap_paths(&self, db: &Path, mappings: &BTreeMap<String, String>) -> Result<u64> {
        if mappings.is_empty() {
            return Ok(0);
        }
        if !db.is_file() {
            return Err(ToolkitError::SourceNotFound(db.to_path_buf()));
        }

        // Pre-write safety copy; restored wholesale if anything below fails.
        let backup = Self::backup_path(db);
        std::fs::copy(db, &backup)?;

        let result = Connection::open(db)
            .map_err(|e| ToolkitError::Database(e.to_string()))
            .and_then(|conn| Self::apply_mappings(&conn, mappings));

        match result {
            Ok(changed) => {
                info!(db = %db.display(), changed, "remapped media paths");
                Ok(changed)
            }
            Err(e) => {
                warn!(db = %db.display(), "remap failed, restoring pre-write copy: {e}");
                if let Err(restore_err) = std::fs::copy(&backup, db) {
                    return Err(ToolkitError::Database(format!(
                        "remap failed ({e}) and restoring the pre-write copy also failed: {restore_err}"
                    )));
                }
                Err(e)
            }
        }
    }

    fn integrity_check(&self, db: &Path) -> Result<String> {
        let conn = Connection::open_with_flags(db, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| ToolkitError::Database(e.to_string()))?;
        let verdict: String = conn
            .query_row("PRAGMA integrity_check", [], |row| row.get(0))
            .map_err(|e| ToolkitError::Database(e.to_string()))?;
        Ok(verdict)
    }

    fn export_summary(&self, db: &Path) -> Result<serde_json::Value> {
        let conn = Connection::open_with_flags(db, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| ToolkitError::Database(e.to_string()))?;

        let mut sections = Vec::new();
        if table_exists(&conn, "library_sections")? {
            let mut stmt = conn
                .prepare("SELECT id, name, section_type FROM library_sections ORDER BY id")
                .map_err(|e| ToolkitError::Database(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(serde_json::json!({
                        "id": row.get::<_, i64>(0)?,
                        "name": row.get::<_, String>(1)?,
                        "type": row.get::<_, i64>(2)?,
                    }))
                })
                .map_err(|e| ToolkitError::Database(e.to_string()))?;
            for row in rows {
                sections.push(row.map_err(|e| ToolkitError::Database(e.to_string()))?);
            }
        }

        let mut locations = Vec::new();
        if table_exists(&conn, "section_locations")? {
            let mut stmt = conn
                .prepare("SELECT root_path FROM section_locations ORDER BY id")
                .map_err(|e| ToolkitError::Database(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| ToolkitError::Database(e.to_string()))?;
            for row in rows {
                locations.push(row.map_err(|e| ToolkitError::Database(e.to_string()))?);
            }
        }

        let media_parts = if table_exists(&conn, "media_parts")? {
            conn.query_row("SELECT COUNT(*) FROM media_parts", [], |row| {
                row.get::<_, i64>(0)
            })
            .map_err(|e| ToolkitError::Database(e.to_string()))?
        } else {
            0
        };

        Ok(serde_json::json!({
            "sections": sections,
            "locations": locations,
            "statistics": { "media_parts": media_parts },
        }))
    }
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .map_err(|e| ToolkitError::Database(e.to_string()))?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library_fixture(dir: &Path) -> PathBuf {
        let db = dir.join("library.db");
        let conn = Connection::open(&db).unwrap();
        conn.execute_batch(
            "CREATE TABLE library_sections (id INTEGER PRIMARY KEY, name TEXT, section_type INTEGER);
             CREATE TABLE section_locations (id INTEGER PRIMARY KEY, root_path TEXT);
             CREATE TABLE media_parts (id INTEGER PRIMARY KEY, file TEXT);
             INSERT INTO library_sections VALUES (1, 'Movies', 1);
             INSERT INTO section_locations (root_path) VALUES ('/old/media/movies');
             INSERT INTO media_parts (file) VALUES ('/old/media/movies/film.mkv');
             INSERT INTO media_parts (file) VALUES ('/other/clips/a.mkv');",
        )
        .unwrap();
        db
    }

    #[test]
    fn test_remap_rewrites_prefixed_rows_only() {
        let tmp = tempfile::tempdir().unwrap();
        let db = library_fixture(tmp.path());

        let mut mappings = BTreeMap::new();
        mappings.insert("/old/media".to_string(), "/new/media".to_string());
        let changed = SqliteLibraryAdapter.remap_paths(&db, &mappings).unwrap();
        assert_eq!(changed, 2);

        let conn = Connection::open(&db).unwrap();
        let root: String = conn
            .query_row("SELECT root_path FROM section_locations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(root, "/new/media/movies");
        let untouched: String = conn
            .query_row(
                "SELECT file FROM media_parts WHERE id = 2",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(untouched, "/other/clips/a.mkv");

        assert!(db.with_extension("db.backup").is_file());
    }

    #[test]
    fn test_remap_empty_mapping_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let db = library_fixture(tmp.path());
        let changed = SqliteLibraryAdapter
            .remap_paths(&db, &BTreeMap::new())
            .unwrap();
        assert_eq!(changed, 0);
        assert!(!db.with_extension("db.backup").exists());
    }

    #[test]
    fn test_remap_missing_db_is_source_not_found() {
        let mut mappings = BTreeMap::new();
        mappings.insert("/a".to_string(), "/b".to_string());
        let err = SqliteLibraryAdapter
            .remap_paths(Path::new("/no/such/library.db"), &mappings)
            .unwrap_err();
        assert!(matches!(err, ToolkitError::SourceNotFound(_)));
    }

    #[test]
    fn test_remap_failure_restores_pre_write_copy() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("library.db");
        // Not a SQLite file at all; opening it for writes fails mid-flight
        std::fs::write(&db, b"original-bytes-not-a-database").unwrap();

        let mut mappings = BTreeMap::new();
        mappings.insert("/old".to_string(), "/new".to_string());
        let err = SqliteLibraryAdapter.remap_paths(&db, &mappings).unwrap_err();
        assert!(matches!(err, ToolkitError::Database(_)));
        assert_eq!(
            std::fs::read(&db).unwrap(),
            b"original-bytes-not-a-database"
        );
    }

    #[test]
    fn test_integrity_check_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let db = library_fixture(tmp.path());
        let verdict = SqliteLibraryAdapter.integrity_check(&db).unwrap();
        assert_eq!(verdict, "ok");
    }

    #[test]
    fn test_export_summary() {
        let tmp = tempfile::tempdir().unwrap();
        let db = library_fixture(tmp.path());
        let summary = SqliteLibraryAdapter.export_summary(&db).unwrap();
        assert_eq!(summary["sections"][0]["name"], "Movies");
        assert_eq!(summary["locations"][0], "/old/media/movies");
        assert_eq!(summary["statistics"]["media_parts"], 2);
    }
}
