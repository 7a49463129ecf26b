mod schema;

use std::path::Path;
use std::time::Duration;

use log::{error, info};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};

use crate::config::DatabaseConfig;
use crate::error::EngineError;

pub use schema::SCHEMA_VERSION;
use schema::CREATE_SCHEMA_SQL;

pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Pooled handle on the engine's SQLite database.
///
/// Cheap to clone; every clone shares the same pool.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    pub fn open(db_path: &Path, config: &DatabaseConfig) -> Result<Self, EngineError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        let manager = SqliteConnectionManager::file(db_path).with_init(move |c| {
            c.busy_timeout(busy_timeout)?;
            c.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))?;
            c.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .build(manager)?;

        let db = Database { pool };

        let conn = db.get_connection()?;
        Self::ensure_schema(&conn)?;

        info!("Database opened at: {}", db_path.display());

        Ok(db)
    }

    pub fn get_connection(&self) -> Result<DbConnection, EngineError> {
        Ok(self.pool.get()?)
    }

    /// Run `func` inside `BEGIN IMMEDIATE` .. `COMMIT`.
    ///
    /// The write lock is taken up front so a read-check-write sequence inside
    /// `func` cannot be interleaved with another writer. Any error rolls the
    /// whole unit back.
    pub fn immediate_transaction<T, F>(conn: &Connection, func: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, EngineError>,
    {
        conn.execute_batch("BEGIN IMMEDIATE")?;

        let result = func(conn).and_then(|value| {
            conn.execute_batch("COMMIT")?;
            Ok(value)
        });

        if result.is_err() && !conn.is_autocommit() {
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                error!("Failed to roll back transaction: {}", e);
            }
        }

        result
    }

    pub fn get_meta_value_locked(conn: &Connection, key: &str) -> Result<Option<String>, EngineError> {
        let value = conn
            .query_row("SELECT value FROM meta WHERE key = ?", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn set_meta_value_locked(conn: &Connection, key: &str, value: &str) -> Result<(), EngineError> {
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn ensure_schema(conn: &Connection) -> Result<(), EngineError> {
        let table_exists: bool = conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='meta'",
            [],
            |row| row.get::<_, i64>(0).map(|count| count > 0),
        )?;

        if !table_exists {
            return Self::immediate_transaction(conn, |c| {
                c.execute_batch(CREATE_SCHEMA_SQL)?;
                Self::set_meta_value_locked(c, "schema_version", SCHEMA_VERSION)?;
                info!("Created schema version {}", SCHEMA_VERSION);
                Ok(())
            });
        }

        let stored_version = Self::get_meta_value_locked(conn, "schema_version")?;

        match stored_version.as_deref() {
            Some(SCHEMA_VERSION) => Ok(()),
            Some(other) => Err(EngineError::Error(format!(
                "Schema version mismatch: database is at '{}', expected '{}'",
                other, SCHEMA_VERSION
            ))),
            None => Err(EngineError::Error("Schema version missing".to_string())),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// Open a fresh on-disk database. Keep the TempDir alive for the test's duration.
    pub fn temp_db() -> (TempDir, Database) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = Database::open(&dir.path().join("test.db"), &DatabaseConfig::default())
            .expect("Failed to open database");
        (dir, db)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::temp_db;
    use super::*;

    #[test]
    fn test_schema_created_and_versioned() {
        let (_dir, db) = temp_db();
        let conn = db.get_connection().unwrap();
        let version = Database::get_meta_value_locked(&conn, "schema_version").unwrap();
        assert_eq!(version.as_deref(), Some(SCHEMA_VERSION));
    }

    #[test]
    fn test_reopen_accepts_current_schema() {
        let (dir, _db) = temp_db();
        let reopened = Database::open(&dir.path().join("test.db"), &DatabaseConfig::default());
        assert!(reopened.is_ok());
    }

    #[test]
    fn test_reopen_rejects_unknown_schema_version() {
        let (dir, db) = temp_db();
        {
            let conn = db.get_connection().unwrap();
            Database::set_meta_value_locked(&conn, "schema_version", "999").unwrap();
        }
        let reopened = Database::open(&dir.path().join("test.db"), &DatabaseConfig::default());
        assert!(matches!(reopened, Err(EngineError::Error(_))));
    }

    #[test]
    fn test_immediate_transaction_rolls_back_on_error() {
        let (_dir, db) = temp_db();
        let conn = db.get_connection().unwrap();

        let result: Result<(), EngineError> = Database::immediate_transaction(&conn, |c| {
            Database::set_meta_value_locked(c, "probe", "written")?;
            Err(EngineError::Error("abort".into()))
        });
        assert!(result.is_err());
        assert!(conn.is_autocommit());
        assert_eq!(Database::get_meta_value_locked(&conn, "probe").unwrap(), None);

        Database::immediate_transaction(&conn, |c| Database::set_meta_value_locked(c, "probe", "kept"))
            .unwrap();
        assert_eq!(
            Database::get_meta_value_locked(&conn, "probe").unwrap().as_deref(),
            Some("kept")
        );
    }
}
