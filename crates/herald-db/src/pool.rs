//! Connection pool construction.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

/// Pool of SQLite connections shared by the store and the router.
pub type DbPool = Pool<SqliteConnectionManager>;

/// SQLite tunables applied to every pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// How long a writer waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,
    /// Upper bound on open connections.
    pub pool_max_size: u32,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
        }
    }
}

/// Errors that can occur when creating the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),
}

/// Opens a pool on `db_path` with WAL journaling, foreign keys, and the
/// configured busy timeout.
///
/// `:memory:` gives every connection its own private database, so callers
/// that want a shared in-memory database must use `pool_max_size: 1`.
///
/// # Errors
///
/// Returns `PoolError::PoolInit` if the initial connections cannot be opened
/// or configured.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(flags)
        .with_init(move |conn| configure_connection(conn, settings));

    Ok(Pool::builder()
        .max_size(settings.pool_max_size)
        .build(manager)?)
}

fn configure_connection(conn: &mut Connection, settings: DbRuntimeSettings) -> rusqlite::Result<()> {
    // In-memory databases report "memory" and cannot switch to WAL.
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
    if mode != "wal" && mode != "memory" {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("journal_mode stayed at {mode}, expected wal")),
        ));
    }

    conn.execute_batch(&format!(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = {};",
        settings.busy_timeout_ms
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooled_connections_are_configured() {
        let settings = DbRuntimeSettings {
            busy_timeout_ms: 1_250,
            pool_max_size: 2,
        };
        let pool = create_pool(":memory:", settings).expect("pool creation should succeed");
        let conn = pool.get().expect("should get a connection");

        let fk: i32 = conn
            .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
            .expect("should query foreign_keys");
        assert_eq!(fk, 1);

        let busy: i64 = conn
            .query_row("PRAGMA busy_timeout;", [], |row| row.get(0))
            .expect("should query busy_timeout");
        assert_eq!(busy, 1_250);

        assert_eq!(pool.max_size(), 2);
    }

    #[test]
    fn file_database_uses_wal() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("herald.db");
        let pool = create_pool(
            path.to_str().expect("utf-8 path"),
            DbRuntimeSettings::default(),
        )
        .expect("pool creation should succeed");

        let conn = pool.get().expect("should get a connection");
        let mode: String = conn
            .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            .expect("should query journal_mode");
        assert_eq!(mode, "wal");
    }
}
