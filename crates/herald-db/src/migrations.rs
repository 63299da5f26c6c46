//! Embedded schema migrations.
//!
//! Each migration is a SQL file compiled into the binary. Applied names are
//! recorded in `_herald_migrations`; a migration and its tracking row are
//! committed in one transaction, so a failure leaves no partial schema.

use rusqlite::Connection;
use thiserror::Error;

struct Migration {
    name: &'static str,
    sql: &'static str,
}

/// Migrations in application order. Append only.
const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "000_init",
        sql: include_str!("migrations/000_init.sql"),
    },
    Migration {
        name: "001_channels",
        sql: include_str!("migrations/001_channels.sql"),
    },
    Migration {
        name: "002_rules",
        sql: include_str!("migrations/002_rules.sql"),
    },
];

/// Errors that can occur while migrating the schema.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A statement inside a migration (or its bookkeeping) failed.
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        name: String,
        source: rusqlite::Error,
    },

    /// The tracking table could not be read.
    #[error("failed to check migration state: {0}")]
    StateQuery(rusqlite::Error),
}

/// Applies every migration that has not run yet and returns how many ran.
///
/// # Errors
///
/// Returns `MigrationError` if a migration fails or the tracking table cannot
/// be queried. A failed migration is rolled back in full.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    apply(conn, MIGRATIONS)
}

fn apply(conn: &Connection, migrations: &[Migration]) -> Result<usize, MigrationError> {
    let failed = |name: &str| {
        let name = name.to_string();
        move |source| MigrationError::ExecutionFailed { name, source }
    };

    conn.execute_batch(include_str!("migrations/000_init.sql"))
        .map_err(failed("_herald_migrations_bootstrap"))?;

    let mut applied = 0;
    for migration in migrations {
        let done: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM _herald_migrations WHERE name = ?1)",
                [migration.name],
                |row| row.get(0),
            )
            .map_err(MigrationError::StateQuery)?;
        if done {
            tracing::debug!(migration = migration.name, "migration already applied");
            continue;
        }

        tracing::info!(migration = migration.name, "applying migration");

        let tx = conn
            .unchecked_transaction()
            .map_err(failed(migration.name))?;
        tx.execute_batch(migration.sql)
            .map_err(failed(migration.name))?;
        tx.execute(
            "INSERT INTO _herald_migrations (name) VALUES (?1)",
            [migration.name],
        )
        .map_err(failed(migration.name))?;
        tx.commit().map_err(failed(migration.name))?;

        applied += 1;
    }

    Ok(applied)
}
