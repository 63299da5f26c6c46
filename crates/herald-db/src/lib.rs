//! SQLite persistence for Herald.
//!
//! Owns the connection pool (via `r2d2`) and the embedded schema
//! migrations that create the `channels` and `rules` tables. Higher
//! layers borrow connections from the pool and never run DDL themselves.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
