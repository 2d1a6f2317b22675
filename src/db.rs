//! SQLite pool construction and inline DDL migrations.
//!
//! Following the teacher's pattern, table creation is idempotent and lives
//! next to each store as an `initialize()` method rather than a separate
//! migration-runner binary (external migration tooling is a Non-goal). This
//! module just opens the pool and calls each store's `initialize()` once, in
//! dependency order (leaf stores first).

use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Open (creating if necessary) the SQLite database at `path` and return a
/// connection pool sized for a single long-running daemon process.
pub async fn open_pool(path: &Path) -> Result<sqlx::SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Run every store's idempotent `initialize()` against `pool`, in dependency
/// order so foreign keys always reference an already-created table.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    crate::identity::IdentityStore::initialize(pool).await?;
    crate::bots::BotStore::initialize(pool).await?;
    crate::routes::RouteStore::initialize(pool).await?;
    crate::messages::MessageStore::initialize(pool).await?;
    crate::media::MediaStore::initialize(pool).await?;
    crate::scheduler::ScheduleStore::initialize(pool).await?;
    crate::inbox::InboxStore::initialize(pool).await?;
    crate::bots::lifecycle_events::initialize(pool).await?;
    Ok(())
}
