pub mod constants;
pub mod migrator;
pub mod models;
pub mod operations;
pub mod sql;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::info;

pub use migrator::run_migrations;

use constants::MEMORY_DB_PATH;

/// Owner of the SQLite pool shared by the queue, batch store and archive.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at `db_path` and run migrations.
    ///
    /// `:memory:` gives a single-connection pool so every caller sees the
    /// same in-memory database.
    pub async fn connect(db_path: &str) -> Result<Self> {
        info!("Initializing database at {:?}", db_path);
        prepare_db_path(db_path)?;

        let pool = if db_path == MEMORY_DB_PATH {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
                .connect_with(options)
                .await?
        } else {
            let options = SqliteConnectOptions::new()
                .filename(db_path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Full)
                .busy_timeout(Duration::from_secs(5))
                .foreign_keys(true);
            SqlitePoolOptions::new()
                .max_connections(8)
                .connect_with(options)
                .await?
        };

        run_migrations(&pool).await?;
        info!("Database initialized successfully");

        Ok(Database { pool })
    }

    /// Fresh in-memory database, used by tests.
    pub async fn in_memory() -> Result<Self> {
        Self::connect(MEMORY_DB_PATH).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// `DB_PATH` is `:memory:` or a plain file path, never a SQLite URL.
/// Missing parent directories are created.
fn prepare_db_path(db_path: &str) -> Result<()> {
    if db_path == MEMORY_DB_PATH {
        return Ok(());
    }
    if db_path.trim().is_empty() || db_path.contains('\0') {
        bail!("DB_PATH must be a file path or {}", MEMORY_DB_PATH);
    }
    if db_path.starts_with("sqlite:") || db_path.starts_with("file:") {
        bail!("DB_PATH takes a file path, not a connection URL: {}", db_path);
    }

    let path = Path::new(db_path);
    if db_path.ends_with(['/', '\\']) || path.file_name().is_none() || path.is_dir() {
        bail!("DB_PATH {:?} does not name a database file", db_path);
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }
    Ok(())
}
