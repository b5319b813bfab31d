//! Database migration implementation (SQLx)

use anyhow::Result;
use sqlx::sqlite::SqlitePool;
use tracing::info;

use super::constants::{CURRENT_SCHEMA_VERSION, MIGRATION_DESCRIPTIONS};
use super::sql::{
    CREATE_ARCHIVE_TABLE_SQL, CREATE_BATCHES_TABLE_SQL, CREATE_DB_INDEXES,
    CREATE_INTAKE_QUEUE_TABLE_SQL, CREATE_MIGRATIONS_TABLE_SQL,
};

/// Run all pending database migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    info!("Running database migrations");

    create_migrations_table(pool).await?;

    let current_version = get_current_version(pool).await?;
    info!("Current database version: {}", current_version);

    if current_version > CURRENT_SCHEMA_VERSION {
        anyhow::bail!(
            "database schema v{} is newer than this build (v{})",
            current_version,
            CURRENT_SCHEMA_VERSION
        );
    }

    if current_version < 1 {
        apply_migration_v1(pool).await?;
    }

    info!("All migrations completed");
    Ok(())
}

async fn create_migrations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(CREATE_MIGRATIONS_TABLE_SQL)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_current_version(pool: &SqlitePool) -> Result<i32> {
    let version: Option<i32> = sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
        .fetch_one(pool)
        .await?;
    Ok(version.unwrap_or(0))
}

/// Migration v1: intake queue, batches and archive tables with their indexes.
async fn apply_migration_v1(pool: &SqlitePool) -> Result<()> {
    info!("Applying migration v1: {}", MIGRATION_DESCRIPTIONS[0]);

    let mut tx = pool.begin().await?;

    sqlx::query(CREATE_INTAKE_QUEUE_TABLE_SQL)
        .execute(&mut *tx)
        .await?;
    sqlx::query(CREATE_BATCHES_TABLE_SQL)
        .execute(&mut *tx)
        .await?;
    sqlx::query(CREATE_ARCHIVE_TABLE_SQL)
        .execute(&mut *tx)
        .await?;

    for index_sql in CREATE_DB_INDEXES {
        sqlx::query(index_sql).execute(&mut *tx).await?;
    }

    sqlx::query(
        "INSERT INTO schema_migrations (version, applied_at, description) VALUES (?, ?, ?)",
    )
    .bind(1)
    .bind(chrono::Utc::now().to_rfc3339())
    .bind(MIGRATION_DESCRIPTIONS[0])
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    info!("Migration v1 completed successfully");
    Ok(())
}
