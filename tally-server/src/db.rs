//! Counter store access layer
//!
//! Owns the single `counters` table this core persists to. The merge rule
//! lives in one atomic UPSERT so concurrent callers for the same owner can
//! never interleave a lost update: SQLite serializes the writes and each one
//! lands on `MAX(value, excluded.value)`.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::Path;
use tally_common::Result;
use tracing::info;

/// One persisted counter row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CounterRecord {
    pub owner_id: String,
    pub display_name: Option<String>,
    pub value: i64,
    pub updated_at: DateTime<Utc>,
}

/// Initialize database connection and create the counters table if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // WAL allows concurrent readers (snapshot loads) with one writer (merges)
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_counters_table(&pool).await?;

    Ok(pool)
}

/// Create the counters table (idempotent)
///
/// `rowid` doubles as first-observed order: snapshot loads sort by it, which
/// is what keeps tie-breaking stable across full reloads.
async fn create_counters_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS counters (
            owner_id     TEXT PRIMARY KEY NOT NULL,
            display_name TEXT,
            value        INTEGER NOT NULL DEFAULT 0 CHECK (value >= 0),
            updated_at   TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Persist a proposed counter value under the max-merge rule and return the
/// authoritative value.
///
/// Idempotent: resubmitting the same proposal cannot change the outcome, and
/// the stored value never decreases.
pub async fn upsert_max(
    pool: &SqlitePool,
    owner_id: &str,
    display_name: Option<&str>,
    proposed: u64,
) -> Result<u64> {
    let value: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO counters (owner_id, display_name, value, updated_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(owner_id) DO UPDATE SET
            value = MAX(counters.value, excluded.value),
            display_name = COALESCE(excluded.display_name, counters.display_name),
            updated_at = excluded.updated_at
        RETURNING value
        "#,
    )
    .bind(owner_id)
    .bind(display_name)
    .bind(proposed as i64)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(value as u64)
}

/// Check whether a counter row already exists for this owner
pub async fn owner_exists(pool: &SqlitePool, owner_id: &str) -> Result<bool> {
    let row: Option<i64> = sqlx::query_scalar("SELECT 1 FROM counters WHERE owner_id = ?1")
        .bind(owner_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

/// Load all counter records in first-observed order
pub async fn load_all(pool: &SqlitePool) -> Result<Vec<CounterRecord>> {
    let records = sqlx::query_as::<_, CounterRecord>(
        "SELECT owner_id, display_name, value, updated_at FROM counters ORDER BY rowid",
    )
    .fetch_all(pool)
    .await?;

    Ok(records)
}
