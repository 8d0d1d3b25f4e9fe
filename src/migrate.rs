use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Pending queue of normalized records
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collected_records (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            source_record_id TEXT NOT NULL,
            record_type TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            collected_at INTEGER NOT NULL,
            content_hash TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL DEFAULT 'pending',
            issues_json TEXT NOT NULL DEFAULT '[]',
            processed_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Canonical cases
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cases (
            id TEXT PRIMARY KEY,
            case_number TEXT,
            source_id TEXT NOT NULL,
            source_record_id TEXT NOT NULL,
            record_type TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            latitude REAL,
            longitude REAL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only change log
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS change_events (
            id TEXT PRIMARY KEY,
            change_type TEXT NOT NULL,
            source_id TEXT NOT NULL,
            source_record_id TEXT NOT NULL,
            priority TEXT NOT NULL,
            changes_json TEXT NOT NULL,
            record_json TEXT NOT NULL,
            detected_at INTEGER NOT NULL,
            processed INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One row per source
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS data_sources_status (
            source_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            status TEXT NOT NULL,
            error_count INTEGER NOT NULL DEFAULT 0,
            is_healthy INTEGER NOT NULL DEFAULT 1,
            last_successful_sync INTEGER,
            consecutive_errors INTEGER NOT NULL DEFAULT 0,
            average_response_ms REAL NOT NULL DEFAULT 0,
            last_error TEXT,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only cycle outcomes
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_history (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER NOT NULL,
            records_processed INTEGER NOT NULL,
            records_added INTEGER NOT NULL,
            records_updated INTEGER NOT NULL,
            records_skipped INTEGER NOT NULL,
            errors_json TEXT NOT NULL,
            success INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    for index in [
        "CREATE INDEX IF NOT EXISTS idx_collected_status ON collected_records(status, collected_at)",
        "CREATE INDEX IF NOT EXISTS idx_collected_identity ON collected_records(source_id, source_record_id)",
        "CREATE INDEX IF NOT EXISTS idx_cases_case_number ON cases(case_number)",
        "CREATE INDEX IF NOT EXISTS idx_events_detected ON change_events(detected_at)",
        "CREATE INDEX IF NOT EXISTS idx_history_source ON sync_history(source_id, started_at)",
    ] {
        sqlx::query(index).execute(pool).await?;
    }

    Ok(())
}
