//! Store statistics.
//!
//! A quick summary of the pipeline's state: the pending queue, canonical
//! cases and geocoding coverage, the change log, and a per-source
//! breakdown of the last recorded cycle. Used by `cw stats` to confirm
//! that collection and processing are keeping up.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

/// Whole-store totals plus one row per source.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub pending: i64,
    pub processed: i64,
    pub failed: i64,
    pub cases: i64,
    pub geocoded_cases: i64,
    pub change_events: i64,
    pub undelivered_events: i64,
    pub sources: Vec<SourceStats>,
}

/// Per-source record count and last cycle.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub source_id: String,
    pub status: Option<String>,
    pub records: i64,
    pub cycles: i64,
    /// Unix milliseconds.
    pub last_cycle_at: Option<i64>,
    pub last_cycle_success: Option<bool>,
}

pub async fn collect_stats(pool: &SqlitePool) -> Result<StoreStats> {
    let mut stats = StoreStats {
        pending: 0,
        processed: 0,
        failed: 0,
        cases: 0,
        geocoded_cases: 0,
        change_events: 0,
        undelivered_events: 0,
        sources: Vec::new(),
    };

    let status_rows =
        sqlx::query("SELECT status, COUNT(*) AS n FROM collected_records GROUP BY status")
            .fetch_all(pool)
            .await?;
    for row in &status_rows {
        let n: i64 = row.get("n");
        match row.get::<String, _>("status").as_str() {
            "pending" => stats.pending = n,
            "processed" => stats.processed = n,
            "failed" => stats.failed = n,
            _ => {}
        }
    }

    stats.cases = sqlx::query_scalar("SELECT COUNT(*) FROM cases")
        .fetch_one(pool)
        .await?;
    stats.geocoded_cases = sqlx::query_scalar(
        "SELECT COUNT(*) FROM cases WHERE latitude IS NOT NULL AND longitude IS NOT NULL",
    )
    .fetch_one(pool)
    .await?;
    stats.change_events = sqlx::query_scalar("SELECT COUNT(*) FROM change_events")
        .fetch_one(pool)
        .await?;
    stats.undelivered_events =
        sqlx::query_scalar("SELECT COUNT(*) FROM change_events WHERE processed = 0")
            .fetch_one(pool)
            .await?;

    // Union of sources seen in records, history, or status
    let source_rows = sqlx::query(
        r#"
        SELECT
            ids.source_id AS source_id,
            s.status AS status,
            (SELECT COUNT(*) FROM collected_records r WHERE r.source_id = ids.source_id) AS records,
            (SELECT COUNT(*) FROM sync_history h WHERE h.source_id = ids.source_id) AS cycles,
            (SELECT MAX(h.finished_at) FROM sync_history h WHERE h.source_id = ids.source_id) AS last_cycle_at,
            (SELECT h.success FROM sync_history h WHERE h.source_id = ids.source_id
                ORDER BY h.finished_at DESC LIMIT 1) AS last_success
        FROM (
            SELECT source_id FROM collected_records
            UNION SELECT source_id FROM sync_history
            UNION SELECT source_id FROM data_sources_status
        ) ids
        LEFT JOIN data_sources_status s ON s.source_id = ids.source_id
        ORDER BY ids.source_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    for row in &source_rows {
        stats.sources.push(SourceStats {
            source_id: row.get("source_id"),
            status: row.get("status"),
            records: row.get("records"),
            cycles: row.get("cycles"),
            last_cycle_at: row.get("last_cycle_at"),
            last_cycle_success: row.get::<Option<i64>, _>("last_success").map(|v| v != 0),
        });
    }

    Ok(stats)
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = collect_stats(&pool).await?;
    pool.close().await;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);
    let now = Utc::now();

    println!("casewatch store stats");
    println!("=====================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!(
        "  Records:     {} pending, {} processed, {} failed",
        stats.pending, stats.processed, stats.failed
    );
    println!(
        "  Cases:       {} ({} geocoded, {}%)",
        stats.cases,
        stats.geocoded_cases,
        if stats.cases > 0 {
            (stats.geocoded_cases * 100) / stats.cases
        } else {
            0
        }
    );
    println!(
        "  Events:      {} ({} undelivered)",
        stats.change_events, stats.undelivered_events
    );

    if !stats.sources.is_empty() {
        println!();
        println!("  By source:");
        println!(
            "  {:<24} {:<12} {:>8} {:>7}   {}",
            "SOURCE", "STATUS", "RECORDS", "CYCLES", "LAST CYCLE"
        );
        println!("  {}", "-".repeat(72));

        for s in &stats.sources {
            let finished = s.last_cycle_at.and_then(DateTime::from_timestamp_millis);
            let last = match (finished, s.last_cycle_success) {
                (Some(at), Some(true)) => format_relative(at, now),
                (Some(at), _) => format!("{} (failed)", format_relative(at, now)),
                (None, _) => "never".to_string(),
            };
            println!(
                "  {:<24} {:<12} {:>8} {:>7}   {}",
                s.source_id,
                s.status.as_deref().unwrap_or("-"),
                s.records,
                s.cycles,
                last
            );
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a timestamp relative to `now` (e.g. "3 hours ago").
pub fn format_relative(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = (now - ts).num_seconds();

    if delta < 0 {
        return ts.format("%Y-%m-%d %H:%M").to_string();
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        ts.format("%Y-%m-%d %H:%M").to_string()
    }
}
