//! SQLite-backed [`RecordStore`] implementation.
//!
//! Payloads, issues, and field diffs are stored as JSON text columns;
//! timestamps as Unix milliseconds.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use casewatch_core::models::{
    CasePayload, CaseRecord, ChangeEvent, CollectedRecord, InsertOutcome, RecordStatus, RecordType,
    SourceHealthStatus, SourceStatus, SourceStatusSnapshot, StoredRecord, SyncResult,
    ValidationIssue,
};
use casewatch_core::store::{RecordCounts, RecordStore};

/// SQLite implementation of the [`RecordStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp out of range: {}", ms))
}

fn parse_record_type(s: &str) -> Result<RecordType> {
    RecordType::parse(s).ok_or_else(|| anyhow!("unknown record type in store: {}", s))
}

fn row_to_stored(row: &SqliteRow) -> Result<StoredRecord> {
    let payload_json: String = row.get("payload_json");
    let issues_json: String = row.get("issues_json");
    let status: String = row.get("status");
    let record_type: String = row.get("record_type");

    Ok(StoredRecord {
        id: row.get("id"),
        record: CollectedRecord {
            source_id: row.get("source_id"),
            source_record_id: row.get("source_record_id"),
            record_type: parse_record_type(&record_type)?,
            payload: serde_json::from_str(&payload_json).context("corrupt payload_json")?,
            collected_at: from_ms(row.get("collected_at"))?,
            content_hash: row.get("content_hash"),
        },
        status: RecordStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown record status in store: {}", status))?,
        issues: serde_json::from_str(&issues_json).context("corrupt issues_json")?,
    })
}

fn row_to_case(row: &SqliteRow) -> Result<CaseRecord> {
    let payload_json: String = row.get("payload_json");
    let record_type: String = row.get("record_type");
    Ok(CaseRecord {
        id: row.get("id"),
        source_id: row.get("source_id"),
        source_record_id: row.get("source_record_id"),
        record_type: parse_record_type(&record_type)?,
        payload: serde_json::from_str(&payload_json).context("corrupt case payload_json")?,
        latitude: row.get("latitude"),
        longitude: row.get("longitude"),
        created_at: from_ms(row.get("created_at"))?,
        updated_at: from_ms(row.get("updated_at"))?,
    })
}

fn row_to_event(row: &SqliteRow) -> Result<ChangeEvent> {
    let change_type: String = row.get("change_type");
    let priority: String = row.get("priority");
    let changes_json: String = row.get("changes_json");
    let record_json: String = row.get("record_json");
    let processed: i64 = row.get("processed");
    Ok(ChangeEvent {
        id: row.get("id"),
        change_type: serde_json::from_value(serde_json::Value::String(change_type))?,
        source_id: row.get("source_id"),
        source_record_id: row.get("source_record_id"),
        priority: serde_json::from_value(serde_json::Value::String(priority))?,
        changes: serde_json::from_str(&changes_json).context("corrupt changes_json")?,
        record: serde_json::from_str(&record_json).context("corrupt record_json")?,
        detected_at: from_ms(row.get("detected_at"))?,
        processed: processed != 0,
    })
}

fn row_to_sync(row: &SqliteRow) -> Result<SyncResult> {
    let errors_json: String = row.get("errors_json");
    let success: i64 = row.get("success");
    Ok(SyncResult {
        id: row.get("id"),
        source_id: row.get("source_id"),
        started_at: from_ms(row.get("started_at"))?,
        finished_at: from_ms(row.get("finished_at"))?,
        records_processed: row.get::<i64, _>("records_processed") as u64,
        records_added: row.get::<i64, _>("records_added") as u64,
        records_updated: row.get::<i64, _>("records_updated") as u64,
        records_skipped: row.get::<i64, _>("records_skipped") as u64,
        errors: serde_json::from_str(&errors_json).context("corrupt errors_json")?,
        success: success != 0,
    })
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn insert_collected(&self, record: &CollectedRecord) -> Result<InsertOutcome> {
        let existing = sqlx::query(
            "SELECT id, payload_json FROM collected_records WHERE content_hash = ?",
        )
        .bind(&record.content_hash)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = existing {
            let payload_json: String = row.get("payload_json");
            let stored: CasePayload =
                serde_json::from_str(&payload_json).context("corrupt payload_json")?;
            if stored == record.payload {
                return Ok(InsertOutcome::Skipped);
            }
            let id: String = row.get("id");
            sqlx::query(
                r#"
                UPDATE collected_records
                SET payload_json = ?, collected_at = ?, status = 'pending',
                    issues_json = '[]', processed_at = NULL
                WHERE id = ?
                "#,
            )
            .bind(serde_json::to_string(&record.payload)?)
            .bind(to_ms(record.collected_at))
            .bind(&id)
            .execute(&self.pool)
            .await?;
            return Ok(InsertOutcome::Updated);
        }

        let seen_before: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM collected_records WHERE source_id = ? AND source_record_id = ?",
        )
        .bind(&record.source_id)
        .bind(&record.source_record_id)
        .fetch_one(&self.pool)
        .await?;

        let result = sqlx::query(
            r#"
            INSERT INTO collected_records (id, source_id, source_record_id, record_type,
                                           payload_json, collected_at, content_hash, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'pending')
            ON CONFLICT(content_hash) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&record.source_id)
        .bind(&record.source_record_id)
        .bind(record.record_type.as_str())
        .bind(serde_json::to_string(&record.payload)?)
        .bind(to_ms(record.collected_at))
        .bind(&record.content_hash)
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 0 {
            InsertOutcome::Skipped
        } else if seen_before {
            InsertOutcome::Updated
        } else {
            InsertOutcome::Added
        })
    }

    async fn pending_records(&self, limit: usize, offset: usize) -> Result<Vec<StoredRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM collected_records
            WHERE status = 'pending'
            ORDER BY collected_at ASC, rowid ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_stored).collect()
    }

    async fn mark_processed(&self, record_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE collected_records SET status = 'processed', issues_json = '[]', processed_at = ? WHERE id = ?",
        )
        .bind(to_ms(Utc::now()))
        .bind(record_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("collected record not found: {}", record_id);
        }
        Ok(())
    }

    async fn mark_failed(&self, record_id: &str, issues: &[ValidationIssue]) -> Result<()> {
        let result = sqlx::query(
            "UPDATE collected_records SET status = 'failed', issues_json = ?, processed_at = ? WHERE id = ?",
        )
        .bind(serde_json::to_string(issues)?)
        .bind(to_ms(Utc::now()))
        .bind(record_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("collected record not found: {}", record_id);
        }
        Ok(())
    }

    async fn reset_failed(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE collected_records SET status = 'pending', issues_json = '[]', processed_at = NULL WHERE status = 'failed'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn record_counts(&self) -> Result<RecordCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM collected_records GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = RecordCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let n = row.get::<i64, _>("n") as u64;
            match RecordStatus::parse(&status) {
                Some(RecordStatus::Pending) => counts.pending = n,
                Some(RecordStatus::Processed) => counts.processed = n,
                Some(RecordStatus::Failed) => counts.failed = n,
                None => {}
            }
        }
        Ok(counts)
    }

    async fn list_cases(&self) -> Result<Vec<CaseRecord>> {
        let rows = sqlx::query("SELECT * FROM cases ORDER BY created_at ASC, rowid ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_case).collect()
    }

    async fn upsert_case(&self, case: &CaseRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cases (id, case_number, source_id, source_record_id, record_type,
                               payload_json, latitude, longitude, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                case_number = excluded.case_number,
                source_id = excluded.source_id,
                source_record_id = excluded.source_record_id,
                record_type = excluded.record_type,
                payload_json = excluded.payload_json,
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&case.id)
        .bind(&case.payload.case_number)
        .bind(&case.source_id)
        .bind(&case.source_record_id)
        .bind(case.record_type.as_str())
        .bind(serde_json::to_string(&case.payload)?)
        .bind(case.latitude)
        .bind(case.longitude)
        .bind(to_ms(case.created_at))
        .bind(to_ms(case.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_case_coordinates(
        &self,
        case_id: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE cases SET latitude = ?, longitude = ? WHERE id = ?")
            .bind(latitude)
            .bind(longitude)
            .bind(case_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("case not found: {}", case_id);
        }
        Ok(())
    }

    async fn append_change_event(&self, event: &ChangeEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO change_events (id, change_type, source_id, source_record_id, priority,
                                       changes_json, record_json, detected_at, processed)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(event.change_type.as_str())
        .bind(&event.source_id)
        .bind(&event.source_record_id)
        .bind(event.priority.as_str())
        .bind(serde_json::to_string(&event.changes)?)
        .bind(serde_json::to_string(&event.record)?)
        .bind(to_ms(event.detected_at))
        .bind(i64::from(event.processed))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_change_events(&self, limit: usize) -> Result<Vec<ChangeEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM change_events ORDER BY detected_at DESC, rowid DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn upsert_source_status(&self, snapshot: &SourceStatusSnapshot) -> Result<()> {
        let health = &snapshot.health;
        sqlx::query(
            r#"
            INSERT INTO data_sources_status (source_id, name, status, error_count, is_healthy,
                                             last_successful_sync, consecutive_errors,
                                             average_response_ms, last_error, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                error_count = excluded.error_count,
                is_healthy = excluded.is_healthy,
                last_successful_sync = excluded.last_successful_sync,
                consecutive_errors = excluded.consecutive_errors,
                average_response_ms = excluded.average_response_ms,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&snapshot.source_id)
        .bind(&snapshot.name)
        .bind(snapshot.status.as_str())
        .bind(i64::from(snapshot.error_count))
        .bind(i64::from(health.is_healthy))
        .bind(health.last_successful_sync.map(to_ms))
        .bind(i64::from(health.consecutive_errors))
        .bind(health.average_response_ms)
        .bind(&health.last_error)
        .bind(to_ms(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_source_status(&self, source_id: &str) -> Result<Option<SourceStatusSnapshot>> {
        let row = sqlx::query("SELECT * FROM data_sources_status WHERE source_id = ?")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.get("status");
        let last_sync: Option<i64> = row.get("last_successful_sync");
        Ok(Some(SourceStatusSnapshot {
            source_id: row.get("source_id"),
            name: row.get("name"),
            status: SourceStatus::parse(&status)
                .ok_or_else(|| anyhow!("unknown source status in store: {}", status))?,
            error_count: row.get::<i64, _>("error_count") as u32,
            health: SourceHealthStatus {
                source_id: row.get("source_id"),
                is_healthy: row.get::<i64, _>("is_healthy") != 0,
                last_successful_sync: last_sync.map(from_ms).transpose()?,
                consecutive_errors: row.get::<i64, _>("consecutive_errors") as u32,
                average_response_ms: row.get("average_response_ms"),
                last_error: row.get("last_error"),
            },
        }))
    }

    async fn append_sync_result(&self, result: &SyncResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_history (id, source_id, started_at, finished_at, records_processed,
                                      records_added, records_updated, records_skipped,
                                      errors_json, success)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&result.id)
        .bind(&result.source_id)
        .bind(to_ms(result.started_at))
        .bind(to_ms(result.finished_at))
        .bind(result.records_processed as i64)
        .bind(result.records_added as i64)
        .bind(result.records_updated as i64)
        .bind(result.records_skipped as i64)
        .bind(serde_json::to_string(&result.errors)?)
        .bind(i64::from(result.success))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_sync_history(
        &self,
        source_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SyncResult>> {
        let rows = match source_id {
            Some(id) => {
                sqlx::query(
                    "SELECT * FROM sync_history WHERE source_id = ? ORDER BY started_at DESC, rowid DESC LIMIT ?",
                )
                .bind(id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM sync_history ORDER BY started_at DESC, rowid DESC LIMIT ?",
                )
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(row_to_sync).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate;
    use casewatch_core::models::{
        CasePayload, ChangeType, FieldChange, Priority, Severity, Significance,
    };
    use chrono::Duration;
    use tempfile::TempDir;

    async fn store() -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("cw.sqlite")).await.unwrap();
        migrate::migrate_pool(&pool).await.unwrap();
        (tmp, SqliteStore::new(pool))
    }

    fn record(source_record_id: &str, name: &str) -> CollectedRecord {
        CollectedRecord::new(
            "florida_fdle",
            source_record_id,
            RecordType::MissingPerson,
            CasePayload {
                name: Some(name.into()),
                ..Default::default()
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_insert_outcomes() {
        let (_tmp, store) = store().await;
        let r = record("1", "Jane Doe");
        assert_eq!(store.insert_collected(&r).await.unwrap(), InsertOutcome::Added);
        assert_eq!(store.insert_collected(&r).await.unwrap(), InsertOutcome::Skipped);
        assert_eq!(
            store.insert_collected(&record("1", "Jane Q. Doe")).await.unwrap(),
            InsertOutcome::Updated
        );
        assert_eq!(store.record_counts().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_status_change_requeues_processed_record() {
        let (_tmp, store) = store().await;
        let first = record("MP1", "Jane Doe");
        store.insert_collected(&first).await.unwrap();
        let id = store.pending_records(10, 0).await.unwrap()[0].id.clone();
        store.mark_processed(&id).await.unwrap();

        let mut located = record("MP1", "Jane Doe");
        located.payload.status = casewatch_core::models::CaseStatus::Found;
        assert_eq!(located.content_hash, first.content_hash);
        assert_eq!(
            store.insert_collected(&located).await.unwrap(),
            InsertOutcome::Updated
        );

        let counts = store.record_counts().await.unwrap();
        assert_eq!((counts.pending, counts.processed), (1, 0));
        let pending = store.pending_records(10, 0).await.unwrap();
        assert_eq!(pending[0].id, id);
        assert_eq!(
            pending[0].record.payload.status,
            casewatch_core::models::CaseStatus::Found
        );

        assert_eq!(
            store.insert_collected(&located).await.unwrap(),
            InsertOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn test_pending_roundtrip_and_status_transitions() {
        let (_tmp, store) = store().await;
        store.insert_collected(&record("1", "A")).await.unwrap();
        store.insert_collected(&record("2", "B")).await.unwrap();

        let pending = store.pending_records(10, 0).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].record.payload.name.as_deref(), Some("A"));

        store.mark_processed(&pending[0].id).await.unwrap();
        let issue = ValidationIssue {
            field: "name".into(),
            severity: Severity::Error,
            message: "Name is required".into(),
        };
        store.mark_failed(&pending[1].id, &[issue]).await.unwrap();

        let counts = store.record_counts().await.unwrap();
        assert_eq!((counts.pending, counts.processed, counts.failed), (0, 1, 1));

        assert_eq!(store.reset_failed().await.unwrap(), 1);
        let again = store.pending_records(10, 0).await.unwrap();
        assert_eq!(again.len(), 1);
        assert!(again[0].issues.is_empty());
    }

    #[tokio::test]
    async fn test_cases_and_coordinates() {
        let (_tmp, store) = store().await;
        let now = Utc::now();
        let mut case = CaseRecord {
            id: "case-1".into(),
            source_id: "florida_fdle".into(),
            source_record_id: "1".into(),
            record_type: RecordType::MissingPerson,
            payload: CasePayload {
                case_number: Some("FL-1".into()),
                name: Some("Jane Doe".into()),
                ..Default::default()
            },
            latitude: None,
            longitude: None,
            created_at: now,
            updated_at: now,
        };
        store.upsert_case(&case).await.unwrap();
        case.payload.name = Some("Jane A. Doe".into());
        store.upsert_case(&case).await.unwrap();
        store.set_case_coordinates("case-1", 25.76, -80.19).await.unwrap();

        let cases = store.list_cases().await.unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].payload.name.as_deref(), Some("Jane A. Doe"));
        assert_eq!(cases[0].coordinates(), Some((25.76, -80.19)));
        assert!(store.set_case_coordinates("missing", 0.0, 0.0).await.is_err());
    }

    #[tokio::test]
    async fn test_events_status_and_history() {
        let (_tmp, store) = store().await;
        let event = ChangeEvent {
            id: "evt-1".into(),
            change_type: ChangeType::StatusUpdate,
            source_id: "florida_fdle".into(),
            source_record_id: "1".into(),
            priority: Priority::High,
            changes: vec![FieldChange {
                field: "status".into(),
                old_value: Some("Active".into()),
                new_value: Some("Closed".into()),
                significance: Significance::Major,
            }],
            record: CasePayload::default(),
            // Stored at millisecond precision.
            detected_at: DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap(),
            processed: true,
        };
        store.append_change_event(&event).await.unwrap();
        let events = store.recent_change_events(5).await.unwrap();
        assert_eq!(events, vec![event]);

        let mut health = SourceHealthStatus::new("florida_fdle");
        health.last_successful_sync = Some(Utc::now());
        let snapshot = SourceStatusSnapshot {
            source_id: "florida_fdle".into(),
            name: "Florida FDLE".into(),
            status: SourceStatus::Error,
            error_count: 6,
            health,
        };
        store.upsert_source_status(&snapshot).await.unwrap();
        let loaded = store.get_source_status("florida_fdle").await.unwrap().unwrap();
        assert_eq!(loaded.status, SourceStatus::Error);
        assert_eq!(loaded.error_count, 6);
        assert!(store.get_source_status("other").await.unwrap().is_none());

        let start = Utc::now();
        for (i, source) in ["a", "b", "a"].iter().enumerate() {
            store
                .append_sync_result(&SyncResult {
                    id: format!("sync-{}", i),
                    source_id: source.to_string(),
                    started_at: start + Duration::seconds(i as i64),
                    finished_at: start + Duration::seconds(i as i64 + 1),
                    records_processed: 3,
                    records_added: 1,
                    records_updated: 1,
                    records_skipped: 1,
                    errors: vec![],
                    success: true,
                })
                .await
                .unwrap();
        }
        let all = store.recent_sync_history(None, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, "sync-2");
        let only_a = store.recent_sync_history(Some("a"), 10).await.unwrap();
        assert_eq!(only_a.len(), 2);
    }
}
