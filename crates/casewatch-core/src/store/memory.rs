//! In-memory [`RecordStore`] implementation for tests and embedding.
//!
//! Uses `Vec` and `HashMap` behind `std::sync::RwLock`. No lock is held
//! across an await point.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{
    CaseRecord, ChangeEvent, CollectedRecord, InsertOutcome, RecordStatus, SourceStatusSnapshot,
    StoredRecord, SyncResult, ValidationIssue,
};

use super::{RecordCounts, RecordStore};

/// In-memory store for tests and single-process embedding.
pub struct InMemoryStore {
    records: RwLock<Vec<StoredRecord>>,
    cases: RwLock<Vec<CaseRecord>>,
    events: RwLock<Vec<ChangeEvent>>,
    statuses: RwLock<HashMap<String, SourceStatusSnapshot>>,
    history: RwLock<Vec<SyncResult>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            cases: RwLock::new(Vec::new()),
            events: RwLock::new(Vec::new()),
            statuses: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn set_status(
    records: &mut [StoredRecord],
    record_id: &str,
    status: RecordStatus,
    issues: &[ValidationIssue],
) -> Result<()> {
    let stored = records
        .iter_mut()
        .find(|r| r.id == record_id)
        .ok_or_else(|| anyhow!("collected record not found: {}", record_id))?;
    stored.status = status;
    stored.issues = issues.to_vec();
    Ok(())
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn insert_collected(&self, record: &CollectedRecord) -> Result<InsertOutcome> {
        let mut records = write(&self.records)?;
        if let Some(existing) = records
            .iter_mut()
            .find(|r| r.record.content_hash == record.content_hash)
        {
            if existing.record.payload == record.payload {
                return Ok(InsertOutcome::Skipped);
            }
            // Same identity, changed status or details: queue it again.
            existing.record = record.clone();
            existing.status = RecordStatus::Pending;
            existing.issues.clear();
            return Ok(InsertOutcome::Updated);
        }
        let seen_before = records.iter().any(|r| {
            r.record.source_id == record.source_id
                && r.record.source_record_id == record.source_record_id
        });
        records.push(StoredRecord {
            id: Uuid::new_v4().to_string(),
            record: record.clone(),
            status: RecordStatus::Pending,
            issues: Vec::new(),
        });
        Ok(if seen_before {
            InsertOutcome::Updated
        } else {
            InsertOutcome::Added
        })
    }

    async fn pending_records(&self, limit: usize, offset: usize) -> Result<Vec<StoredRecord>> {
        let records = read(&self.records)?;
        let mut pending: Vec<&StoredRecord> = records
            .iter()
            .filter(|r| r.status == RecordStatus::Pending)
            .collect();
        pending.sort_by_key(|r| r.record.collected_at);
        Ok(pending
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_processed(&self, record_id: &str) -> Result<()> {
        let mut records = write(&self.records)?;
        set_status(&mut records, record_id, RecordStatus::Processed, &[])
    }

    async fn mark_failed(&self, record_id: &str, issues: &[ValidationIssue]) -> Result<()> {
        let mut records = write(&self.records)?;
        set_status(&mut records, record_id, RecordStatus::Failed, issues)
    }

    async fn reset_failed(&self) -> Result<u64> {
        let mut records = write(&self.records)?;
        let mut moved = 0;
        for r in records
            .iter_mut()
            .filter(|r| r.status == RecordStatus::Failed)
        {
            r.status = RecordStatus::Pending;
            r.issues.clear();
            moved += 1;
        }
        Ok(moved)
    }

    async fn record_counts(&self) -> Result<RecordCounts> {
        let records = read(&self.records)?;
        let mut counts = RecordCounts::default();
        for r in records.iter() {
            match r.status {
                RecordStatus::Pending => counts.pending += 1,
                RecordStatus::Processed => counts.processed += 1,
                RecordStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn list_cases(&self) -> Result<Vec<CaseRecord>> {
        Ok(read(&self.cases)?.clone())
    }

    async fn upsert_case(&self, case: &CaseRecord) -> Result<()> {
        let mut cases = write(&self.cases)?;
        match cases.iter_mut().find(|c| c.id == case.id) {
            Some(existing) => *existing = case.clone(),
            None => cases.push(case.clone()),
        }
        Ok(())
    }

    async fn set_case_coordinates(
        &self,
        case_id: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<()> {
        let mut cases = write(&self.cases)?;
        let case = cases
            .iter_mut()
            .find(|c| c.id == case_id)
            .ok_or_else(|| anyhow!("case not found: {}", case_id))?;
        case.latitude = Some(latitude);
        case.longitude = Some(longitude);
        Ok(())
    }

    async fn append_change_event(&self, event: &ChangeEvent) -> Result<()> {
        write(&self.events)?.push(event.clone());
        Ok(())
    }

    async fn recent_change_events(&self, limit: usize) -> Result<Vec<ChangeEvent>> {
        let events = read(&self.events)?;
        Ok(events.iter().rev().take(limit).cloned().collect())
    }

    async fn upsert_source_status(&self, snapshot: &SourceStatusSnapshot) -> Result<()> {
        write(&self.statuses)?.insert(snapshot.source_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn get_source_status(&self, source_id: &str) -> Result<Option<SourceStatusSnapshot>> {
        Ok(read(&self.statuses)?.get(source_id).cloned())
    }

    async fn append_sync_result(&self, result: &SyncResult) -> Result<()> {
        write(&self.history)?.push(result.clone());
        Ok(())
    }

    async fn recent_sync_history(
        &self,
        source_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SyncResult>> {
        let history = read(&self.history)?;
        Ok(history
            .iter()
            .rev()
            .filter(|r| source_id.map_or(true, |id| r.source_id == id))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CasePayload, RecordType, Severity};
    use chrono::{Duration, Utc};

    fn record(source_record_id: &str, name: &str, offset_secs: i64) -> CollectedRecord {
        CollectedRecord::new(
            "florida_fdle",
            source_record_id,
            RecordType::MissingPerson,
            CasePayload {
                name: Some(name.into()),
                ..Default::default()
            },
            Utc::now() + Duration::seconds(offset_secs),
        )
    }

    #[tokio::test]
    async fn test_insert_is_idempotent_on_hash() {
        let store = InMemoryStore::new();
        let r = record("1", "Jane Doe", 0);
        assert_eq!(store.insert_collected(&r).await.unwrap(), InsertOutcome::Added);
        assert_eq!(
            store.insert_collected(&r).await.unwrap(),
            InsertOutcome::Skipped
        );

        let changed = record("1", "Jane A. Doe", 1);
        assert_eq!(
            store.insert_collected(&changed).await.unwrap(),
            InsertOutcome::Updated
        );
        assert_eq!(store.record_counts().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_status_change_requeues_processed_record() {
        let store = InMemoryStore::new();
        let first = record("1", "Jane Doe", 0);
        store.insert_collected(&first).await.unwrap();
        let id = store.pending_records(10, 0).await.unwrap()[0].id.clone();
        store.mark_processed(&id).await.unwrap();

        let mut located = record("1", "Jane Doe", 5);
        located.payload.status = crate::models::CaseStatus::Found;
        assert_eq!(located.content_hash, first.content_hash);
        assert_eq!(
            store.insert_collected(&located).await.unwrap(),
            InsertOutcome::Updated
        );

        let pending = store.pending_records(10, 0).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].record.payload.status, crate::models::CaseStatus::Found);

        // the same status again is a no-op
        assert_eq!(
            store.insert_collected(&located).await.unwrap(),
            InsertOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn test_pending_paging_is_oldest_first() {
        let store = InMemoryStore::new();
        store.insert_collected(&record("b", "B", 10)).await.unwrap();
        store.insert_collected(&record("a", "A", 0)).await.unwrap();
        store.insert_collected(&record("c", "C", 20)).await.unwrap();

        let first = store.pending_records(2, 0).await.unwrap();
        let ids: Vec<&str> = first
            .iter()
            .map(|r| r.record.source_record_id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        let rest = store.pending_records(2, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].record.source_record_id, "c");
    }

    #[tokio::test]
    async fn test_failed_records_can_be_reset() {
        let store = InMemoryStore::new();
        store.insert_collected(&record("1", "J", 0)).await.unwrap();
        let pending = store.pending_records(10, 0).await.unwrap();
        let issue = ValidationIssue {
            field: "name".into(),
            severity: Severity::Error,
            message: "missing".into(),
        };
        store.mark_failed(&pending[0].id, &[issue]).await.unwrap();
        assert!(store.pending_records(10, 0).await.unwrap().is_empty());
        assert_eq!(store.record_counts().await.unwrap().failed, 1);

        assert_eq!(store.reset_failed().await.unwrap(), 1);
        let again = store.pending_records(10, 0).await.unwrap();
        assert_eq!(again.len(), 1);
        assert!(again[0].issues.is_empty());
    }

    #[tokio::test]
    async fn test_mark_unknown_record_errors() {
        let store = InMemoryStore::new();
        assert!(store.mark_processed("nope").await.is_err());
    }
}
