//! Storage abstraction for casewatch.
//!
//! The [`RecordStore`] trait covers every persistence operation the
//! pipeline needs: the pending queue of collected records, canonical
//! cases, the change-event log, per-source status, and sync history.
//! Backends only need keyed upsert, equality filters, ordering, and
//! limit/offset paging.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{
    CaseRecord, ChangeEvent, CollectedRecord, InsertOutcome, SourceStatusSnapshot, StoredRecord,
    SyncResult, ValidationIssue,
};

/// Number of collected records in each processing state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecordCounts {
    pub pending: u64,
    pub processed: u64,
    pub failed: u64,
}

/// Abstract storage backend for casewatch.
///
/// # Operations
///
/// | Method | Collection |
/// |--------|------------|
/// | [`insert_collected`](RecordStore::insert_collected) | `collected_records` (idempotent on content hash) |
/// | [`pending_records`](RecordStore::pending_records) | `collected_records` where status = pending, oldest first |
/// | [`mark_processed`](RecordStore::mark_processed) / [`mark_failed`](RecordStore::mark_failed) | status transitions |
/// | [`reset_failed`](RecordStore::reset_failed) | failed → pending |
/// | [`list_cases`](RecordStore::list_cases) / [`upsert_case`](RecordStore::upsert_case) | `cases` |
/// | [`append_change_event`](RecordStore::append_change_event) | `change_events` (append-only) |
/// | [`upsert_source_status`](RecordStore::upsert_source_status) | `data_sources_status` (one row per source) |
/// | [`append_sync_result`](RecordStore::append_sync_result) | `sync_history` (append-only) |
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Queue a collected record as `pending`.
    ///
    /// A record whose content hash and payload are already stored reports
    /// [`InsertOutcome::Skipped`]. When the hash is stored but the payload
    /// differs (a status-only change upstream), the stored row takes the
    /// new payload, goes back to `pending` and reports
    /// [`InsertOutcome::Updated`].
    async fn insert_collected(&self, record: &CollectedRecord) -> Result<InsertOutcome>;

    /// Page through pending records ordered by collection time, oldest first.
    async fn pending_records(&self, limit: usize, offset: usize) -> Result<Vec<StoredRecord>>;

    async fn mark_processed(&self, record_id: &str) -> Result<()>;

    async fn mark_failed(&self, record_id: &str, issues: &[ValidationIssue]) -> Result<()>;

    /// Move every failed record back to pending. Returns how many moved.
    async fn reset_failed(&self) -> Result<u64>;

    async fn record_counts(&self) -> Result<RecordCounts>;

    async fn list_cases(&self) -> Result<Vec<CaseRecord>>;

    /// Insert or replace a case by id.
    async fn upsert_case(&self, case: &CaseRecord) -> Result<()>;

    async fn set_case_coordinates(&self, case_id: &str, latitude: f64, longitude: f64)
        -> Result<()>;

    async fn append_change_event(&self, event: &ChangeEvent) -> Result<()>;

    /// Most recent change events first.
    async fn recent_change_events(&self, limit: usize) -> Result<Vec<ChangeEvent>>;

    async fn upsert_source_status(&self, snapshot: &SourceStatusSnapshot) -> Result<()>;

    async fn get_source_status(&self, source_id: &str) -> Result<Option<SourceStatusSnapshot>>;

    async fn append_sync_result(&self, result: &SyncResult) -> Result<()>;

    /// Most recent sync results first, optionally for one source.
    async fn recent_sync_history(
        &self,
        source_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SyncResult>>;
}
