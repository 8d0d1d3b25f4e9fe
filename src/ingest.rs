//! One collection cycle.
//!
//! Runs a connector and queues every record it returns as `pending`:
//!
//! ```text
//! connector.collect() ──▶ insert_collected (idempotent on content hash)
//!                               │
//!                 Added / Updated / Skipped counts ──▶ SyncResult
//! ```
//!
//! A connector error or a store write failure fails the cycle. The
//! [`SyncResult`] is returned either way; persisting it and updating
//! source health is the scheduler's job.

use chrono::Utc;
use uuid::Uuid;

use casewatch_core::models::{InsertOutcome, SyncResult};
use casewatch_core::store::RecordStore;

use crate::progress::{SyncProgressEvent, SyncProgressReporter};
use crate::traits::Connector;

pub async fn run_cycle(
    connector: &dyn Connector,
    store: &dyn RecordStore,
    progress: &dyn SyncProgressReporter,
) -> SyncResult {
    let source_id = connector.source_id().to_string();
    let started_at = Utc::now();
    let mut result = SyncResult {
        id: Uuid::new_v4().to_string(),
        source_id: source_id.clone(),
        started_at,
        finished_at: started_at,
        records_processed: 0,
        records_added: 0,
        records_updated: 0,
        records_skipped: 0,
        errors: Vec::new(),
        success: false,
    };

    progress.report(SyncProgressEvent::Collecting {
        source: source_id.clone(),
    });
    tracing::info!(source_id = %source_id, "collection cycle started");

    let records = match connector.collect().await {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!(source_id = %source_id, error = %format!("{:#}", e), "collection failed");
            result.errors.push(format!("{:#}", e));
            result.finished_at = Utc::now();
            return result;
        }
    };

    for record in &records {
        match store.insert_collected(record).await {
            Ok(outcome) => {
                result.records_processed += 1;
                match outcome {
                    InsertOutcome::Added => result.records_added += 1,
                    InsertOutcome::Updated => result.records_updated += 1,
                    InsertOutcome::Skipped => result.records_skipped += 1,
                }
            }
            Err(e) => {
                tracing::error!(
                    source_id = %source_id,
                    record_id = %record.source_record_id,
                    error = %format!("{:#}", e),
                    "failed to queue collected record"
                );
                result.errors.push(format!("store: {:#}", e));
                break;
            }
        }
    }

    result.success = result.errors.is_empty();
    result.finished_at = Utc::now();
    progress.report(SyncProgressEvent::Collected {
        source: source_id.clone(),
        records: result.records_processed,
    });
    tracing::info!(
        source_id = %source_id,
        records = result.records_processed,
        added = result.records_added,
        updated = result.records_updated,
        skipped = result.records_skipped,
        duration_ms = result.duration_ms(),
        success = result.success,
        "collection cycle finished"
    );
    result
}
