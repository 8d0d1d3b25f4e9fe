//! Pending-record processing.
//!
//! Consumes `pending` collected records page by page, oldest first:
//!
//! 1. validate against the stored cases
//! 2. invalid → `failed` with the issues attached
//! 3. valid → match and classify, upsert the merged case, mark
//!    `processed`, then hand the change event (if any) to the alert sink
//!    and append it to the event log
//!
//! Events are only delivered after their record left `pending`. A sink
//! failure is logged and the event is stored with `processed = false`.
//! Failed records can be moved back to `pending` with
//! [`Processor::reprocess_failed`].

use std::sync::Arc;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

use casewatch_core::models::{CaseRecord, ChangeType, StoredRecord};
use casewatch_core::store::RecordStore;

use crate::alerting::AlertSink;
use crate::classify::{merge_payload, ChangeClassifier};
use crate::config::ValidationConfig;
use crate::geocode::GeocodeResolver;
use crate::progress::{SyncProgressEvent, SyncProgressReporter};
use crate::validate::Validator;

/// Counts for one `process_pending` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessSummary {
    pub processed: u64,
    pub failed: u64,
    pub new_cases: u64,
    pub updated_cases: u64,
    /// Matched records with no changed fields.
    pub unchanged: u64,
    pub events: u64,
    /// Events the alert sink rejected.
    pub undelivered: u64,
}

enum Outcome {
    Failed,
    Unchanged,
    Event { delivered: bool, new_case: bool },
}

pub struct Processor {
    store: Arc<dyn RecordStore>,
    validator: Validator,
    classifier: ChangeClassifier,
    sink: Arc<dyn AlertSink>,
    geocoder: Option<Arc<GeocodeResolver>>,
}

impl Processor {
    pub fn new(store: Arc<dyn RecordStore>, config: &ValidationConfig, sink: Arc<dyn AlertSink>) -> Self {
        Self {
            store,
            validator: Validator::new(config.clone()),
            classifier: ChangeClassifier::new(config.match_threshold),
            sink,
            geocoder: None,
        }
    }

    /// Geocode new and relocated cases as they are stored.
    pub fn with_geocoder(mut self, geocoder: Arc<GeocodeResolver>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    /// Process pending records in pages of `batch_size` until none are left
    /// or `limit` records have been handled.
    pub async fn process_pending(
        &self,
        batch_size: usize,
        limit: Option<usize>,
        progress: &dyn SyncProgressReporter,
    ) -> Result<ProcessSummary> {
        let total = self.store.record_counts().await?.pending;
        let total = limit.map_or(total, |l| total.min(l as u64));
        let mut remaining = limit.unwrap_or(usize::MAX);
        let mut summary = ProcessSummary::default();
        let mut cases = self.store.list_cases().await?;
        let today = Utc::now().date_naive();

        while remaining > 0 {
            let page = self
                .store
                .pending_records(batch_size.min(remaining), 0)
                .await?;
            if page.is_empty() {
                break;
            }
            remaining -= page.len();

            for stored in &page {
                match self.process_record(stored, &mut cases, today).await? {
                    Outcome::Failed => summary.failed += 1,
                    Outcome::Unchanged => {
                        summary.processed += 1;
                        summary.unchanged += 1;
                    }
                    Outcome::Event { delivered, new_case } => {
                        summary.processed += 1;
                        summary.events += 1;
                        if new_case {
                            summary.new_cases += 1;
                        } else {
                            summary.updated_cases += 1;
                        }
                        if !delivered {
                            summary.undelivered += 1;
                        }
                    }
                }
            }

            progress.report(SyncProgressEvent::Processing {
                n: summary.processed + summary.failed,
                total,
            });
        }

        if let Some(geocoder) = &self.geocoder {
            geocoder.flush().await?;
        }

        tracing::info!(
            processed = summary.processed,
            failed = summary.failed,
            events = summary.events,
            new_cases = summary.new_cases,
            "pending records processed"
        );
        Ok(summary)
    }

    async fn process_record(
        &self,
        stored: &StoredRecord,
        cases: &mut Vec<CaseRecord>,
        today: NaiveDate,
    ) -> Result<Outcome> {
        let record = &stored.record;
        let result = self.validator.validate_record(record, cases, today);
        if !result.is_valid {
            tracing::debug!(
                source_id = %record.source_id,
                record_id = %record.source_record_id,
                issues = result.issues.len(),
                confidence = result.confidence,
                "record failed validation"
            );
            self.store.mark_failed(&stored.id, &result.issues).await?;
            return Ok(Outcome::Failed);
        }

        let now = Utc::now();
        let matched = self.classifier.find_match(&result.normalized, cases);
        let event = self.classifier.classify(
            record,
            &result.normalized,
            matched.map(|i| &cases[i]),
            now,
        );

        let mut case = match matched {
            Some(i) => {
                let existing = &cases[i];
                let payload = merge_payload(&existing.payload, &result.normalized);
                let relocated = payload.city != existing.payload.city
                    || payload.state != existing.payload.state;
                CaseRecord {
                    payload,
                    latitude: if relocated { None } else { existing.latitude },
                    longitude: if relocated { None } else { existing.longitude },
                    updated_at: now,
                    ..existing.clone()
                }
            }
            None => CaseRecord {
                id: Uuid::new_v4().to_string(),
                source_id: record.source_id.clone(),
                source_record_id: record.source_record_id.clone(),
                record_type: record.record_type,
                payload: result.normalized.clone(),
                latitude: None,
                longitude: None,
                created_at: now,
                updated_at: now,
            },
        };

        if case.coordinates().is_none() {
            if let (Some(geocoder), Some(city), Some(state)) =
                (&self.geocoder, &case.payload.city, &case.payload.state)
            {
                if let Some(found) = geocoder.resolve(city, state, "USA").await {
                    case.latitude = Some(found.latitude);
                    case.longitude = Some(found.longitude);
                }
            }
        }

        self.store.upsert_case(&case).await?;
        match matched {
            Some(i) => cases[i] = case,
            None => cases.push(case),
        }
        self.store.mark_processed(&stored.id).await?;

        let Some(mut event) = event else {
            tracing::trace!(record_id = %record.source_record_id, "no changes");
            return Ok(Outcome::Unchanged);
        };

        event.processed = match self.sink.process_change_event(&event).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    source_id = %event.source_id,
                    record_id = %event.source_record_id,
                    error = %e,
                    "alert sink rejected change event"
                );
                false
            }
        };
        self.store.append_change_event(&event).await?;

        Ok(Outcome::Event {
            delivered: event.processed,
            new_case: matches!(event.change_type, ChangeType::NewCase | ChangeType::AmberAlert)
                && matched.is_none(),
        })
    }

    /// Move every failed record back to pending.
    pub async fn reprocess_failed(&self) -> Result<u64> {
        let moved = self.store.reset_failed().await?;
        tracing::info!(records = moved, "failed records reset to pending");
        Ok(moved)
    }
}
