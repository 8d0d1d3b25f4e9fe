//! Alert delivery seam.
//!
//! Every emitted [`ChangeEvent`] is handed to an [`AlertSink`]. Delivery
//! (channels, retries, subscriber matching) lives behind this trait; the
//! pipeline only needs to know whether the sink accepted the event.

use anyhow::Result;
use async_trait::async_trait;

use casewatch_core::models::{ChangeEvent, Priority};

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn process_change_event(&self, event: &ChangeEvent) -> Result<()>;
}

/// Writes each event to the log. Critical events log at WARN.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn process_change_event(&self, event: &ChangeEvent) -> Result<()> {
        let name = event.record.name.as_deref().unwrap_or("(unnamed)");
        let case_number = event.record.case_number.as_deref().unwrap_or("");
        if event.priority == Priority::Critical {
            tracing::warn!(
                source_id = %event.source_id,
                record_id = %event.source_record_id,
                change_type = %event.change_type,
                case_number,
                name,
                "critical change event"
            );
        } else {
            tracing::info!(
                source_id = %event.source_id,
                record_id = %event.source_record_id,
                change_type = %event.change_type,
                priority = %event.priority,
                changes = event.changes.len(),
                case_number,
                name,
                "change event"
            );
        }
        Ok(())
    }
}
