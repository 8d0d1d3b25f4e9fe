//! Core data models used throughout casewatch.
//!
//! These types describe sources, the records collected from them, the
//! canonical case payload every adapter produces, and the events and
//! validation results that flow through the pipeline.
//!
//! Enum variants serialize to the names used in stored JSON and in CLI
//! output (`"missing_person"`, `"Missing Children"`, `"critical"`, ...).

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ═══════════════════════════════════════════════════════════════════════
// Enumerations
// ═══════════════════════════════════════════════════════════════════════

/// Kind of upstream item a record was collected from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    #[default]
    MissingPerson,
    AmberAlert,
    ResolvedCase,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::MissingPerson => "missing_person",
            RecordType::AmberAlert => "amber_alert",
            RecordType::ResolvedCase => "resolved_case",
        }
    }

    /// Alert-type records are always critical and always categorized as
    /// AMBER alerts.
    pub fn is_alert(&self) -> bool {
        matches!(self, RecordType::AmberAlert)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "missing_person" => Some(RecordType::MissingPerson),
            "amber_alert" => Some(RecordType::AmberAlert),
            "resolved_case" => Some(RecordType::ResolvedCase),
            _ => None,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CaseStatus {
    #[default]
    Active,
    Found,
    Deceased,
    Closed,
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CaseStatus::Active => "Active",
            CaseStatus::Found => "Found",
            CaseStatus::Deceased => "Deceased",
            CaseStatus::Closed => "Closed",
        };
        f.write_str(s)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub enum Category {
    #[serde(rename = "Missing Children")]
    MissingChildren,
    #[default]
    #[serde(rename = "Missing Adults")]
    MissingAdults,
    #[serde(rename = "Missing Veterans")]
    MissingVeterans,
    #[serde(rename = "AMBER Alert")]
    AmberAlert,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Category::MissingChildren => "Missing Children",
            Category::MissingAdults => "Missing Adults",
            Category::MissingVeterans => "Missing Veterans",
            Category::AmberAlert => "AMBER Alert",
        };
        f.write_str(s)
    }
}

/// Risk tag attached to a case, used for cluster point weighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    Critical,
    High,
    Medium,
    Low,
}

/// Priority tier shared by source schedules and change events.
///
/// Ordering is by urgency: `Critical < High < Medium < Low`, so sorting
/// ascending puts the most urgent first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    NewCase,
    StatusUpdate,
    InfoUpdate,
    Resolution,
    AmberAlert,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::NewCase => "new_case",
            ChangeType::StatusUpdate => "status_update",
            ChangeType::InfoUpdate => "info_update",
            ChangeType::Resolution => "resolution",
            ChangeType::AmberAlert => "amber_alert",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Significance {
    Major,
    Minor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// Processing state of a collected record in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Processed,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Processed => "processed",
            RecordStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RecordStatus::Pending),
            "processed" => Some(RecordStatus::Processed),
            "failed" => Some(RecordStatus::Failed),
            _ => None,
        }
    }
}

/// Lifecycle status of a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    #[default]
    Active,
    Inactive,
    Error,
    RateLimited,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Active => "active",
            SourceStatus::Inactive => "inactive",
            SourceStatus::Error => "error",
            SourceStatus::RateLimited => "rate_limited",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SourceStatus::Active),
            "inactive" => Some(SourceStatus::Inactive),
            "error" => Some(SourceStatus::Error),
            "rate_limited" => Some(SourceStatus::RateLimited),
            _ => None,
        }
    }
}

/// Broad family of upstream a source adapter talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    Api,
    Rss,
    Scraper,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::Api => "api",
            AdapterKind::Rss => "rss",
            AdapterKind::Scraper => "scraper",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Sources
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests_per_minute: u32,
    /// Maximum requests inside any one-second span.
    pub burst: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub interval_minutes: u64,
    pub priority: Priority,
}

/// Static description of one upstream source plus its mutable lifecycle
/// state (status and cumulative error count).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceDescriptor {
    pub id: String,
    pub name: String,
    pub kind: AdapterKind,
    pub base_url: String,
    pub rate_limit: RateLimit,
    pub schedule: Schedule,
    pub status: SourceStatus,
    pub error_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHealthStatus {
    pub source_id: String,
    pub is_healthy: bool,
    pub last_successful_sync: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
    pub average_response_ms: f64,
    pub last_error: Option<String>,
}

impl SourceHealthStatus {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            is_healthy: true,
            last_successful_sync: None,
            consecutive_errors: 0,
            average_response_ms: 0.0,
            last_error: None,
        }
    }
}

/// Persisted lifecycle state of a source, restored at scheduler startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStatusSnapshot {
    pub source_id: String,
    pub name: String,
    pub status: SourceStatus,
    pub error_count: u32,
    pub health: SourceHealthStatus,
}

/// Outcome of one collection cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub id: String,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records_processed: u64,
    pub records_added: u64,
    pub records_updated: u64,
    pub records_skipped: u64,
    pub errors: Vec<String>,
    pub success: bool,
}

impl SyncResult {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SourceMeta {
    pub source_id: String,
    pub source_name: String,
    pub source_url: Option<String>,
}

/// The canonical person payload every adapter produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CasePayload {
    pub case_number: Option<String>,
    pub name: Option<String>,
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    pub age: Option<i32>,
    pub gender: Option<String>,
    pub ethnicity: Option<String>,
    pub city: Option<String>,
    pub county: Option<String>,
    pub state: Option<String>,
    pub location: Option<String>,
    pub date_missing: Option<NaiveDate>,
    /// Raw upstream text for `date_missing` when it could not be parsed.
    pub date_missing_text: Option<String>,
    pub date_reported: Option<NaiveDate>,
    pub date_modified: Option<NaiveDate>,
    pub status: CaseStatus,
    pub category: Category,
    pub priority: Option<Priority>,
    pub risk_level: Option<RiskLevel>,
    pub description: Option<String>,
    pub circumstances: Option<String>,
    pub height: Option<String>,
    pub weight: Option<String>,
    pub source: SourceMeta,
}

/// A normalized record emitted by an adapter, queued as `pending`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectedRecord {
    pub source_id: String,
    pub source_record_id: String,
    pub record_type: RecordType,
    pub payload: CasePayload,
    pub collected_at: DateTime<Utc>,
    pub content_hash: String,
}

impl CollectedRecord {
    /// Build a record and compute its content hash.
    pub fn new(
        source_id: impl Into<String>,
        source_record_id: impl Into<String>,
        record_type: RecordType,
        payload: CasePayload,
        collected_at: DateTime<Utc>,
    ) -> Self {
        let source_id = source_id.into();
        let source_record_id = source_record_id.into();
        let content_hash = content_hash(&source_id, &source_record_id, record_type, &payload);
        Self {
            source_id,
            source_record_id,
            record_type,
            payload,
            collected_at,
            content_hash,
        }
    }
}

/// SHA-256 over the identity fields of a record, hex encoded.
///
/// Covers source id, source record id, record type, name, case number,
/// location and date missing. Absent fields hash as empty strings; each
/// field is terminated by a unit separator so adjacent fields cannot
/// run together.
pub fn content_hash(
    source_id: &str,
    source_record_id: &str,
    record_type: RecordType,
    payload: &CasePayload,
) -> String {
    let date = payload
        .date_missing
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default();
    let fields = [
        source_id,
        source_record_id,
        record_type.as_str(),
        payload.name.as_deref().unwrap_or(""),
        payload.case_number.as_deref().unwrap_or(""),
        payload.location.as_deref().unwrap_or(""),
        date.as_str(),
    ];

    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field.as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}

/// A collected record as held by the store, with its processing state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    pub record: CollectedRecord,
    pub status: RecordStatus,
    pub issues: Vec<ValidationIssue>,
}

/// Result of inserting a collected record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New upstream item.
    Added,
    /// Known (source id, source record id) with a new content hash, or
    /// the same hash with a changed payload (e.g. only the status moved).
    Updated,
    /// Content hash and payload already stored.
    Skipped,
}

/// The canonical stored case that incoming records are matched against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub id: String,
    pub source_id: String,
    pub source_record_id: String,
    pub record_type: RecordType,
    pub payload: CasePayload,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CaseRecord {
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Validation & change events
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub confidence: f64,
    pub issues: Vec<ValidationIssue>,
    pub normalized: CasePayload,
}

impl ValidationResult {
    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub significance: Significance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: String,
    pub change_type: ChangeType,
    pub source_id: String,
    pub source_record_id: String,
    pub priority: Priority,
    pub changes: Vec<FieldChange>,
    pub record: CasePayload,
    pub detected_at: DateTime<Utc>,
    pub processed: bool,
}
