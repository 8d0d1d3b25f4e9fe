//! Change classification.
//!
//! Turns a validated record into a [`ChangeEvent`] relative to the stored
//! case it matches:
//!
//! ```text
//! match by case number ──▶ match by name similarity > threshold ──▶ no match
//!        │                           │                                │
//!        └──────── diff fields ◀─────┘                     new_case / amber_alert
//!                      │
//!   status → Found ──▶ resolution (critical)
//!   status changed ──▶ status_update
//!   other fields ────▶ info_update
//!   nothing changed ─▶ no event
//! ```
//!
//! Update priority: `high` with any major change (status, location),
//! `medium` with more than 3 changed fields, else `low`. AMBER-alert
//! records are always `critical`.

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use casewatch_core::models::{
    CasePayload, CaseRecord, CaseStatus, ChangeEvent, ChangeType, CollectedRecord, FieldChange,
    Priority, Significance,
};
use casewatch_core::similarity::string_similarity;

pub struct ChangeClassifier {
    match_threshold: f64,
}

fn date_text(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format("%Y-%m-%d").to_string())
}

/// The tracked fields of a payload as comparable text.
fn tracked_fields(payload: &CasePayload) -> [(&'static str, Option<String>); 8] {
    [
        ("status", Some(payload.status.to_string())),
        ("location", payload.location.clone()),
        ("description", payload.description.clone()),
        ("circumstances", payload.circumstances.clone()),
        ("date_modified", date_text(payload.date_modified)),
        ("age", payload.age.map(|a| a.to_string())),
        ("height", payload.height.clone()),
        ("weight", payload.weight.clone()),
    ]
}

/// Fields whose incoming value is present and differs from the stored one.
pub fn diff_fields(stored: &CasePayload, incoming: &CasePayload) -> Vec<FieldChange> {
    tracked_fields(stored)
        .into_iter()
        .zip(tracked_fields(incoming))
        .filter_map(|((field, old_value), (_, new_value))| {
            let new = new_value.as_deref()?;
            if old_value.as_deref() == Some(new) {
                return None;
            }
            let significance = match field {
                "status" | "location" => Significance::Major,
                _ => Significance::Minor,
            };
            Some(FieldChange {
                field: field.to_string(),
                old_value,
                new_value,
                significance,
            })
        })
        .collect()
}

/// Priority for an update from its field diff.
pub fn update_priority(changes: &[FieldChange]) -> Priority {
    if changes.iter().any(|c| c.significance == Significance::Major) {
        Priority::High
    } else if changes.len() > 3 {
        Priority::Medium
    } else {
        Priority::Low
    }
}

/// Stored payload updated with every present incoming field.
///
/// Absent incoming values never erase stored data.
pub fn merge_payload(stored: &CasePayload, incoming: &CasePayload) -> CasePayload {
    fn pick<T: Clone>(incoming: &Option<T>, stored: &Option<T>) -> Option<T> {
        incoming.clone().or_else(|| stored.clone())
    }

    CasePayload {
        case_number: pick(&incoming.case_number, &stored.case_number),
        name: pick(&incoming.name, &stored.name),
        first_name: pick(&incoming.first_name, &stored.first_name),
        middle_name: pick(&incoming.middle_name, &stored.middle_name),
        last_name: pick(&incoming.last_name, &stored.last_name),
        age: pick(&incoming.age, &stored.age),
        gender: pick(&incoming.gender, &stored.gender),
        ethnicity: pick(&incoming.ethnicity, &stored.ethnicity),
        city: pick(&incoming.city, &stored.city),
        county: pick(&incoming.county, &stored.county),
        state: pick(&incoming.state, &stored.state),
        location: pick(&incoming.location, &stored.location),
        date_missing: pick(&incoming.date_missing, &stored.date_missing),
        date_missing_text: pick(&incoming.date_missing_text, &stored.date_missing_text),
        date_reported: pick(&incoming.date_reported, &stored.date_reported),
        date_modified: pick(&incoming.date_modified, &stored.date_modified),
        status: incoming.status,
        category: incoming.category,
        priority: pick(&incoming.priority, &stored.priority),
        risk_level: pick(&incoming.risk_level, &stored.risk_level),
        description: pick(&incoming.description, &stored.description),
        circumstances: pick(&incoming.circumstances, &stored.circumstances),
        height: pick(&incoming.height, &stored.height),
        weight: pick(&incoming.weight, &stored.weight),
        source: incoming.source.clone(),
    }
}

impl ChangeClassifier {
    pub fn new(match_threshold: f64) -> Self {
        Self { match_threshold }
    }

    /// Index of the stored case this payload refers to.
    ///
    /// Case number equality wins; otherwise the most similar name above
    /// the match threshold.
    pub fn find_match(&self, payload: &CasePayload, cases: &[CaseRecord]) -> Option<usize> {
        if let Some(number) = payload.case_number.as_deref() {
            let by_number = cases.iter().position(|c| {
                c.payload
                    .case_number
                    .as_deref()
                    .is_some_and(|n| n.eq_ignore_ascii_case(number))
            });
            if by_number.is_some() {
                return by_number;
            }
        }

        let name = payload.name.as_deref()?;
        cases
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                let other = c.payload.name.as_deref()?;
                Some((i, string_similarity(name, other)))
            })
            .filter(|(_, score)| *score > self.match_threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
    }

    /// Classify a validated record against its matched stored case.
    ///
    /// Returns `None` when a matched case has no changed fields.
    pub fn classify(
        &self,
        record: &CollectedRecord,
        normalized: &CasePayload,
        matched: Option<&CaseRecord>,
        detected_at: DateTime<Utc>,
    ) -> Option<ChangeEvent> {
        let is_alert = record.record_type.is_alert();

        let (change_type, priority, changes) = match matched {
            None if is_alert => (ChangeType::AmberAlert, Priority::Critical, Vec::new()),
            None => (ChangeType::NewCase, Priority::High, Vec::new()),
            Some(stored) => {
                let changes = diff_fields(&stored.payload, normalized);
                if changes.is_empty() {
                    return None;
                }
                let resolved = stored.payload.status != CaseStatus::Found
                    && normalized.status == CaseStatus::Found;
                let (change_type, priority) = if resolved {
                    (ChangeType::Resolution, Priority::Critical)
                } else if changes.iter().any(|c| c.field == "status") {
                    (ChangeType::StatusUpdate, update_priority(&changes))
                } else {
                    (ChangeType::InfoUpdate, update_priority(&changes))
                };
                (change_type, priority, changes)
            }
        };

        let priority = if is_alert { Priority::Critical } else { priority };

        Some(ChangeEvent {
            id: Uuid::new_v4().to_string(),
            change_type,
            source_id: record.source_id.clone(),
            source_record_id: record.source_record_id.clone(),
            priority,
            changes,
            record: normalized.clone(),
            detected_at,
            processed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casewatch_core::models::RecordType;

    fn payload() -> CasePayload {
        CasePayload {
            case_number: Some("FL-2024-001".into()),
            name: Some("Jane Doe".into()),
            age: Some(16),
            city: Some("Miami".into()),
            state: Some("FL".into()),
            location: Some("Miami, FL, USA".into()),
            description: Some("Brown hair".into()),
            ..Default::default()
        }
    }

    fn stored(payload: CasePayload) -> CaseRecord {
        let now = Utc::now();
        CaseRecord {
            id: "case-1".into(),
            source_id: "florida_fdle".into(),
            source_record_id: "FL-2024-001".into(),
            record_type: RecordType::MissingPerson,
            payload,
            latitude: None,
            longitude: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn record(record_type: RecordType, payload: CasePayload) -> CollectedRecord {
        CollectedRecord::new("florida_fdle", "FL-2024-001", record_type, payload, Utc::now())
    }

    fn classifier() -> ChangeClassifier {
        ChangeClassifier::new(0.8)
    }

    #[test]
    fn test_new_case_and_alert() {
        let event = classifier()
            .classify(&record(RecordType::MissingPerson, payload()), &payload(), None, Utc::now())
            .unwrap();
        assert_eq!(event.change_type, ChangeType::NewCase);
        assert_eq!(event.priority, Priority::High);
        assert!(!event.processed);

        let event = classifier()
            .classify(&record(RecordType::AmberAlert, payload()), &payload(), None, Utc::now())
            .unwrap();
        assert_eq!(event.change_type, ChangeType::AmberAlert);
        assert_eq!(event.priority, Priority::Critical);
    }

    #[test]
    fn test_found_is_resolution() {
        let mut found = payload();
        found.status = CaseStatus::Found;
        let existing = stored(payload());
        let event = classifier()
            .classify(&record(RecordType::MissingPerson, found.clone()), &found, Some(&existing), Utc::now())
            .unwrap();
        assert_eq!(event.change_type, ChangeType::Resolution);
        assert_eq!(event.priority, Priority::Critical);
        assert_eq!(event.changes.len(), 1);
        assert_eq!(event.changes[0].old_value.as_deref(), Some("Active"));
        assert_eq!(event.changes[0].new_value.as_deref(), Some("Found"));
        assert_eq!(event.changes[0].significance, Significance::Major);
    }

    #[test]
    fn test_update_priorities() {
        let existing = stored(payload());

        let mut moved = payload();
        moved.location = Some("Orlando, FL, USA".into());
        let event = classifier()
            .classify(&record(RecordType::MissingPerson, moved.clone()), &moved, Some(&existing), Utc::now())
            .unwrap();
        assert_eq!(event.change_type, ChangeType::InfoUpdate);
        assert_eq!(event.priority, Priority::High);

        let mut many = payload();
        many.description = Some("Red jacket".into());
        many.circumstances = Some("Left school".into());
        many.height = Some("5'4\"".into());
        many.weight = Some("110 lbs".into());
        let event = classifier()
            .classify(&record(RecordType::MissingPerson, many.clone()), &many, Some(&existing), Utc::now())
            .unwrap();
        assert_eq!(event.changes.len(), 4);
        assert_eq!(event.priority, Priority::Medium);

        let mut one = payload();
        one.age = Some(17);
        let event = classifier()
            .classify(&record(RecordType::MissingPerson, one.clone()), &one, Some(&existing), Utc::now())
            .unwrap();
        assert_eq!(event.priority, Priority::Low);

        let event = classifier()
            .classify(&record(RecordType::AmberAlert, one.clone()), &one, Some(&existing), Utc::now())
            .unwrap();
        assert_eq!(event.priority, Priority::Critical);
    }

    #[test]
    fn test_unchanged_or_absent_fields_emit_nothing() {
        let existing = stored(payload());
        let mut sparse = payload();
        sparse.description = None;
        sparse.age = None;
        assert!(diff_fields(&existing.payload, &sparse).is_empty());
        assert!(classifier()
            .classify(&record(RecordType::MissingPerson, sparse.clone()), &sparse, Some(&existing), Utc::now())
            .is_none());
    }

    #[test]
    fn test_priority_is_deterministic() {
        let existing = stored(payload());
        let mut changed = payload();
        changed.weight = Some("100 lbs".into());
        let first = diff_fields(&existing.payload, &changed);
        let second = diff_fields(&existing.payload, &changed);
        assert_eq!(first, second);
        assert_eq!(update_priority(&first), update_priority(&second));
    }

    #[test]
    fn test_find_match() {
        let cases = vec![stored(payload())];

        let mut renumbered = payload();
        renumbered.name = Some("Someone Else".into());
        assert_eq!(classifier().find_match(&renumbered, &cases), Some(0));

        let by_name = CasePayload {
            case_number: Some("OTHER-1".into()),
            name: Some("Jane Do".into()),
            ..Default::default()
        };
        assert_eq!(classifier().find_match(&by_name, &cases), Some(0));

        let stranger = CasePayload {
            name: Some("John Smith".into()),
            ..Default::default()
        };
        assert_eq!(classifier().find_match(&stranger, &cases), None);
    }

    #[test]
    fn test_merge_keeps_stored_values() {
        let mut incoming = payload();
        incoming.description = None;
        incoming.age = Some(17);
        let merged = merge_payload(&payload(), &incoming);
        assert_eq!(merged.description.as_deref(), Some("Brown hair"));
        assert_eq!(merged.age, Some(17));
    }
}
