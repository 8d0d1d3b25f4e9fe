//! Record validation and duplicate detection.
//!
//! [`Validator::validate_record`] scores a collected record, starting from
//! a confidence of 1.0 and subtracting a penalty per issue:
//!
//! | Rule | Severity | Penalty |
//! |------|----------|---------|
//! | name missing | error | 0.3 |
//! | case number missing | warning | 0.1 |
//! | no city, state, or composed location | error | 0.2 |
//! | date missing unparsable | warning | 0.1 |
//! | date missing in the future | error | 0.2 |
//! | date missing before 1900 | warning | 0.1 |
//! | age outside 0..=120 | error | 0.2 |
//! | name shorter than 2 characters | warning | 0.1 |
//! | implausible state/city | warning | 0.1 |
//!
//! A probable duplicate of a stored case (score above
//! `duplicate_threshold`) is reported as an issue without a penalty: an
//! error above `duplicate_error_threshold`, a warning otherwise.
//!
//! A record is valid iff it has no error-severity issue and its final
//! confidence is above `min_confidence`. Valid records are normalized:
//! text trimmed, case number and state upper-cased, a missing case
//! number synthesized as `SOURCE_ID-SOURCE_RECORD_ID`.

use chrono::{Datelike, NaiveDate};

use casewatch_core::models::{
    CasePayload, CaseRecord, CollectedRecord, Severity, ValidationIssue, ValidationResult,
};
use casewatch_core::similarity::duplicate_score;

use crate::config::ValidationConfig;
use crate::normalize::{clean_text, is_state_code};

/// Well-known city names and the states they exist in.
const GAZETTEER: &[(&str, &[&str])] = &[
    ("anchorage", &["AK", "KY"]),
    ("atlanta", &["GA", "TX", "IN", "IL", "MI", "NE"]),
    ("boston", &["MA", "GA", "VA"]),
    ("chicago", &["IL"]),
    ("honolulu", &["HI"]),
    ("las vegas", &["NV", "NM"]),
    ("los angeles", &["CA"]),
    ("miami", &["FL", "OK", "AZ", "TX"]),
    ("new orleans", &["LA"]),
    ("salt lake city", &["UT"]),
    ("san antonio", &["TX", "FL"]),
    ("san diego", &["CA", "TX"]),
    ("san francisco", &["CA"]),
    ("seattle", &["WA"]),
];

/// Whether a city/state pair is plausible. Unknown cities pass.
pub fn plausible_location(city: Option<&str>, state: Option<&str>) -> bool {
    let Some(state) = state else {
        return true;
    };
    if !is_state_code(state) {
        return false;
    }
    let Some(city) = city else {
        return true;
    };
    let city = city.trim().to_lowercase();
    GAZETTEER
        .iter()
        .find(|(name, _)| *name == city)
        .map(|(_, states)| states.iter().any(|s| s.eq_ignore_ascii_case(state)))
        .unwrap_or(true)
}

fn trim_field(field: &mut Option<String>) {
    *field = clean_text(field.as_deref());
}

fn name_from_fragments(payload: &CasePayload) -> Option<String> {
    let parts: Vec<&str> = [&payload.first_name, &payload.middle_name, &payload.last_name]
        .into_iter()
        .filter_map(|p| p.as_deref().map(str::trim).filter(|s| !s.is_empty()))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

struct Scorer {
    confidence: f64,
    issues: Vec<ValidationIssue>,
}

impl Scorer {
    fn issue(&mut self, field: &str, severity: Severity, penalty: f64, message: impl Into<String>) {
        self.confidence -= penalty;
        self.issues.push(ValidationIssue {
            field: field.to_string(),
            severity,
            message: message.into(),
        });
    }
}

pub struct Validator {
    config: ValidationConfig,
}

impl Validator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Validate one collected record against the stored cases.
    ///
    /// `today` bounds the "date in the future" rule.
    pub fn validate_record(
        &self,
        record: &CollectedRecord,
        existing: &[CaseRecord],
        today: NaiveDate,
    ) -> ValidationResult {
        let mut payload = record.payload.clone();
        for field in [
            &mut payload.case_number,
            &mut payload.name,
            &mut payload.first_name,
            &mut payload.middle_name,
            &mut payload.last_name,
            &mut payload.gender,
            &mut payload.ethnicity,
            &mut payload.city,
            &mut payload.county,
            &mut payload.state,
            &mut payload.location,
            &mut payload.description,
            &mut payload.circumstances,
            &mut payload.height,
            &mut payload.weight,
        ] {
            trim_field(field);
        }
        payload.case_number = payload.case_number.map(|c| c.to_uppercase());
        payload.state = payload.state.map(|s| s.to_uppercase());
        if payload.name.is_none() {
            payload.name = name_from_fragments(&payload);
        }

        let mut scorer = Scorer {
            confidence: 1.0,
            issues: Vec::new(),
        };

        match &payload.name {
            None => scorer.issue("name", Severity::Error, 0.3, "Name is required"),
            Some(name) if name.chars().count() < 2 => scorer.issue(
                "name",
                Severity::Warning,
                0.1,
                format!("Name '{}' is too short", name),
            ),
            Some(_) => {}
        }

        if payload.case_number.is_none() {
            scorer.issue("case_number", Severity::Warning, 0.1, "Case number is missing");
        }

        if payload.city.is_none() && payload.state.is_none() && payload.location.is_none() {
            scorer.issue("location", Severity::Error, 0.2, "No usable location");
        }

        match (payload.date_missing, &payload.date_missing_text) {
            (Some(date), _) if date > today => scorer.issue(
                "date_missing",
                Severity::Error,
                0.2,
                format!("Date missing {} is in the future", date),
            ),
            (Some(date), _) if date.year() < 1900 => scorer.issue(
                "date_missing",
                Severity::Warning,
                0.1,
                format!("Date missing {} is before 1900", date),
            ),
            (None, Some(text)) => scorer.issue(
                "date_missing",
                Severity::Warning,
                0.1,
                format!("Unparsable date missing: '{}'", text),
            ),
            _ => {}
        }

        if let Some(age) = payload.age {
            if !(0..=120).contains(&age) {
                scorer.issue(
                    "age",
                    Severity::Error,
                    0.2,
                    format!("Age {} is outside 0-120", age),
                );
            }
        }

        if !plausible_location(payload.city.as_deref(), payload.state.as_deref()) {
            scorer.issue(
                "state",
                Severity::Warning,
                0.1,
                format!(
                    "Implausible location: {}, {}",
                    payload.city.as_deref().unwrap_or("?"),
                    payload.state.as_deref().unwrap_or("?")
                ),
            );
        }

        if let Some((case, score)) = self.best_duplicate(record, &payload, existing) {
            let severity = if score > self.config.duplicate_error_threshold {
                Severity::Error
            } else {
                Severity::Warning
            };
            scorer.issue(
                "duplicate",
                severity,
                0.0,
                format!("Probable duplicate of case {} (score {:.2})", case.id, score),
            );
        }

        let confidence = (scorer.confidence.clamp(0.0, 1.0) * 1000.0).round() / 1000.0;
        let has_errors = scorer.issues.iter().any(|i| i.severity == Severity::Error);
        let is_valid = !has_errors && confidence > self.config.min_confidence;

        if !has_errors && payload.case_number.is_none() {
            payload.case_number = Some(
                format!("{}-{}", record.source_id, record.source_record_id).to_uppercase(),
            );
        }

        tracing::trace!(
            source_id = %record.source_id,
            record_id = %record.source_record_id,
            confidence,
            issues = scorer.issues.len(),
            is_valid,
            "record validated"
        );

        ValidationResult {
            is_valid,
            confidence,
            issues: scorer.issues,
            normalized: payload,
        }
    }

    /// Highest-scoring stored case above the duplicate threshold.
    ///
    /// Stored cases from the same upstream item are updates, not duplicates,
    /// and are skipped.
    fn best_duplicate<'a>(
        &self,
        record: &CollectedRecord,
        payload: &CasePayload,
        existing: &'a [CaseRecord],
    ) -> Option<(&'a CaseRecord, f64)> {
        existing
            .iter()
            .filter(|c| {
                !(c.source_id == record.source_id && c.source_record_id == record.source_record_id)
            })
            .map(|c| (c, duplicate_score(payload, &c.payload)))
            .filter(|(_, score)| *score > self.config.duplicate_threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use casewatch_core::models::{Category, RecordType};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    fn validator() -> Validator {
        Validator::new(ValidationConfig::default())
    }

    fn record(source_record_id: &str, payload: CasePayload) -> CollectedRecord {
        CollectedRecord::new(
            "florida_fdle",
            source_record_id,
            RecordType::MissingPerson,
            payload,
            Utc::now(),
        )
    }

    fn jane() -> CasePayload {
        CasePayload {
            case_number: Some("FL-2024-001".into()),
            name: Some("Jane Doe".into()),
            age: Some(16),
            city: Some("Miami".into()),
            state: Some("FL".into()),
            location: Some("Miami, FL, USA".into()),
            date_missing: NaiveDate::from_ymd_opt(2024, 5, 1),
            category: Category::MissingChildren,
            ..Default::default()
        }
    }

    fn stored(id: &str, source_record_id: &str, payload: CasePayload) -> CaseRecord {
        let now = Utc::now();
        CaseRecord {
            id: id.into(),
            source_id: "other_source".into(),
            source_record_id: source_record_id.into(),
            record_type: RecordType::MissingPerson,
            payload,
            latitude: None,
            longitude: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn has_issue(result: &ValidationResult, field: &str, severity: Severity) -> bool {
        result
            .issues
            .iter()
            .any(|i| i.field == field && i.severity == severity)
    }

    #[test]
    fn test_clean_record_is_valid_with_full_confidence() {
        let result = validator().validate_record(&record("1", jane()), &[], today());
        assert!(result.is_valid);
        assert!(result.issues.is_empty());
        assert!((result.confidence - 1.0).abs() < 1e-9);
        assert_eq!(result.normalized.age, Some(16));
    }

    #[test]
    fn test_penalties_accumulate() {
        let payload = CasePayload {
            name: Some("J".into()),
            state: Some("FL".into()),
            date_missing_text: Some("sometime last spring".into()),
            ..Default::default()
        };
        let result = validator().validate_record(&record("2", payload), &[], today());
        assert!(has_issue(&result, "name", Severity::Warning));
        assert!(has_issue(&result, "case_number", Severity::Warning));
        assert!(has_issue(&result, "date_missing", Severity::Warning));
        assert!((result.confidence - 0.7).abs() < 1e-9);
        assert!(result.is_valid);
    }

    #[test]
    fn test_error_rules() {
        let payload = CasePayload {
            age: Some(130),
            date_missing: NaiveDate::from_ymd_opt(2030, 1, 1),
            ..Default::default()
        };
        let result = validator().validate_record(&record("3", payload), &[], today());
        assert!(!result.is_valid);
        assert!(has_issue(&result, "name", Severity::Error));
        assert!(has_issue(&result, "location", Severity::Error));
        assert!(has_issue(&result, "date_missing", Severity::Error));
        assert!(has_issue(&result, "age", Severity::Error));
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.normalized.case_number, None);
    }

    #[test]
    fn test_old_date_is_a_warning() {
        let mut payload = jane();
        payload.date_missing = NaiveDate::from_ymd_opt(1899, 12, 31);
        let result = validator().validate_record(&record("4", payload), &[], today());
        assert!(has_issue(&result, "date_missing", Severity::Warning));
        assert!(result.is_valid);
    }

    #[test]
    fn test_low_confidence_without_errors_is_invalid() {
        let payload = CasePayload {
            name: Some("X".into()),
            city: Some("Seattle".into()),
            state: Some("FL".into()),
            date_missing: NaiveDate::from_ymd_opt(1850, 1, 1),
            ..Default::default()
        };
        let mut with_bad_date = payload.clone();
        with_bad_date.date_missing = None;
        with_bad_date.date_missing_text = Some("??".into());

        let result = validator().validate_record(&record("5", payload), &[], today());
        assert!(!result.has_errors());
        assert!((result.confidence - 0.6).abs() < 1e-9);
        assert!(result.is_valid);

        let strict = Validator::new(ValidationConfig {
            min_confidence: 0.6,
            ..ValidationConfig::default()
        });
        let result = strict.validate_record(&record("5", with_bad_date), &[], today());
        assert!(!result.has_errors());
        assert!(!result.is_valid);
    }

    #[test]
    fn test_implausible_locations() {
        assert!(plausible_location(Some("Miami"), Some("FL")));
        assert!(plausible_location(Some("Springfield"), Some("IL")));
        assert!(plausible_location(None, None));
        assert!(!plausible_location(Some("Seattle"), Some("FL")));
        assert!(!plausible_location(Some("Anywhere"), Some("XX")));
    }

    #[test]
    fn test_same_name_and_place_is_duplicate_error() {
        let incoming = CasePayload {
            name: Some("Jane Doe".into()),
            city: Some("Miami".into()),
            state: Some("FL".into()),
            ..Default::default()
        };
        let existing = vec![stored("case-1", "x", incoming.clone())];
        let result = validator().validate_record(&record("6", incoming), &existing, today());
        let duplicate = result
            .issues
            .iter()
            .find(|i| i.field == "duplicate")
            .unwrap();
        assert_eq!(duplicate.severity, Severity::Error);
        assert!(duplicate.message.contains("case-1"));
        assert!(duplicate.message.contains("1.00"));
        assert!(!result.is_valid);
        // duplicates carry no penalty; only the missing case number counts
        assert!((result.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_moderate_similarity_is_duplicate_warning() {
        let incoming = CasePayload {
            name: Some("Jane Doe".into()),
            city: Some("Miami".into()),
            state: Some("FL".into()),
            age: Some(16),
            ..Default::default()
        };
        let mut other = incoming.clone();
        other.age = Some(9);
        other.name = Some("Jane Dow".into());
        // name 0.875*0.4 + location 0.2 + age 0.3*0.1 = 0.58 / 0.7 ≈ 0.829
        let existing = vec![stored("case-2", "y", other.clone())];
        let result = validator().validate_record(&record("7", incoming.clone()), &existing, today());
        assert!(!result.issues.iter().any(|i| i.field == "duplicate"));

        other.age = Some(13);
        // 0.35 + 0.2 + 0.07 = 0.62 / 0.7 ≈ 0.886
        let existing = vec![stored("case-2", "y", other)];
        let result = validator().validate_record(&record("7", incoming), &existing, today());
        let duplicate = result.issues.iter().find(|i| i.field == "duplicate").unwrap();
        assert_eq!(duplicate.severity, Severity::Warning);
    }

    #[test]
    fn test_same_upstream_item_is_not_a_duplicate() {
        let mut existing = stored("case-1", "1", jane());
        existing.source_id = "florida_fdle".into();
        let result = validator().validate_record(&record("1", jane()), &[existing], today());
        assert!(result.issues.is_empty());
    }

    #[test]
    fn test_normalization_backfills() {
        let payload = CasePayload {
            first_name: Some(" Jane ".into()),
            last_name: Some("Doe".into()),
            city: Some("  Miami ".into()),
            state: Some("fl".into()),
            ..Default::default()
        };
        let result = validator().validate_record(&record("abc-9", payload), &[], today());
        assert!(result.is_valid);
        let normalized = result.normalized;
        assert_eq!(normalized.name.as_deref(), Some("Jane Doe"));
        assert_eq!(normalized.city.as_deref(), Some("Miami"));
        assert_eq!(normalized.state.as_deref(), Some("FL"));
        assert_eq!(normalized.case_number.as_deref(), Some("FLORIDA_FDLE-ABC-9"));
    }
}
