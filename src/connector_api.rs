//! Paginated JSON search API connector (`adapter = "search_api"`).
//!
//! POSTs `{searchType, caseStatus, take, skip}` pages to
//! `base_url + search_path` and normalizes every result object.
//!
//! # Configuration
//!
//! ```toml
//! [sources.namus]
//! name = "NamUs"
//! adapter = "search_api"
//! base_url = "https://www.namus.gov"
//! search_path = "/api/CaseSets/NamUs/MissingPersons/Search"
//! page_size = 100
//! max_pages = 10
//! priority = "high"
//! ```
//!
//! # Pagination
//!
//! Results are read from `results`, `data`, or a top-level array. Paging
//! stops on a short page, when `skip` reaches the reported `count`, or
//! after `max_pages`.
//!
//! # Field aliases
//!
//! Upstream schemas vary between deployments, so each canonical field is
//! read from the first non-empty alias. Nested objects are searched one
//! level deep (e.g. `subjectIdentification.firstName`). Object values
//! such as `{"name": "Florida"}` resolve to their `name`/`displayName`.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use casewatch_core::models::{AdapterKind, CollectedRecord, SourceMeta};

use crate::config::SourceConfig;
use crate::fetch::{join_url, SourceClient};
use crate::normalize::{fallback_record_id, into_record, RawCase};
use crate::traits::Connector;

const CASE_NUMBER: &[&str] = &["caseNumber", "namus_number", "namusNumber", "case_number", "id"];
const NAME: &[&str] = &["name", "full_name", "fullName"];
const FIRST_NAME: &[&str] = &["firstName", "first_name"];
const MIDDLE_NAME: &[&str] = &["middleName", "middle_name"];
const LAST_NAME: &[&str] = &["lastName", "last_name"];
const AGE: &[&str] = &[
    "ageLastSeen",
    "age_last_seen",
    "computedMissingMinAge",
    "age",
    "current_age",
    "currentAge",
];
const GENDER: &[&str] = &["sex", "gender"];
const ETHNICITY: &[&str] = &["raceEthnicity", "race_ethnicity", "race", "ethnicity"];
const CITY: &[&str] = &["cityLastSeen", "city_last_seen", "city"];
const COUNTY: &[&str] = &["countyLastSeen", "county_last_seen", "county"];
const STATE: &[&str] = &["stateLastSeen", "state_last_seen", "state"];
const DATE_MISSING: &[&str] = &["dateLastSeen", "date_last_seen", "date_missing", "dateMissing"];
const DATE_REPORTED: &[&str] = &["dateReported", "date_reported", "createdDateTime"];
const DATE_MODIFIED: &[&str] = &["modifiedDateTime", "date_modified", "dateModified"];
const STATUS: &[&str] = &["status", "caseStatus"];
const CATEGORY: &[&str] = &["category"];
const RISK: &[&str] = &["riskLevel", "risk_level"];
const CIRCUMSTANCES: &[&str] = &["circumstances", "circumstancesOfDisappearance"];
const DESCRIPTION: &[&str] = &["description", "details"];
const HEIGHT: &[&str] = &["height", "heightFrom"];
const WEIGHT: &[&str] = &["weight", "weightFrom"];
const URL: &[&str] = &["url", "link", "caseUrl"];

const ALL_ALIASES: &[&[&str]] = &[
    CASE_NUMBER,
    NAME,
    FIRST_NAME,
    MIDDLE_NAME,
    LAST_NAME,
    AGE,
    GENDER,
    ETHNICITY,
    CITY,
    COUNTY,
    STATE,
    DATE_MISSING,
    DATE_REPORTED,
    DATE_MODIFIED,
    STATUS,
    CATEGORY,
    RISK,
    CIRCUMSTANCES,
    DESCRIPTION,
    HEIGHT,
    WEIGHT,
    URL,
];

pub struct SearchApiConnector {
    id: String,
    config: SourceConfig,
    client: SourceClient,
    description: String,
}

impl SearchApiConnector {
    pub fn new(id: &str, config: SourceConfig, client: SourceClient) -> Self {
        let description = format!("{} (JSON search API)", config.name);
        Self {
            id: id.to_string(),
            config,
            client,
            description,
        }
    }

    fn meta(&self) -> SourceMeta {
        SourceMeta {
            source_id: self.id.clone(),
            source_name: self.config.name.clone(),
            source_url: Some(self.config.base_url.clone()),
        }
    }
}

#[async_trait]
impl Connector for SearchApiConnector {
    fn source_id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Api
    }

    async fn collect(&self) -> Result<Vec<CollectedRecord>> {
        let url = join_url(&self.config.base_url, &self.config.search_path);
        let page_size = self.config.page_size.max(1);
        let meta = self.meta();
        let mut records = Vec::new();

        for page in 0..self.config.max_pages {
            let skip = page * page_size;
            let body = json!({
                "searchType": "missing",
                "caseStatus": "open",
                "take": page_size,
                "skip": skip,
            });
            let response = self.client.post_json(&url, &body).await?;

            let Some(items) = result_items(&response) else {
                tracing::warn!(
                    source_id = %self.id,
                    page,
                    "search response has no result list, treating as empty"
                );
                break;
            };
            tracing::debug!(source_id = %self.id, page, records = items.len(), "page fetched");

            for item in items {
                let Some(obj) = item.as_object() else {
                    continue;
                };
                let raw = raw_case(obj);
                if raw.is_empty() {
                    tracing::trace!(source_id = %self.id, "skipping result without identity");
                    continue;
                }
                let record_id = lookup(obj, CASE_NUMBER).unwrap_or_else(|| {
                    fallback_record_id(&[
                        raw.name.as_deref().unwrap_or(""),
                        raw.last_name.as_deref().unwrap_or(""),
                        raw.date_missing.as_deref().unwrap_or(""),
                    ])
                });
                records.push(into_record(
                    &raw,
                    &meta,
                    self.config.record_type,
                    self.config.default_state.as_deref(),
                    &record_id,
                ));
            }

            let total = response.get("count").and_then(Value::as_u64);
            let fetched = (skip + items.len()) as u64;
            if items.len() < page_size || total.is_some_and(|t| fetched >= t) {
                break;
            }
        }

        Ok(records)
    }
}

fn result_items(response: &Value) -> Option<&Vec<Value>> {
    response
        .get("results")
        .and_then(Value::as_array)
        .or_else(|| response.get("data").and_then(Value::as_array))
        .or_else(|| response.as_array())
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Object(obj) => ["name", "displayName", "value"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(scalar)),
        _ => None,
    }
}

fn is_alias(key: &str) -> bool {
    ALL_ALIASES.iter().any(|group| group.contains(&key))
}

/// First non-empty alias, top level first, then one level of nesting.
fn lookup(obj: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    if let Some(found) = aliases
        .iter()
        .find_map(|alias| obj.get(*alias).and_then(scalar))
    {
        return Some(found);
    }
    // Objects that are themselves alias targets (stateLastSeen: {name}) are
    // values, not containers.
    obj.iter()
        .filter(|(key, _)| !is_alias(key))
        .filter_map(|(_, value)| value.as_object())
        .find_map(|nested| {
            aliases
                .iter()
                .find_map(|alias| nested.get(*alias).and_then(scalar))
        })
}

fn raw_case(obj: &Map<String, Value>) -> RawCase {
    RawCase {
        case_number: lookup(obj, CASE_NUMBER),
        name: lookup(obj, NAME),
        first_name: lookup(obj, FIRST_NAME),
        middle_name: lookup(obj, MIDDLE_NAME),
        last_name: lookup(obj, LAST_NAME),
        age: lookup(obj, AGE),
        gender: lookup(obj, GENDER),
        ethnicity: lookup(obj, ETHNICITY),
        city: lookup(obj, CITY),
        county: lookup(obj, COUNTY),
        state: lookup(obj, STATE),
        location: None,
        date_missing: lookup(obj, DATE_MISSING),
        date_reported: lookup(obj, DATE_REPORTED),
        date_modified: lookup(obj, DATE_MODIFIED),
        status: lookup(obj, STATUS),
        category: lookup(obj, CATEGORY),
        risk_level: lookup(obj, RISK),
        description: lookup(obj, DESCRIPTION),
        circumstances: lookup(obj, CIRCUMSTANCES),
        height: lookup(obj, HEIGHT),
        weight: lookup(obj, WEIGHT),
        source_url: lookup(obj, URL),
    }
}
