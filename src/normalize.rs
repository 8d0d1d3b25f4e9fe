//! Shared normalization from upstream records to the canonical payload.
//!
//! Adapters fill a [`RawCase`] (every field optional, absence explicit)
//! and call [`normalize`]. The rules are the same for every source; the
//! only per-source parameters are the source metadata, the record type,
//! and an optional default state for single-state sources.
//!
//! | Field | Rule |
//! |-------|------|
//! | name | `name`, else first/middle/last fragments joined by spaces |
//! | age | first integer run in the age text |
//! | category | alerts → AMBER Alert; age < 18 → Missing Children; veteran upstream → Missing Veterans; else Missing Adults |
//! | location | non-empty {city, county, state, "USA"} joined by ", " |
//! | status | keyword match (deceased, found/located/recovered, closed, default Active) |
//! | dates | several formats accepted, unparsable dates dropped |

use chrono::{DateTime, NaiveDate, Utc};
use sha2::{Digest, Sha256};
use once_cell::sync::Lazy;
use regex::Regex;

use casewatch_core::models::{
    CasePayload, CaseStatus, Category, CollectedRecord, Priority, RecordType, RiskLevel,
    SourceMeta,
};

/// Schema-tolerant upstream record. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawCase {
    pub case_number: Option<String>,
    pub name: Option<String>,
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    pub age: Option<String>,
    pub gender: Option<String>,
    pub ethnicity: Option<String>,
    pub city: Option<String>,
    pub county: Option<String>,
    pub state: Option<String>,
    pub location: Option<String>,
    pub date_missing: Option<String>,
    pub date_reported: Option<String>,
    pub date_modified: Option<String>,
    pub status: Option<String>,
    pub category: Option<String>,
    pub risk_level: Option<String>,
    pub description: Option<String>,
    pub circumstances: Option<String>,
    pub height: Option<String>,
    pub weight: Option<String>,
    pub source_url: Option<String>,
}

impl RawCase {
    /// True when no identifying field was extracted.
    pub fn is_empty(&self) -> bool {
        [
            &self.case_number,
            &self.name,
            &self.first_name,
            &self.last_name,
        ]
        .iter()
        .all(|f| clean_text(f.as_deref()).is_none())
    }
}

static INTEGER_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("valid regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));
static CITY_STATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([A-Za-z][A-Za-z .'\-]*?)\s*,\s*([A-Za-z]{2})\s*(?:,\s*USA?)?\s*$")
        .expect("valid regex")
});

const PLACEHOLDERS: &[&str] = &["unknown", "n/a", "na", "none", "null", "-", "--", "not available"];

/// Trim, collapse whitespace, and drop empty or placeholder values.
pub fn clean_text(value: Option<&str>) -> Option<String> {
    let collapsed = WHITESPACE.replace_all(value?.trim(), " ").to_string();
    if collapsed.is_empty() || PLACEHOLDERS.contains(&collapsed.to_lowercase().as_str()) {
        None
    } else {
        Some(collapsed)
    }
}

pub fn derive_name(raw: &RawCase) -> Option<String> {
    if let Some(name) = clean_text(raw.name.as_deref()) {
        return Some(name);
    }
    let parts: Vec<String> = [&raw.first_name, &raw.middle_name, &raw.last_name]
        .iter()
        .filter_map(|f| clean_text(f.as_deref()))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

/// First run of digits in free text ("16 years old" → 16).
pub fn extract_age(text: &str) -> Option<i32> {
    INTEGER_RUN.find(text)?.as_str().parse().ok()
}

pub fn derive_category(
    age: Option<i32>,
    record_type: RecordType,
    upstream: Option<&str>,
) -> Category {
    if record_type.is_alert() {
        return Category::AmberAlert;
    }
    if matches!(age, Some(a) if a < 18) {
        return Category::MissingChildren;
    }
    if upstream.is_some_and(|c| c.to_lowercase().contains("veteran")) {
        return Category::MissingVeterans;
    }
    Category::MissingAdults
}

/// Join the non-empty parts with "USA". Returns `None` when no part is present.
pub fn compose_location(
    city: Option<&str>,
    county: Option<&str>,
    state: Option<&str>,
) -> Option<String> {
    let parts: Vec<&str> = [city, county, state]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if parts.is_empty() {
        return None;
    }
    let mut joined = parts.join(", ");
    joined.push_str(", USA");
    Some(joined)
}

pub fn derive_status(text: Option<&str>) -> CaseStatus {
    let Some(text) = text else {
        return CaseStatus::Active;
    };
    let lower = text.to_lowercase();
    if lower.contains("deceased") {
        CaseStatus::Deceased
    } else if lower.contains("found") || lower.contains("located") || lower.contains("recovered")
    {
        CaseStatus::Found
    } else if lower.contains("closed") || lower.contains("cancel") {
        CaseStatus::Closed
    } else {
        CaseStatus::Active
    }
}

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%m/%d/%Y",
    "%m-%d-%Y",
    "%Y/%m/%d",
    "%B %d, %Y",
    "%b %d, %Y",
];

/// Parse a date in any accepted format, truncated to the calendar date.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, fmt) {
            return Some(date);
        }
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.date_naive());
    }
    if let Ok(ts) = DateTime::parse_from_rfc2822(text) {
        return Some(ts.date_naive());
    }
    // ISO timestamps without offset ("2024-05-01T10:00:00")
    text.get(..10)
        .filter(|_| text.len() > 10 && text.as_bytes()[10] == b'T')
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
}

const STATES: &[(&str, &str)] = &[
    ("AL", "alabama"),
    ("AK", "alaska"),
    ("AZ", "arizona"),
    ("AR", "arkansas"),
    ("CA", "california"),
    ("CO", "colorado"),
    ("CT", "connecticut"),
    ("DE", "delaware"),
    ("DC", "district of columbia"),
    ("FL", "florida"),
    ("GA", "georgia"),
    ("HI", "hawaii"),
    ("ID", "idaho"),
    ("IL", "illinois"),
    ("IN", "indiana"),
    ("IA", "iowa"),
    ("KS", "kansas"),
    ("KY", "kentucky"),
    ("LA", "louisiana"),
    ("ME", "maine"),
    ("MD", "maryland"),
    ("MA", "massachusetts"),
    ("MI", "michigan"),
    ("MN", "minnesota"),
    ("MS", "mississippi"),
    ("MO", "missouri"),
    ("MT", "montana"),
    ("NE", "nebraska"),
    ("NV", "nevada"),
    ("NH", "new hampshire"),
    ("NJ", "new jersey"),
    ("NM", "new mexico"),
    ("NY", "new york"),
    ("NC", "north carolina"),
    ("ND", "north dakota"),
    ("OH", "ohio"),
    ("OK", "oklahoma"),
    ("OR", "oregon"),
    ("PA", "pennsylvania"),
    ("RI", "rhode island"),
    ("SC", "south carolina"),
    ("SD", "south dakota"),
    ("TN", "tennessee"),
    ("TX", "texas"),
    ("UT", "utah"),
    ("VT", "vermont"),
    ("VA", "virginia"),
    ("WA", "washington"),
    ("WV", "west virginia"),
    ("WI", "wisconsin"),
    ("WY", "wyoming"),
];

/// True for the 50 state codes plus DC.
pub fn is_state_code(code: &str) -> bool {
    STATES.iter().any(|(c, _)| *c == code)
}

/// Upper-case state codes and map full state names to codes.
pub fn normalize_state(value: &str) -> String {
    let trimmed = value.trim().trim_end_matches('.');
    let lower = trimmed.to_lowercase();
    STATES
        .iter()
        .find(|(_, name)| *name == lower)
        .map(|(code, _)| code.to_string())
        .unwrap_or_else(|| trimmed.to_uppercase())
}

pub fn normalize_gender(value: &str) -> String {
    match value.trim().to_lowercase().as_str() {
        "m" | "male" | "boy" | "man" => "Male".to_string(),
        "f" | "female" | "girl" | "woman" => "Female".to_string(),
        _ => value.trim().to_string(),
    }
}

fn parse_risk(value: &str) -> Option<RiskLevel> {
    match value.trim().to_lowercase().as_str() {
        "critical" => Some(RiskLevel::Critical),
        "high" => Some(RiskLevel::High),
        "medium" | "moderate" => Some(RiskLevel::Medium),
        "low" => Some(RiskLevel::Low),
        _ => None,
    }
}

/// Map a raw upstream record to the canonical payload.
pub fn normalize(
    raw: &RawCase,
    source: &SourceMeta,
    record_type: RecordType,
    default_state: Option<&str>,
) -> CasePayload {
    let text = |v: &Option<String>| clean_text(v.as_deref());

    let age = text(&raw.age).and_then(|a| extract_age(&a));
    let mut city = text(&raw.city);
    let mut state = text(&raw.state);
    if city.is_none() && state.is_none() {
        if let Some((c, s)) = text(&raw.location).as_deref().and_then(split_city_state) {
            city = Some(c);
            state = Some(s);
        }
    }
    let county = text(&raw.county);
    let state = state
        .or_else(|| default_state.map(str::to_string))
        .map(|s| normalize_state(&s));
    let location = compose_location(city.as_deref(), county.as_deref(), state.as_deref())
        .or_else(|| text(&raw.location));

    let date_missing_raw = text(&raw.date_missing);
    let date_missing = date_missing_raw.as_deref().and_then(parse_date);
    let date_missing_text = if date_missing.is_none() {
        date_missing_raw
    } else {
        None
    };

    let category = derive_category(age, record_type, raw.category.as_deref());
    let alert = record_type.is_alert();
    let risk_level = if alert {
        Some(RiskLevel::Critical)
    } else {
        text(&raw.risk_level)
            .and_then(|r| parse_risk(&r))
            .or(match category {
                Category::MissingChildren => Some(RiskLevel::High),
                _ => None,
            })
    };

    let status = match record_type {
        RecordType::ResolvedCase => CaseStatus::Found,
        _ => derive_status(raw.status.as_deref()),
    };

    CasePayload {
        case_number: text(&raw.case_number),
        name: derive_name(raw),
        first_name: text(&raw.first_name),
        middle_name: text(&raw.middle_name),
        last_name: text(&raw.last_name),
        age,
        gender: text(&raw.gender).map(|g| normalize_gender(&g)),
        ethnicity: text(&raw.ethnicity),
        city,
        county,
        state,
        location,
        date_missing,
        date_missing_text,
        date_reported: text(&raw.date_reported).and_then(|d| parse_date(&d)),
        date_modified: text(&raw.date_modified).and_then(|d| parse_date(&d)),
        status,
        category,
        priority: alert.then_some(Priority::Critical),
        risk_level,
        description: text(&raw.description),
        circumstances: text(&raw.circumstances),
        height: text(&raw.height),
        weight: text(&raw.weight),
        source: SourceMeta {
            source_id: source.source_id.clone(),
            source_name: source.source_name.clone(),
            source_url: text(&raw.source_url).or_else(|| source.source_url.clone()),
        },
    }
}

/// Normalize and wrap as a collected record stamped with the current time.
pub fn into_record(
    raw: &RawCase,
    source: &SourceMeta,
    record_type: RecordType,
    default_state: Option<&str>,
    source_record_id: &str,
) -> CollectedRecord {
    let payload = normalize(raw, source, record_type, default_state);
    CollectedRecord::new(
        source.source_id.clone(),
        source_record_id,
        record_type,
        payload,
        Utc::now(),
    )
}

/// Stable id for upstream items that carry none: the first 16 hex
/// characters of a SHA-256 over the parts.
pub fn fallback_record_id(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.trim().to_lowercase().as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Split `"City, ST"` (optionally followed by `", USA"`) into its parts.
pub fn split_city_state(location: &str) -> Option<(String, String)> {
    let caps = CITY_STATE.captures(location)?;
    let state = caps[2].to_uppercase();
    if !is_state_code(&state) {
        return None;
    }
    Some((caps[1].trim().to_string(), state))
}

// ============ Markup and free text ============

static SCRIPT_STYLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<script[^>]*>.*?</script>|<style[^>]*>.*?</style>|<!--.*?-->")
        .expect("valid regex")
});
static DT_DD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)</dt>\s*<dd[^>]*>").expect("valid regex"));
static BLOCK_BREAK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<br\s*/?>|</(?:p|div|li|tr|dd|h[1-6]|article|section|table)>")
        .expect("valid regex")
});
static CELL_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</t[dh]>").expect("valid regex"));
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid regex"));

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&#160;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&#8217;", "'")
        .replace("&amp;", "&")
}

/// Convert an HTML fragment to plain text, one line per block element.
///
/// `<dt>Label</dt><dd>value</dd>` pairs become `Label: value` lines.
pub fn strip_html(fragment: &str) -> String {
    let text = SCRIPT_STYLE.replace_all(fragment, "");
    let text = DT_DD.replace_all(&text, ": ");
    let text = BLOCK_BREAK.replace_all(&text, "\n");
    let text = CELL_BREAK.replace_all(&text, " ");
    let text = TAG.replace_all(&text, "");
    decode_entities(&text)
        .lines()
        .map(|line| WHITESPACE.replace_all(line.trim(), " ").to_string())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

static TITLE_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:(?:amber|endangered|missing|update|cancel+ed|child|person|alert|juvenile|teen|runaway)[a-z]*\s*)+[:\-–]\s*")
        .expect("valid regex")
});
static NAME_END: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s*(?:,|\(|\s[-–]\s|\s(?:missing|abducted|last seen|from|was|is)\b)")
        .expect("valid regex")
});
static ALERT_FOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:[Aa]lert|[Ss]earch|[Ll]ooking) for\s+([A-Z][A-Za-z'\-]+(?:\s+[A-Z][A-Za-z'\-]+){1,3})")
        .expect("valid regex")
});
static AGE_PHRASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d{1,3})[\s-]+years?[\s-]+old|\bage[:\s]+(\d{1,3})\b|\((\d{1,3})\)|,\s*(\d{1,3})\s*,")
        .expect("valid regex")
});
static GENDER_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(male|female|boy|girl)\b").expect("valid regex"));
static SEEN_IN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:last seen in|last seen near|missing from|abducted from|taken from)\s+([A-Za-z][A-Za-z .'\-]*?),\s*([A-Za-z]{2})\b")
        .expect("valid regex")
});

/// Person name from a feed or alert title.
///
/// Handles `"AMBER Alert: Jane Doe, 7, ..."`, `"Missing: John Smith (15)"`
/// and `"Jane Roe (16) missing from ..."`.
pub fn name_from_title(title: &str) -> Option<String> {
    let rest = TITLE_PREFIX.replace(title, "");
    let end = NAME_END.find(&rest).map(|m| m.start()).unwrap_or(rest.len());
    let name = rest[..end].trim();
    let words = name.split_whitespace().count();
    if (1..=5).contains(&words) && name.chars().any(char::is_alphabetic) {
        Some(name.to_string())
    } else {
        None
    }
}

/// Person name from alert prose ("... issued an AMBER Alert for Jane Doe, ...").
pub fn name_from_prose(text: &str) -> Option<String> {
    ALERT_FOR.captures(text).map(|c| c[1].to_string())
}

/// Age stated in free text ("7-year-old", "age 12", "(15)", ", 9,").
pub fn age_from_text(text: &str) -> Option<String> {
    let caps = AGE_PHRASE.captures(text)?;
    (1..=4)
        .find_map(|i| caps.get(i))
        .map(|m| m.as_str().to_string())
}

pub fn gender_from_text(text: &str) -> Option<String> {
    GENDER_WORD
        .captures(text)
        .map(|c| normalize_gender(&c[1]))
}

/// City and state from "last seen in C, ST" style phrases.
pub fn location_from_text(text: &str) -> Option<(String, String)> {
    let caps = SEEN_IN.captures(text)?;
    let state = caps[2].to_uppercase();
    if !is_state_code(&state) {
        return None;
    }
    Some((caps[1].trim().to_string(), state))
}
