//! Scraped HTML connector (`adapter = "html_scraper"`).
//!
//! Fetches each configured page and tries three extraction strategies in
//! order; the first one that yields records wins for that page:
//!
//! 1. **Tables**: `<table>` whose header cells map to canonical fields
//!    ("Name", "Case #", "Age", "Date Missing", ...). One record per row.
//! 2. **Keyed blocks**: `<div>`/`<article>`/`<li>`/`<section>` elements
//!    whose class mentions `case`, `missing` or `person`, read as
//!    `Label: value` lines (including `<dt>/<dd>` pairs).
//! 3. **Regex fields**: inside those same blocks, free-text patterns
//!    fill what the labels did not: heading as name, "N years old",
//!    "last seen in City, ST", gender words.
//!
//! A page matching none of them yields zero records and a warning.
//! Markup drift is expected and never fails the cycle; transport errors
//! (after retries) do.
//!
//! # Configuration
//!
//! ```toml
//! [sources.florida_fdle]
//! name = "Florida FDLE"
//! adapter = "html_scraper"
//! base_url = "https://www.fdle.state.fl.us"
//! pages = ["/mcicsearch/search.asp"]
//! default_state = "FL"
//! ```

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use casewatch_core::models::{AdapterKind, CollectedRecord, SourceMeta};

use crate::config::SourceConfig;
use crate::fetch::{join_url, SourceClient};
use crate::normalize::{
    age_from_text, clean_text, fallback_record_id, gender_from_text, into_record,
    location_from_text, strip_html, RawCase,
};
use crate::traits::Connector;

static TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<table\b[^>]*>(.*?)</table>").expect("valid regex"));
static ROW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<tr\b[^>]*>(.*?)</tr>").expect("valid regex"));
static CELL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<t[hd]\b[^>]*>(.*?)</t[hd]>").expect("valid regex"));
static BLOCK_OPEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)<(?:div|article|li|section)\b[^>]*\bclass\s*=\s*["'][^"']*(?:case|missing|person)[^"']*["'][^>]*>"#,
    )
    .expect("valid regex")
});
static PAGE_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<footer\b|</main>|</body>").expect("valid regex"));
static HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<h[1-6]\b[^>]*>(.*?)</h[1-6]>").expect("valid regex"));
static LABEL_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z][A-Za-z #./()'\-]{0,40}?)\s*:\s*(.+)$").expect("valid regex")
});

/// Canonical field a page label maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    CaseNumber,
    Name,
    FirstName,
    LastName,
    Age,
    Gender,
    Ethnicity,
    City,
    County,
    State,
    Location,
    DateMissing,
    DateReported,
    Status,
    Description,
    Circumstances,
    Height,
    Weight,
}

fn label_field(label: &str) -> Option<Field> {
    let label = label
        .to_lowercase()
        .replace(['#', '.', ':', '(', ')'], " ");
    let label = label.split_whitespace().collect::<Vec<_>>().join(" ");
    let has = |word: &str| label.contains(word);

    let field = if (has("date") || has("since"))
        && (has("miss") || has("last seen") || has("disappear") || has("since"))
    {
        Field::DateMissing
    } else if has("reported") {
        Field::DateReported
    } else if has("case") || has("ncic") || label == "namus" || label == "id" {
        Field::CaseNumber
    } else if has("first name") {
        Field::FirstName
    } else if has("last name") || has("surname") {
        Field::LastName
    } else if has("name") || label == "missing person" || label == "subject" {
        Field::Name
    } else if label.split(' ').any(|w| w == "age") {
        Field::Age
    } else if has("sex") || has("gender") {
        Field::Gender
    } else if has("race") || has("ethnicity") {
        Field::Ethnicity
    } else if has("county") {
        Field::County
    } else if has("city") {
        Field::City
    } else if label == "state" || label == "st" {
        Field::State
    } else if has("location") || has("last seen") || has("missing from") {
        Field::Location
    } else if has("status") {
        Field::Status
    } else if has("circumstance") {
        Field::Circumstances
    } else if has("description") || has("details") {
        Field::Description
    } else if has("height") {
        Field::Height
    } else if has("weight") {
        Field::Weight
    } else {
        return None;
    };
    Some(field)
}

fn set_field(raw: &mut RawCase, field: Field, value: &str) {
    let Some(value) = clean_text(Some(value)) else {
        return;
    };
    let slot = match field {
        Field::CaseNumber => &mut raw.case_number,
        Field::Name => &mut raw.name,
        Field::FirstName => &mut raw.first_name,
        Field::LastName => &mut raw.last_name,
        Field::Age => &mut raw.age,
        Field::Gender => &mut raw.gender,
        Field::Ethnicity => &mut raw.ethnicity,
        Field::City => &mut raw.city,
        Field::County => &mut raw.county,
        Field::State => &mut raw.state,
        Field::Location => &mut raw.location,
        Field::DateMissing => &mut raw.date_missing,
        Field::DateReported => &mut raw.date_reported,
        Field::Status => &mut raw.status,
        Field::Description => &mut raw.description,
        Field::Circumstances => &mut raw.circumstances,
        Field::Height => &mut raw.height,
        Field::Weight => &mut raw.weight,
    };
    if slot.is_none() {
        *slot = Some(value);
    }
}

// ============ Strategy 1: tables ============

fn cells(row_html: &str) -> Vec<String> {
    CELL.captures_iter(row_html)
        .map(|c| strip_html(&c[1]).replace('\n', " "))
        .collect()
}

fn extract_tables(html: &str) -> Vec<RawCase> {
    let mut cases = Vec::new();
    for table in TABLE.captures_iter(html) {
        let mut rows = ROW.captures_iter(&table[1]).map(|r| cells(&r[1]));
        let Some(header) = rows.next() else {
            continue;
        };
        let columns: Vec<Option<Field>> = header.iter().map(|h| label_field(h)).collect();
        let identifies = columns.iter().flatten().any(|f| {
            matches!(
                f,
                Field::Name | Field::FirstName | Field::LastName | Field::CaseNumber
            )
        });
        if !identifies {
            continue;
        }

        for row in rows {
            let mut raw = RawCase::default();
            for (field, value) in columns.iter().zip(row.iter()) {
                if let Some(field) = field {
                    set_field(&mut raw, *field, value);
                }
            }
            if !raw.is_empty() {
                cases.push(raw);
            }
        }
    }
    cases
}

// ============ Strategies 2 + 3: keyed blocks, regex fields ============

fn block_spans(html: &str) -> Vec<&str> {
    let opens: Vec<(usize, usize)> = BLOCK_OPEN
        .find_iter(html)
        .map(|m| (m.start(), m.end()))
        .collect();
    opens
        .iter()
        .enumerate()
        .map(|(i, &(_, content_start))| {
            let end = match opens.get(i + 1) {
                Some(&(next_start, _)) => next_start,
                None => PAGE_END
                    .find_at(html, content_start)
                    .map(|m| m.start())
                    .unwrap_or(html.len()),
            };
            &html[content_start..end]
        })
        .collect()
}

fn extract_block(block_html: &str) -> RawCase {
    let text = strip_html(block_html);
    let mut raw = RawCase::default();

    for line in text.lines() {
        if let Some(caps) = LABEL_LINE.captures(line) {
            if let Some(field) = label_field(&caps[1]) {
                set_field(&mut raw, field, &caps[2]);
            }
        }
    }

    if raw.name.is_none() && raw.first_name.is_none() && raw.last_name.is_none() {
        if let Some(heading) = HEADING.captures(block_html) {
            let heading = strip_html(&heading[1]);
            if !heading.contains(':') {
                set_field(&mut raw, Field::Name, &heading);
            }
        }
    }
    if raw.age.is_none() {
        raw.age = age_from_text(&text);
    }
    if raw.gender.is_none() {
        raw.gender = gender_from_text(&text);
    }
    if raw.city.is_none() && raw.state.is_none() && raw.location.is_none() {
        if let Some((city, state)) = location_from_text(&text) {
            raw.city = Some(city);
            raw.state = Some(state);
        }
    }
    raw
}

fn extract_blocks(html: &str) -> Vec<RawCase> {
    block_spans(html)
        .into_iter()
        .map(extract_block)
        .filter(|raw| !raw.is_empty())
        .collect()
}

/// Run the strategies in order and return the first non-empty result.
pub fn extract_cases(html: &str) -> Vec<RawCase> {
    let tables = extract_tables(html);
    if !tables.is_empty() {
        return tables;
    }
    extract_blocks(html)
}

// ============ Connector ============

pub struct HtmlScraperConnector {
    id: String,
    config: SourceConfig,
    client: SourceClient,
    description: String,
}

impl HtmlScraperConnector {
    pub fn new(id: &str, config: SourceConfig, client: SourceClient) -> Self {
        let description = format!("{} (scraped pages: {})", config.name, config.pages.len());
        Self {
            id: id.to_string(),
            config,
            client,
            description,
        }
    }
}

#[async_trait]
impl Connector for HtmlScraperConnector {
    fn source_id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Scraper
    }

    async fn collect(&self) -> Result<Vec<CollectedRecord>> {
        let mut records = Vec::new();

        for page in &self.config.pages {
            let url = join_url(&self.config.base_url, page);
            let html = self.client.get_text(&url, &[]).await?;
            let cases = extract_cases(&html);

            if cases.is_empty() {
                tracing::warn!(
                    source_id = %self.id,
                    page = %page,
                    "no recognizable case markup on page"
                );
                continue;
            }
            tracing::debug!(source_id = %self.id, page = %page, records = cases.len(), "page scraped");

            let meta = SourceMeta {
                source_id: self.id.clone(),
                source_name: self.config.name.clone(),
                source_url: Some(url.clone()),
            };
            for raw in cases {
                let record_id = raw
                    .case_number
                    .clone()
                    .unwrap_or_else(|| {
                        let name = raw
                            .name
                            .clone()
                            .or_else(|| raw.last_name.clone())
                            .unwrap_or_default();
                        fallback_record_id(&[name.as_str(), page.as_str()])
                    });
                records.push(into_record(
                    &raw,
                    &meta,
                    self.config.record_type,
                    self.config.default_state.as_deref(),
                    &record_id,
                ));
            }
        }

        Ok(records)
    }
}
