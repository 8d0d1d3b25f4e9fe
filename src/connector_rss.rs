//! RSS 2.0 / Atom feed connector (`adapter = "rss"`).
//!
//! Each `<item>` (RSS) or `<entry>` (Atom) becomes one record. Feeds
//! rarely carry structured person fields, so most of the payload is
//! recovered from the title and description text:
//!
//! | Field | Source |
//! |-------|--------|
//! | name | title (`AMBER Alert: X`, `Missing: X`, `X (age)`), else "alert for X" in the body |
//! | age | `N-year-old`, `age N`, `(N)` |
//! | gender | male/female/boy/girl |
//! | city, state | `last seen in C, ST`, `missing from C, ST`, `abducted from C, ST` |
//! | date reported | `pubDate` / `published` / `updated` |
//! | record id | `guid` / `id`, else the link, else a digest of the title |
//!
//! Items whose title mentions AMBER are collected as `amber_alert`
//! records. A feed that is not well-formed XML yields zero records and a
//! warning.

use anyhow::Result;
use async_trait::async_trait;

use casewatch_core::models::{AdapterKind, CollectedRecord, RecordType, SourceMeta};

use crate::config::SourceConfig;
use crate::fetch::{join_url, SourceClient};
use crate::normalize::{
    age_from_text, clean_text, fallback_record_id, gender_from_text, into_record,
    location_from_text, name_from_prose, name_from_title, strip_html, RawCase,
};
use crate::traits::Connector;

/// One feed entry, with text fields as they appear in the feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedItem {
    pub title: Option<String>,
    pub description: Option<String>,
    pub link: Option<String>,
    pub guid: Option<String>,
    pub published: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Tag {
    Title,
    Description,
    Link,
    Guid,
    Published,
}

fn tag_for(local_name: &[u8]) -> Option<Tag> {
    match local_name {
        b"title" => Some(Tag::Title),
        b"description" | b"summary" | b"content" | b"encoded" => Some(Tag::Description),
        b"link" => Some(Tag::Link),
        b"guid" | b"id" => Some(Tag::Guid),
        b"pubDate" | b"published" | b"updated" | b"date" => Some(Tag::Published),
        _ => None,
    }
}

fn append(item: &mut FeedItem, tag: Tag, text: &str) {
    let slot = match tag {
        Tag::Title => &mut item.title,
        Tag::Description => &mut item.description,
        Tag::Link => &mut item.link,
        Tag::Guid => &mut item.guid,
        Tag::Published => &mut item.published,
    };
    match slot {
        Some(existing) => existing.push_str(text),
        None => *slot = Some(text.to_string()),
    }
}

fn href(e: &quick_xml::events::BytesStart<'_>) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.local_name().as_ref() == b"href" {
            a.unescape_value().ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

/// Parse RSS `<item>`s and Atom `<entry>`s.
pub fn parse_feed(xml: &[u8]) -> Result<Vec<FeedItem>, quick_xml::Error> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut items = Vec::new();
    let mut current: Option<FeedItem> = None;
    let mut field: Option<Tag> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            quick_xml::events::Event::Start(e) => {
                let name = e.local_name();
                if name.as_ref() == b"item" || name.as_ref() == b"entry" {
                    current = Some(FeedItem::default());
                    field = None;
                } else if let Some(item) = current.as_mut() {
                    field = tag_for(name.as_ref());
                    if field == Some(Tag::Link) && item.link.is_none() {
                        item.link = href(&e);
                    }
                }
            }
            quick_xml::events::Event::Empty(e) => {
                // Atom: <link href="..."/>
                if let Some(item) = current.as_mut() {
                    if e.local_name().as_ref() == b"link" && item.link.is_none() {
                        item.link = href(&e);
                    }
                }
            }
            quick_xml::events::Event::Text(te) => {
                if let (Some(item), Some(tag)) = (current.as_mut(), field) {
                    let text = te
                        .unescape()
                        .map(|t| t.into_owned())
                        .unwrap_or_else(|_| String::from_utf8_lossy(&te).into_owned());
                    append(item, tag, &text);
                }
            }
            quick_xml::events::Event::CData(cd) => {
                if let (Some(item), Some(tag)) = (current.as_mut(), field) {
                    let bytes = cd.into_inner();
                    append(item, tag, &String::from_utf8_lossy(&bytes));
                }
            }
            quick_xml::events::Event::End(e) => {
                let name = e.local_name();
                if name.as_ref() == b"item" || name.as_ref() == b"entry" {
                    if let Some(item) = current.take() {
                        items.push(item);
                    }
                }
                field = None;
            }
            quick_xml::events::Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(items)
}

const CASE_WORDS: &[&str] = &["amber", "missing", "abduct", "endangered", "last seen", "runaway"];

/// Recover person fields from a feed entry.
///
/// Entries that mention none of the case keywords (newsletters, notices)
/// come back empty.
pub fn item_to_raw(item: &FeedItem) -> RawCase {
    let title = item.title.as_deref().map(str::trim).unwrap_or("");
    let body = item
        .description
        .as_deref()
        .map(strip_html)
        .unwrap_or_default();
    let all = format!("{}\n{}", title, body);
    let lower = all.to_lowercase();
    if !CASE_WORDS.iter().any(|w| lower.contains(w)) {
        return RawCase::default();
    }

    let mut raw = RawCase {
        name: name_from_title(title).or_else(|| name_from_prose(&body)),
        age: age_from_text(title).or_else(|| age_from_text(&body)),
        gender: gender_from_text(&all),
        date_reported: item.published.clone(),
        status: clean_text(Some(title)),
        description: clean_text(Some(&body)),
        source_url: item.link.clone(),
        ..Default::default()
    };
    if let Some((city, state)) = location_from_text(&all) {
        raw.city = Some(city);
        raw.state = Some(state);
    }
    raw
}

pub struct RssConnector {
    id: String,
    config: SourceConfig,
    client: SourceClient,
    description: String,
}

impl RssConnector {
    pub fn new(id: &str, config: SourceConfig, client: SourceClient) -> Self {
        let description = format!("{} (feeds: {})", config.name, config.feeds.len());
        Self {
            id: id.to_string(),
            config,
            client,
            description,
        }
    }

    fn record_type(&self, item: &FeedItem) -> RecordType {
        let is_amber = item
            .title
            .as_deref()
            .is_some_and(|t| t.to_lowercase().contains("amber"));
        if is_amber {
            RecordType::AmberAlert
        } else {
            self.config.record_type
        }
    }
}

#[async_trait]
impl Connector for RssConnector {
    fn source_id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Rss
    }

    async fn collect(&self) -> Result<Vec<CollectedRecord>> {
        let mut records = Vec::new();

        for feed in &self.config.feeds {
            let url = join_url(&self.config.base_url, feed);
            let body = self.client.get_text(&url, &[]).await?;

            let items = match parse_feed(body.as_bytes()) {
                Ok(items) => items,
                Err(e) => {
                    tracing::warn!(source_id = %self.id, feed = %feed, error = %e, "unparsable feed");
                    continue;
                }
            };
            if items.is_empty() {
                tracing::warn!(source_id = %self.id, feed = %feed, "feed has no items");
                continue;
            }

            let meta = SourceMeta {
                source_id: self.id.clone(),
                source_name: self.config.name.clone(),
                source_url: Some(url.clone()),
            };
            for item in &items {
                let raw = item_to_raw(item);
                if raw.is_empty() {
                    tracing::trace!(source_id = %self.id, title = ?item.title, "no person in item");
                    continue;
                }
                let record_id = item
                    .guid
                    .as_deref()
                    .or(item.link.as_deref())
                    .and_then(|id| clean_text(Some(id)))
                    .unwrap_or_else(|| {
                        fallback_record_id(&[item.title.as_deref().unwrap_or(""), feed.as_str()])
                    });
                records.push(into_record(
                    &raw,
                    &meta,
                    self.record_type(item),
                    self.config.default_state.as_deref(),
                    &record_id,
                ));
            }
        }

        Ok(records)
    }
}
