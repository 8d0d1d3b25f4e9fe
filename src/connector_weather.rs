//! Weather-alert API connector (`adapter = "weather_alerts"`).
//!
//! The National Weather Service alert feed also carries Child Abduction
//! Emergency messages. This connector asks for active alerts of that
//! event type and collects every matching GeoJSON feature as an
//! `amber_alert` record.
//!
//! ```toml
//! [sources.nws_amber]
//! name = "NWS Child Abduction Emergencies"
//! adapter = "weather_alerts"
//! base_url = "https://api.weather.gov"
//! interval_minutes = 5
//! priority = "critical"
//! ```
//!
//! | Field | Source |
//! |-------|--------|
//! | record id | feature `id` (else `properties.id`) |
//! | county, state | first `areaDesc` segment, `"County, ST"` |
//! | name, age, gender | headline and description prose |
//! | date reported | `sent`, else `effective` |
//! | status | `Closed` when `messageType` is `Cancel` |

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use casewatch_core::models::{AdapterKind, CollectedRecord, RecordType, SourceMeta};

use crate::config::SourceConfig;
use crate::fetch::{join_url, SourceClient};
use crate::normalize::{
    age_from_text, clean_text, gender_from_text, into_record, location_from_text,
    name_from_prose, name_from_title, split_city_state, RawCase,
};
use crate::traits::Connector;

pub struct WeatherAlertConnector {
    id: String,
    config: SourceConfig,
    client: SourceClient,
    description: String,
}

impl WeatherAlertConnector {
    pub fn new(id: &str, config: SourceConfig, client: SourceClient) -> Self {
        let description = format!("{} (weather alerts: {})", config.name, config.event);
        Self {
            id: id.to_string(),
            config,
            client,
            description,
        }
    }
}

fn prop<'a>(properties: &'a Value, key: &str) -> Option<&'a str> {
    properties
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Build the raw case for one alert feature. Returns the upstream id too.
pub fn feature_to_raw(feature: &Value) -> Option<(String, RawCase)> {
    let properties = feature.get("properties")?;
    let id = feature
        .get("id")
        .and_then(Value::as_str)
        .or_else(|| prop(properties, "id"))?
        .to_string();

    let headline = prop(properties, "headline").unwrap_or("");
    let description = prop(properties, "description").unwrap_or("");
    let prose = format!("{}\n{}", headline, description);

    let mut raw = RawCase {
        name: name_from_prose(&prose).or_else(|| name_from_title(headline)),
        age: age_from_text(&prose),
        gender: gender_from_text(&prose),
        date_reported: prop(properties, "sent")
            .or_else(|| prop(properties, "effective"))
            .map(str::to_string),
        description: clean_text(Some(headline)),
        circumstances: clean_text(Some(description)),
        source_url: prop(properties, "@id")
            .or_else(|| feature.get("id").and_then(Value::as_str))
            .map(str::to_string),
        ..Default::default()
    };

    if prop(properties, "messageType").is_some_and(|t| t.eq_ignore_ascii_case("cancel")) {
        raw.status = Some("Closed".to_string());
    }

    // "Travis, TX; Williamson, TX" → first area is the county
    if let Some((county, state)) = prop(properties, "areaDesc")
        .and_then(|area| area.split(';').next())
        .and_then(split_city_state)
    {
        raw.county = Some(format!("{} County", county.trim_end_matches(" County")));
        raw.state = Some(state);
    }
    if let Some((city, state)) = location_from_text(&prose) {
        raw.city = Some(city);
        raw.state.get_or_insert(state);
    }

    Some((id, raw))
}

#[async_trait]
impl Connector for WeatherAlertConnector {
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
        let url = join_url(&self.config.base_url, "/alerts/active");
        let response = self
            .client
            .get_json(&url, &[("event", self.config.event.as_str())])
            .await?;

        let Some(features) = response.get("features").and_then(Value::as_array) else {
            tracing::warn!(source_id = %self.id, "alert response has no features array");
            return Ok(Vec::new());
        };

        let meta = SourceMeta {
            source_id: self.id.clone(),
            source_name: self.config.name.clone(),
            source_url: Some(self.config.base_url.clone()),
        };
        let mut records = Vec::new();
        for feature in features {
            let event = feature
                .get("properties")
                .and_then(|p| prop(p, "event"))
                .unwrap_or("");
            if !event.eq_ignore_ascii_case(&self.config.event) {
                continue;
            }
            let Some((id, raw)) = feature_to_raw(feature) else {
                tracing::warn!(source_id = %self.id, "alert feature without id or properties");
                continue;
            };
            records.push(into_record(
                &raw,
                &meta,
                RecordType::AmberAlert,
                self.config.default_state.as_deref(),
                &id,
            ));
        }

        tracing::debug!(
            source_id = %self.id,
            features = features.len(),
            records = records.len(),
            "alerts filtered"
        );
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use casewatch_core::models::{CaseStatus, Category, Priority, RateLimit, RiskLevel};
    use chrono::NaiveDate;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::config::HttpConfig;
    use crate::rate_limit::RateLimiter;

    fn alerts() -> Value {
        json!({
            "type": "FeatureCollection",
            "features": [
                {
                    "id": "https://api.weather.gov/alerts/urn:oid:1",
                    "properties": {
                        "@id": "https://api.weather.gov/alerts/urn:oid:1",
                        "event": "Child Abduction Emergency",
                        "messageType": "Alert",
                        "areaDesc": "Travis, TX; Williamson, TX",
                        "sent": "2024-05-01T09:15:00-05:00",
                        "headline": "Child Abduction Emergency issued May 1 by Texas DPS",
                        "description": "The Texas Department of Public Safety has issued an AMBER Alert for Maria Lopez, a 7 year old girl last seen in Austin, TX."
                    }
                },
                {
                    "id": "https://api.weather.gov/alerts/urn:oid:2",
                    "properties": {
                        "event": "Flood Warning",
                        "areaDesc": "Harris, TX",
                        "headline": "Flood Warning"
                    }
                }
            ]
        })
    }

    #[test]
    fn test_feature_fields() {
        let value = alerts();
        let (id, raw) = feature_to_raw(&value["features"][0]).unwrap();
        assert_eq!(id, "https://api.weather.gov/alerts/urn:oid:1");
        assert_eq!(raw.name.as_deref(), Some("Maria Lopez"));
        assert_eq!(raw.age.as_deref(), Some("7"));
        assert_eq!(raw.gender.as_deref(), Some("Female"));
        assert_eq!(raw.county.as_deref(), Some("Travis County"));
        assert_eq!(raw.state.as_deref(), Some("TX"));
        assert_eq!(raw.city.as_deref(), Some("Austin"));
        assert_eq!(raw.status, None);
    }

    #[test]
    fn test_cancel_closes_case() {
        let feature = json!({
            "id": "x",
            "properties": {"messageType": "Cancel", "headline": "AMBER Alert cancelled"}
        });
        let (_, raw) = feature_to_raw(&feature).unwrap();
        assert_eq!(raw.status.as_deref(), Some("Closed"));
        assert!(feature_to_raw(&json!({"id": "y"})).is_none());
    }

    #[tokio::test]
    async fn test_collect_keeps_only_child_abduction_events() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/alerts/active"))
            .and(query_param("event", "Child Abduction Emergency"))
            .respond_with(ResponseTemplate::new(200).set_body_json(alerts()))
            .expect(1)
            .mount(&server)
            .await;

        let source: SourceConfig = toml::from_str(&format!(
            r#"
            name = "NWS"
            adapter = "weather_alerts"
            base_url = "{}"
            "#,
            server.uri()
        ))
        .unwrap();
        let limit = RateLimit {
            requests_per_minute: 60,
            burst: 5,
        };
        let client =
            SourceClient::new("nws", limit, Arc::new(RateLimiter::new()), &HttpConfig::default())
                .unwrap();

        let records = WeatherAlertConnector::new("nws", source, client)
            .collect()
            .await
            .unwrap();
        assert_eq!(records.len(), 1);

        let alert = &records[0];
        assert_eq!(alert.record_type, RecordType::AmberAlert);
        assert_eq!(alert.payload.category, Category::AmberAlert);
        assert_eq!(alert.payload.priority, Some(Priority::Critical));
        assert_eq!(alert.payload.risk_level, Some(RiskLevel::Critical));
        assert_eq!(alert.payload.status, CaseStatus::Active);
        assert_eq!(alert.payload.date_reported, NaiveDate::from_ymd_opt(2024, 5, 1));
        assert_eq!(
            alert.payload.location.as_deref(),
            Some("Austin, Travis County, TX, USA")
        );
    }
}
