//! Geocoding providers.
//!
//! | Kind | Auth | Confidence |
//! |------|------|------------|
//! | `google` | API key | 0.95 locality, 0.6 state-level, 0.8 otherwise |
//! | `nominatim` | none | 0.8 city/town/village, 0.5 state, 0.7 otherwise |
//! | `opencage` | API key | upstream confidence / 10, at most 0.5 for a state |
//!
//! Every provider sends its requests through a [`SourceClient`] keyed
//! `geocode:<kind>`, so provider rate limits share the same limiter as
//! the source connectors.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use casewatch_core::models::RateLimit;

use crate::config::{GeocodeProviderConfig, GeocodingConfig, HttpConfig};
use crate::fetch::{join_url, FetchError, SourceClient};
use crate::rate_limit::RateLimiter;

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("request failed: {0}")]
    Network(#[source] FetchError),
    #[error("no results")]
    NoResults,
    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("provider not configured")]
    NotConfigured,
}

impl From<FetchError> for GeocodeError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::RateLimited => GeocodeError::QuotaExceeded,
            FetchError::Status { status: 402, .. } => GeocodeError::QuotaExceeded,
            FetchError::Status {
                status: 400 | 401 | 403,
                body,
            } => GeocodeError::Rejected(body),
            FetchError::Decode(msg) => GeocodeError::InvalidResponse(msg),
            other => GeocodeError::Network(other),
        }
    }
}

/// One successful provider answer.
#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeHit {
    pub latitude: f64,
    pub longitude: f64,
    pub confidence: f64,
    pub formatted_address: Option<String>,
}

#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    /// Name stored with cache entries and used in usage statistics.
    fn name(&self) -> &str;

    /// Whether the provider has the credentials it needs.
    fn is_configured(&self) -> bool;

    async fn geocode(&self, city: &str, state: &str, country: &str)
        -> Result<GeocodeHit, GeocodeError>;
}

fn query_text(city: &str, state: &str, country: &str) -> String {
    [city, state, country]
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn is_usa(country: &str) -> bool {
    matches!(
        country.trim().to_ascii_lowercase().as_str(),
        "usa" | "us" | "united states" | "united states of america"
    )
}

/// Accepts numbers and numeric strings (Nominatim returns the latter).
fn number(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn coordinates(lat: &Value, lon: &Value) -> Result<(f64, f64), GeocodeError> {
    match (number(lat), number(lon)) {
        (Some(lat), Some(lon)) => Ok((lat, lon)),
        _ => Err(GeocodeError::InvalidResponse(
            "result without numeric coordinates".into(),
        )),
    }
}

fn api_key(provider: &GeocodeProviderConfig, default_env: &str) -> Option<String> {
    let var = provider.api_key_env.as_deref().unwrap_or(default_env);
    std::env::var(var).ok().filter(|k| !k.trim().is_empty())
}

// ═══════════════════════════════════════════════════════════════════════
// Google
// ═══════════════════════════════════════════════════════════════════════

pub struct GoogleProvider {
    client: SourceClient,
    base_url: String,
    api_key: Option<String>,
}

impl GoogleProvider {
    pub const DEFAULT_BASE_URL: &'static str = "https://maps.googleapis.com";

    pub fn new(client: SourceClient, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key,
        }
    }
}

fn parse_google(body: &Value) -> Result<GeocodeHit, GeocodeError> {
    let status = body.get("status").and_then(Value::as_str).unwrap_or("");
    match status {
        "OK" => {}
        "ZERO_RESULTS" => return Err(GeocodeError::NoResults),
        "OVER_QUERY_LIMIT" | "OVER_DAILY_LIMIT" => return Err(GeocodeError::QuotaExceeded),
        "REQUEST_DENIED" | "INVALID_REQUEST" => {
            let message = body
                .get("error_message")
                .and_then(Value::as_str)
                .unwrap_or(status);
            return Err(GeocodeError::Rejected(message.to_string()));
        }
        other => {
            return Err(GeocodeError::InvalidResponse(format!(
                "unexpected status '{}'",
                other
            )))
        }
    }

    let first = body
        .get("results")
        .and_then(Value::as_array)
        .and_then(|r| r.first())
        .ok_or(GeocodeError::NoResults)?;
    let location = &first["geometry"]["location"];
    let (latitude, longitude) = coordinates(&location["lat"], &location["lng"])?;

    let types: Vec<&str> = first
        .get("types")
        .and_then(Value::as_array)
        .map(|t| t.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let confidence = if types.contains(&"locality") {
        0.95
    } else if types.contains(&"administrative_area_level_1") {
        0.6
    } else {
        0.8
    };

    Ok(GeocodeHit {
        latitude,
        longitude,
        confidence,
        formatted_address: first
            .get("formatted_address")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

#[async_trait]
impl GeocodeProvider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn geocode(
        &self,
        city: &str,
        state: &str,
        country: &str,
    ) -> Result<GeocodeHit, GeocodeError> {
        let key = self.api_key.as_deref().ok_or(GeocodeError::NotConfigured)?;
        let address = query_text(city, state, country);
        let url = join_url(&self.base_url, "/maps/api/geocode/json");
        let body = self
            .client
            .get_json(&url, &[("address", address.as_str()), ("key", key)])
            .await?;
        parse_google(&body)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Nominatim
// ═══════════════════════════════════════════════════════════════════════

pub struct NominatimProvider {
    client: SourceClient,
    base_url: String,
}

impl NominatimProvider {
    pub const DEFAULT_BASE_URL: &'static str = "https://nominatim.openstreetmap.org";

    pub fn new(client: SourceClient, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

fn parse_nominatim(body: &Value) -> Result<GeocodeHit, GeocodeError> {
    let results = body
        .as_array()
        .ok_or_else(|| GeocodeError::InvalidResponse("expected a JSON array".into()))?;
    let first = results.first().ok_or(GeocodeError::NoResults)?;
    let (latitude, longitude) = coordinates(&first["lat"], &first["lon"])?;

    let place_type = first
        .get("addresstype")
        .or_else(|| first.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let confidence = match place_type {
        "city" | "town" | "village" => 0.8,
        "state" => 0.5,
        _ => 0.7,
    };

    Ok(GeocodeHit {
        latitude,
        longitude,
        confidence,
        formatted_address: first
            .get("display_name")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

#[async_trait]
impl GeocodeProvider for NominatimProvider {
    fn name(&self) -> &str {
        "nominatim"
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn geocode(
        &self,
        city: &str,
        state: &str,
        country: &str,
    ) -> Result<GeocodeHit, GeocodeError> {
        let q = query_text(city, state, country);
        let url = join_url(&self.base_url, "/search");
        let mut query = vec![
            ("q", q.as_str()),
            ("format", "json"),
            ("limit", "1"),
            ("addressdetails", "1"),
        ];
        if is_usa(country) {
            query.push(("countrycodes", "us"));
        }
        let body = self.client.get_json(&url, &query).await?;
        parse_nominatim(&body)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// OpenCage
// ═══════════════════════════════════════════════════════════════════════

pub struct OpenCageProvider {
    client: SourceClient,
    base_url: String,
    api_key: Option<String>,
}

impl OpenCageProvider {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.opencagedata.com";

    pub fn new(client: SourceClient, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key,
        }
    }
}

fn parse_opencage(body: &Value) -> Result<GeocodeHit, GeocodeError> {
    match body["status"]["code"].as_u64() {
        Some(200) | None => {}
        Some(402) | Some(429) => return Err(GeocodeError::QuotaExceeded),
        Some(code) => {
            let message = body["status"]["message"].as_str().unwrap_or("");
            return Err(GeocodeError::Rejected(format!("{} {}", code, message)));
        }
    }

    let first = body
        .get("results")
        .and_then(Value::as_array)
        .and_then(|r| r.first())
        .ok_or(GeocodeError::NoResults)?;
    let (latitude, longitude) = coordinates(&first["geometry"]["lat"], &first["geometry"]["lng"])?;

    let mut confidence = number(&first["confidence"]).unwrap_or(5.0) / 10.0;
    if first["components"]["_type"].as_str() == Some("state") {
        confidence = confidence.min(0.5);
    }

    Ok(GeocodeHit {
        latitude,
        longitude,
        confidence: confidence.clamp(0.0, 1.0),
        formatted_address: first
            .get("formatted")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

#[async_trait]
impl GeocodeProvider for OpenCageProvider {
    fn name(&self) -> &str {
        "opencage"
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn geocode(
        &self,
        city: &str,
        state: &str,
        country: &str,
    ) -> Result<GeocodeHit, GeocodeError> {
        let key = self.api_key.as_deref().ok_or(GeocodeError::NotConfigured)?;
        let q = query_text(city, state, country);
        let url = join_url(&self.base_url, "/geocode/v1/json");
        let mut query = vec![("q", q.as_str()), ("key", key), ("limit", "1")];
        if is_usa(country) {
            query.push(("countrycode", "us"));
        }
        let body = self.client.get_json(&url, &query).await?;
        parse_opencage(&body)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Construction
// ═══════════════════════════════════════════════════════════════════════

/// Build the provider chain in configured priority order.
///
/// Keys are read from the environment here; a keyed provider without a
/// key stays in the chain and reports [`GeocodeError::NotConfigured`].
pub fn build_providers(
    config: &GeocodingConfig,
    http: &HttpConfig,
    limiter: Arc<RateLimiter>,
) -> Result<Vec<Box<dyn GeocodeProvider>>> {
    let mut providers: Vec<Box<dyn GeocodeProvider>> = Vec::new();
    for provider in &config.providers {
        let limit = RateLimit {
            requests_per_minute: provider.requests_per_minute,
            // Nominatim's usage policy allows one request per second.
            burst: if provider.kind == "nominatim" { 1 } else { 5 },
        };
        let client = SourceClient::new(
            format!("geocode:{}", provider.kind),
            limit,
            limiter.clone(),
            http,
        )?;
        let base = |default: &str| provider.base_url.clone().unwrap_or_else(|| default.to_string());

        let built: Box<dyn GeocodeProvider> = match provider.kind.as_str() {
            "google" => Box::new(GoogleProvider::new(
                client,
                base(GoogleProvider::DEFAULT_BASE_URL),
                api_key(provider, "GOOGLE_MAPS_API_KEY"),
            )),
            "nominatim" => Box::new(NominatimProvider::new(
                client,
                base(NominatimProvider::DEFAULT_BASE_URL),
            )),
            "opencage" => Box::new(OpenCageProvider::new(
                client,
                base(OpenCageProvider::DEFAULT_BASE_URL),
                api_key(provider, "OPENCAGE_API_KEY"),
            )),
            other => anyhow::bail!("Unknown geocoding provider: '{}'", other),
        };
        providers.push(built);
    }
    Ok(providers)
}
