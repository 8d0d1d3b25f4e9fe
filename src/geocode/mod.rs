//! Geocoding resolver.
//!
//! Turns a `(city, state, country)` triple into coordinates:
//!
//! ```text
//! resolve("Miami", "FL")
//!   ├─ cache hit "miami,fl,usa" ──────────────────────────▶ cached coordinates
//!   └─ miss ─▶ provider 1 ─✗─▶ provider 2 ─✓─▶ cache write ─▶ coordinates
//!                                   (all ✗) ─────────────────▶ None
//! ```
//!
//! Provider failures (network, no results, quota, rejected key) are
//! logged and fall through to the next provider. Exhausting the chain is
//! a normal outcome and returns `None`.
//!
//! The resolver is shared across workers behind an `Arc`; the cache sits
//! behind a `tokio::sync::Mutex` which is not held across provider calls.
//! Cache writes are ranked, so a concurrent resolution from a
//! lower-priority provider never replaces an entry written by a
//! higher-priority one.

pub mod cache;
pub mod providers;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::Mutex;

use casewatch_core::store::RecordStore;

use crate::config::{GeocodingConfig, HttpConfig};
use crate::rate_limit::RateLimiter;

pub use cache::{cache_key, GeocodeCache, GeocodeCacheEntry};
pub use providers::{build_providers, GeocodeError, GeocodeHit, GeocodeProvider};

/// Coordinates returned by [`GeocodeResolver::resolve`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeocodeResult {
    pub latitude: f64,
    pub longitude: f64,
    pub provider: String,
    pub confidence: f64,
    pub formatted_address: Option<String>,
    /// Whether the answer came from the cache.
    pub cached: bool,
}

impl GeocodeResult {
    fn from_entry(entry: &GeocodeCacheEntry, cached: bool) -> Self {
        Self {
            latitude: entry.lat,
            longitude: entry.lon,
            provider: entry.provider.clone(),
            confidence: entry.confidence,
            formatted_address: entry.formatted_address.clone(),
            cached,
        }
    }
}

/// Usage statistics for `cw geocode stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GeocodeStats {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_hit_rate: f64,
    pub failures: u64,
    pub provider_usage: BTreeMap<String, u64>,
    pub cache_entries: usize,
    /// Providers with the credentials they need.
    pub configured_providers: Vec<String>,
}

/// Summary of a `geocode_pending` batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GeocodeBatchSummary {
    pub considered: usize,
    pub resolved: usize,
    pub unresolved: usize,
    /// Cases without both a city and a state.
    pub skipped: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total_requests: u64,
    cache_hits: u64,
    failures: u64,
    provider_usage: BTreeMap<String, u64>,
}

/// Contiguous US plus Alaska and Hawaii.
const US_BOUNDS: [(f64, f64, f64, f64); 3] = [
    (24.0, 49.5, -125.0, -66.0),
    (51.0, 71.5, -180.0, -129.0),
    (18.5, 22.5, -161.0, -154.0),
];

pub fn within_us_bounds(lat: f64, lon: f64) -> bool {
    US_BOUNDS
        .iter()
        .any(|&(lat_min, lat_max, lon_min, lon_max)| {
            (lat_min..=lat_max).contains(&lat) && (lon_min..=lon_max).contains(&lon)
        })
}

pub struct GeocodeResolver {
    providers: Vec<Box<dyn GeocodeProvider>>,
    cache: Mutex<GeocodeCache>,
    counters: Mutex<Counters>,
    /// Save the cache after this many new entries. 0 saves only on flush.
    flush_every: usize,
}

impl GeocodeResolver {
    pub fn new(providers: Vec<Box<dyn GeocodeProvider>>, cache: GeocodeCache, flush_every: usize) -> Self {
        Self {
            providers,
            cache: Mutex::new(cache),
            counters: Mutex::new(Counters::default()),
            flush_every,
        }
    }

    /// Build the provider chain from config and load the cache file.
    pub fn from_config(
        config: &GeocodingConfig,
        http: &HttpConfig,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self> {
        let providers = build_providers(config, http, limiter)?;
        let cache = GeocodeCache::load(&config.cache_path)?;
        Ok(Self::new(providers, cache, config.flush_every))
    }

    fn rank(&self, provider: &str) -> usize {
        self.providers
            .iter()
            .position(|p| p.name() == provider)
            .unwrap_or(usize::MAX)
    }

    /// Resolve a place. `None` when the cache misses and every provider fails.
    pub async fn resolve(&self, city: &str, state: &str, country: &str) -> Option<GeocodeResult> {
        let key = cache_key(city, state, country);
        self.counters.lock().await.total_requests += 1;

        let cached = self.cache.lock().await.get(&key).cloned();
        if let Some(entry) = cached {
            tracing::debug!(key = %key, provider = %entry.provider, "geocode cache hit");
            self.counters.lock().await.cache_hits += 1;
            return Some(GeocodeResult::from_entry(&entry, true));
        }

        for provider in &self.providers {
            let name = provider.name();
            let hit = match provider.geocode(city, state, country).await {
                Ok(hit) => hit,
                Err(GeocodeError::NotConfigured) => {
                    tracing::debug!(provider = name, "geocoding provider has no API key, skipping");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(provider = name, key = %key, error = %e, "geocoding provider failed, trying next");
                    continue;
                }
            };

            if providers::is_usa(country) && !within_us_bounds(hit.latitude, hit.longitude) {
                tracing::warn!(
                    provider = name,
                    key = %key,
                    lat = hit.latitude,
                    lon = hit.longitude,
                    "geocoding result outside US bounds, trying next"
                );
                continue;
            }

            *self
                .counters
                .lock()
                .await
                .provider_usage
                .entry(name.to_string())
                .or_default() += 1;

            let entry = GeocodeCacheEntry {
                lat: hit.latitude,
                lon: hit.longitude,
                provider: name.to_string(),
                confidence: hit.confidence,
                formatted_address: hit.formatted_address,
            };
            return Some(self.store(key, entry).await);
        }

        tracing::debug!(key = %key, "no geocoding provider resolved the place");
        self.counters.lock().await.failures += 1;
        None
    }

    /// Write a fresh entry and return whatever the cache now holds for the key.
    async fn store(&self, key: String, entry: GeocodeCacheEntry) -> GeocodeResult {
        let mut cache = self.cache.lock().await;
        let fallback = GeocodeResult::from_entry(&entry, false);
        cache.insert_ranked(key.clone(), entry, |p| self.rank(p));

        if self.flush_every > 0 && cache.unsaved() >= self.flush_every {
            if let Err(e) = cache.save() {
                tracing::warn!(error = %e, "failed to save geocode cache");
            }
        }

        match cache.get(&key) {
            Some(current) if current.provider != fallback.provider => {
                GeocodeResult::from_entry(current, true)
            }
            _ => fallback,
        }
    }

    /// Save unsaved cache entries.
    pub async fn flush(&self) -> Result<()> {
        let mut cache = self.cache.lock().await;
        if cache.unsaved() > 0 {
            cache.save()?;
        }
        Ok(())
    }

    /// Drop every cache entry and remove the cache file.
    pub async fn clear(&self) -> Result<usize> {
        self.cache.lock().await.clear()
    }

    pub async fn stats(&self) -> GeocodeStats {
        let cache_entries = self.cache.lock().await.len();
        let counters = self.counters.lock().await;
        let cache_hit_rate = if counters.total_requests == 0 {
            0.0
        } else {
            counters.cache_hits as f64 / counters.total_requests as f64
        };
        GeocodeStats {
            total_requests: counters.total_requests,
            cache_hits: counters.cache_hits,
            cache_hit_rate,
            failures: counters.failures,
            provider_usage: counters.provider_usage.clone(),
            cache_entries,
            configured_providers: self
                .providers
                .iter()
                .filter(|p| p.is_configured())
                .map(|p| p.name().to_string())
                .collect(),
        }
    }

    /// Geocode stored cases that have a city and state but no coordinates.
    ///
    /// The cache is saved every `flush_every` new entries and once more at
    /// the end of the batch.
    pub async fn geocode_pending(
        &self,
        store: &dyn RecordStore,
        limit: Option<usize>,
    ) -> Result<GeocodeBatchSummary> {
        let cases = store.list_cases().await?;
        let mut summary = GeocodeBatchSummary::default();

        let pending = cases
            .iter()
            .filter(|c| c.coordinates().is_none())
            .take(limit.unwrap_or(usize::MAX));
        for case in pending {
            summary.considered += 1;
            let (Some(city), Some(state)) = (&case.payload.city, &case.payload.state) else {
                summary.skipped += 1;
                continue;
            };
            match self.resolve(city, state, "USA").await {
                Some(found) => {
                    store
                        .set_case_coordinates(&case.id, found.latitude, found.longitude)
                        .await?;
                    summary.resolved += 1;
                }
                None => summary.unresolved += 1,
            }
        }

        self.flush().await?;
        tracing::info!(
            considered = summary.considered,
            resolved = summary.resolved,
            unresolved = summary.unresolved,
            skipped = summary.skipped,
            "geocoding batch complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use casewatch_core::models::{CasePayload, CaseRecord, RateLimit, RecordType};
    use casewatch_core::store::memory::InMemoryStore;

    use crate::fetch::SourceClient;
    use providers::GoogleProvider;

    struct FakeProvider {
        name: &'static str,
        answer: Option<(f64, f64)>,
        calls: Arc<AtomicUsize>,
    }

    impl FakeProvider {
        fn boxed(name: &'static str, answer: Option<(f64, f64)>) -> (Box<dyn GeocodeProvider>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let provider = Self {
                name,
                answer,
                calls: calls.clone(),
            };
            (Box::new(provider), calls)
        }
    }

    #[async_trait]
    impl GeocodeProvider for FakeProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn is_configured(&self) -> bool {
            true
        }

        async fn geocode(&self, _: &str, _: &str, _: &str) -> Result<GeocodeHit, GeocodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.answer {
                Some((latitude, longitude)) => Ok(GeocodeHit {
                    latitude,
                    longitude,
                    confidence: 0.7,
                    formatted_address: None,
                }),
                None => Err(GeocodeError::NoResults),
            }
        }
    }

    #[test]
    fn test_us_bounds() {
        assert!(within_us_bounds(25.7617, -80.1918));
        assert!(within_us_bounds(61.2181, -149.9003));
        assert!(within_us_bounds(21.3069, -157.8583));
        assert!(!within_us_bounds(51.5074, -0.1278));
        assert!(!within_us_bounds(19.4326, -99.1332));
    }

    #[tokio::test]
    async fn test_cached_resolution_skips_providers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/maps/api/geocode/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "OK",
                "results": [{
                    "geometry": {"location": {"lat": 25.7617, "lng": -80.1918}},
                    "formatted_address": "Miami, FL, USA",
                    "types": ["locality", "political"]
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let limit = RateLimit {
            requests_per_minute: 600,
            burst: 50,
        };
        let client = SourceClient::new(
            "geocode:google",
            limit,
            Arc::new(RateLimiter::new()),
            &HttpConfig::default(),
        )
        .unwrap();
        let google = GoogleProvider::new(client, server.uri(), Some("key".into()));
        let resolver = GeocodeResolver::new(
            vec![Box::new(google)],
            GeocodeCache::empty(tmp.path().join("geocache.json")),
            10,
        );

        let first = resolver.resolve("Miami", "FL", "USA").await.unwrap();
        assert_eq!((first.latitude, first.longitude), (25.7617, -80.1918));
        assert_eq!(first.confidence, 0.95);
        assert_eq!(first.provider, "google");
        assert!(!first.cached);

        let second = resolver.resolve("Miami", "FL", "USA").await.unwrap();
        assert!(second.cached);
        assert_eq!((second.latitude, second.longitude), (25.7617, -80.1918));

        let stats = resolver.stats().await;
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_hit_rate, 0.5);
        assert_eq!(stats.provider_usage.get("google"), Some(&1));
        assert_eq!(stats.configured_providers, vec!["google".to_string()]);

        resolver.flush().await.unwrap();
        let saved = GeocodeCache::load(&tmp.path().join("geocache.json")).unwrap();
        assert!(saved.get("miami,fl,usa").is_some());
    }

    #[tokio::test]
    async fn test_chain_falls_through_in_order() {
        let (failing, failing_calls) = FakeProvider::boxed("primary", None);
        let (working, working_calls) = FakeProvider::boxed("secondary", Some((30.2672, -97.7431)));
        let (unused, unused_calls) = FakeProvider::boxed("tertiary", Some((0.0, 0.0)));
        let resolver = GeocodeResolver::new(
            vec![failing, working, unused],
            GeocodeCache::empty("unused.json"),
            0,
        );

        let result = resolver.resolve("Austin", "TX", "USA").await.unwrap();
        assert_eq!(result.provider, "secondary");
        assert_eq!(failing_calls.load(Ordering::SeqCst), 1);
        assert_eq!(working_calls.load(Ordering::SeqCst), 1);
        assert_eq!(unused_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_providers_failing_is_none() {
        let (a, _) = FakeProvider::boxed("a", None);
        let (b, _) = FakeProvider::boxed("b", None);
        let resolver = GeocodeResolver::new(vec![a, b], GeocodeCache::empty("unused.json"), 0);
        assert!(resolver.resolve("Nowhere", "ZZ", "USA").await.is_none());
        assert_eq!(resolver.stats().await.failures, 1);
    }

    #[tokio::test]
    async fn test_out_of_bounds_result_is_ignored() {
        let (london, _) = FakeProvider::boxed("a", Some((51.5074, -0.1278)));
        let (miami, _) = FakeProvider::boxed("b", Some((25.7617, -80.1918)));
        let resolver = GeocodeResolver::new(vec![london, miami], GeocodeCache::empty("unused.json"), 0);
        let result = resolver.resolve("Miami", "FL", "USA").await.unwrap();
        assert_eq!(result.provider, "b");
    }

    #[tokio::test]
    async fn test_geocode_pending_sets_coordinates_and_flushes() {
        let tmp = TempDir::new().unwrap();
        let cache_path = tmp.path().join("geocache.json");
        let (provider, calls) = FakeProvider::boxed("fake", Some((25.7617, -80.1918)));
        let resolver = GeocodeResolver::new(vec![provider], GeocodeCache::empty(&cache_path), 100);

        let store = InMemoryStore::new();
        let now = Utc::now();
        let case = |id: &str, city: Option<&str>| CaseRecord {
            id: id.into(),
            source_id: "src".into(),
            source_record_id: id.into(),
            record_type: RecordType::MissingPerson,
            payload: CasePayload {
                name: Some(format!("Person {}", id)),
                city: city.map(str::to_string),
                state: Some("FL".into()),
                ..Default::default()
            },
            latitude: None,
            longitude: None,
            created_at: now,
            updated_at: now,
        };
        store.upsert_case(&case("1", Some("Miami"))).await.unwrap();
        store.upsert_case(&case("2", Some("Miami"))).await.unwrap();
        store.upsert_case(&case("3", None)).await.unwrap();

        let summary = resolver.geocode_pending(&store, None).await.unwrap();
        assert_eq!(summary.considered, 3);
        assert_eq!(summary.resolved, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache_path.exists());

        let cases = store.list_cases().await.unwrap();
        assert_eq!(cases.iter().filter(|c| c.coordinates().is_some()).count(), 2);
    }
}
