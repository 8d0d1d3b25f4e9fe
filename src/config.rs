//! TOML configuration.
//!
//! Only `[db]` is required; every other section falls back to defaults.
//! See `config/casewatch.example.toml` for a complete file.
//!
//! Sources are declared as `[sources.<id>]` tables. The table key is the
//! source id used in records, sync history, and `cw sync <id>`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use casewatch_core::cluster::{ClusterAlgorithm, ClusterParams};
use casewatch_core::models::{
    AdapterKind, DataSourceDescriptor, Priority, RateLimit, RecordType, Schedule, SourceStatus,
};

use crate::traits::known_adapters;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub geocoding: GeocodingConfig,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            filter: default_log_filter(),
        }
    }
}

fn default_log_format() -> String {
    "text".to_string()
}
fn default_log_filter() -> String {
    "casewatch=info,casewatch_core=info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_user_agent() -> String {
    format!(
        "casewatch/{} (missing-persons awareness pipeline)",
        env!("CARGO_PKG_VERSION")
    )
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_batch_delay_secs")]
    pub batch_delay_secs: u64,
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    #[serde(default = "default_process_interval_secs")]
    pub process_interval_secs: u64,
    #[serde(default = "default_process_batch_size")]
    pub process_batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            health_check_interval_secs: default_health_check_interval_secs(),
            batch_delay_secs: default_batch_delay_secs(),
            error_threshold: default_error_threshold(),
            process_interval_secs: default_process_interval_secs(),
            process_batch_size: default_process_batch_size(),
        }
    }
}

fn default_max_concurrency() -> usize {
    4
}
fn default_health_check_interval_secs() -> u64 {
    300
}
fn default_batch_delay_secs() -> u64 {
    5
}
fn default_error_threshold() -> u32 {
    5
}
fn default_process_interval_secs() -> u64 {
    120
}
fn default_process_batch_size() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ValidationConfig {
    #[serde(default = "default_duplicate_threshold")]
    pub duplicate_threshold: f64,
    #[serde(default = "default_duplicate_error_threshold")]
    pub duplicate_error_threshold: f64,
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            duplicate_threshold: default_duplicate_threshold(),
            duplicate_error_threshold: default_duplicate_error_threshold(),
            match_threshold: default_match_threshold(),
            min_confidence: default_min_confidence(),
        }
    }
}

fn default_duplicate_threshold() -> f64 {
    0.85
}
fn default_duplicate_error_threshold() -> f64 {
    0.9
}
fn default_match_threshold() -> f64 {
    0.8
}
fn default_min_confidence() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusteringConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_max_distance_km")]
    pub max_distance_km: f64,
    #[serde(default = "default_min_points")]
    pub min_points: usize,
    #[serde(default = "default_kmeans_max_k")]
    pub kmeans_max_k: usize,
    #[serde(default = "default_kmeans_max_iterations")]
    pub kmeans_max_iterations: usize,
    #[serde(default = "default_kmeans_tolerance_deg")]
    pub kmeans_tolerance_deg: f64,
    #[serde(default = "default_risk_cluster_cap")]
    pub risk_cluster_cap: usize,
    #[serde(default = "default_risk_seed_min_weight")]
    pub risk_seed_min_weight: f64,
    #[serde(default = "default_risk_min_neighbors")]
    pub risk_min_neighbors: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            max_distance_km: default_max_distance_km(),
            min_points: default_min_points(),
            kmeans_max_k: default_kmeans_max_k(),
            kmeans_max_iterations: default_kmeans_max_iterations(),
            kmeans_tolerance_deg: default_kmeans_tolerance_deg(),
            risk_cluster_cap: default_risk_cluster_cap(),
            risk_seed_min_weight: default_risk_seed_min_weight(),
            risk_min_neighbors: default_risk_min_neighbors(),
        }
    }
}

fn default_algorithm() -> String {
    "density".to_string()
}
fn default_max_distance_km() -> f64 {
    50.0
}
fn default_min_points() -> usize {
    3
}
fn default_kmeans_max_k() -> usize {
    20
}
fn default_kmeans_max_iterations() -> usize {
    100
}
fn default_kmeans_tolerance_deg() -> f64 {
    0.001
}
fn default_risk_cluster_cap() -> usize {
    21
}
fn default_risk_seed_min_weight() -> f64 {
    3.0
}
fn default_risk_min_neighbors() -> usize {
    2
}

impl ClusteringConfig {
    /// Translate into core clustering parameters.
    pub fn params(&self) -> Result<ClusterParams> {
        let algorithm: ClusterAlgorithm = self.algorithm.parse().map_err(anyhow::Error::msg)?;
        Ok(ClusterParams {
            algorithm,
            max_distance_km: self.max_distance_km,
            min_points: self.min_points,
            kmeans_max_k: self.kmeans_max_k,
            kmeans_max_iterations: self.kmeans_max_iterations,
            kmeans_tolerance_deg: self.kmeans_tolerance_deg,
            risk_cluster_cap: self.risk_cluster_cap,
            risk_seed_min_weight: self.risk_seed_min_weight,
            risk_min_neighbors: self.risk_min_neighbors,
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeocodingConfig {
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,
    /// Providers in priority order.
    #[serde(default = "default_geocode_providers")]
    pub providers: Vec<GeocodeProviderConfig>,
}

impl Default for GeocodingConfig {
    fn default() -> Self {
        Self {
            cache_path: default_cache_path(),
            flush_every: default_flush_every(),
            providers: default_geocode_providers(),
        }
    }
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("./data/geocache.json")
}
fn default_flush_every() -> usize {
    10
}
fn default_geocode_providers() -> Vec<GeocodeProviderConfig> {
    vec![GeocodeProviderConfig {
        kind: "nominatim".to_string(),
        api_key_env: None,
        base_url: None,
        requests_per_minute: 60,
    }]
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeocodeProviderConfig {
    /// `google`, `nominatim`, or `opencage`.
    pub kind: String,
    /// Environment variable holding the API key, for keyed providers.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_geocode_rpm")]
    pub requests_per_minute: u32,
}

fn default_geocode_rpm() -> u32 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub name: String,
    /// Adapter constructor key: `search_api`, `html_scraper`, `rss`, or `weather_alerts`.
    pub adapter: String,
    pub base_url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub record_type: RecordType,
    /// Two-letter state for sources that only cover one state.
    #[serde(default)]
    pub default_state: Option<String>,

    // search_api
    #[serde(default = "default_search_path")]
    pub search_path: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,

    // html_scraper
    #[serde(default)]
    pub pages: Vec<String>,

    // rss
    #[serde(default)]
    pub feeds: Vec<String>,

    // weather_alerts
    #[serde(default = "default_alert_event")]
    pub event: String,
}

fn default_enabled() -> bool {
    true
}
fn default_requests_per_minute() -> u32 {
    30
}
fn default_burst() -> u32 {
    5
}
fn default_interval_minutes() -> u64 {
    60
}
fn default_search_path() -> String {
    "/api/CaseSets/NamUs/MissingPersons/Search".to_string()
}
fn default_page_size() -> usize {
    100
}
fn default_max_pages() -> usize {
    10
}
fn default_alert_event() -> String {
    "Child Abduction Emergency".to_string()
}

impl SourceConfig {
    pub fn adapter_kind(&self) -> AdapterKind {
        match self.adapter.as_str() {
            "rss" => AdapterKind::Rss,
            "html_scraper" => AdapterKind::Scraper,
            _ => AdapterKind::Api,
        }
    }

    /// Build the runtime descriptor for this source.
    pub fn descriptor(&self, id: &str) -> DataSourceDescriptor {
        DataSourceDescriptor {
            id: id.to_string(),
            name: self.name.clone(),
            kind: self.adapter_kind(),
            base_url: self.base_url.clone(),
            rate_limit: RateLimit {
                requests_per_minute: self.requests_per_minute,
                burst: self.burst,
            },
            schedule: Schedule {
                interval_minutes: self.interval_minutes,
                priority: self.priority,
            },
            status: if self.enabled {
                SourceStatus::Active
            } else {
                SourceStatus::Inactive
            },
            error_count: 0,
        }
    }
}

impl Config {
    /// Descriptors for every configured source, ordered by id.
    pub fn descriptors(&self) -> Vec<DataSourceDescriptor> {
        self.sources
            .iter()
            .map(|(id, source)| source.descriptor(id))
            .collect()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match config.logging.format.as_str() {
        "text" | "json" => {}
        other => anyhow::bail!("Unknown logging.format: '{}'. Must be text or json.", other),
    }

    if config.scheduler.max_concurrency == 0 {
        anyhow::bail!("scheduler.max_concurrency must be > 0");
    }
    if config.scheduler.process_batch_size == 0 {
        anyhow::bail!("scheduler.process_batch_size must be > 0");
    }

    let v = &config.validation;
    for (name, value) in [
        ("duplicate_threshold", v.duplicate_threshold),
        ("duplicate_error_threshold", v.duplicate_error_threshold),
        ("match_threshold", v.match_threshold),
        ("min_confidence", v.min_confidence),
    ] {
        if !(0.0..=1.0).contains(&value) {
            anyhow::bail!("validation.{} must be in [0.0, 1.0]", name);
        }
    }

    let c = &config.clustering;
    c.params()?;
    if c.max_distance_km <= 0.0 {
        anyhow::bail!("clustering.max_distance_km must be > 0");
    }
    if c.min_points == 0 {
        anyhow::bail!("clustering.min_points must be >= 1");
    }
    if c.kmeans_max_k == 0 || c.risk_cluster_cap == 0 {
        anyhow::bail!("clustering.kmeans_max_k and clustering.risk_cluster_cap must be >= 1");
    }

    for provider in &config.geocoding.providers {
        match provider.kind.as_str() {
            "google" | "nominatim" | "opencage" => {}
            other => anyhow::bail!(
                "Unknown geocoding provider: '{}'. Must be google, nominatim, or opencage.",
                other
            ),
        }
        if provider.requests_per_minute == 0 {
            anyhow::bail!("geocoding provider '{}': requests_per_minute must be > 0", provider.kind);
        }
    }

    let adapters = known_adapters();
    for (id, source) in &config.sources {
        if !adapters.contains(&source.adapter.as_str()) {
            anyhow::bail!(
                "sources.{}: unknown adapter '{}'. Must be one of: {}",
                id,
                source.adapter,
                adapters.join(", ")
            );
        }
        if source.requests_per_minute == 0 {
            anyhow::bail!("sources.{}.requests_per_minute must be > 0", id);
        }
        if source.burst == 0 {
            anyhow::bail!("sources.{}.burst must be > 0", id);
        }
        if source.interval_minutes == 0 {
            anyhow::bail!("sources.{}.interval_minutes must be > 0", id);
        }
        if source.adapter == "html_scraper" && source.pages.is_empty() {
            anyhow::bail!("sources.{}: html_scraper requires at least one page", id);
        }
        if source.adapter == "rss" && source.feeds.is_empty() {
            anyhow::bail!("sources.{}: rss requires at least one feed", id);
        }
    }

    Ok(())
}
