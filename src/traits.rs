//! Connector trait and the source-id → connector registry.
//!
//! Every upstream source is served by one [`Connector`]. Connectors are
//! built from `[sources.<id>]` config tables through a constructor map
//! keyed by the table's `adapter` name, so adding a source type means
//! adding one constructor here and one module implementing the trait.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               ConnectorRegistry              │
//! │  ┌──────────┐ ┌──────────┐ ┌─────┐ ┌───────┐ │
//! │  │search_api│ │html_scrap│ │ rss │ │weather│ │
//! │  └──────────┘ └──────────┘ └─────┘ └───────┘ │
//! └──────────────────────┬───────────────────────┘
//!                        ▼
//!        ingest::run_cycle() → pending records
//! ```
//!
//! All connectors of a process share one [`RateLimiter`]; each one's
//! [`SourceClient`] is keyed by its source id.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use casewatch_core::models::{AdapterKind, CollectedRecord};

use crate::config::{Config, SourceConfig};
use crate::connector_api::SearchApiConnector;
use crate::connector_html::HtmlScraperConnector;
use crate::connector_rss::RssConnector;
use crate::connector_weather::WeatherAlertConnector;
use crate::fetch::SourceClient;
use crate::rate_limit::RateLimiter;

// ═══════════════════════════════════════════════════════════════════════
// Connector Trait
// ═══════════════════════════════════════════════════════════════════════

/// An upstream source adapter that produces normalized records.
///
/// # Contract
///
/// - Every outbound request goes through the connector's
///   [`SourceClient`], and therefore through the shared rate limiter.
/// - Transport failures (after retries) are returned as errors and fail
///   the cycle.
/// - Unrecognized markup or payload shapes are *not* errors: the
///   connector logs a warning and returns zero records for that part.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Source id this connector collects for (the `[sources.<id>]` key).
    fn source_id(&self) -> &str;

    /// One-line description, shown by `cw sources`.
    fn description(&self) -> &str;

    fn kind(&self) -> AdapterKind;

    /// Fetch and normalize the current upstream records.
    async fn collect(&self) -> Result<Vec<CollectedRecord>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Constructor map
// ═══════════════════════════════════════════════════════════════════════

type ConnectorCtor = fn(&str, &SourceConfig, SourceClient) -> Box<dyn Connector>;

const CONSTRUCTORS: &[(&str, ConnectorCtor)] = &[
    ("search_api", search_api),
    ("html_scraper", html_scraper),
    ("rss", rss),
    ("weather_alerts", weather_alerts),
];

fn search_api(id: &str, cfg: &SourceConfig, client: SourceClient) -> Box<dyn Connector> {
    Box::new(SearchApiConnector::new(id, cfg.clone(), client))
}

fn html_scraper(id: &str, cfg: &SourceConfig, client: SourceClient) -> Box<dyn Connector> {
    Box::new(HtmlScraperConnector::new(id, cfg.clone(), client))
}

fn rss(id: &str, cfg: &SourceConfig, client: SourceClient) -> Box<dyn Connector> {
    Box::new(RssConnector::new(id, cfg.clone(), client))
}

fn weather_alerts(id: &str, cfg: &SourceConfig, client: SourceClient) -> Box<dyn Connector> {
    Box::new(WeatherAlertConnector::new(id, cfg.clone(), client))
}

/// Adapter names accepted in `[sources.<id>] adapter = "..."`.
pub fn known_adapters() -> Vec<&'static str> {
    CONSTRUCTORS.iter().map(|(name, _)| *name).collect()
}

/// Build the connector for one configured source.
pub fn build_connector(
    id: &str,
    source: &SourceConfig,
    config: &Config,
    limiter: Arc<RateLimiter>,
) -> Result<Box<dyn Connector>> {
    let ctor = CONSTRUCTORS
        .iter()
        .find(|(name, _)| *name == source.adapter)
        .map(|(_, ctor)| *ctor)
        .with_context(|| format!("sources.{}: unknown adapter '{}'", id, source.adapter))?;
    let client = SourceClient::new(id, source.descriptor(id).rate_limit, limiter, &config.http)?;
    Ok(ctor(id, source, client))
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Registry of connectors, one per source id.
pub struct ConnectorRegistry {
    connectors: Vec<Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    /// Create an empty connector registry.
    pub fn new() -> Self {
        Self {
            connectors: Vec::new(),
        }
    }

    /// Build connectors for every configured source, enabled or not.
    ///
    /// Disabled sources still get a connector so `cw sync <id>` can run
    /// them on demand; the scheduler decides what runs on a timer.
    pub fn from_config(config: &Config, limiter: Arc<RateLimiter>) -> Result<Self> {
        let mut registry = Self::new();
        for (id, source) in &config.sources {
            let connector = build_connector(id, source, config, limiter.clone())?;
            registry.register(Arc::from(connector));
        }
        Ok(registry)
    }

    /// Register a connector. A later registration for the same source id
    /// replaces the earlier one.
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors
            .retain(|c| c.source_id() != connector.source_id());
        self.connectors.push(connector);
    }

    pub fn find(&self, source_id: &str) -> Option<Arc<dyn Connector>> {
        self.connectors
            .iter()
            .find(|c| c.source_id() == source_id)
            .cloned()
    }

    pub fn connectors(&self) -> &[Arc<dyn Connector>] {
        &self.connectors
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl Connector for Fixed {
        fn source_id(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "fixed"
        }
        fn kind(&self) -> AdapterKind {
            AdapterKind::Api
        }
        async fn collect(&self) -> Result<Vec<CollectedRecord>> {
            Ok(vec![])
        }
    }

    #[test]
    fn test_known_adapters() {
        assert_eq!(
            known_adapters(),
            vec!["search_api", "html_scraper", "rss", "weather_alerts"]
        );
    }

    #[test]
    fn test_register_replaces_same_source() {
        let mut registry = ConnectorRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(Fixed("a")));
        registry.register(Arc::new(Fixed("b")));
        registry.register(Arc::new(Fixed("a")));
        assert_eq!(registry.len(), 2);
        assert!(registry.find("a").is_some());
        assert!(registry.find("c").is_none());
    }

    #[test]
    fn test_from_config_builds_every_source() {
        let config: Config = toml::from_str(
            r#"
            [db]
            path = "./x.sqlite"

            [sources.namus]
            name = "NamUs"
            adapter = "search_api"
            base_url = "https://example.org"

            [sources.alerts]
            name = "NWS"
            adapter = "weather_alerts"
            base_url = "https://example.org"
            enabled = false
            "#,
        )
        .unwrap();
        let registry = ConnectorRegistry::from_config(&config, Arc::new(RateLimiter::new())).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find("namus").unwrap().kind(), AdapterKind::Api);
        assert_eq!(registry.find("alerts").unwrap().source_id(), "alerts");
    }
}
