//! Persistent geocode cache.
//!
//! A JSON object mapping `"city,state,country"` (lowercased) to the
//! resolved coordinates:
//!
//! ```json
//! {
//!   "miami,fl,usa": {
//!     "lat": 25.7617,
//!     "lon": -80.1918,
//!     "provider": "google",
//!     "confidence": 0.95,
//!     "formatted_address": "Miami, FL, USA"
//!   }
//! }
//! ```
//!
//! Entries never expire. Loading is lenient: entries without numeric
//! `lat`/`lon` or without a provider name are dropped, the rest load. A
//! file that is not a JSON object at all is treated as empty.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeCacheEntry {
    pub lat: f64,
    pub lon: f64,
    pub provider: String,
    pub confidence: f64,
    #[serde(default)]
    pub formatted_address: Option<String>,
}

impl GeocodeCacheEntry {
    fn from_value(value: &Value) -> Option<Self> {
        let lat = value.get("lat")?.as_f64()?;
        let lon = value.get("lon")?.as_f64()?;
        let provider = value
            .get("provider")?
            .as_str()
            .map(str::trim)
            .filter(|p| !p.is_empty())?
            .to_string();
        Some(Self {
            lat,
            lon,
            provider,
            confidence: value.get("confidence").and_then(Value::as_f64).unwrap_or(0.0),
            formatted_address: value
                .get("formatted_address")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

/// Normalized cache key for a place.
pub fn cache_key(city: &str, state: &str, country: &str) -> String {
    format!(
        "{},{},{}",
        city.trim().to_lowercase(),
        state.trim().to_lowercase(),
        country.trim().to_lowercase()
    )
}

#[derive(Debug)]
pub struct GeocodeCache {
    path: PathBuf,
    entries: HashMap<String, GeocodeCacheEntry>,
    /// Entries written since the last save.
    unsaved: usize,
}

impl GeocodeCache {
    /// An empty cache that will persist to `path`.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: HashMap::new(),
            unsaved: 0,
        }
    }

    /// Load the cache file. A missing file yields an empty cache.
    pub fn load(path: &Path) -> Result<Self> {
        let mut cache = Self::empty(path);
        if !path.exists() {
            return Ok(cache);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read geocode cache: {}", path.display()))?;
        let parsed: Value = match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "geocode cache is not valid JSON, starting empty");
                return Ok(cache);
            }
        };
        let Some(object) = parsed.as_object() else {
            tracing::warn!(path = %path.display(), "geocode cache is not a JSON object, starting empty");
            return Ok(cache);
        };

        let mut discarded = 0usize;
        for (key, value) in object {
            match GeocodeCacheEntry::from_value(value) {
                Some(entry) => {
                    cache.entries.insert(key.clone(), entry);
                }
                None => discarded += 1,
            }
        }
        tracing::debug!(
            path = %path.display(),
            entries = cache.entries.len(),
            discarded,
            "geocode cache loaded"
        );
        Ok(cache)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&GeocodeCacheEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn unsaved(&self) -> usize {
        self.unsaved
    }

    /// Write an entry unless the key already holds one from a provider
    /// ranked at least as high. `rank` maps a provider name to its
    /// position in the chain (lower is higher priority).
    ///
    /// Returns whether the entry was written.
    pub fn insert_ranked(
        &mut self,
        key: String,
        entry: GeocodeCacheEntry,
        rank: impl Fn(&str) -> usize,
    ) -> bool {
        if let Some(existing) = self.entries.get(&key) {
            if rank(&existing.provider) <= rank(&entry.provider) {
                return false;
            }
        }
        self.entries.insert(key, entry);
        self.unsaved += 1;
        true
    }

    /// Persist the cache atomically (temp file + rename).
    pub fn save(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create cache directory: {}", parent.display())
                })?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write geocode cache: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace geocode cache: {}", self.path.display()))?;
        self.unsaved = 0;
        tracing::debug!(path = %self.path.display(), entries = self.entries.len(), "geocode cache saved");
        Ok(())
    }

    /// Drop every entry and remove the file.
    pub fn clear(&mut self) -> Result<usize> {
        let removed = self.entries.len();
        self.entries.clear();
        self.unsaved = 0;
        if self.path.exists() {
            std::fs::remove_file(&self.path).with_context(|| {
                format!("Failed to remove geocode cache: {}", self.path.display())
            })?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(provider: &str) -> GeocodeCacheEntry {
        GeocodeCacheEntry {
            lat: 25.7617,
            lon: -80.1918,
            provider: provider.into(),
            confidence: 0.95,
            formatted_address: Some("Miami, FL, USA".into()),
        }
    }

    fn rank(name: &str) -> usize {
        match name {
            "google" => 0,
            "nominatim" => 1,
            _ => usize::MAX,
        }
    }

    #[test]
    fn test_key_normalization() {
        assert_eq!(cache_key(" Miami ", "FL", "USA"), "miami,fl,usa");
    }

    #[test]
    fn test_save_and_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/geocache.json");
        let mut cache = GeocodeCache::empty(&path);
        assert!(cache.insert_ranked("miami,fl,usa".into(), entry("google"), rank));
        assert_eq!(cache.unsaved(), 1);
        cache.save().unwrap();
        assert_eq!(cache.unsaved(), 0);

        let reloaded = GeocodeCache::load(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get("miami,fl,usa"), Some(&entry("google")));
    }

    #[test]
    fn test_malformed_entries_are_discarded() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("geocache.json");
        std::fs::write(
            &path,
            r#"{
                "good,fl,usa": {"lat": 1.0, "lon": 2.0, "provider": "nominatim"},
                "nolat,fl,usa": {"lon": 2.0, "provider": "nominatim"},
                "textlat,fl,usa": {"lat": "1.0", "lon": 2.0, "provider": "nominatim"},
                "noprovider,fl,usa": {"lat": 1.0, "lon": 2.0},
                "scalar,fl,usa": 7
            }"#,
        )
        .unwrap();

        let cache = GeocodeCache::load(&path).unwrap();
        assert_eq!(cache.len(), 1);
        let good = cache.get("good,fl,usa").unwrap();
        assert_eq!(good.confidence, 0.0);
        assert_eq!(good.formatted_address, None);
    }

    #[test]
    fn test_garbage_file_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("geocache.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(GeocodeCache::load(&path).unwrap().is_empty());
        assert!(GeocodeCache::load(&tmp.path().join("missing.json")).unwrap().is_empty());
    }

    #[test]
    fn test_lower_priority_never_overwrites() {
        let mut cache = GeocodeCache::empty("unused.json");
        assert!(cache.insert_ranked("k".into(), entry("google"), rank));
        assert!(!cache.insert_ranked("k".into(), entry("nominatim"), rank));
        assert!(!cache.insert_ranked("k".into(), entry("google"), rank));
        assert_eq!(cache.get("k").unwrap().provider, "google");

        let mut cache = GeocodeCache::empty("unused.json");
        assert!(cache.insert_ranked("k".into(), entry("nominatim"), rank));
        assert!(cache.insert_ranked("k".into(), entry("google"), rank));
        assert_eq!(cache.get("k").unwrap().provider, "google");
    }

    #[test]
    fn test_clear_removes_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("geocache.json");
        let mut cache = GeocodeCache::empty(&path);
        cache.insert_ranked("k".into(), entry("google"), rank);
        cache.save().unwrap();
        assert!(path.exists());
        assert_eq!(cache.clear().unwrap(), 1);
        assert!(!path.exists());
        assert!(cache.is_empty());
    }
}
