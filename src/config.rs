use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top level configuration, assembled from defaults, an optional JSON file
/// and finally the command line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub remote: RemoteMatcherConfig,
    pub gap_fill: GapFillConfig,
    pub streak: StreakConfig,
    pub prefit: PrefitConfig,
    pub area: AreaConfig,
}

impl Config {
    /// Load a JSON config file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }
}

/// Settings for the remote shape-matching service. Costing and matching
/// mode are fixed, see [`crate::remote_matcher::MatchRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteMatcherConfig {
    /// Base URL of the matching service, `/trace_attributes` is appended
    pub endpoint: Option<String>,
}

impl RemoteMatcherConfig {
    pub fn trace_attributes_url(&self) -> Option<String> {
        self.endpoint
            .as_deref()
            .map(|base| format!("{}/trace_attributes", base.trim_end_matches('/')))
    }
}

/// Plausibility limits for bridging gaps between matched edges
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GapFillConfig {
    /// A bridge must be strictly shorter than this (meters)
    pub length_threshold_m: f64,
    /// A bridge must visit strictly fewer nodes than this
    pub node_count_threshold: usize,
}

impl Default for GapFillConfig {
    fn default() -> Self {
        Self {
            length_threshold_m: 30.0,
            node_count_threshold: 6,
        }
    }
}

/// Nearest-edge matcher used when no remote service is available
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreakConfig {
    /// Samples at least this far from every edge are ignored (meters)
    pub max_distance_m: f64,
    /// Streaks at least this long are accepted outright
    pub min_streak: usize,
    /// Shorter streaks need one sample whose distance to the nearest edge
    /// endpoint, relative to the edge length, exceeds this ratio
    pub min_intersection_ratio: f64,
}

impl Default for StreakConfig {
    fn default() -> Self {
        Self {
            max_distance_m: 10.0,
            min_streak: 3,
            min_intersection_ratio: 0.2,
        }
    }
}

/// Optional pre-fitting of raw samples through a Mapbox-compatible
/// map matching API before they are sent to the remote matcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefitConfig {
    /// Pre-fitting is skipped when no token is configured
    pub access_token: Option<String>,
    pub base_url: String,
    pub profile: String,
    /// The API accepts at most this many coordinates per request
    pub batch_size: usize,
    /// Pause between two consecutive requests (milliseconds)
    pub pause_ms: u64,
}

impl Default for PrefitConfig {
    fn default() -> Self {
        Self {
            access_token: None,
            base_url: "https://api.mapbox.com/matching/v5/mapbox".to_string(),
            profile: "walking".to_string(),
            batch_size: 100,
            pause_ms: 1000,
        }
    }
}

/// Extent and street filter of the study area
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AreaConfig {
    /// `[min_lon, min_lat, max_lon, max_lat]`
    pub bbox: [f64; 4],
    pub highway_whitelist: Vec<String>,
    pub highway_blacklist: Vec<String>,
}

impl Default for AreaConfig {
    fn default() -> Self {
        Self {
            // Englischer Garten, Munich, including the Oberföhring weir
            bbox: [11.575, 48.140, 11.625, 48.190],
            highway_whitelist: [
                "footway",
                "cycleway",
                "residential",
                "steps",
                "service",
                "unclassified",
                "track",
                "trunk_link",
                "trunk",
                "path",
                "bridleway",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            highway_blacklist: ["service", "trunk", "trunk_link"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl AreaConfig {
    pub fn accepts_highway(&self, highway: &str) -> bool {
        self.highway_whitelist.iter().any(|h| h == highway)
            && !self.highway_blacklist.iter().any(|h| h == highway)
    }

    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        let [min_lon, min_lat, max_lon, max_lat] = self.bbox;
        (min_lon..=max_lon).contains(&lon) && (min_lat..=max_lat).contains(&lat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_area_drops_blacklisted_highways() {
        let area = AreaConfig::default();
        assert!(area.accepts_highway("footway"));
        assert!(area.accepts_highway("bridleway"));
        assert!(!area.accepts_highway("service"));
        assert!(!area.accepts_highway("trunk"));
        assert!(!area.accepts_highway("motorway"));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"gap_fill": {"length_threshold_m": 45.0}}"#).unwrap();
        assert_eq!(config.gap_fill.length_threshold_m, 45.0);
        assert_eq!(config.gap_fill.node_count_threshold, 6);
        assert_eq!(config.streak.min_streak, 3);
        assert!(config.remote.endpoint.is_none());
    }

    #[test]
    fn trace_attributes_url_strips_trailing_slash() {
        let remote = RemoteMatcherConfig {
            endpoint: Some("http://localhost:8002/".to_string()),
        };
        assert_eq!(
            remote.trace_attributes_url().as_deref(),
            Some("http://localhost:8002/trace_attributes")
        );
        assert!(RemoteMatcherConfig::default().trace_attributes_url().is_none());
    }
}
