//! Monitor configuration
//!
//! All tunables for a refresh cycle live here: where documents come from,
//! how long fetches may take, how much memory a document may use, where the
//! cache goes and the constant flag thresholds.

use crate::error::{HealthError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for fetch and cycle timeouts (one day)
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Upper bound for `max_cache_age_secs` (90 days)
pub const MAX_CACHE_AGE_SECS: i64 = 90 * 24 * 60 * 60;

/// Flag thresholds that are identical for every authority.
///
/// Values mirror tor's compiled-in defaults. Units: fractions for WFU,
/// seconds for time-known, bytes/s for bandwidth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstantThresholds {
    /// Weighted fractional uptime required for Guard
    pub guard_wfu: f64,
    /// Time known required for Guard (8 days)
    pub guard_tk: f64,
    /// Time known required for HSDir (96 hours)
    pub hsdir_tk: f64,
    /// Bandwidth that guarantees Fast (AuthDirFastGuarantee)
    pub fast_guarantee: f64,
}

impl Default for ConstantThresholds {
    fn default() -> Self {
        Self {
            guard_wfu: 0.98,
            guard_tk: 691_200.0,
            hsdir_tk: 345_600.0,
            fast_guarantee: 102_400.0,
        }
    }
}

impl ConstantThresholds {
    /// `(flag-thresholds key, value)` pairs in a stable order
    pub fn entries(&self) -> [(&'static str, f64); 4] {
        [
            ("guard-wfu", self.guard_wfu),
            ("guard-tk", self.guard_tk),
            ("hsdir-tk", self.hsdir_tk),
            ("fast-guarantee", self.fast_guarantee),
        ]
    }
}

/// Configuration for the directory monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Document mirror base URL
    pub collector_url: String,

    /// Listing path for votes
    pub votes_path: String,

    /// Listing path for bandwidth files
    pub bandwidth_path: String,

    /// Per-file fetch timeout in seconds
    pub fetch_timeout_secs: u64,

    /// Outer deadline for all fetches of one cycle, in seconds
    pub cycle_timeout_secs: u64,

    /// Largest accepted document body
    pub max_document_bytes: usize,

    /// Largest accepted listing page
    pub max_listing_bytes: usize,

    /// Upper bound on concurrent fetches per document family
    pub max_concurrent_fetches: usize,

    /// Directory for persisted snapshots
    pub cache_dir: PathBuf,

    /// Number of snapshot artifacts to keep
    pub cache_retention: usize,

    /// Snapshots older than this are not trusted on load
    pub max_cache_age_secs: i64,

    /// Seconds after the top of the hour at which a cycle starts
    pub cycle_offset_secs: u64,

    /// Absolute bandwidth deviation (percent) that raises a warning
    pub deviation_warning_percent: f64,

    /// Thresholds shared by every authority
    pub constant_thresholds: ConstantThresholds,

    /// HTTP User-Agent header
    pub user_agent: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            collector_url: "https://collector.torproject.org".to_string(),
            votes_path: "/recent/relay-descriptors/votes/".to_string(),
            bandwidth_path: "/recent/relay-descriptors/bandwidths/".to_string(),
            fetch_timeout_secs: 60,
            cycle_timeout_secs: 600,
            max_document_bytes: 32 * 1024 * 1024,
            max_listing_bytes: 4 * 1024 * 1024,
            max_concurrent_fetches: 9,
            cache_dir: PathBuf::from("./cache"),
            cache_retention: 24,
            max_cache_age_secs: 7 * 24 * 60 * 60,
            cycle_offset_secs: 600,
            deviation_warning_percent: 5.0,
            constant_thresholds: ConstantThresholds::default(),
            user_agent: concat!("consensus-health/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl MonitorConfig {
    /// Config pointing at a different mirror
    pub fn with_collector(collector_url: impl Into<String>) -> Self {
        Self {
            collector_url: collector_url.into(),
            ..Default::default()
        }
    }

    /// Set the cache directory
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Load a JSON config file; missing fields take their defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| HealthError::Config(format!("{}: {}", path.display(), e)))?;
        let config: MonitorConfig = serde_json::from_str(&text)
            .map_err(|e| HealthError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make a cycle hang or never fetch
    pub fn validate(&self) -> Result<()> {
        if !(self.collector_url.starts_with("http://") || self.collector_url.starts_with("https://"))
        {
            return Err(HealthError::Config(format!(
                "collector_url must be http(s): {}",
                self.collector_url
            )));
        }
        if self.fetch_timeout_secs == 0 || self.cycle_timeout_secs == 0 {
            return Err(HealthError::Config("timeouts must be non-zero".into()));
        }
        if self.fetch_timeout_secs > MAX_TIMEOUT_SECS || self.cycle_timeout_secs > MAX_TIMEOUT_SECS {
            return Err(HealthError::Config(format!(
                "timeouts must not exceed {}s",
                MAX_TIMEOUT_SECS
            )));
        }
        if self.max_cache_age_secs <= 0 || self.max_cache_age_secs > MAX_CACHE_AGE_SECS {
            return Err(HealthError::Config(format!(
                "max_cache_age_secs must be within 1..={}, got {}",
                MAX_CACHE_AGE_SECS, self.max_cache_age_secs
            )));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(HealthError::Config(
                "max_concurrent_fetches must be non-zero".into(),
            ));
        }
        if self.max_document_bytes == 0 || self.max_listing_bytes == 0 {
            return Err(HealthError::Config("size limits must be non-zero".into()));
        }
        if self.cycle_offset_secs >= 3600 {
            return Err(HealthError::Config(
                "cycle_offset_secs must be below one hour".into(),
            ));
        }
        Ok(())
    }

    /// Full URL of the vote listing
    pub fn votes_url(&self) -> String {
        join_url(&self.collector_url, &self.votes_path)
    }

    /// Full URL of the bandwidth listing
    pub fn bandwidth_url(&self) -> String {
        join_url(&self.collector_url, &self.bandwidth_path)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }
}

/// Join a base URL and a path with exactly one slash between them
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(
            config.votes_url(),
            "https://collector.torproject.org/recent/relay-descriptors/votes/"
        );
        assert_eq!(config.max_concurrent_fetches, 9);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = MonitorConfig::with_collector("ftp://mirror");
        assert!(config.validate().is_err());

        config.collector_url = "http://mirror/".into();
        assert!(config.validate().is_ok());
        config.fetch_timeout_secs = 0;
        assert!(config.validate().is_err());

        config.fetch_timeout_secs = u64::MAX;
        assert!(config.validate().is_err());
        config.fetch_timeout_secs = 60;

        for age in [i64::MAX, MAX_CACHE_AGE_SECS + 1, 0, -3600] {
            config.max_cache_age_secs = age;
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("max_cache_age_secs"), "{}", err);
        }
        config.max_cache_age_secs = MAX_CACHE_AGE_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config: MonitorConfig =
            serde_json::from_str(r#"{"collector_url": "http://localhost:8000", "cache_retention": 3}"#)
                .unwrap();
        assert_eq!(config.cache_retention, 3);
        assert_eq!(config.fetch_timeout_secs, 60);
        assert_eq!(
            config.bandwidth_url(),
            "http://localhost:8000/recent/relay-descriptors/bandwidths/"
        );
        assert_eq!(config.constant_thresholds.guard_wfu, 0.98);
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.json");
        std::fs::write(&path, r#"{"fetch_timeout_secs": 5}"#).unwrap();
        let config = MonitorConfig::from_json_file(&path).unwrap();
        assert_eq!(config.fetch_timeout(), Duration::from_secs(5));
    }
}
