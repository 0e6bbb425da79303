// Snapshot cache
//
// Persists each cycle's snapshot so a restart, or a cycle where every
// fetch fails, can still serve the last good data (marked stale).
// Artifacts are validated before use; anything suspicious is deleted
// rather than partially trusted.

mod backend;

pub use backend::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};

use crate::config::{MonitorConfig, MAX_CACHE_AGE_SECS};
use crate::error::{HealthError, Result};
use crate::snapshot::{CycleSnapshot, SCHEMA_VERSION};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use std::sync::Arc;

const ARTIFACT_PREFIX: &str = "snapshot-";
const ARTIFACT_SUFFIX: &str = ".json";
const ARTIFACT_TIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Tolerated clock skew for artifacts stamped in the future
const MAX_FUTURE_SKEW_SECS: i64 = 300;

/// Top-level keys a snapshot artifact must carry
pub const REQUIRED_KEYS: [&str; 8] = [
    "schema_version",
    "fetched_at",
    "authorities",
    "requirement",
    "votes",
    "bandwidth",
    "index",
    "thresholds",
];

/// Cache directory statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub artifacts: usize,
    pub newest: Option<DateTime<Utc>>,
}

/// Saves, validates and prunes snapshot artifacts
pub struct CacheManager {
    store: Arc<dyn SnapshotStore>,
    retention: usize,
    max_age: Duration,
}

impl CacheManager {
    pub fn new(store: Arc<dyn SnapshotStore>, config: &MonitorConfig) -> Self {
        Self {
            store,
            retention: config.cache_retention.max(1),
            max_age: Duration::try_seconds(config.max_cache_age_secs.clamp(1, MAX_CACHE_AGE_SECS))
                .unwrap_or_else(|| Duration::days(7)),
        }
    }

    /// `snapshot-<YYYYMMDDTHHMMSSZ>.json`
    pub fn artifact_name(fetched_at: DateTime<Utc>) -> String {
        format!(
            "{}{}{}",
            ARTIFACT_PREFIX,
            fetched_at.format(ARTIFACT_TIME_FORMAT),
            ARTIFACT_SUFFIX
        )
    }

    /// Timestamp encoded in an artifact name
    pub fn parse_artifact_name(name: &str) -> Option<DateTime<Utc>> {
        let stamp = name.strip_prefix(ARTIFACT_PREFIX)?.strip_suffix(ARTIFACT_SUFFIX)?;
        NaiveDateTime::parse_from_str(stamp, ARTIFACT_TIME_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// Persist a snapshot, then prune old artifacts
    pub fn save(&self, snapshot: &CycleSnapshot) -> Result<String> {
        let name = Self::artifact_name(snapshot.fetched_at);
        let bytes = serde_json::to_vec(snapshot)?;
        self.store.write(&name, &bytes)?;
        log::info!("💾 Cached snapshot {} ({} KB)", name, bytes.len() / 1024);

        if let Err(e) = self.prune() {
            log::warn!("⚠️ Failed to prune snapshot cache: {}", e);
        }
        Ok(name)
    }

    /// Artifacts newest first
    fn artifacts(&self) -> Result<Vec<(DateTime<Utc>, String)>> {
        let mut artifacts: Vec<(DateTime<Utc>, String)> = self
            .store
            .list()?
            .into_iter()
            .filter_map(|name| Self::parse_artifact_name(&name).map(|t| (t, name)))
            .collect();
        artifacts.sort_by(|a, b| b.cmp(a));
        Ok(artifacts)
    }

    /// Delete artifacts beyond the retention count; returns how many went
    pub fn prune(&self) -> Result<usize> {
        let mut removed = 0;
        for (_, name) in self.artifacts()?.into_iter().skip(self.retention) {
            self.store.remove(&name)?;
            removed += 1;
        }
        if removed > 0 {
            log::debug!("Pruned {} old snapshot artifacts", removed);
        }
        Ok(removed)
    }

    /// Newest artifact that passes validation
    ///
    /// Invalid artifacts met on the way are deleted.
    pub fn load_latest(&self, now: DateTime<Utc>) -> Option<CycleSnapshot> {
        let artifacts = match self.artifacts() {
            Ok(a) => a,
            Err(e) => {
                log::warn!("⚠️ Snapshot cache unreadable: {}", e);
                return None;
            }
        };

        for (_, name) in artifacts {
            let loaded = self
                .store
                .read(&name)
                .and_then(|bytes| self.validate(&bytes, now));
            match loaded {
                Ok(snapshot) => {
                    log::info!(
                        "📂 Loaded cached snapshot {} ({} relays)",
                        name,
                        snapshot.index.len()
                    );
                    return Some(snapshot);
                }
                Err(e) => {
                    log::warn!("🗑️ Discarding cached snapshot {}: {}", name, e);
                    if let Err(e) = self.store.remove(&name) {
                        log::warn!("⚠️ Could not delete {}: {}", name, e);
                    }
                }
            }
        }

        log::info!("No usable snapshot cache, cold start");
        None
    }

    /// Structural and timestamp checks on one artifact
    pub fn validate(&self, bytes: &[u8], now: DateTime<Utc>) -> Result<CycleSnapshot> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        let object = value
            .as_object()
            .ok_or_else(|| HealthError::Cache("artifact is not a JSON object".into()))?;

        if let Some(missing) = REQUIRED_KEYS.iter().find(|k| !object.contains_key(**k)) {
            return Err(HealthError::Cache(format!("missing key {:?}", missing)));
        }

        let version = object.get("schema_version").and_then(|v| v.as_u64());
        if version != Some(u64::from(SCHEMA_VERSION)) {
            return Err(HealthError::Cache(format!(
                "unsupported schema version {:?}",
                version
            )));
        }

        let snapshot: CycleSnapshot = serde_json::from_value(value)?;

        if snapshot.fetched_at > now + Duration::seconds(MAX_FUTURE_SKEW_SECS) {
            return Err(HealthError::Cache(format!(
                "fetched_at {} is in the future",
                snapshot.fetched_at
            )));
        }
        if now - snapshot.fetched_at > self.max_age {
            return Err(HealthError::Cache(format!(
                "fetched_at {} is older than {} hours",
                snapshot.fetched_at,
                self.max_age.num_hours()
            )));
        }
        if snapshot.requirement.authority_count != snapshot.authorities.len() {
            return Err(HealthError::Cache(format!(
                "requirement counts {} authorities but {} are listed",
                snapshot.requirement.authority_count,
                snapshot.authorities.len()
            )));
        }

        Ok(snapshot)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let artifacts = self.artifacts()?;
        Ok(CacheStats {
            artifacts: artifacts.len(),
            newest: artifacts.first().map(|(t, _)| *t),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::tests::empty_snapshot;
    use chrono::TimeZone;

    fn manager(store: Arc<dyn SnapshotStore>, retention: usize) -> CacheManager {
        let config = MonitorConfig {
            cache_retention: retention,
            ..MonitorConfig::default()
        };
        CacheManager::new(store, &config)
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 10, 0).unwrap()
    }

    #[test]
    fn test_artifact_name() {
        let name = CacheManager::artifact_name(at(13));
        assert_eq!(name, "snapshot-20240301T131000Z.json");
        assert_eq!(CacheManager::parse_artifact_name(&name), Some(at(13)));
        assert_eq!(CacheManager::parse_artifact_name("notes.txt"), None);
    }

    #[test]
    fn test_save_load_and_prune() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileSnapshotStore::new(dir.path()));
        let cache = manager(store.clone(), 2);

        for hour in [10, 11, 12] {
            cache.save(&empty_snapshot(at(hour), 9)).unwrap();
        }
        let stats = cache.stats().unwrap();
        assert_eq!(stats.artifacts, 2);
        assert_eq!(stats.newest, Some(at(12)));

        let loaded = cache.load_latest(at(13)).unwrap();
        assert_eq!(loaded.fetched_at, at(12));
        assert_eq!(loaded.requirement.majority_required, Some(5));
    }

    #[test]
    fn test_corrupt_artifact_is_deleted() {
        let store = Arc::new(MemorySnapshotStore::new());
        let cache = manager(store.clone(), 5);
        cache.save(&empty_snapshot(at(10), 3)).unwrap();
        store
            .write(&CacheManager::artifact_name(at(11)), b"{\"schema_version\": 1")
            .unwrap();

        // falls back to the older valid artifact
        let loaded = cache.load_latest(at(12)).unwrap();
        assert_eq!(loaded.fetched_at, at(10));
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_validate_rejects() {
        let cache = manager(Arc::new(MemorySnapshotStore::new()), 5);
        let now = at(12);

        let mut missing = serde_json::to_value(empty_snapshot(at(11), 3)).unwrap();
        missing.as_object_mut().unwrap().remove("index");
        let err = cache
            .validate(&serde_json::to_vec(&missing).unwrap(), now)
            .unwrap_err();
        assert!(err.to_string().contains("index"));

        let mut version = empty_snapshot(at(11), 3);
        version.schema_version = 99;
        assert!(cache.validate(&serde_json::to_vec(&version).unwrap(), now).is_err());

        let future = empty_snapshot(at(13), 3);
        assert!(cache.validate(&serde_json::to_vec(&future).unwrap(), now).is_err());

        let old = empty_snapshot(now - Duration::days(8), 3);
        assert!(cache.validate(&serde_json::to_vec(&old).unwrap(), now).is_err());

        assert!(cache.validate(b"[1, 2]", now).is_err());

        let mut mismatched = empty_snapshot(at(11), 3);
        mismatched.requirement = crate::authority::ConsensusRequirement::for_count(9);
        assert!(cache
            .validate(&serde_json::to_vec(&mismatched).unwrap(), now)
            .is_err());

        let ok = empty_snapshot(at(11), 0);
        assert!(cache.validate(&serde_json::to_vec(&ok).unwrap(), now).is_ok());
    }

    #[test]
    fn test_out_of_range_max_age_is_clamped() {
        for age in [i64::MAX, -1] {
            let config = MonitorConfig {
                max_cache_age_secs: age,
                ..MonitorConfig::default()
            };
            let cache = CacheManager::new(Arc::new(MemorySnapshotStore::new()), &config);
            let now = at(12);
            let recent = serde_json::to_vec(&empty_snapshot(at(11), 3)).unwrap();
            assert!(cache.validate(&recent, now).is_ok());
        }
    }

    #[test]
    fn test_empty_cache_is_cold_start() {
        let cache = manager(Arc::new(MemorySnapshotStore::new()), 5);
        assert!(cache.load_latest(Utc::now()).is_none());
    }
}
