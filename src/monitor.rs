//! Hourly refresh cycle
//!
//! `DirectoryMonitor` ties the pieces together:
//!
//! ```text
//! population -> AuthorityRegistry
//!            -> DocumentFetcher (votes + bandwidth files, bounded pool)
//!            -> VoteParser / BandwidthParser
//!            -> RelayIndex + ThresholdTable
//!            -> CycleSnapshot -> SnapshotHandle (atomic swap) + CacheManager
//! ```
//!
//! A cycle never returns an error. Partial failures shrink the snapshot and
//! are itemised in the report; a total failure keeps serving the previous
//! snapshot, or the newest cache artifact, marked stale.

use crate::authority::{AuthorityRegistry, RelayRecord};
use crate::config::MonitorConfig;
use crate::diagnostics::{DiagnosticsFormatter, DiagnosticsResult};
use crate::error::{HealthError, Result};
use crate::index::RelayIndex;
use crate::network::{
    CycleFetch, DocumentFetcher, DocumentKind, DocumentSource, FetchFailure, FetchStats,
    HttpDocumentSource,
};
use crate::protocol::{BandwidthFile, BandwidthParser, VoteDocument, VoteParser};
use crate::snapshot::{CycleMetadata, CycleSnapshot, SnapshotHandle, SCHEMA_VERSION};
use crate::storage::{CacheManager, FileSnapshotStore, SnapshotStore};
use crate::thresholds::ThresholdTable;
use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// How a cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Every authority contributed
    Fresh,
    /// Published, but some contributions are missing
    Degraded,
    /// Nothing retrieved; serving an older snapshot
    Stale,
    /// Nothing retrieved and nothing to fall back on
    Unavailable,
}

/// Summary of one cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub started_at: DateTime<Utc>,
    pub authority_count: usize,
    pub votes_used: usize,
    pub bandwidth_files_used: usize,
    pub relay_count: usize,
    pub stats: FetchStats,
    pub failures: Vec<FetchFailure>,
    pub notes: Vec<String>,
    /// Name of the cache artifact written, if any
    pub cache_artifact: Option<String>,
    #[serde(skip)]
    pub error: Option<HealthError>,
}

/// Supplies the relay population authorities are discovered from
#[async_trait]
pub trait PopulationSource: Send + Sync {
    async fn population(&self) -> Result<Vec<RelayRecord>>;
}

/// A fixed population
#[derive(Debug, Clone, Default)]
pub struct StaticPopulation(pub Vec<RelayRecord>);

#[async_trait]
impl PopulationSource for StaticPopulation {
    async fn population(&self) -> Result<Vec<RelayRecord>> {
        Ok(self.0.clone())
    }
}

/// Parsed, attributed documents for one cycle
struct CycleDocuments {
    votes: Vec<VoteDocument>,
    bandwidth: Vec<BandwidthFile>,
    bandwidth_unavailable: BTreeSet<String>,
    notes: Vec<String>,
}

/// Owns the fetcher, the cache and the published snapshot
pub struct DirectoryMonitor {
    config: MonitorConfig,
    fetcher: DocumentFetcher,
    cache: CacheManager,
    snapshot: SnapshotHandle,
    formatter: DiagnosticsFormatter,
}

impl DirectoryMonitor {
    pub fn new(
        config: MonitorConfig,
        source: Arc<dyn DocumentSource>,
        store: Arc<dyn SnapshotStore>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            fetcher: DocumentFetcher::new(source, config.clone()),
            cache: CacheManager::new(store, &config),
            snapshot: SnapshotHandle::new(),
            formatter: DiagnosticsFormatter::new(config.deviation_warning_percent),
            config,
        })
    }

    /// Monitor fetching over HTTP and caching under `config.cache_dir`
    pub fn with_http(config: MonitorConfig) -> Result<Self> {
        let source = Arc::new(HttpDocumentSource::new(&config)?);
        let store = Arc::new(FileSnapshotStore::new(config.cache_dir.clone()));
        log::info!(
            "🚀 Monitor created for {} (cache {})",
            config.collector_url,
            config.cache_dir.display()
        );
        Self::new(config, source, store)
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Publish the newest valid cache artifact as stale data
    pub fn warm_start(&self) -> bool {
        match self.cache.load_latest(Utc::now()) {
            Some(snapshot) => {
                log::info!(
                    "♻️ Warm start from snapshot fetched at {}",
                    snapshot.fetched_at
                );
                self.snapshot.publish(Arc::new(snapshot), true);
                true
            }
            None => false,
        }
    }

    /// `GetDiagnostics`: never fails, whatever the fingerprint
    pub fn get_diagnostics(&self, fingerprint: &str) -> DiagnosticsResult {
        let published = self.snapshot.load();
        self.formatter
            .diagnose(published.as_deref(), fingerprint, Utc::now())
    }

    pub fn cycle_metadata(&self) -> CycleMetadata {
        self.snapshot.metadata(Utc::now())
    }

    /// The currently published snapshot
    pub fn current_snapshot(&self) -> Option<Arc<CycleSnapshot>> {
        self.snapshot.load().map(|p| Arc::clone(&p.snapshot))
    }

    /// Run one cycle against a freshly supplied relay population
    pub async fn run_cycle(&self, population: &[RelayRecord]) -> CycleReport {
        let registry = AuthorityRegistry::discover(population);
        self.run_with_registry(registry).await
    }

    /// Run one cycle with an already-built authority registry
    pub async fn run_with_registry(&self, mut registry: AuthorityRegistry) -> CycleReport {
        let started_at = Utc::now();
        log::info!(
            "🔄 Starting cycle with {} authorities (majority {:?})",
            registry.len(),
            registry.requirement().majority_required
        );

        if registry.is_empty() {
            log::warn!("⚠️ No authorities discovered; publishing an empty snapshot");
            let note = "no authorities discovered".to_string();
            let snapshot = CycleSnapshot {
                schema_version: SCHEMA_VERSION,
                fetched_at: started_at,
                valid_after: None,
                authorities: Vec::new(),
                requirement: registry.requirement(),
                votes: Vec::new(),
                bandwidth: Vec::new(),
                bandwidth_unavailable: BTreeSet::new(),
                index: RelayIndex::default(),
                thresholds: ThresholdTable::default(),
                fetch_failures: Vec::new(),
                notes: Vec::new(),
            };
            // Memory only: an empty artifact must not shadow the last good one
            self.snapshot.publish(Arc::new(snapshot), false);
            return CycleReport {
                outcome: CycleOutcome::Degraded,
                started_at,
                authority_count: 0,
                votes_used: 0,
                bandwidth_files_used: 0,
                relay_count: 0,
                stats: FetchStats::default(),
                failures: Vec::new(),
                notes: vec![note],
                cache_artifact: None,
                error: None,
            };
        }

        let fetch = self.fetcher.fetch_cycle(registry.len()).await;
        let failures = fetch.failures();
        let names = self.identity_names();
        let docs = Self::attribute(&mut registry, &fetch, &names);

        if fetch.retrieved_count() == 0 || docs.votes.is_empty() {
            return self.fall_back(started_at, &registry, fetch, failures, docs.notes, &names);
        }

        let index = RelayIndex::build(&docs.votes, &docs.bandwidth);
        let thresholds = ThresholdTable::aggregate(&docs.votes, &self.config.constant_thresholds);

        // Registered authorities' failures already show in their rows, so
        // the snapshot only keeps the ones no row accounts for
        let mut notes = docs.notes;
        let mut report_notes = notes.clone();
        for failure in &failures {
            let note = failure_note(failure, &names);
            let has_row = failure
                .authority_key
                .as_deref()
                .is_some_and(|key| registry.by_nickname(resolve_authority(key, &names)).is_some());
            if !has_row {
                notes.push(note.clone());
            }
            report_notes.push(note);
        }
        let complete = failures.is_empty()
            && report_notes.is_empty()
            && docs.votes.len() == registry.len()
            && docs.bandwidth_unavailable.is_empty();

        let snapshot = CycleSnapshot {
            schema_version: SCHEMA_VERSION,
            fetched_at: started_at,
            valid_after: docs.votes.iter().filter_map(|v| v.valid_after).max(),
            requirement: registry.requirement(),
            authorities: registry.into_authorities(),
            votes: docs.votes.iter().map(VoteDocument::header).collect(),
            bandwidth: docs.bandwidth.iter().map(BandwidthFile::header).collect(),
            bandwidth_unavailable: docs.bandwidth_unavailable,
            index,
            thresholds,
            fetch_failures: failures.clone(),
            notes,
        };

        let report = CycleReport {
            outcome: if complete {
                CycleOutcome::Fresh
            } else {
                CycleOutcome::Degraded
            },
            started_at,
            authority_count: snapshot.authorities.len(),
            votes_used: snapshot.votes.len(),
            bandwidth_files_used: snapshot.bandwidth.len(),
            relay_count: snapshot.index.len(),
            stats: fetch.stats,
            failures,
            notes: report_notes,
            cache_artifact: None,
            error: None,
        };

        let cache_artifact = self.publish(snapshot);
        log::info!(
            "✅ Cycle complete: {:?}, {} votes, {} bandwidth files, {} relays",
            report.outcome,
            report.votes_used,
            report.bandwidth_files_used,
            report.relay_count
        );
        CycleReport {
            cache_artifact,
            ..report
        }
    }

    /// v3 identity -> nickname, as learned from the current snapshot's votes
    fn identity_names(&self) -> HashMap<String, String> {
        let Some(current) = self.current_snapshot() else {
            return HashMap::new();
        };
        current
            .votes
            .iter()
            .filter_map(|v| {
                let identity = v.authority_identity.as_ref()?;
                Some((identity.to_uppercase(), v.authority.clone()))
            })
            .collect()
    }

    /// Parse fetched bodies and map them onto registered authorities
    fn attribute(
        registry: &mut AuthorityRegistry,
        fetch: &CycleFetch,
        names: &HashMap<String, String>,
    ) -> CycleDocuments {
        let mut notes = Vec::new();

        let mut votes: Vec<VoteDocument> = Vec::new();
        for (name, body) in fetch.votes.successes() {
            let mut vote = match VoteParser::parse_text(body) {
                Ok(vote) => vote,
                Err(e) => {
                    log::warn!("⚠️ Dropping vote {}: {}", name.file_name, e);
                    notes.push(format!(
                        "authority {}: vote unusable ({})",
                        resolve_authority(&name.authority_key, names),
                        e
                    ));
                    continue;
                }
            };
            let Some(auth) = registry.by_nickname(&vote.authority) else {
                log::warn!(
                    "⚠️ Dropping vote from unregistered authority {}",
                    vote.authority
                );
                notes.push(format!(
                    "vote from unregistered authority {} ignored",
                    vote.authority
                ));
                continue;
            };
            if votes.iter().any(|v| v.authority == auth.nickname) {
                log::warn!("⚠️ Duplicate vote from {}, keeping the first", auth.nickname);
                continue;
            }
            if !vote.warnings.is_empty() {
                log::warn!(
                    "⚠️ Vote from {} had {} malformed lines",
                    auth.nickname,
                    vote.warnings.len()
                );
            }
            vote.authority = auth.nickname.clone();
            votes.push(vote);
        }

        // Bandwidth authorities: listed files plus votes that declare one
        for name in &fetch.bandwidth.selected {
            registry.mark_bandwidth_authority(&name.authority_key);
        }
        for vote in votes.iter().filter(|v| v.has_bandwidth_file) {
            registry.mark_bandwidth_authority(&vote.authority);
        }

        let mut bandwidth: Vec<BandwidthFile> = Vec::new();
        for (name, body) in fetch.bandwidth.successes() {
            let Some(auth) = registry.by_nickname(&name.authority_key) else {
                log::warn!(
                    "⚠️ Dropping bandwidth file from unregistered authority {}",
                    name.authority_key
                );
                notes.push(format!(
                    "bandwidth file from unregistered authority {} ignored",
                    name.authority_key
                ));
                continue;
            };
            match BandwidthParser::parse_text(&auth.nickname, body) {
                Ok(file) => bandwidth.push(file),
                Err(e) => {
                    log::warn!("⚠️ Dropping bandwidth file {}: {}", name.file_name, e);
                    notes.push(format!(
                        "authority {}: bandwidth file unusable ({})",
                        auth.nickname, e
                    ));
                }
            }
        }

        let bandwidth_unavailable = registry
            .authorities()
            .iter()
            .filter(|a| a.is_bandwidth_authority)
            .filter(|a| !bandwidth.iter().any(|b| b.authority == a.nickname))
            .map(|a| a.nickname.clone())
            .collect();

        CycleDocuments {
            votes,
            bandwidth,
            bandwidth_unavailable,
            notes,
        }
    }

    /// Total failure: keep serving what we have, marked stale
    fn fall_back(
        &self,
        started_at: DateTime<Utc>,
        registry: &AuthorityRegistry,
        fetch: CycleFetch,
        failures: Vec<FetchFailure>,
        mut notes: Vec<String>,
        names: &HashMap<String, String>,
    ) -> CycleReport {
        let error = HealthError::TotalCycleFailure {
            failures: failures.len(),
        };
        log::error!("❌ {}", error);
        notes.extend(failures.iter().map(|f| failure_note(f, names)));

        let outcome = if self.snapshot.mark_stale() {
            log::warn!("⚠️ Serving the previous snapshot as stale");
            CycleOutcome::Stale
        } else if let Some(cached) = self.cache.load_latest(started_at) {
            log::warn!(
                "⚠️ Serving cached snapshot from {} as stale",
                cached.fetched_at
            );
            self.snapshot.publish(Arc::new(cached), true);
            CycleOutcome::Stale
        } else {
            log::error!("❌ No snapshot to fall back on; diagnostics unavailable");
            CycleOutcome::Unavailable
        };

        CycleReport {
            outcome,
            started_at,
            authority_count: registry.len(),
            votes_used: 0,
            bandwidth_files_used: 0,
            relay_count: 0,
            stats: fetch.stats,
            failures,
            notes,
            cache_artifact: None,
            error: Some(error),
        }
    }

    /// Swap the snapshot in, then persist it
    fn publish(&self, snapshot: CycleSnapshot) -> Option<String> {
        let snapshot = Arc::new(snapshot);
        self.snapshot.publish(Arc::clone(&snapshot), false);
        match self.cache.save(&snapshot) {
            Ok(name) => Some(name),
            Err(e) => {
                log::warn!("⚠️ Snapshot not cached: {}", e);
                None
            }
        }
    }

    /// Run a cycle every hour at `cycle_offset_secs` past the hour
    ///
    /// When the population is unavailable the previous cycle's authorities
    /// are reused.
    pub async fn run_hourly(&self, population: &dyn PopulationSource) {
        loop {
            let delay = next_cycle_delay(Utc::now(), self.config.cycle_offset_secs);
            log::info!("⏰ Next cycle in {}s", delay.as_secs());
            tokio::time::sleep(delay).await;

            let report = match population.population().await {
                Ok(records) => self.run_cycle(&records).await,
                Err(e) => match self.current_snapshot() {
                    Some(previous) if !previous.authorities.is_empty() => {
                        log::warn!(
                            "⚠️ Relay population unavailable ({}); reusing {} authorities",
                            e,
                            previous.authorities.len()
                        );
                        let authorities = previous
                            .authorities
                            .iter()
                            .cloned()
                            .map(|mut a| {
                                a.is_bandwidth_authority = false;
                                a
                            })
                            .collect();
                        self.run_with_registry(AuthorityRegistry::from_authorities(authorities))
                            .await
                    }
                    _ => {
                        log::error!("❌ Relay population unavailable ({}); skipping cycle", e);
                        self.snapshot.mark_stale();
                        continue;
                    }
                },
            };
            log::info!("📊 Cycle outcome: {:?}", report.outcome);
        }
    }
}

/// Time until the next cycle: `offset_secs` past the next hour boundary,
/// or past the current one if that is still ahead
pub fn next_cycle_delay(now: DateTime<Utc>, offset_secs: u64) -> std::time::Duration {
    let offset = Duration::seconds((offset_secs % 3600) as i64);
    let hour_start = now.duration_trunc(Duration::hours(1)).unwrap_or(now);
    let mut next = hour_start + offset;
    if next <= now {
        next += Duration::hours(1);
    }
    (next - now).to_std().unwrap_or_default()
}

/// Nickname for a vote's v3 identity when one is known, else the key itself
fn resolve_authority<'a>(key: &'a str, names: &'a HashMap<String, String>) -> &'a str {
    names.get(key).map(String::as_str).unwrap_or(key)
}

fn failure_note(failure: &FetchFailure, names: &HashMap<String, String>) -> String {
    match (&failure.authority_key, failure.kind) {
        (Some(key), DocumentKind::Vote) => format!(
            "authority {}: vote fetch failed ({})",
            resolve_authority(key, names),
            failure.error
        ),
        (Some(key), DocumentKind::Bandwidth) => {
            format!("authority {}: bandwidth fetch failed ({})", key, failure.error)
        }
        (None, kind) => format!("{} listing fetch failed ({})", kind, failure.error),
    }
}
