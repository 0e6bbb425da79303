//! Published cycle snapshots
//!
//! A cycle builds one [`CycleSnapshot`] and publishes it with a single
//! pointer swap. Readers load the pointer and work on an immutable `Arc`;
//! they see either the previous snapshot or the new one, never a mix.

use crate::authority::{Authority, ConsensusRequirement};
use crate::index::RelayIndex;
use crate::network::FetchFailure;
use crate::protocol::{BandwidthHeader, VoteHeader};
use crate::thresholds::ThresholdTable;
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Version of the persisted snapshot layout
pub const SCHEMA_VERSION: u32 = 1;

/// Everything one cycle produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSnapshot {
    pub schema_version: u32,
    pub fetched_at: DateTime<Utc>,
    /// Latest `valid-after` among the votes
    #[serde(default)]
    pub valid_after: Option<DateTime<Utc>>,
    pub authorities: Vec<Authority>,
    pub requirement: ConsensusRequirement,
    pub votes: Vec<VoteHeader>,
    pub bandwidth: Vec<BandwidthHeader>,
    /// Bandwidth authorities whose file did not arrive
    #[serde(default)]
    pub bandwidth_unavailable: BTreeSet<String>,
    pub index: RelayIndex,
    pub thresholds: ThresholdTable,
    #[serde(default)]
    pub fetch_failures: Vec<FetchFailure>,
    /// Cycle-level notes shown with every lookup
    #[serde(default)]
    pub notes: Vec<String>,
}

impl CycleSnapshot {
    /// Whether `authority`'s vote made it into this snapshot
    pub fn vote_available(&self, authority: &str) -> bool {
        self.votes
            .iter()
            .any(|v| v.authority.eq_ignore_ascii_case(authority))
    }

    /// Whether `authority` published bandwidth measurements we hold
    pub fn bandwidth_available(&self, authority: &str) -> bool {
        self.bandwidth
            .iter()
            .any(|b| b.authority.eq_ignore_ascii_case(authority))
    }

    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.fetched_at).num_seconds().max(0)
    }
}

/// A snapshot as readers see it
#[derive(Debug, Clone)]
pub struct PublishedSnapshot {
    pub snapshot: Arc<CycleSnapshot>,
    /// Served from a previous cycle or from cache
    pub stale: bool,
}

/// `CycleMetadata` accessor result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleMetadata {
    pub available: bool,
    pub fetched_at: Option<DateTime<Utc>>,
    pub stale: bool,
    pub authority_count: usize,
    pub majority_required: Option<usize>,
    pub age_secs: Option<i64>,
}

impl CycleMetadata {
    /// Metadata when nothing has ever been published
    pub fn unavailable() -> Self {
        Self {
            available: false,
            fetched_at: None,
            stale: true,
            authority_count: 0,
            majority_required: None,
            age_secs: None,
        }
    }

    pub fn for_snapshot(published: &PublishedSnapshot, now: DateTime<Utc>) -> Self {
        let snap = &published.snapshot;
        Self {
            available: true,
            fetched_at: Some(snap.fetched_at),
            stale: published.stale,
            authority_count: snap.requirement.authority_count,
            majority_required: snap.requirement.majority_required,
            age_secs: Some(snap.age_secs(now)),
        }
    }
}

/// The one shared mutable thing: the current snapshot pointer
#[derive(Default)]
pub struct SnapshotHandle {
    current: ArcSwapOption<PublishedSnapshot>,
}

impl SnapshotHandle {
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
        }
    }

    /// Swap in a new snapshot
    pub fn publish(&self, snapshot: Arc<CycleSnapshot>, stale: bool) {
        log::debug!(
            "Publishing snapshot fetched at {} (stale: {})",
            snapshot.fetched_at,
            stale
        );
        self.current
            .store(Some(Arc::new(PublishedSnapshot { snapshot, stale })));
    }

    /// Re-publish the current snapshot marked stale; false if there is none
    pub fn mark_stale(&self) -> bool {
        match self.load() {
            Some(current) => {
                self.publish(Arc::clone(&current.snapshot), true);
                true
            }
            None => false,
        }
    }

    pub fn load(&self) -> Option<Arc<PublishedSnapshot>> {
        self.current.load_full()
    }

    pub fn metadata(&self, now: DateTime<Utc>) -> CycleMetadata {
        match self.load() {
            Some(published) => CycleMetadata::for_snapshot(&published, now),
            None => CycleMetadata::unavailable(),
        }
    }
}
