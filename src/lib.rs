//! # Consensus Health
//!
//! Hourly diagnostics over the Tor directory authorities' votes and
//! bandwidth files, as mirrored by CollecTor.
//!
//! For any relay it answers: did it make consensus, what did each authority
//! vote for it, which flag thresholds does it meet, and how far apart are
//! the bandwidth measurements.
//!
//! ## Architecture
//!
//! ```text
//! DirectoryMonitor
//!   ↓
//! AuthorityRegistry (from the live relay population)
//!   ↓
//! DocumentFetcher (listing → latest hour → bounded fetch pool)
//!   ↓
//! VoteParser / BandwidthParser
//!   ↓
//! RelayIndex + ThresholdTable → CycleSnapshot (atomic swap, cached to disk)
//!   ↓
//! DiagnosticsFormatter (per-relay lookups, read-only)
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use consensus_health::{DirectoryMonitor, MonitorConfig, RelayRecord};
//!
//! # async fn example(population: Vec<RelayRecord>) -> consensus_health::Result<()> {
//! let monitor = DirectoryMonitor::with_http(MonitorConfig::default())?;
//! monitor.warm_start();
//! let report = monitor.run_cycle(&population).await;
//! println!("cycle: {:?}", report.outcome);
//!
//! let result = monitor.get_diagnostics("$9695DFC35FFEB861329B9F1AB04C46397020CE31");
//! println!("in consensus: {}", result.in_consensus());
//! # Ok(())
//! # }
//! ```
//!
//! Membership is approximated by a simple majority of votes; it is not the
//! directory protocol's bandwidth-weighted consensus computation.

// Modules
pub mod authority;
pub mod config;
pub mod diagnostics;
pub mod eligibility;
mod error;
pub mod index;
pub mod monitor;
pub mod network;
pub mod protocol;
pub mod snapshot;
pub mod storage;
pub mod thresholds;

pub use error::{ErrorCode, ErrorScope, HealthError, Result};
pub use authority::{Authority, AuthorityRegistry, ConsensusRequirement, RelayRecord};
pub use config::{ConstantThresholds, MonitorConfig};
pub use diagnostics::{
    AuthorityRow, BandwidthCell, DiagnosticsFormatter, DiagnosticsResult, NotObserved,
    NotObservedReason, RelayDiagnostics, CONSENSUS_NOTE,
};
pub use eligibility::{
    AuthorityCheck, CheckOutcome, ConstantCheck, FlagEligibility, Metric, RelayMetrics,
};
pub use index::{RelayIndex, RelayIndexEntry};
pub use monitor::{
    next_cycle_delay, CycleOutcome, CycleReport, DirectoryMonitor, PopulationSource,
    StaticPopulation,
};
pub use network::{
    DocumentFetcher, DocumentKind, DocumentSource, FetchFailure, FetchStats,
    HttpDocumentSource, MemoryDocumentSource,
};
pub use protocol::{
    BandwidthFile, BandwidthParser, Fingerprint, VoteDocument, VoteEntry, VoteParser,
};
pub use snapshot::{CycleMetadata, CycleSnapshot, SnapshotHandle};
pub use storage::{CacheManager, FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
pub use thresholds::{ConstantThreshold, Threshold, ThresholdTable, VariableThreshold};
