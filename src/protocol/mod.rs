//! Directory document formats
//!
//! This module implements the line-oriented documents published by the
//! directory authorities:
//! - Relay fingerprints (base64 <-> hex)
//! - Votes (`network-status-version 3` vote documents)
//! - Bandwidth files (bandwidth-authority measurement output)
//!
//! Parsers here are pure: text in, structured value out. They never touch
//! the network or the filesystem.

mod bandwidth;
mod fingerprint;
mod vote;

pub use bandwidth::{BandwidthFile, BandwidthHeader, BandwidthParser};
pub use fingerprint::{Fingerprint, FINGERPRINT_BYTES};
pub use vote::{
    ParseWarning, RelayStats, ThresholdValue, VoteDocument, VoteEntry, VoteHeader, VoteParser,
};

use chrono::{DateTime, NaiveDateTime, Utc};

/// Flags that eligibility analysis looks at, in priority order
pub const TRACKED_FLAGS: [&str; 4] = ["Guard", "Stable", "Fast", "HSDir"];

/// Flag whose absence means the authority could not reach the relay
pub const RUNNING_FLAG: &str = "Running";

/// Capability flag identifying directory authorities
pub const AUTHORITY_FLAG: &str = "Authority";

/// Parse the `YYYY-MM-DD HH:MM:SS` timestamps used in directory documents
pub fn parse_dir_time(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let joined = format!("{} {}", date, time);
    NaiveDateTime::parse_from_str(&joined, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}
