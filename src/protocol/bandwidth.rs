//! Bandwidth file parsing
//!
//! Bandwidth files are what a bandwidth authority feeds its vote. Layout:
//!
//! ```text
//! 1704110000                      <- unix timestamp
//! version=1.4.0                   <- header key=value lines
//! software=sbws
//! =====                           <- header terminator (optional)
//! bw=760 node_id=$96F5...  nick=relay1 ...
//! ```
//!
//! Only `bw` and `node_id` matter here. Lines that cannot be read are
//! skipped one by one.

use super::Fingerprint;
use crate::error::{HealthError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A parsed bandwidth file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandwidthFile {
    /// Authority nickname (from the file name)
    pub authority: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub version: Option<String>,
    /// Measured bandwidth in KB/s; absence means "not measured"
    pub relays: BTreeMap<Fingerprint, u64>,
    /// Relay lines that were skipped
    pub skipped_lines: usize,
}

impl BandwidthFile {
    pub fn header(&self) -> BandwidthHeader {
        BandwidthHeader {
            authority: self.authority.clone(),
            timestamp: self.timestamp,
            version: self.version.clone(),
            relay_count: self.relays.len(),
        }
    }
}

/// Bandwidth file metadata kept in the published snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandwidthHeader {
    pub authority: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub version: Option<String>,
    pub relay_count: usize,
}

/// Bandwidth file parser
pub struct BandwidthParser;

impl BandwidthParser {
    /// Parse raw bytes published by `authority`
    pub fn parse(authority: &str, data: &[u8]) -> Result<BandwidthFile> {
        Self::parse_text(authority, &String::from_utf8_lossy(data))
    }

    /// Parse bandwidth file text published by `authority`
    pub fn parse_text(authority: &str, text: &str) -> Result<BandwidthFile> {
        let mut file = BandwidthFile {
            authority: authority.to_string(),
            timestamp: None,
            version: None,
            relays: BTreeMap::new(),
            skipped_lines: 0,
        };

        for (idx, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }

            if file.timestamp.is_none() && file.relays.is_empty() && is_digits(line) {
                file.timestamp = line
                    .parse::<i64>()
                    .ok()
                    .and_then(|secs| DateTime::from_timestamp(secs, 0));
                continue;
            }
            if let Some(version) = line.strip_prefix("version=") {
                file.version = Some(version.to_string());
                continue;
            }
            // Header lines and terminators carry no node_id
            if !line.contains("node_id=") {
                continue;
            }

            match Self::parse_relay_line(line) {
                Ok(Some((fp, bw))) => {
                    file.relays.insert(fp, bw);
                }
                Ok(None) => {}
                Err(message) => {
                    file.skipped_lines += 1;
                    log::warn!(
                        "⚠️ Bandwidth file {} line {}: {}",
                        authority,
                        idx + 1,
                        message
                    );
                }
            }
        }

        if file.relays.is_empty() {
            return Err(HealthError::Validation(format!(
                "bandwidth file from {} contains no measurements",
                authority
            )));
        }

        log::debug!(
            "Parsed bandwidth file from {}: {} relays, {} skipped",
            authority,
            file.relays.len(),
            file.skipped_lines
        );
        Ok(file)
    }

    /// Parse one relay line; `Ok(None)` for relays the authority does not
    /// vote a measurement for
    fn parse_relay_line(line: &str) -> std::result::Result<Option<(Fingerprint, u64)>, String> {
        let mut bw = None;
        let mut node_id = None;
        let mut excluded = false;

        for token in line.split_whitespace() {
            match token.split_once('=') {
                Some(("bw", value)) => {
                    bw = Some(
                        value
                            .parse::<u64>()
                            .map_err(|_| format!("bad bw {:?}", value))?,
                    );
                }
                Some(("node_id", value)) => {
                    node_id = Some(
                        Fingerprint::from_hex(value)
                            .ok_or_else(|| format!("bad node_id {:?}", value))?,
                    );
                }
                Some(("vote", "0")) | Some(("unmeasured", "1")) => excluded = true,
                _ => {}
            }
        }

        match (node_id, bw) {
            (Some(_), Some(_)) if excluded => Ok(None),
            (Some(fp), Some(bw)) => Ok(Some((fp, bw))),
            (_, None) => Err("missing bw".into()),
            (None, _) => Err("missing node_id".into()),
        }
    }
}

fn is_digits(line: &str) -> bool {
    !line.is_empty() && line.bytes().all(|b| b.is_ascii_digit())
}
