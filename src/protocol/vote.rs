//! Vote document parsing
//!
//! Turns one authority's vote into a [`VoteDocument`]. The parser is a
//! line-driven state machine: header keywords fill document fields, an `r`
//! line opens a relay record and the `a`/`s`/`w`/`stats` lines that follow
//! attach to it until the next `r` line.
//!
//! A malformed relay line is skipped with a warning; it never aborts the
//! document. Only a structurally unusable vote (no `dir-source`, not a vote,
//! no relays at all) is rejected.

use super::{parse_dir_time, Fingerprint};
use crate::error::{HealthError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{Ipv4Addr, SocketAddr};

/// A `flag-thresholds` value
///
/// Numeric values are parsed (`98.000%` becomes `0.98`); anything else is
/// kept verbatim so the key is never lost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdValue {
    Number(f64),
    Raw(String),
}

impl ThresholdValue {
    pub fn parse(raw: &str) -> Self {
        let parsed = match raw.strip_suffix('%') {
            Some(percent) => percent.parse::<f64>().ok().map(|p| p / 100.0),
            None => raw.parse::<f64>().ok(),
        };
        match parsed {
            Some(n) if n.is_finite() => ThresholdValue::Number(n),
            _ => ThresholdValue::Raw(raw.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ThresholdValue::Number(n) => Some(*n),
            ThresholdValue::Raw(_) => None,
        }
    }
}

/// Per-relay history an authority reports on its `stats` line
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayStats {
    /// Weighted fractional uptime (0.0 - 1.0)
    pub wfu: Option<f64>,
    /// Time known, seconds
    pub tk: Option<u64>,
    /// Mean time between failures, seconds
    pub mtbf: Option<u64>,
}

/// One relay as seen by one authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteEntry {
    pub nickname: String,
    pub ipv4: Ipv4Addr,
    pub or_port: u16,
    pub dir_port: Option<u16>,
    pub ipv6: Option<SocketAddr>,
    pub flags: BTreeSet<String>,
    /// `w Bandwidth=` value in KB/s
    pub bandwidth: Option<u64>,
    /// Whether the bandwidth came from a bandwidth authority measurement
    pub measured: bool,
    /// `Measured=<n>` value when the authority publishes it separately
    #[serde(default)]
    pub measured_bandwidth: Option<u64>,
    #[serde(default)]
    pub stats: Option<RelayStats>,
    pub published: Option<DateTime<Utc>>,
}

impl VoteEntry {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }
}

/// A non-fatal problem found while parsing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseWarning {
    /// 1-based line number
    pub line: usize,
    pub message: String,
}

/// A parsed vote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteDocument {
    /// Voting authority nickname (from `dir-source`)
    pub authority: String,
    /// Authority v3 identity (from `dir-source`)
    pub authority_identity: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub valid_after: Option<DateTime<Utc>>,
    pub known_flags: BTreeSet<String>,
    /// This authority's own flag thresholds
    pub flag_thresholds: BTreeMap<String, ThresholdValue>,
    /// Vote references a bandwidth file (the voter is a bandwidth authority)
    pub has_bandwidth_file: bool,
    pub relays: BTreeMap<Fingerprint, VoteEntry>,
    pub warnings: Vec<ParseWarning>,
}

impl VoteDocument {
    pub fn relay(&self, fingerprint: &Fingerprint) -> Option<&VoteEntry> {
        self.relays.get(fingerprint)
    }

    /// Numeric threshold, if this authority published one
    pub fn threshold(&self, key: &str) -> Option<f64> {
        self.flag_thresholds.get(key).and_then(ThresholdValue::as_f64)
    }

    /// Any relay carries a `Measured` bandwidth
    pub fn has_measured_entries(&self) -> bool {
        self.relays.values().any(|r| r.measured)
    }

    /// Metadata without the relay bodies
    pub fn header(&self) -> VoteHeader {
        VoteHeader {
            authority: self.authority.clone(),
            authority_identity: self.authority_identity.clone(),
            published: self.published,
            valid_after: self.valid_after,
            known_flags: self.known_flags.clone(),
            flag_thresholds: self.flag_thresholds.clone(),
            has_bandwidth_file: self.has_bandwidth_file,
            relay_count: self.relays.len(),
            warning_count: self.warnings.len(),
        }
    }
}

/// Vote metadata kept in the published snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteHeader {
    pub authority: String,
    pub authority_identity: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub valid_after: Option<DateTime<Utc>>,
    pub known_flags: BTreeSet<String>,
    pub flag_thresholds: BTreeMap<String, ThresholdValue>,
    pub has_bandwidth_file: bool,
    pub relay_count: usize,
    pub warning_count: usize,
}

/// Where in the document the parser is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Header,
    Relays,
    Footer,
}

/// Vote parser
pub struct VoteParser;

impl VoteParser {
    /// Parse raw vote bytes; invalid UTF-8 is replaced rather than rejected
    pub fn parse(data: &[u8]) -> Result<VoteDocument> {
        Self::parse_text(&String::from_utf8_lossy(data))
    }

    /// Parse vote text
    pub fn parse_text(text: &str) -> Result<VoteDocument> {
        let mut doc = VoteDocument {
            authority: String::new(),
            authority_identity: None,
            published: None,
            valid_after: None,
            known_flags: BTreeSet::new(),
            flag_thresholds: BTreeMap::new(),
            has_bandwidth_file: false,
            relays: BTreeMap::new(),
            warnings: Vec::new(),
        };
        let mut have_dir_source = false;
        let mut section = Section::Header;
        let mut in_object = false;
        let mut current: Option<(Fingerprint, VoteEntry)> = None;

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();

            if line.is_empty() {
                continue;
            }
            // Skip signature and key blocks wholesale
            if line.starts_with("-----BEGIN") {
                in_object = true;
                continue;
            }
            if line.starts_with("-----END") {
                in_object = false;
                continue;
            }
            if in_object || section == Section::Footer {
                continue;
            }

            let (keyword, rest) = match line.split_once(char::is_whitespace) {
                Some((k, r)) => (k, r.trim()),
                None => (line, ""),
            };

            match keyword {
                "r" => {
                    section = Section::Relays;
                    if let Some((fp, entry)) = current.take() {
                        Self::insert_relay(&mut doc, fp, entry, line_no);
                    }
                    match Self::parse_r_line(rest) {
                        Ok(parsed) => current = Some(parsed),
                        Err(message) => Self::warn(&mut doc, line_no, message),
                    }
                }
                "a" | "s" | "w" | "stats" if section == Section::Relays => {
                    // Lines after a rejected `r` line have nothing to attach to
                    let Some((_, entry)) = current.as_mut() else {
                        continue;
                    };
                    let outcome = match keyword {
                        "a" => Self::apply_a_line(entry, rest),
                        "s" => {
                            entry.flags = rest.split_whitespace().map(str::to_string).collect();
                            Ok(())
                        }
                        "w" => Self::apply_w_line(entry, rest),
                        _ => {
                            entry.stats = Some(Self::parse_stats(rest));
                            Ok(())
                        }
                    };
                    if let Err(message) = outcome {
                        Self::warn(&mut doc, line_no, message);
                    }
                }
                "directory-footer" => {
                    if let Some((fp, entry)) = current.take() {
                        Self::insert_relay(&mut doc, fp, entry, line_no);
                    }
                    section = Section::Footer;
                }
                _ if section == Section::Header => {
                    Self::apply_header_line(&mut doc, &mut have_dir_source, keyword, rest, line_no)?;
                }
                _ => {}
            }
        }

        if let Some((fp, entry)) = current.take() {
            let last = text.lines().count();
            Self::insert_relay(&mut doc, fp, entry, last);
        }

        if !have_dir_source {
            return Err(HealthError::Validation("vote has no dir-source line".into()));
        }
        if doc.relays.is_empty() {
            return Err(HealthError::Validation(format!(
                "vote from {} contains no relay entries",
                doc.authority
            )));
        }

        log::debug!(
            "Parsed vote from {}: {} relays, {} warnings",
            doc.authority,
            doc.relays.len(),
            doc.warnings.len()
        );
        Ok(doc)
    }

    fn apply_header_line(
        doc: &mut VoteDocument,
        have_dir_source: &mut bool,
        keyword: &str,
        rest: &str,
        line_no: usize,
    ) -> Result<()> {
        match keyword {
            "vote-status" => {
                if rest != "vote" {
                    return Err(HealthError::Validation(format!(
                        "document is a {:?}, not a vote",
                        rest
                    )));
                }
            }
            "published" => doc.published = Self::parse_time_field(doc, rest, line_no),
            "valid-after" => doc.valid_after = Self::parse_time_field(doc, rest, line_no),
            "known-flags" => {
                doc.known_flags = rest.split_whitespace().map(str::to_string).collect();
            }
            "flag-thresholds" => {
                for pair in rest.split_whitespace() {
                    match pair.split_once('=') {
                        Some((key, value)) if !key.is_empty() => {
                            doc.flag_thresholds
                                .insert(key.to_string(), ThresholdValue::parse(value));
                        }
                        _ => Self::warn(doc, line_no, format!("bad flag-threshold {:?}", pair)),
                    }
                }
            }
            "bandwidth-file-headers" | "bandwidth-file-digest" => doc.has_bandwidth_file = true,
            "dir-source" if !*have_dir_source => {
                let mut parts = rest.split_whitespace();
                match (parts.next(), parts.next()) {
                    (Some(nickname), identity) => {
                        doc.authority = nickname.to_string();
                        doc.authority_identity = identity.map(str::to_uppercase);
                        *have_dir_source = true;
                    }
                    _ => Self::warn(doc, line_no, "empty dir-source line".into()),
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn parse_time_field(doc: &mut VoteDocument, rest: &str, line_no: usize) -> Option<DateTime<Utc>> {
        let mut parts = rest.split_whitespace();
        let parsed = match (parts.next(), parts.next()) {
            (Some(date), Some(time)) => parse_dir_time(date, time),
            _ => None,
        };
        if parsed.is_none() {
            Self::warn(doc, line_no, format!("bad timestamp {:?}", rest));
        }
        parsed
    }

    /// Parse "r" line
    /// Format: r nickname identity [digest] date time IP ORPort DirPort
    fn parse_r_line(rest: &str) -> std::result::Result<(Fingerprint, VoteEntry), String> {
        let parts: Vec<&str> = rest.split_whitespace().collect();

        // 7 fields without the descriptor digest, 8 with it
        let (date, time, ip, or_port, dir_port) = match parts.len() {
            7 => (parts[2], parts[3], parts[4], parts[5], parts[6]),
            8 => (parts[3], parts[4], parts[5], parts[6], parts[7]),
            n => return Err(format!("r line has {} fields, expected 7 or 8", n)),
        };

        let fingerprint = Fingerprint::from_base64(parts[1])
            .ok_or_else(|| format!("bad identity {:?} on r line", parts[1]))?;
        let ipv4: Ipv4Addr = ip
            .parse()
            .map_err(|_| format!("bad IPv4 address {:?} on r line", ip))?;
        let or_port: u16 = or_port
            .parse()
            .map_err(|_| format!("bad OR port {:?} on r line", or_port))?;
        let dir_port: u16 = dir_port
            .parse()
            .map_err(|_| format!("bad dir port {:?} on r line", dir_port))?;

        Ok((
            fingerprint,
            VoteEntry {
                nickname: parts[0].to_string(),
                ipv4,
                or_port,
                dir_port: (dir_port != 0).then_some(dir_port),
                ipv6: None,
                flags: BTreeSet::new(),
                bandwidth: None,
                measured: false,
                measured_bandwidth: None,
                stats: None,
                published: parse_dir_time(date, time),
            },
        ))
    }

    /// Parse "a" line
    /// Format: a [2001:db8::1]:9001
    fn apply_a_line(entry: &mut VoteEntry, rest: &str) -> std::result::Result<(), String> {
        let addr: SocketAddr = rest
            .parse()
            .map_err(|_| format!("bad address {:?} on a line", rest))?;
        // Only the first IPv6 OR address is kept
        if addr.is_ipv6() && entry.ipv6.is_none() {
            entry.ipv6 = Some(addr);
        }
        Ok(())
    }

    /// Parse "w" line
    /// Format: w Bandwidth=12345 [Measured | Measured=12000] [Unmeasured=1]
    fn apply_w_line(entry: &mut VoteEntry, rest: &str) -> std::result::Result<(), String> {
        let mut bandwidth = None;
        for token in rest.split_whitespace() {
            match token.split_once('=') {
                Some(("Bandwidth", value)) => {
                    bandwidth = Some(
                        value
                            .parse::<u64>()
                            .map_err(|_| format!("bad Bandwidth {:?} on w line", value))?,
                    );
                }
                Some(("Measured", value)) => {
                    entry.measured = true;
                    entry.measured_bandwidth = value.parse().ok();
                }
                Some(("Unmeasured", "1")) => entry.measured = false,
                None if token == "Measured" => entry.measured = true,
                _ => {}
            }
        }
        match bandwidth {
            Some(bw) => {
                entry.bandwidth = Some(bw);
                Ok(())
            }
            None => Err("w line without Bandwidth".into()),
        }
    }

    /// Parse "stats" line
    /// Format: stats wfu=0.999 tk=2540880 mtbf=2540880
    fn parse_stats(rest: &str) -> RelayStats {
        let mut stats = RelayStats::default();
        for token in rest.split_whitespace() {
            match token.split_once('=') {
                Some(("wfu", v)) => stats.wfu = v.parse().ok(),
                Some(("tk", v)) => stats.tk = v.parse().ok(),
                Some(("mtbf", v)) => stats.mtbf = v.parse().ok(),
                _ => {}
            }
        }
        stats
    }

    fn insert_relay(doc: &mut VoteDocument, fp: Fingerprint, entry: VoteEntry, line_no: usize) {
        if doc.relays.insert(fp.clone(), entry).is_some() {
            Self::warn(doc, line_no, format!("duplicate relay {}", fp));
        }
    }

    fn warn(doc: &mut VoteDocument, line: usize, message: String) {
        log::warn!(
            "⚠️ Vote {} line {}: {}",
            if doc.authority.is_empty() { "?" } else { doc.authority.as_str() },
            line,
            message
        );
        doc.warnings.push(ParseWarning { line, message });
    }
}
