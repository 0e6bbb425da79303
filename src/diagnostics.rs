//! Per-relay diagnostics
//!
//! A read-only view over a published snapshot. Lookups never fail: an
//! unknown, malformed or unavailable fingerprint still produces a
//! [`DiagnosticsResult`] that says why.

use crate::authority::Authority;
use crate::eligibility::{self, AuthorityCheck, FlagEligibility};
use crate::index::RelayIndexEntry;
use crate::protocol::{Fingerprint, VoteEntry, RUNNING_FLAG, TRACKED_FLAGS};
use crate::snapshot::{CycleMetadata, CycleSnapshot, PublishedSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Attached to every observed result
pub const CONSENSUS_NOTE: &str = "in_consensus is approximated by a majority of authority votes; \
     it is not the network's bandwidth-weighted consensus";

/// An authority's bandwidth contribution for one relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "value")]
pub enum BandwidthCell {
    /// The authority does not measure bandwidth
    NotApplicable,
    /// It does, but its file did not arrive this cycle
    Unavailable,
    /// Its file arrived without this relay
    NotMeasured,
    /// KB/s
    Measured(u64),
}

impl BandwidthCell {
    pub fn value(&self) -> Option<u64> {
        match self {
            BandwidthCell::Measured(v) => Some(*v),
            _ => None,
        }
    }
}

impl std::fmt::Display for BandwidthCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BandwidthCell::NotApplicable => write!(f, "N/A"),
            BandwidthCell::Unavailable => write!(f, "unavailable"),
            BandwidthCell::NotMeasured => write!(f, "not measured"),
            BandwidthCell::Measured(v) => write!(f, "{}", v),
        }
    }
}

/// One authority's row in the report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorityRow {
    pub authority: String,
    pub is_bandwidth_authority: bool,
    /// The authority's vote arrived this cycle
    pub vote_available: bool,
    /// The relay is listed in that vote
    pub voted: bool,
    /// `Running` assigned; `None` when not voted
    pub ipv4_reachable: Option<bool>,
    /// Only set when the authority tests IPv6 and the relay has an IPv6 address
    pub ipv6_reachable: Option<bool>,
    pub flags: BTreeSet<String>,
    /// `w Bandwidth=` from the vote, KB/s
    pub vote_bandwidth: Option<u64>,
    pub measured: bool,
    pub bandwidth: BandwidthCell,
    pub deviation_percent: Option<f64>,
    pub deviation_warning: bool,
    /// Check against this authority's own cutoff for the target flag
    pub threshold_check: Option<AuthorityCheck>,
}

/// Full report for a relay at least one authority voted on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayDiagnostics {
    pub fingerprint: Fingerprint,
    pub nickname: Option<String>,
    pub in_consensus: bool,
    pub consensus_note: String,
    pub vote_count: usize,
    pub authority_count: usize,
    pub majority_required: Option<usize>,
    pub per_authority: Vec<AuthorityRow>,
    pub flag_eligibility: Option<FlagEligibility>,
    /// Mean over authorities that measured the relay, KB/s
    pub bandwidth_mean: Option<f64>,
    pub issues: Vec<String>,
    pub advice: String,
    pub fetched_at: DateTime<Utc>,
    pub stale: bool,
    pub cache_age_secs: i64,
}

/// Why there is no full report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotObservedReason {
    /// No authority vote lists the relay
    AbsentFromVotes,
    /// The cycle discovered zero authorities
    NoAuthorities,
    /// No snapshot has been published or cached
    Unavailable,
    InvalidFingerprint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotObserved {
    pub fingerprint: String,
    pub reason: NotObservedReason,
    pub issues: Vec<String>,
    pub metadata: CycleMetadata,
}

impl NotObserved {
    pub fn in_consensus(&self) -> bool {
        false
    }
}

/// `GetDiagnostics` result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DiagnosticsResult {
    Observed(Box<RelayDiagnostics>),
    NotObserved(NotObserved),
}

impl DiagnosticsResult {
    pub fn in_consensus(&self) -> bool {
        match self {
            DiagnosticsResult::Observed(d) => d.in_consensus,
            DiagnosticsResult::NotObserved(n) => n.in_consensus(),
        }
    }

    pub fn issues(&self) -> &[String] {
        match self {
            DiagnosticsResult::Observed(d) => &d.issues,
            DiagnosticsResult::NotObserved(n) => &n.issues,
        }
    }

    pub fn is_stale(&self) -> bool {
        match self {
            DiagnosticsResult::Observed(d) => d.stale,
            DiagnosticsResult::NotObserved(n) => n.metadata.stale,
        }
    }

    pub fn observed(&self) -> Option<&RelayDiagnostics> {
        match self {
            DiagnosticsResult::Observed(d) => Some(d),
            DiagnosticsResult::NotObserved(_) => None,
        }
    }

    pub fn not_observed_reason(&self) -> Option<NotObservedReason> {
        match self {
            DiagnosticsResult::Observed(_) => None,
            DiagnosticsResult::NotObserved(n) => Some(n.reason),
        }
    }
}

/// Builds reports from the published snapshot
#[derive(Debug, Clone)]
pub struct DiagnosticsFormatter {
    deviation_warning_percent: f64,
}

impl DiagnosticsFormatter {
    pub fn new(deviation_warning_percent: f64) -> Self {
        Self {
            deviation_warning_percent,
        }
    }

    /// Report for `query` (hex, `$hex` or base64)
    pub fn diagnose(
        &self,
        published: Option<&PublishedSnapshot>,
        query: &str,
        now: DateTime<Utc>,
    ) -> DiagnosticsResult {
        let metadata = published
            .map(|p| CycleMetadata::for_snapshot(p, now))
            .unwrap_or_else(CycleMetadata::unavailable);
        let not_observed = |reason, issues: Vec<String>| {
            DiagnosticsResult::NotObserved(NotObserved {
                fingerprint: query.trim().to_string(),
                reason,
                issues,
                metadata: metadata.clone(),
            })
        };

        let Some(fingerprint) = Fingerprint::parse(query) else {
            return not_observed(
                NotObservedReason::InvalidFingerprint,
                vec![format!("invalid fingerprint: {:?}", query.trim())],
            );
        };
        let Some(published) = published else {
            return not_observed(
                NotObservedReason::Unavailable,
                vec!["directory data unavailable: no cycle has completed and no cache exists".into()],
            );
        };

        let snap = &published.snapshot;
        let mut context = Vec::new();
        if published.stale {
            context.push(stale_issue(snap, now));
        }
        context.extend(snap.notes.iter().cloned());

        if snap.authorities.is_empty() {
            context.insert(0, "no authorities discovered".into());
            return DiagnosticsResult::NotObserved(NotObserved {
                fingerprint: fingerprint.to_string(),
                reason: NotObservedReason::NoAuthorities,
                issues: context,
                metadata,
            });
        }

        let Some(entry) = snap.index.get(&fingerprint) else {
            context.insert(0, "not observed by any authority".into());
            return DiagnosticsResult::NotObserved(NotObserved {
                fingerprint: fingerprint.to_string(),
                reason: NotObservedReason::AbsentFromVotes,
                issues: context,
                metadata,
            });
        };

        let report = self.build(published, fingerprint, entry, context, now);
        DiagnosticsResult::Observed(Box::new(report))
    }

    fn build(
        &self,
        published: &PublishedSnapshot,
        fingerprint: Fingerprint,
        entry: &RelayIndexEntry,
        mut issues: Vec<String>,
        now: DateTime<Utc>,
    ) -> RelayDiagnostics {
        let snap = &published.snapshot;
        let requirement = snap.requirement;
        let vote_count = entry.vote_count();
        let in_consensus = requirement.is_met(vote_count);

        let eligibility =
            eligibility::analyze(entry, &snap.authorities, &snap.thresholds, &requirement);

        let mut rows: Vec<AuthorityRow> = snap
            .authorities
            .iter()
            .map(|auth| {
                let check = eligibility.as_ref().and_then(|e| {
                    e.per_authority
                        .iter()
                        .find(|c| c.authority == auth.nickname)
                        .cloned()
                });
                authority_row(snap, auth, entry, check)
            })
            .collect();

        let bandwidth_mean = self.apply_deviation(&mut rows);

        for row in &rows {
            if !row.vote_available {
                issues.push(format!("authority {}: vote unavailable this cycle", row.authority));
            } else if !row.voted {
                issues.push(format!("authority {}: relay not listed in vote", row.authority));
            } else if row.ipv4_reachable == Some(false) {
                issues.push(format!("authority {}: cannot reach relay", row.authority));
            }
            if row.ipv6_reachable == Some(false) {
                issues.push(format!("authority {}: cannot reach relay over IPv6", row.authority));
            }
        }

        if !in_consensus {
            match requirement.majority_required {
                Some(required) => issues.push(format!(
                    "listed in {}/{} votes, below the majority of {}",
                    vote_count, requirement.authority_count, required
                )),
                None => issues.push("no authorities discovered".into()),
            }
        }

        for flag in TRACKED_FLAGS {
            let assigned = entry.flag_count(flag);
            let missing = requirement.authority_count.saturating_sub(assigned);
            if assigned > 0 && missing > 0 {
                issues.push(format!(
                    "{}/{} authorities not assigning {}",
                    missing, requirement.authority_count, flag
                ));
            }
        }

        for row in &rows {
            if row.bandwidth == BandwidthCell::Unavailable {
                issues.push(format!("authority {}: bandwidth file unavailable", row.authority));
            }
            if let (true, Some(dev)) = (row.deviation_warning, row.deviation_percent) {
                issues.push(format!(
                    "authority {}: bandwidth measurement deviates {:+.1}% from mean",
                    row.authority, dev
                ));
            }
        }

        let advice = match &eligibility {
            Some(e) => e.advice.clone(),
            None => format!(
                "Relay holds {}; no flag changes needed.",
                TRACKED_FLAGS.join(", ")
            ),
        };

        RelayDiagnostics {
            nickname: entry.nickname().map(str::to_string),
            fingerprint,
            in_consensus,
            consensus_note: CONSENSUS_NOTE.to_string(),
            vote_count,
            authority_count: requirement.authority_count,
            majority_required: requirement.majority_required,
            per_authority: rows,
            flag_eligibility: eligibility,
            bandwidth_mean,
            issues,
            advice,
            fetched_at: snap.fetched_at,
            stale: published.stale,
            cache_age_secs: snap.age_secs(now),
        }
    }

    /// Fill in deviation from the mean of measured values; returns the mean
    fn apply_deviation(&self, rows: &mut [AuthorityRow]) -> Option<f64> {
        let measured: Vec<f64> = rows
            .iter()
            .filter_map(|r| r.bandwidth.value())
            .map(|v| v as f64)
            .collect();
        if measured.is_empty() {
            return None;
        }
        let mean = measured.iter().sum::<f64>() / measured.len() as f64;

        if mean > 0.0 {
            for row in rows.iter_mut() {
                if let Some(v) = row.bandwidth.value() {
                    let deviation = (v as f64 - mean) * 100.0 / mean;
                    row.deviation_percent = Some(deviation);
                    row.deviation_warning = deviation.abs() > self.deviation_warning_percent;
                }
            }
        }
        Some(mean)
    }
}

fn authority_row(
    snap: &CycleSnapshot,
    auth: &Authority,
    entry: &RelayIndexEntry,
    threshold_check: Option<AuthorityCheck>,
) -> AuthorityRow {
    let vote: Option<&VoteEntry> = entry.votes.get(&auth.nickname);
    let running = vote.map(|v| v.has_flag(RUNNING_FLAG));

    let bandwidth = if !auth.is_bandwidth_authority {
        BandwidthCell::NotApplicable
    } else if let Some(bw) = entry.bandwidth.get(&auth.nickname) {
        BandwidthCell::Measured(*bw)
    } else if snap.bandwidth_available(&auth.nickname) {
        BandwidthCell::NotMeasured
    } else {
        BandwidthCell::Unavailable
    };

    AuthorityRow {
        authority: auth.nickname.clone(),
        is_bandwidth_authority: auth.is_bandwidth_authority,
        vote_available: snap.vote_available(&auth.nickname),
        voted: vote.is_some(),
        ipv4_reachable: running,
        ipv6_reachable: vote
            .filter(|v| auth.tests_ipv6 && v.ipv6.is_some())
            .and(running),
        flags: vote.map(|v| v.flags.clone()).unwrap_or_default(),
        vote_bandwidth: vote.and_then(|v| v.bandwidth),
        measured: vote.is_some_and(|v| v.measured),
        bandwidth,
        deviation_percent: None,
        deviation_warning: false,
        threshold_check,
    }
}

fn stale_issue(snap: &CycleSnapshot, now: DateTime<Utc>) -> String {
    format!(
        "stale data: serving the cycle fetched at {} ({} minutes old)",
        snap.fetched_at.format("%Y-%m-%d %H:%M UTC"),
        snap.age_secs(now) / 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::ConsensusRequirement;
    use crate::index::RelayIndex;
    use crate::protocol::{BandwidthFile, BandwidthHeader, VoteDocument, VoteHeader};
    use crate::snapshot::tests::empty_snapshot;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn fp() -> Fingerprint {
        Fingerprint::from_hex(&"AB".repeat(20)).unwrap()
    }

    fn authority(nick: &str, n: u8, bw: bool) -> Authority {
        Authority {
            fingerprint: Fingerprint::from_hex(&format!("{:02X}", n).repeat(20)).unwrap(),
            nickname: nick.into(),
            address: None,
            dir_port: None,
            is_bandwidth_authority: bw,
            tests_ipv6: false,
        }
    }

    fn vote_with(authority: &str, flags: &[&str]) -> VoteDocument {
        let entry = VoteEntry {
            nickname: "relay".into(),
            ipv4: "1.2.3.4".parse().unwrap(),
            or_port: 9001,
            dir_port: None,
            ipv6: None,
            flags: flags.iter().map(|f| f.to_string()).collect(),
            bandwidth: Some(50000),
            measured: false,
            measured_bandwidth: None,
            stats: None,
            published: None,
        };
        VoteDocument {
            authority: authority.into(),
            authority_identity: None,
            published: None,
            valid_after: None,
            known_flags: BTreeSet::new(),
            flag_thresholds: BTreeMap::new(),
            has_bandwidth_file: false,
            relays: [(fp(), entry)].into_iter().collect(),
            warnings: Vec::new(),
        }
    }

    fn bw_file(authority: &str, value: u64) -> BandwidthFile {
        BandwidthFile {
            authority: authority.into(),
            timestamp: None,
            version: None,
            relays: [(fp(), value)].into_iter().collect(),
            skipped_lines: 0,
        }
    }

    fn published(
        authorities: Vec<Authority>,
        votes: Vec<VoteDocument>,
        bandwidth: Vec<BandwidthFile>,
        stale: bool,
    ) -> PublishedSnapshot {
        let mut snap = empty_snapshot(Utc::now(), authorities.len());
        snap.requirement = ConsensusRequirement::for_count(authorities.len());
        snap.authorities = authorities;
        snap.votes = votes.iter().map(VoteDocument::header).collect::<Vec<VoteHeader>>();
        snap.bandwidth = bandwidth
            .iter()
            .map(BandwidthFile::header)
            .collect::<Vec<BandwidthHeader>>();
        snap.index = RelayIndex::build(&votes, &bandwidth);
        PublishedSnapshot {
            snapshot: Arc::new(snap),
            stale,
        }
    }

    #[test]
    fn test_deviation_and_not_applicable() {
        let auths = vec![
            authority("bastet", 1, true),
            authority("gabelmoo", 2, true),
            authority("longclaw", 3, true),
            authority("dizum", 4, false),
        ];
        let votes = ["bastet", "gabelmoo", "longclaw", "dizum"]
            .iter()
            .map(|a| vote_with(a, &["Running", "Fast"]))
            .collect();
        let bw = vec![bw_file("bastet", 100), bw_file("gabelmoo", 110), bw_file("longclaw", 90)];
        let p = published(auths, votes, bw, false);

        let result = DiagnosticsFormatter::new(5.0).diagnose(Some(&p), fp().as_str(), Utc::now());
        let d = result.observed().unwrap();
        assert_eq!(d.bandwidth_mean, Some(100.0));

        let rows = &d.per_authority;
        assert_eq!(rows[0].deviation_percent, Some(0.0));
        assert!(!rows[0].deviation_warning);
        assert_eq!(rows[1].deviation_percent, Some(10.0));
        assert!(rows[1].deviation_warning);
        assert_eq!(rows[2].deviation_percent, Some(-10.0));
        assert!(rows[2].deviation_warning);
        assert_eq!(rows[3].bandwidth, BandwidthCell::NotApplicable);
        assert_ne!(rows[3].bandwidth, BandwidthCell::Measured(0));
        assert_eq!(rows[3].deviation_percent, None);
        assert!(d
            .issues
            .contains(&"authority gabelmoo: bandwidth measurement deviates +10.0% from mean".to_string()));
    }

    #[test]
    fn test_unavailable_bandwidth_file() {
        let auths = vec![authority("bastet", 1, true), authority("moria1", 2, true)];
        let votes = vec![vote_with("bastet", &["Running"]), vote_with("moria1", &["Running"])];
        let p = published(auths, votes, vec![bw_file("bastet", 100)], false);

        let d = DiagnosticsFormatter::new(5.0)
            .diagnose(Some(&p), fp().as_str(), Utc::now());
        let d = d.observed().unwrap();
        assert_eq!(d.per_authority[0].bandwidth, BandwidthCell::Measured(100));
        assert_eq!(d.per_authority[1].bandwidth, BandwidthCell::Unavailable);
        assert!(d
            .issues
            .contains(&"authority moria1: bandwidth file unavailable".to_string()));
    }

    #[test]
    fn test_unreachable_and_flag_issues() {
        let auths = vec![authority("a", 1, false), authority("b", 2, false), authority("c", 3, false)];
        let votes = vec![
            vote_with("a", &["Running", "Guard"]),
            vote_with("b", &["Running"]),
            vote_with("c", &[]),
        ];
        let p = published(auths, votes, vec![], false);

        let result = DiagnosticsFormatter::new(5.0).diagnose(Some(&p), &fp().to_base64(), Utc::now());
        let d = result.observed().unwrap();
        assert!(d.in_consensus);
        assert_eq!(d.per_authority[2].ipv4_reachable, Some(false));
        assert_eq!(d.per_authority[2].ipv6_reachable, None);
        assert!(d.issues.contains(&"authority c: cannot reach relay".to_string()));
        assert!(d.issues.contains(&"2/3 authorities not assigning Guard".to_string()));
        assert_eq!(d.flag_eligibility.as_ref().unwrap().flag, "Guard");
        assert!(d.consensus_note.contains("approximated"));
    }

    #[test]
    fn test_not_observed_variants() {
        let formatter = DiagnosticsFormatter::new(5.0);
        let now = Utc::now();

        let r = formatter.diagnose(None, fp().as_str(), now);
        assert_eq!(r.not_observed_reason(), Some(NotObservedReason::Unavailable));
        assert!(!r.in_consensus());

        let r = formatter.diagnose(None, "not-a-fingerprint", now);
        assert_eq!(r.not_observed_reason(), Some(NotObservedReason::InvalidFingerprint));

        let empty = published(vec![], vec![], vec![], false);
        let r = formatter.diagnose(Some(&empty), fp().as_str(), now);
        assert_eq!(r.not_observed_reason(), Some(NotObservedReason::NoAuthorities));
        assert_eq!(r.issues()[0], "no authorities discovered");

        let p = published(vec![authority("a", 1, false)], vec![vote_with("a", &[])], vec![], true);
        let other = format!("${}", "cd".repeat(20));
        let r = formatter.diagnose(Some(&p), &other, now);
        assert_eq!(r.not_observed_reason(), Some(NotObservedReason::AbsentFromVotes));
        assert!(r.is_stale());
        assert!(r.issues()[1].starts_with("stale data"));
    }

    #[test]
    fn test_stale_flag_propagates() {
        let auths = vec![authority("a", 1, false)];
        let p = published(auths, vec![vote_with("a", &["Running"])], vec![], true);
        let r = DiagnosticsFormatter::new(5.0).diagnose(Some(&p), fp().as_str(), Utc::now());
        assert!(r.is_stale());
        assert!(r.issues().iter().any(|i| i.starts_with("stale data")));
    }
}
