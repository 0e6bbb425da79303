//! Flag eligibility analysis
//!
//! Picks the first tracked flag (Guard, Stable, Fast, HSDir) a relay does
//! not hold and checks it against every requirement for that flag:
//! variable thresholds per authority, constant thresholds once, and the
//! flags it depends on. The advice string is built only from which checks
//! failed, so the same inputs always give the same text.

use crate::authority::{Authority, ConsensusRequirement};
use crate::index::RelayIndexEntry;
use crate::protocol::{VoteEntry, TRACKED_FLAGS};
use crate::thresholds::ThresholdTable;
use serde::{Deserialize, Serialize};

/// Metric a requirement is measured on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Bytes per second
    Bandwidth,
    /// Weighted fractional uptime
    Wfu,
    /// Time known, seconds
    TimeKnown,
    /// Mean time between failures, seconds
    Mtbf,
}

impl Metric {
    pub fn label(&self) -> &'static str {
        match self {
            Metric::Bandwidth => "bandwidth",
            Metric::Wfu => "weighted fractional uptime",
            Metric::TimeKnown => "time known",
            Metric::Mtbf => "mean time between failures",
        }
    }

    /// Human-readable value in this metric's unit
    pub fn format(&self, value: f64) -> String {
        match self {
            Metric::Bandwidth if value >= 1_000_000.0 => format!("{:.2} MB/s", value / 1_000_000.0),
            Metric::Bandwidth => format!("{:.0} KB/s", value / 1000.0),
            Metric::Wfu => format!("{:.1}%", value * 100.0),
            Metric::TimeKnown | Metric::Mtbf if value >= 86_400.0 => {
                format!("{:.1} days", value / 86_400.0)
            }
            Metric::TimeKnown | Metric::Mtbf => format!("{:.1} hours", value / 3600.0),
        }
    }
}

/// Metric values known for a relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayMetrics {
    pub bandwidth: Option<f64>,
    pub wfu: Option<f64>,
    pub time_known: Option<f64>,
    pub mtbf: Option<f64>,
}

impl RelayMetrics {
    /// Values from a single authority's vote entry
    pub fn from_vote(entry: &VoteEntry) -> Self {
        let stats = entry.stats.as_ref();
        Self {
            bandwidth: entry.bandwidth.map(|kb| kb as f64 * 1000.0),
            wfu: stats.and_then(|s| s.wfu),
            time_known: stats.and_then(|s| s.tk).map(|v| v as f64),
            mtbf: stats.and_then(|s| s.mtbf).map(|v| v as f64),
        }
    }

    /// The largest value any authority reports for each metric; bandwidth
    /// files are consulted when no vote carries a bandwidth
    pub fn best_known(entry: &RelayIndexEntry) -> Self {
        let mut best = entry
            .votes
            .values()
            .map(Self::from_vote)
            .fold(Self::default(), |acc, m| Self {
                bandwidth: max_opt(acc.bandwidth, m.bandwidth),
                wfu: max_opt(acc.wfu, m.wfu),
                time_known: max_opt(acc.time_known, m.time_known),
                mtbf: max_opt(acc.mtbf, m.mtbf),
            });
        if best.bandwidth.is_none() {
            best.bandwidth = entry.bandwidth.values().max().map(|kb| *kb as f64 * 1000.0);
        }
        best
    }

    /// Fill gaps from `fallback`
    pub fn or(self, fallback: Self) -> Self {
        Self {
            bandwidth: self.bandwidth.or(fallback.bandwidth),
            wfu: self.wfu.or(fallback.wfu),
            time_known: self.time_known.or(fallback.time_known),
            mtbf: self.mtbf.or(fallback.mtbf),
        }
    }

    pub fn get(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Bandwidth => self.bandwidth,
            Metric::Wfu => self.wfu,
            Metric::TimeKnown => self.time_known,
            Metric::Mtbf => self.mtbf,
        }
    }
}

fn max_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, y) => x.or(y),
    }
}

/// Result of one comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    Meets,
    Fails,
    /// Threshold or metric missing
    Unknown,
}

impl CheckOutcome {
    fn compare(value: Option<f64>, threshold: Option<f64>) -> Self {
        match (value, threshold) {
            (Some(v), Some(t)) if v >= t => CheckOutcome::Meets,
            (Some(_), Some(_)) => CheckOutcome::Fails,
            _ => CheckOutcome::Unknown,
        }
    }
}

/// A variable threshold checked against one authority's own cutoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorityCheck {
    pub authority: String,
    pub key: String,
    pub metric: Metric,
    pub threshold: Option<f64>,
    pub value: Option<f64>,
    pub outcome: CheckOutcome,
}

/// A constant threshold, checked once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantCheck {
    pub key: String,
    pub metric: Metric,
    pub threshold: f64,
    pub value: Option<f64>,
    pub outcome: CheckOutcome,
}

/// What it takes to earn a flag
#[derive(Debug, Clone, Copy)]
struct FlagRule {
    variable: Option<(&'static str, Metric)>,
    constants: &'static [(&'static str, Metric)],
    prerequisites: &'static [&'static str],
    /// Meeting the first constant is enough on its own
    constant_guarantees: bool,
}

fn rule_for(flag: &str, is_exit: bool) -> Option<FlagRule> {
    const NONE: &[&str] = &[];
    const FAST_STABLE: &[&str] = &["Fast", "Stable"];
    let rule = match flag {
        "Guard" => FlagRule {
            variable: Some((
                if is_exit { "guard-bw-inc-exits" } else { "guard-bw-exc-exits" },
                Metric::Bandwidth,
            )),
            constants: &[("guard-wfu", Metric::Wfu), ("guard-tk", Metric::TimeKnown)],
            prerequisites: FAST_STABLE,
            constant_guarantees: false,
        },
        "Stable" => FlagRule {
            variable: Some(("stable-mtbf", Metric::Mtbf)),
            constants: &[],
            prerequisites: NONE,
            constant_guarantees: false,
        },
        "Fast" => FlagRule {
            variable: Some(("fast-speed", Metric::Bandwidth)),
            constants: &[("fast-guarantee", Metric::Bandwidth)],
            prerequisites: NONE,
            constant_guarantees: true,
        },
        "HSDir" => FlagRule {
            variable: None,
            constants: &[("hsdir-tk", Metric::TimeKnown)],
            prerequisites: FAST_STABLE,
            constant_guarantees: false,
        },
        _ => return None,
    };
    Some(rule)
}

/// Eligibility of a relay for one flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagEligibility {
    pub flag: String,
    /// Authorities currently assigning the flag
    pub assigned_by: usize,
    pub authority_count: usize,
    pub per_authority: Vec<AuthorityCheck>,
    pub constant: Vec<ConstantCheck>,
    pub missing_prerequisites: Vec<String>,
    pub advice: String,
}

impl FlagEligibility {
    /// Authorities whose own cutoff the relay meets
    pub fn authorities_met(&self) -> usize {
        self.per_authority
            .iter()
            .filter(|c| c.outcome == CheckOutcome::Meets)
            .count()
    }

    /// `"assigned by M/N authorities"`
    pub fn assignment_summary(&self) -> String {
        format!(
            "{} assigned by {}/{} authorities",
            self.flag, self.assigned_by, self.authority_count
        )
    }
}

/// A flag counts as held once a majority assigns it
pub fn holds_flag(entry: &RelayIndexEntry, flag: &str, requirement: &ConsensusRequirement) -> bool {
    requirement.is_met(entry.flag_count(flag))
}

/// First tracked flag the relay does not hold
pub fn target_flag(entry: &RelayIndexEntry, requirement: &ConsensusRequirement) -> Option<&'static str> {
    TRACKED_FLAGS
        .iter()
        .copied()
        .find(|flag| !holds_flag(entry, flag, requirement))
}

/// Check `flag` for a relay against this cycle's thresholds
pub fn analyze_flag(
    flag: &str,
    entry: &RelayIndexEntry,
    authorities: &[Authority],
    thresholds: &ThresholdTable,
    requirement: &ConsensusRequirement,
) -> Option<FlagEligibility> {
    let is_exit = holds_flag(entry, "Exit", requirement);
    let rule = rule_for(flag, is_exit)?;
    let best = RelayMetrics::best_known(entry);

    let per_authority = match rule.variable {
        Some((key, metric)) => authorities
            .iter()
            .map(|auth| {
                let own = entry
                    .votes
                    .get(&auth.nickname)
                    .map(RelayMetrics::from_vote)
                    .unwrap_or_default();
                let value = own.or(best).get(metric);
                let threshold = thresholds.variable(key).and_then(|v| v.get(&auth.nickname));
                AuthorityCheck {
                    authority: auth.nickname.clone(),
                    key: key.to_string(),
                    metric,
                    threshold,
                    value,
                    outcome: CheckOutcome::compare(value, threshold),
                }
            })
            .collect(),
        None => Vec::new(),
    };

    let constant = rule
        .constants
        .iter()
        .filter_map(|(key, metric)| {
            let threshold = thresholds.constant_value(key)?;
            let value = best.get(*metric);
            Some(ConstantCheck {
                key: key.to_string(),
                metric: *metric,
                threshold,
                value,
                outcome: CheckOutcome::compare(value, Some(threshold)),
            })
        })
        .collect();

    let missing_prerequisites = rule
        .prerequisites
        .iter()
        .filter(|p| !holds_flag(entry, p, requirement))
        .map(|p| p.to_string())
        .collect();

    let mut eligibility = FlagEligibility {
        flag: flag.to_string(),
        assigned_by: entry.flag_count(flag),
        authority_count: requirement.authority_count,
        per_authority,
        constant,
        missing_prerequisites,
        advice: String::new(),
    };
    eligibility.advice = advice(&eligibility, rule.constant_guarantees);
    Some(eligibility)
}

/// Eligibility for the relay's next flag, or `None` when it holds them all
pub fn analyze(
    entry: &RelayIndexEntry,
    authorities: &[Authority],
    thresholds: &ThresholdTable,
    requirement: &ConsensusRequirement,
) -> Option<FlagEligibility> {
    let flag = target_flag(entry, requirement)?;
    analyze_flag(flag, entry, authorities, thresholds, requirement)
}

fn advice(e: &FlagEligibility, constant_guarantees: bool) -> String {
    let mut parts: Vec<String> = Vec::new();

    if !e.missing_prerequisites.is_empty() {
        parts.push(format!(
            "{} requires {} first.",
            e.flag,
            e.missing_prerequisites.join(" and ")
        ));
    }

    if constant_guarantees {
        if let Some(c) = e.constant.first().filter(|c| c.outcome == CheckOutcome::Meets) {
            parts.push(format!(
                "{} {} meets the {} of {}; {} should follow.",
                capitalize(c.metric.label()),
                c.metric.format(c.value.unwrap_or_default()),
                c.key,
                c.metric.format(c.threshold),
                e.flag
            ));
            return parts.join(" ");
        }
    }

    for c in &e.constant {
        match (c.outcome, c.value) {
            (CheckOutcome::Fails, Some(value)) if !constant_guarantees => parts.push(format!(
                "{} {} is below the {} requirement of {}.",
                capitalize(c.metric.label()),
                c.metric.format(value),
                c.key,
                c.metric.format(c.threshold)
            )),
            (CheckOutcome::Unknown, _) => parts.push(format!(
                "{} is unknown, so {} cannot be checked.",
                capitalize(c.metric.label()),
                c.key
            )),
            _ => {}
        }
    }

    let failing: Vec<&AuthorityCheck> = e
        .per_authority
        .iter()
        .filter(|c| c.outcome == CheckOutcome::Fails)
        .collect();
    let unknown = e
        .per_authority
        .iter()
        .filter(|c| c.outcome == CheckOutcome::Unknown)
        .count();

    if let Some(first) = failing.first() {
        let lowest = failing
            .iter()
            .filter_map(|c| c.threshold)
            .fold(f64::INFINITY, f64::min);
        parts.push(format!(
            "{} is below the {} cutoff of {}/{} authorities (lowest failing cutoff {}).",
            capitalize(first.metric.label()),
            first.key,
            failing.len(),
            e.per_authority.len(),
            first.metric.format(lowest)
        ));
    }
    if unknown > 0 {
        parts.push(format!(
            "{}/{} authorities could not be checked.",
            unknown,
            e.per_authority.len()
        ));
    }

    if parts.is_empty() {
        parts.push(format!(
            "Meets every checked requirement for {}; {}.",
            e.flag,
            e.assignment_summary()
        ));
    }
    parts.join(" ")
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConstantThresholds;
    use crate::protocol::{Fingerprint, RelayStats};
    use crate::thresholds::VariableThreshold;
    use std::collections::BTreeSet;

    fn authority(nick: &str, n: u8) -> Authority {
        Authority {
            fingerprint: Fingerprint::from_hex(&format!("{:02X}", n).repeat(20)).unwrap(),
            nickname: nick.into(),
            address: None,
            dir_port: None,
            is_bandwidth_authority: false,
            tests_ipv6: false,
        }
    }

    fn vote_entry(flags: &[&str], bandwidth: u64, stats: Option<RelayStats>) -> VoteEntry {
        VoteEntry {
            nickname: "relay".into(),
            ipv4: "1.2.3.4".parse().unwrap(),
            or_port: 9001,
            dir_port: None,
            ipv6: None,
            flags: flags.iter().map(|f| f.to_string()).collect::<BTreeSet<_>>(),
            bandwidth: Some(bandwidth),
            measured: true,
            measured_bandwidth: None,
            stats,
            published: None,
        }
    }

    fn table(key: &str, values: &[(&str, f64)]) -> ThresholdTable {
        let mut table = ThresholdTable::aggregate(&[], &ConstantThresholds::default());
        table.variable.insert(
            key.into(),
            VariableThreshold {
                per_authority: values.iter().map(|(a, v)| (a.to_string(), *v)).collect(),
            },
        );
        table
    }

    #[test]
    fn test_target_flag_priority() {
        let req = ConsensusRequirement::for_count(3);
        let mut entry = RelayIndexEntry::default();
        for a in ["a", "b", "c"] {
            entry.votes.insert(a.into(), vote_entry(&["Fast", "Stable"], 100, None));
        }
        assert_eq!(target_flag(&entry, &req), Some("Guard"));

        for a in ["a", "b"] {
            entry
                .votes
                .insert(a.into(), vote_entry(&["Fast", "Stable", "Guard", "HSDir"], 100, None));
        }
        assert_eq!(target_flag(&entry, &req), None);

        // nothing is held without authorities
        assert_eq!(
            target_flag(&entry, &ConsensusRequirement::for_count(0)),
            Some("Guard")
        );
    }

    #[test]
    fn test_variable_checked_per_authority() {
        let auths = vec![authority("a", 1), authority("b", 2), authority("c", 3)];
        let req = ConsensusRequirement::for_count(3);
        let mut entry = RelayIndexEntry::default();
        entry.votes.insert(
            "a".into(),
            vote_entry(&[], 50, Some(RelayStats { wfu: None, tk: None, mtbf: Some(500) })),
        );
        entry.votes.insert("b".into(), vote_entry(&[], 50, None));
        let thresholds = table("stable-mtbf", &[("a", 400.0), ("b", 900.0)]);

        let e = analyze_flag("Stable", &entry, &auths, &thresholds, &req).unwrap();
        assert_eq!(e.per_authority.len(), 3);
        assert_eq!(e.per_authority[0].outcome, CheckOutcome::Meets);
        // b has no stats line: best-known 500 is used
        assert_eq!(e.per_authority[1].value, Some(500.0));
        assert_eq!(e.per_authority[1].outcome, CheckOutcome::Fails);
        // c published no threshold
        assert_eq!(e.per_authority[2].outcome, CheckOutcome::Unknown);
        assert_eq!(e.authorities_met(), 1);
        assert!(e.advice.contains("stable-mtbf cutoff of 1/3 authorities"));
        assert!(e.advice.contains("1/3 authorities could not be checked"));
    }

    #[test]
    fn test_guard_constants_and_prerequisites() {
        let auths = vec![authority("a", 1)];
        let req = ConsensusRequirement::for_count(1);
        let mut entry = RelayIndexEntry::default();
        entry.votes.insert(
            "a".into(),
            vote_entry(
                &["Fast"],
                2000,
                Some(RelayStats { wfu: Some(0.5), tk: Some(1_000_000), mtbf: None }),
            ),
        );
        let thresholds = table("guard-bw-exc-exits", &[("a", 1_000_000.0)]);

        let e = analyze_flag("Guard", &entry, &auths, &thresholds, &req).unwrap();
        assert_eq!(e.missing_prerequisites, vec!["Stable".to_string()]);
        assert_eq!(e.per_authority[0].key, "guard-bw-exc-exits");
        assert_eq!(e.per_authority[0].value, Some(2_000_000.0));
        assert_eq!(e.per_authority[0].outcome, CheckOutcome::Meets);
        assert_eq!(e.constant[0].key, "guard-wfu");
        assert_eq!(e.constant[0].outcome, CheckOutcome::Fails);
        assert_eq!(e.constant[1].outcome, CheckOutcome::Meets);
        assert_eq!(
            e.advice,
            "Guard requires Stable first. Weighted fractional uptime 50.0% is below the guard-wfu requirement of 98.0%."
        );

        // deterministic
        let again = analyze_flag("Guard", &entry, &auths, &thresholds, &req).unwrap();
        assert_eq!(e, again);
    }

    #[test]
    fn test_fast_guarantee() {
        let auths = vec![authority("a", 1)];
        let req = ConsensusRequirement::for_count(1);
        let mut entry = RelayIndexEntry::default();
        entry.votes.insert("a".into(), vote_entry(&[], 200, None));
        let thresholds = table("fast-speed", &[("a", 5_000_000.0)]);

        let e = analyze_flag("Fast", &entry, &auths, &thresholds, &req).unwrap();
        assert_eq!(e.per_authority[0].outcome, CheckOutcome::Fails);
        assert_eq!(e.constant[0].outcome, CheckOutcome::Meets);
        assert!(e.advice.starts_with("Bandwidth 200 KB/s meets the fast-guarantee"));
    }

    #[test]
    fn test_hsdir_unknown_time_known() {
        let auths = vec![authority("a", 1)];
        let req = ConsensusRequirement::for_count(1);
        let mut entry = RelayIndexEntry::default();
        entry.votes.insert("a".into(), vote_entry(&["Fast", "Stable"], 200, None));
        let mut thresholds = ThresholdTable::default();
        thresholds.constant.insert(
            "hsdir-tk".into(),
            crate::thresholds::ConstantThreshold { value: 10.0 },
        );

        let e = analyze_flag("HSDir", &entry, &auths, &thresholds, &req).unwrap();
        assert!(e.per_authority.is_empty());
        assert!(e.missing_prerequisites.is_empty());
        assert_eq!(e.constant[0].outcome, CheckOutcome::Unknown);
        assert_eq!(e.advice, "Time known is unknown, so hsdir-tk cannot be checked.");
    }

    #[test]
    fn test_best_known_falls_back_to_bandwidth_file() {
        let mut entry = RelayIndexEntry::default();
        entry.bandwidth.insert("bastet".into(), 300);
        entry.bandwidth.insert("gabelmoo".into(), 500);
        let m = RelayMetrics::best_known(&entry);
        assert_eq!(m.bandwidth, Some(500_000.0));
        assert_eq!(m.wfu, None);
    }

    #[test]
    fn test_metric_format() {
        assert_eq!(Metric::Bandwidth.format(2_500_000.0), "2.50 MB/s");
        assert_eq!(Metric::Bandwidth.format(50_000.0), "50 KB/s");
        assert_eq!(Metric::TimeKnown.format(691_200.0), "8.0 days");
        assert_eq!(Metric::Mtbf.format(7200.0), "2.0 hours");
    }
}
