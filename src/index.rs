//! Relay index
//!
//! Fan-in step of a cycle: once every document is fetched and parsed, all
//! per-authority records are merged into one `fingerprint -> entry` map.
//! Runs single-threaded over already-collected results, so it needs no
//! locking.

use crate::protocol::{BandwidthFile, Fingerprint, VoteDocument, VoteEntry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Everything the authorities said about one relay
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayIndexEntry {
    /// Authority nickname -> that authority's vote entry
    pub votes: BTreeMap<String, VoteEntry>,
    /// Authority nickname -> measured bandwidth (KB/s) from its bandwidth file
    pub bandwidth: BTreeMap<String, u64>,
}

impl RelayIndexEntry {
    pub fn vote_count(&self) -> usize {
        self.votes.len()
    }

    /// Authorities assigning `flag`
    pub fn flag_count(&self, flag: &str) -> usize {
        self.votes.values().filter(|v| v.has_flag(flag)).count()
    }

    /// The nickname most authorities report (ties: alphabetical)
    pub fn nickname(&self) -> Option<&str> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for vote in self.votes.values() {
            *counts.entry(vote.nickname.as_str()).or_default() += 1;
        }
        counts
            .into_iter()
            .fold(None, |best: Option<(&str, usize)>, (nick, n)| match best {
                Some((_, best_n)) if best_n >= n => best,
                _ => Some((nick, n)),
            })
            .map(|(nick, _)| nick)
    }
}

/// Fingerprint-keyed view over one cycle's documents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayIndex {
    entries: HashMap<Fingerprint, RelayIndexEntry>,
}

impl RelayIndex {
    /// Merge parsed votes and bandwidth files
    pub fn build(votes: &[VoteDocument], bandwidth: &[BandwidthFile]) -> Self {
        let mut entries: HashMap<Fingerprint, RelayIndexEntry> = HashMap::new();

        for vote in votes {
            for (fp, entry) in &vote.relays {
                entries
                    .entry(fp.clone())
                    .or_default()
                    .votes
                    .insert(vote.authority.clone(), entry.clone());
            }
        }
        for file in bandwidth {
            for (fp, bw) in &file.relays {
                entries
                    .entry(fp.clone())
                    .or_default()
                    .bandwidth
                    .insert(file.authority.clone(), *bw);
            }
        }

        log::info!(
            "🗃️ Indexed {} relays from {} votes and {} bandwidth files",
            entries.len(),
            votes.len(),
            bandwidth.len()
        );
        Self { entries }
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&RelayIndexEntry> {
        self.entries.get(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Fingerprint, &RelayIndexEntry)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn entry(nick: &str, flags: &[&str]) -> VoteEntry {
        VoteEntry {
            nickname: nick.into(),
            ipv4: "1.2.3.4".parse().unwrap(),
            or_port: 9001,
            dir_port: None,
            ipv6: None,
            flags: flags.iter().map(|f| f.to_string()).collect::<BTreeSet<_>>(),
            bandwidth: Some(100),
            measured: false,
            measured_bandwidth: None,
            stats: None,
            published: None,
        }
    }

    fn vote(authority: &str, relays: Vec<(Fingerprint, VoteEntry)>) -> VoteDocument {
        VoteDocument {
            authority: authority.into(),
            authority_identity: None,
            published: None,
            valid_after: None,
            known_flags: BTreeSet::new(),
            flag_thresholds: BTreeMap::new(),
            has_bandwidth_file: false,
            relays: relays.into_iter().collect(),
            warnings: Vec::new(),
        }
    }

    #[test]
    fn test_build_merges_authorities() {
        let a = Fingerprint::from_hex(&"A".repeat(40)).unwrap();
        let b = Fingerprint::from_hex(&"B".repeat(40)).unwrap();
        let votes = vec![
            vote("moria1", vec![(a.clone(), entry("alpha", &["Fast"])), (b.clone(), entry("beta", &[]))]),
            vote("tor26", vec![(a.clone(), entry("alpha", &["Fast", "Guard"]))]),
        ];
        let bw = vec![BandwidthFile {
            authority: "bastet".into(),
            timestamp: None,
            version: None,
            relays: [(a.clone(), 420)].into_iter().collect(),
            skipped_lines: 0,
        }];

        let index = RelayIndex::build(&votes, &bw);
        assert_eq!(index.len(), 2);

        let ea = index.get(&a).unwrap();
        assert_eq!(ea.vote_count(), 2);
        assert_eq!(ea.flag_count("Fast"), 2);
        assert_eq!(ea.flag_count("Guard"), 1);
        assert_eq!(ea.bandwidth.get("bastet"), Some(&420));
        assert_eq!(ea.nickname(), Some("alpha"));

        assert_eq!(index.get(&b).unwrap().vote_count(), 1);
        assert!(index.get(&Fingerprint::from_hex(&"C".repeat(40)).unwrap()).is_none());
    }

    #[test]
    fn test_nickname_majority() {
        let mut e = RelayIndexEntry::default();
        e.votes.insert("a".into(), entry("new", &[]));
        e.votes.insert("b".into(), entry("old", &[]));
        e.votes.insert("c".into(), entry("old", &[]));
        assert_eq!(e.nickname(), Some("old"));
    }
}
