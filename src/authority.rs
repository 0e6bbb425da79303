//! Directory authority discovery
//!
//! The authority set is a per-cycle fact, filtered out of the live relay
//! population by the `Authority` capability flag. Nothing here is a
//! compiled-in list: when authorities come or go, the majority threshold
//! follows.

use crate::protocol::{Fingerprint, AUTHORITY_FLAG};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// One relay of the externally supplied population (Onionoo-shaped)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayRecord {
    pub fingerprint: String,
    pub nickname: String,
    /// `ip:port` strings, IPv6 bracketed
    #[serde(default)]
    pub or_addresses: Vec<String>,
    /// `ip:port` of the directory port, if any
    #[serde(default)]
    pub dir_address: Option<String>,
    #[serde(default)]
    pub flags: Vec<String>,
}

impl RelayRecord {
    fn is_authority(&self) -> bool {
        self.flags.iter().any(|f| f == AUTHORITY_FLAG)
    }

    fn socket_addrs(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.or_addresses.iter().filter_map(|a| a.parse().ok())
    }
}

/// A directory authority for the current cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authority {
    pub fingerprint: Fingerprint,
    pub nickname: String,
    pub address: Option<IpAddr>,
    pub dir_port: Option<u16>,
    /// Publishes a bandwidth file this cycle
    pub is_bandwidth_authority: bool,
    /// Has IPv6 connectivity, so its Running flag also covers IPv6
    pub tests_ipv6: bool,
}

impl Authority {
    /// Case-insensitive nickname match (file names and dir-source lines
    /// do not agree on case)
    pub fn matches_nickname(&self, nickname: &str) -> bool {
        self.nickname.eq_ignore_ascii_case(nickname)
    }
}

/// How many votes make a relay count as "in consensus"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusRequirement {
    pub authority_count: usize,
    /// `None` when no authorities were discovered
    pub majority_required: Option<usize>,
}

impl ConsensusRequirement {
    /// `floor(n/2) + 1`, undefined for zero authorities
    pub fn for_count(authority_count: usize) -> Self {
        Self {
            authority_count,
            majority_required: (authority_count > 0).then(|| authority_count / 2 + 1),
        }
    }

    /// Majority-vote approximation of consensus membership
    pub fn is_met(&self, vote_count: usize) -> bool {
        match self.majority_required {
            Some(required) => vote_count >= required,
            None => false,
        }
    }
}

/// Authorities discovered for one cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityRegistry {
    authorities: Vec<Authority>,
    requirement: ConsensusRequirement,
}

impl AuthorityRegistry {
    /// Filter the population down to authorities, ordered by nickname
    pub fn discover(population: &[RelayRecord]) -> Self {
        let mut authorities: Vec<Authority> = Vec::new();

        for record in population.iter().filter(|r| r.is_authority()) {
            let Some(fingerprint) = Fingerprint::from_hex(&record.fingerprint) else {
                log::warn!(
                    "⚠️ Ignoring authority {} with bad fingerprint {:?}",
                    record.nickname,
                    record.fingerprint
                );
                continue;
            };
            if authorities.iter().any(|a| a.fingerprint == fingerprint) {
                continue;
            }

            let address = record
                .socket_addrs()
                .find(SocketAddr::is_ipv4)
                .map(|a| a.ip())
                .or_else(|| record.socket_addrs().next().map(|a| a.ip()));
            let dir_port = record
                .dir_address
                .as_deref()
                .and_then(|a| a.parse::<SocketAddr>().ok())
                .map(|a| a.port());

            authorities.push(Authority {
                fingerprint,
                nickname: record.nickname.clone(),
                address,
                dir_port,
                is_bandwidth_authority: false,
                tests_ipv6: record.socket_addrs().any(|a| a.is_ipv6()),
            });
        }

        authorities.sort_by(|a, b| {
            a.nickname
                .to_lowercase()
                .cmp(&b.nickname.to_lowercase())
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });

        let requirement = ConsensusRequirement::for_count(authorities.len());
        if authorities.is_empty() {
            log::warn!("⚠️ No directory authorities discovered in relay population");
        } else {
            log::info!(
                "🏛️ Discovered {} authorities, majority requires {}",
                requirement.authority_count,
                requirement.majority_required.unwrap_or(0)
            );
        }

        Self {
            authorities,
            requirement,
        }
    }

    /// Registry from an already-built authority list
    pub fn from_authorities(authorities: Vec<Authority>) -> Self {
        let requirement = ConsensusRequirement::for_count(authorities.len());
        Self {
            authorities,
            requirement,
        }
    }

    pub fn authorities(&self) -> &[Authority] {
        &self.authorities
    }

    pub fn requirement(&self) -> ConsensusRequirement {
        self.requirement
    }

    pub fn is_empty(&self) -> bool {
        self.authorities.is_empty()
    }

    pub fn len(&self) -> usize {
        self.authorities.len()
    }

    /// Find an authority by nickname, ignoring case
    pub fn by_nickname(&self, nickname: &str) -> Option<&Authority> {
        self.authorities.iter().find(|a| a.matches_nickname(nickname))
    }

    /// Record that `nickname` publishes bandwidth measurements this cycle
    pub fn mark_bandwidth_authority(&mut self, nickname: &str) {
        if let Some(auth) = self
            .authorities
            .iter_mut()
            .find(|a| a.matches_nickname(nickname))
        {
            auth.is_bandwidth_authority = true;
        }
    }

    pub fn into_authorities(self) -> Vec<Authority> {
        self.authorities
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn authority_record(nickname: &str, n: u8, ipv6: bool) -> RelayRecord {
        let mut or_addresses = vec![format!("10.0.0.{}:443", n)];
        if ipv6 {
            or_addresses.push(format!("[2001:db8::{}]:443", n));
        }
        RelayRecord {
            fingerprint: format!("{:02X}", n).repeat(20),
            nickname: nickname.to_string(),
            or_addresses,
            dir_address: Some(format!("10.0.0.{}:80", n)),
            flags: vec!["Authority".into(), "Running".into(), "Valid".into()],
        }
    }

    #[test]
    fn test_majority_formula() {
        for n in 0..=20 {
            let req = ConsensusRequirement::for_count(n);
            assert_eq!(req.authority_count, n);
            if n == 0 {
                assert_eq!(req.majority_required, None);
            } else {
                assert_eq!(req.majority_required, Some(n / 2 + 1));
            }
        }
        assert_eq!(ConsensusRequirement::for_count(9).majority_required, Some(5));
        assert_eq!(ConsensusRequirement::for_count(8).majority_required, Some(5));
    }

    #[test]
    fn test_is_met() {
        let req = ConsensusRequirement::for_count(9);
        assert!(req.is_met(5));
        assert!(!req.is_met(4));
        assert!(!ConsensusRequirement::for_count(0).is_met(100));
    }

    #[test]
    fn test_discover_filters_and_orders() {
        let mut relay = authority_record("ordinary", 50, false);
        relay.flags = vec!["Running".into(), "Fast".into()];
        let population = vec![
            authority_record("tor26", 2, true),
            relay,
            authority_record("Faravahar", 3, false),
            authority_record("moria1", 1, false),
        ];

        let registry = AuthorityRegistry::discover(&population);
        let names: Vec<&str> = registry
            .authorities()
            .iter()
            .map(|a| a.nickname.as_str())
            .collect();
        assert_eq!(names, vec!["Faravahar", "moria1", "tor26"]);
        assert_eq!(registry.requirement().majority_required, Some(2));

        let tor26 = registry.by_nickname("TOR26").unwrap();
        assert!(tor26.tests_ipv6);
        assert_eq!(tor26.dir_port, Some(80));
        assert_eq!(tor26.address, Some("10.0.0.2".parse().unwrap()));
        assert!(!registry.by_nickname("moria1").unwrap().tests_ipv6);
    }

    #[test]
    fn test_discover_empty() {
        let registry = AuthorityRegistry::discover(&[]);
        assert!(registry.is_empty());
        assert_eq!(registry.requirement().majority_required, None);
    }

    #[test]
    fn test_bad_fingerprint_skipped() {
        let mut bad = authority_record("broken", 9, false);
        bad.fingerprint = "nope".into();
        let registry = AuthorityRegistry::discover(&[bad, authority_record("gabelmoo", 4, false)]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_mark_bandwidth_authority() {
        let mut registry = AuthorityRegistry::discover(&[authority_record("longclaw", 7, false)]);
        registry.mark_bandwidth_authority("LongClaw");
        assert!(registry.authorities()[0].is_bandwidth_authority);
    }
}
