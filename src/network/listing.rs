//! Document listing resolution
//!
//! CollecTor publishes plain directory index pages. We do not parse the
//! HTML; every token of the page is tried against the file name patterns:
//!
//! - votes: `YYYY-MM-DD-HH-MM-SS-vote-<AUTHORITY_V3IDENT_HEX40>-<DIGEST>`
//! - bandwidth files: `YYYY-MM-DD-HH-MM-SS-bandwidth-<AUTHORITY_NICKNAME>`

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Document family
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DocumentKind {
    Vote,
    Bandwidth,
}

impl DocumentKind {
    fn marker(self) -> &'static str {
        match self {
            DocumentKind::Vote => "-vote-",
            DocumentKind::Bandwidth => "-bandwidth-",
        }
    }
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentKind::Vote => f.write_str("vote"),
            DocumentKind::Bandwidth => f.write_str("bandwidth"),
        }
    }
}

/// A file name that matched one of the document patterns
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentName {
    pub kind: DocumentKind,
    pub file_name: String,
    /// Timestamp embedded in the name
    pub published: DateTime<Utc>,
    /// `published` truncated to the hour
    pub hour: DateTime<Utc>,
    /// v3 identity for votes, nickname for bandwidth files
    pub authority_key: String,
}

/// Length of `YYYY-MM-DD-HH-MM-SS`
const STAMP_LEN: usize = 19;

impl DocumentName {
    /// Match a file name against both patterns
    pub fn parse(file_name: &str) -> Option<Self> {
        if file_name.len() <= STAMP_LEN || !file_name.is_char_boundary(STAMP_LEN) {
            return None;
        }
        let (stamp, tail) = file_name.split_at(STAMP_LEN);
        let published = NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d-%H-%M-%S")
            .ok()?
            .and_utc();

        let (kind, authority_key) = if let Some(rest) = tail.strip_prefix(DocumentKind::Vote.marker()) {
            let (ident, digest) = rest.split_once('-')?;
            if ident.len() != 40 || !ident.bytes().all(|b| b.is_ascii_hexdigit()) {
                return None;
            }
            if digest.is_empty() || !digest.bytes().all(|b| b.is_ascii_alphanumeric()) {
                return None;
            }
            (DocumentKind::Vote, ident.to_uppercase())
        } else if let Some(nick) = tail.strip_prefix(DocumentKind::Bandwidth.marker()) {
            // Tor nicknames: 1-19 alphanumerics
            if nick.is_empty() || nick.len() > 19 || !nick.bytes().all(|b| b.is_ascii_alphanumeric()) {
                return None;
            }
            (DocumentKind::Bandwidth, nick.to_string())
        } else {
            return None;
        };

        let hour = published
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .unwrap_or(published);

        Some(Self {
            kind,
            file_name: file_name.to_string(),
            published,
            hour,
            authority_key,
        })
    }
}

/// Every distinct document name mentioned on a listing page
pub fn extract_document_names(listing: &str) -> Vec<DocumentName> {
    let tokens: BTreeSet<&str> = listing
        .split(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | '<' | '>' | '/' | '='))
        .filter(|t| !t.is_empty())
        .collect();
    tokens.into_iter().filter_map(DocumentName::parse).collect()
}

/// The latest hour's documents of `kind`, one per authority
///
/// When an authority has several files in that hour the lexicographically
/// last name wins. Output is sorted by file name.
pub fn select_latest_hour(names: &[DocumentName], kind: DocumentKind) -> Vec<DocumentName> {
    let Some(latest) = names.iter().filter(|n| n.kind == kind).map(|n| n.hour).max() else {
        return Vec::new();
    };

    let mut per_authority: BTreeMap<String, &DocumentName> = BTreeMap::new();
    for name in names.iter().filter(|n| n.kind == kind && n.hour == latest) {
        let key = name.authority_key.to_lowercase();
        match per_authority.get(&key) {
            Some(existing) if existing.file_name >= name.file_name => {}
            _ => {
                per_authority.insert(key, name);
            }
        }
    }

    let mut selected: Vec<DocumentName> = per_authority.into_values().cloned().collect();
    selected.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENT_A: &str = "D586D18309DED4CD6D57C18FDB97EFA96D330566";
    const IDENT_B: &str = "14C131DFC5C6F93646BE72FA1401C02A8DF2E8B4";

    fn listing() -> String {
        format!(
            r#"<html><body><pre>
<a href="2024-01-01-12-00-00-vote-{a}-AAAA1111">2024-01-01-12-00-00-vote-{a}-AAAA1111</a> 2024-01-01 12:05  4.1M
<a href="2024-01-01-13-00-00-vote-{a}-BBBB2222">2024-01-01-13-00-00-vote-{a}-BBBB2222</a> 2024-01-01 13:05  4.1M
<a href="2024-01-01-13-00-00-vote-{b}-CCCC3333">2024-01-01-13-00-00-vote-{b}-CCCC3333</a> 2024-01-01 13:05  4.0M
<a href="2024-01-01-12-34-56-bandwidth-longclaw">x</a>
<a href="/recent/relay-descriptors/bandwidths/2024-01-01-13-02-10-bandwidth-bastet">x</a>
<a href="2024-01-01-13-40-00-bandwidth-longclaw">x</a>
<a href="2024-01-01-13-00-00-vote-nothex-XXXX">bad</a>
<a href="../">Parent Directory</a>
</pre></body></html>"#,
            a = IDENT_A,
            b = IDENT_B
        )
    }

    #[test]
    fn test_parse_vote_name() {
        let name = DocumentName::parse(&format!("2024-01-01-13-00-00-vote-{}-ABCDEF", IDENT_A)).unwrap();
        assert_eq!(name.kind, DocumentKind::Vote);
        assert_eq!(name.authority_key, IDENT_A);
        assert_eq!(name.hour.to_rfc3339(), "2024-01-01T13:00:00+00:00");
    }

    #[test]
    fn test_parse_bandwidth_name() {
        let name = DocumentName::parse("2024-01-01-13-40-00-bandwidth-longclaw").unwrap();
        assert_eq!(name.kind, DocumentKind::Bandwidth);
        assert_eq!(name.authority_key, "longclaw");
        assert_eq!(name.hour.to_rfc3339(), "2024-01-01T13:00:00+00:00");
    }

    #[test]
    fn test_rejects_other_names() {
        assert!(DocumentName::parse("index.html").is_none());
        assert!(DocumentName::parse("2024-01-01-13-00-00-consensus").is_none());
        assert!(DocumentName::parse("2024-13-01-13-00-00-bandwidth-x").is_none());
        assert!(DocumentName::parse("2024-01-01-13-00-00-bandwidth-").is_none());
    }

    #[test]
    fn test_extract_and_select() {
        let names = extract_document_names(&listing());
        assert_eq!(names.len(), 6);

        let votes = select_latest_hour(&names, DocumentKind::Vote);
        assert_eq!(votes.len(), 2);
        assert!(votes.iter().all(|v| v.file_name.starts_with("2024-01-01-13")));

        let bw = select_latest_hour(&names, DocumentKind::Bandwidth);
        let keys: Vec<&str> = bw.iter().map(|n| n.authority_key.as_str()).collect();
        assert_eq!(keys, vec!["bastet", "longclaw"]);
    }

    #[test]
    fn test_duplicate_authority_keeps_last() {
        let names = extract_document_names(
            "2024-01-01-13-05-00-bandwidth-bastet 2024-01-01-13-45-00-bandwidth-bastet",
        );
        let bw = select_latest_hour(&names, DocumentKind::Bandwidth);
        assert_eq!(bw.len(), 1);
        assert_eq!(bw[0].file_name, "2024-01-01-13-45-00-bandwidth-bastet");
    }

    #[test]
    fn test_empty_listing() {
        assert!(select_latest_hour(&[], DocumentKind::Vote).is_empty());
    }
}
