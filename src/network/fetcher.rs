//! Per-cycle document fetching
//!
//! One cycle fetches two families (votes, bandwidth files). For each family:
//! fetch the listing, pick the latest hour's files, then fetch those with a
//! bounded pool. Every fetch settles to its own `Result`; a failed file only
//! removes that authority's contribution.
//!
//! Two clocks bound the work: each fetch has its own timeout and the whole
//! cycle has a deadline. A fetch still pending at the deadline counts as
//! failed for this cycle.

use super::listing::{extract_document_names, select_latest_hour, DocumentKind, DocumentName};
use super::source::DocumentSource;
use crate::config::{join_url, MonitorConfig};
use crate::error::{HealthError, Result};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;

/// One settled document fetch
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub name: DocumentName,
    pub url: String,
    pub body: Result<String>,
}

/// A fetch that did not produce a document, as recorded in the snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub kind: DocumentKind,
    /// v3 identity or nickname from the file name; `None` for listings
    pub authority_key: Option<String>,
    pub target: String,
    pub error: String,
}

/// Fetch statistics for one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchStats {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub bytes_received: u64,
}

/// Everything one family produced
#[derive(Debug, Clone)]
pub struct FamilyFetch {
    pub kind: DocumentKind,
    /// Files selected from the listing (latest hour)
    pub selected: Vec<DocumentName>,
    pub documents: Vec<FetchedDocument>,
    pub listing_error: Option<HealthError>,
}

impl FamilyFetch {
    /// Bodies that arrived
    pub fn successes(&self) -> impl Iterator<Item = (&DocumentName, &str)> {
        self.documents
            .iter()
            .filter_map(|d| d.body.as_ref().ok().map(|b| (&d.name, b.as_str())))
    }

    pub fn failures(&self) -> Vec<FetchFailure> {
        let mut out = Vec::new();
        if let Some(err) = &self.listing_error {
            out.push(FetchFailure {
                kind: self.kind,
                authority_key: None,
                target: "listing".into(),
                error: err.to_string(),
            });
        }
        for doc in &self.documents {
            if let Err(err) = &doc.body {
                out.push(FetchFailure {
                    kind: self.kind,
                    authority_key: Some(doc.name.authority_key.clone()),
                    target: doc.name.file_name.clone(),
                    error: err.to_string(),
                });
            }
        }
        out
    }
}

/// Both families for one cycle
#[derive(Debug, Clone)]
pub struct CycleFetch {
    pub votes: FamilyFetch,
    pub bandwidth: FamilyFetch,
    pub stats: FetchStats,
}

impl CycleFetch {
    /// Number of documents (not listings) that arrived
    pub fn retrieved_count(&self) -> usize {
        self.votes.successes().count() + self.bandwidth.successes().count()
    }

    pub fn failures(&self) -> Vec<FetchFailure> {
        let mut out = self.votes.failures();
        out.extend(self.bandwidth.failures());
        out
    }
}

/// Fetches the latest vote and bandwidth files
pub struct DocumentFetcher {
    source: Arc<dyn DocumentSource>,
    config: MonitorConfig,
}

impl DocumentFetcher {
    pub fn new(source: Arc<dyn DocumentSource>, config: MonitorConfig) -> Self {
        Self { source, config }
    }

    /// Pool size for a cycle with `authority_count` authorities
    pub fn pool_size(&self, authority_count: usize) -> usize {
        authority_count.max(1).min(self.config.max_concurrent_fetches)
    }

    /// Fetch both families, bounded by the cycle deadline
    pub async fn fetch_cycle(&self, authority_count: usize) -> CycleFetch {
        let deadline = Instant::now() + self.config.cycle_timeout();
        let pool = self.pool_size(authority_count);

        log::info!(
            "📡 Fetching votes and bandwidth files (pool {}, deadline {}s)",
            pool,
            self.config.cycle_timeout_secs
        );

        let (votes, bandwidth) = futures::join!(
            self.fetch_family(DocumentKind::Vote, pool, deadline),
            self.fetch_family(DocumentKind::Bandwidth, pool, deadline),
        );

        let mut stats = FetchStats::default();
        for doc in votes.documents.iter().chain(bandwidth.documents.iter()) {
            stats.attempted += 1;
            match &doc.body {
                Ok(body) => {
                    stats.succeeded += 1;
                    stats.bytes_received += body.len() as u64;
                }
                Err(_) => stats.failed += 1,
            }
        }

        log::info!(
            "📊 Fetched {}/{} documents ({} KB)",
            stats.succeeded,
            stats.attempted,
            stats.bytes_received / 1024
        );

        CycleFetch {
            votes,
            bandwidth,
            stats,
        }
    }

    async fn fetch_family(&self, kind: DocumentKind, pool: usize, deadline: Instant) -> FamilyFetch {
        let listing_url = match kind {
            DocumentKind::Vote => self.config.votes_url(),
            DocumentKind::Bandwidth => self.config.bandwidth_url(),
        };

        let listing = match self
            .fetch_bounded(&listing_url, self.config.max_listing_bytes, deadline)
            .await
        {
            Ok(body) => body,
            Err(err) => {
                log::warn!("⚠️ {} listing unavailable: {}", kind, err);
                return FamilyFetch {
                    kind,
                    selected: Vec::new(),
                    documents: Vec::new(),
                    listing_error: Some(err),
                };
            }
        };

        let selected = select_latest_hour(&extract_document_names(&listing), kind);
        if let Some(first) = selected.first() {
            log::info!(
                "🗂️ {} {} files for {}",
                selected.len(),
                kind,
                first.hour.format("%Y-%m-%d %H:00")
            );
        } else {
            log::warn!("⚠️ No {} files found in listing {}", kind, listing_url);
        }

        let max_bytes = self.config.max_document_bytes;
        let mut documents: Vec<FetchedDocument> = stream::iter(selected.iter().cloned())
            .map(|name| {
                let url = join_url(&listing_url, &name.file_name);
                async move {
                    let body = self.fetch_bounded(&url, max_bytes, deadline).await;
                    if let Err(err) = &body {
                        log::warn!("⚠️ {} {} fetch failed: {}", kind, name.authority_key, err);
                    }
                    FetchedDocument { name, url, body }
                }
            })
            .buffer_unordered(pool)
            .collect()
            .await;

        // Completion order is arbitrary
        documents.sort_by(|a, b| a.name.file_name.cmp(&b.name.file_name));

        FamilyFetch {
            kind,
            selected,
            documents,
            listing_error: None,
        }
    }

    /// Fetch with the per-file timeout, cut short by the cycle deadline
    async fn fetch_bounded(&self, url: &str, max_bytes: usize, deadline: Instant) -> Result<String> {
        let now = Instant::now();
        let per_file = now + self.config.fetch_timeout();
        let until = per_file.min(deadline);
        let timeout_ms = until.saturating_duration_since(now).as_millis() as u64;

        match tokio::time::timeout_at(until, self.source.fetch(url, max_bytes)).await {
            Ok(result) => result,
            Err(_) => Err(HealthError::Timeout {
                target: url.to_string(),
                timeout_ms,
            }),
        }
    }
}
