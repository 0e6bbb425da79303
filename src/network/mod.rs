//! Network layer
//!
//! Resolves the latest hour's documents from the mirror's listing pages and
//! fetches them with bounded concurrency. Nothing in here parses document
//! bodies.

mod fetcher;
mod listing;
mod source;

pub use fetcher::{CycleFetch, DocumentFetcher, FamilyFetch, FetchFailure, FetchStats, FetchedDocument};
pub use listing::{extract_document_names, select_latest_hour, DocumentKind, DocumentName};
pub use source::{DocumentSource, HttpDocumentSource, MemoryDocumentSource};
