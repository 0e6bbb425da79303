//! Error types for consensus-health
//!
//! This module provides the error taxonomy used across a refresh cycle:
//! - Detailed error variants for each failure mode
//! - Error scope (how much of the cycle a failure takes down)
//! - Error codes for programmatic handling
//! - User-friendly messages

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HealthError>;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Network errors (1xx)
    ConnectionFailed = 100,
    Timeout = 101,
    HttpStatus = 102,
    DocumentTooLarge = 103,

    // Parse errors (2xx)
    ParseError = 200,

    // Validation errors (3xx)
    ValidationError = 300,

    // Cache errors (4xx)
    CacheError = 400,

    // Cycle errors (5xx)
    TotalCycleFailure = 500,

    // Configuration errors (8xx)
    ConfigError = 800,

    // Internal errors (9xx)
    InternalError = 900,
}

/// How much of a refresh cycle a failure removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorScope {
    /// One line of one document
    Line,
    /// One fetched file
    Document,
    /// One authority's whole contribution for the cycle
    Authority,
    /// The persisted snapshot
    Cache,
    /// The whole cycle (fallback to cache)
    Cycle,
    /// Process-level (bad configuration, bugs)
    Process,
}

/// Main error type
#[derive(Error, Debug, Clone)]
pub enum HealthError {
    // ===== Network Errors =====
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timed out after {timeout_ms}ms: {target}")]
    Timeout { target: String, timeout_ms: u64 },

    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Document too large: {url} exceeds {limit} bytes")]
    DocumentTooLarge { url: String, limit: usize },

    // ===== Parse Errors =====
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    // ===== Validation Errors =====
    #[error("Document rejected: {0}")]
    Validation(String),

    // ===== Cache Errors =====
    #[error("Cache error: {0}")]
    Cache(String),

    // ===== Cycle Errors =====
    #[error("No documents retrieved this cycle ({failures} fetches failed)")]
    TotalCycleFailure { failures: usize },

    // ===== Configuration Errors =====
    #[error("Invalid configuration: {0}")]
    Config(String),

    // ===== Internal Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HealthError {
    /// Get the error code for programmatic handling
    pub fn code(&self) -> ErrorCode {
        match self {
            HealthError::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            HealthError::Timeout { .. } => ErrorCode::Timeout,
            HealthError::HttpStatus { .. } => ErrorCode::HttpStatus,
            HealthError::DocumentTooLarge { .. } => ErrorCode::DocumentTooLarge,
            HealthError::Parse { .. } => ErrorCode::ParseError,
            HealthError::Validation(_) => ErrorCode::ValidationError,
            HealthError::Cache(_) => ErrorCode::CacheError,
            HealthError::TotalCycleFailure { .. } => ErrorCode::TotalCycleFailure,
            HealthError::Config(_) => ErrorCode::ConfigError,
            HealthError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// How far this failure propagates within a cycle
    pub fn scope(&self) -> ErrorScope {
        match self {
            HealthError::ConnectionFailed(_)
            | HealthError::Timeout { .. }
            | HealthError::HttpStatus { .. }
            | HealthError::DocumentTooLarge { .. } => ErrorScope::Document,
            HealthError::Parse { .. } => ErrorScope::Line,
            HealthError::Validation(_) => ErrorScope::Authority,
            HealthError::Cache(_) => ErrorScope::Cache,
            HealthError::TotalCycleFailure { .. } => ErrorScope::Cycle,
            HealthError::Config(_) | HealthError::Internal(_) => ErrorScope::Process,
        }
    }

    /// Whether the next cycle is likely to succeed where this one failed
    pub fn is_retryable(&self) -> bool {
        match self {
            HealthError::ConnectionFailed(_)
            | HealthError::Timeout { .. }
            | HealthError::TotalCycleFailure { .. } => true,
            HealthError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Get a user-friendly message for display
    pub fn user_message(&self) -> String {
        match self {
            HealthError::ConnectionFailed(_) | HealthError::HttpStatus { .. } => {
                "A directory document could not be downloaded.".into()
            }
            HealthError::Timeout { .. } => "A directory document download timed out.".into(),
            HealthError::DocumentTooLarge { .. } => {
                "A directory document exceeded the size limit and was rejected.".into()
            }
            HealthError::Parse { .. } => "A malformed line was skipped.".into(),
            HealthError::Validation(_) => {
                "A directory document was unusable and was ignored for this cycle.".into()
            }
            HealthError::Cache(_) => "Cached data was unreadable and has been discarded.".into(),
            HealthError::TotalCycleFailure { .. } => {
                "No fresh directory data could be retrieved; showing the last known data.".into()
            }
            HealthError::Config(_) => "The monitor configuration is invalid.".into(),
            HealthError::Internal(_) => "An internal error occurred. Please report this bug.".into(),
        }
    }

    /// Classify a reqwest failure for `url`
    pub fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HealthError::Timeout {
                target: url.to_string(),
                timeout_ms: 0,
            }
        } else if let Some(status) = err.status() {
            HealthError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            }
        } else {
            HealthError::ConnectionFailed(format!("{}: {}", url, err))
        }
    }
}

impl From<serde_json::Error> for HealthError {
    fn from(err: serde_json::Error) -> Self {
        HealthError::Cache(format!("JSON: {}", err))
    }
}

impl From<std::io::Error> for HealthError {
    fn from(err: std::io::Error) -> Self {
        HealthError::Cache(format!("I/O: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scopes() {
        assert_eq!(
            HealthError::ConnectionFailed("x".into()).scope(),
            ErrorScope::Document
        );
        assert_eq!(
            HealthError::Parse {
                line: 3,
                message: "bad".into()
            }
            .scope(),
            ErrorScope::Line
        );
        assert_eq!(
            HealthError::Validation("no relays".into()).scope(),
            ErrorScope::Authority
        );
        assert_eq!(
            HealthError::TotalCycleFailure { failures: 16 }.scope(),
            ErrorScope::Cycle
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(HealthError::Timeout {
            target: "x".into(),
            timeout_ms: 10
        }
        .is_retryable());
        assert!(HealthError::HttpStatus {
            url: "x".into(),
            status: 503
        }
        .is_retryable());
        assert!(!HealthError::HttpStatus {
            url: "x".into(),
            status: 404
        }
        .is_retryable());
        assert!(!HealthError::Validation("empty".into()).is_retryable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            HealthError::Cache("corrupt".into()).code(),
            ErrorCode::CacheError
        );
        assert_eq!(ErrorCode::TotalCycleFailure as u32, 500);
    }

    #[test]
    fn test_display() {
        let err = HealthError::DocumentTooLarge {
            url: "https://example/vote".into(),
            limit: 1024,
        };
        assert!(err.to_string().contains("1024 bytes"));
    }
}
