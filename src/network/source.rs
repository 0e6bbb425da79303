//! Document sources
//!
//! `DocumentSource` is the only seam between the cycle and the network.
//! `HttpDocumentSource` talks to a CollecTor mirror over reqwest;
//! `MemoryDocumentSource` serves canned bodies for offline runs and tests.

use crate::config::MonitorConfig;
use crate::error::{HealthError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fetches one URL's body as text
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Fetch `url`, failing once the body exceeds `max_bytes`
    async fn fetch(&self, url: &str, max_bytes: usize) -> Result<String>;
}

/// reqwest-backed source
pub struct HttpDocumentSource {
    client: reqwest::Client,
}

impl HttpDocumentSource {
    pub fn new(config: &MonitorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.fetch_timeout_secs.min(30)))
            .timeout(config.fetch_timeout())
            .build()
            .map_err(|e| HealthError::Config(format!("HTTP client error: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DocumentSource for HttpDocumentSource {
    async fn fetch(&self, url: &str, max_bytes: usize) -> Result<String> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| HealthError::from_reqwest(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HealthError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let too_large = || HealthError::DocumentTooLarge {
            url: url.to_string(),
            limit: max_bytes,
        };
        if response.content_length().is_some_and(|len| len > max_bytes as u64) {
            return Err(too_large());
        }

        // Content-Length may be absent or wrong, so the limit is enforced
        // while streaming too
        let mut body: Vec<u8> = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| HealthError::from_reqwest(url, e))?
        {
            if body.len() + chunk.len() > max_bytes {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }

        log::debug!("Fetched {} ({} bytes)", url, body.len());
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

/// What a canned URL answers with
#[derive(Debug, Clone)]
enum Canned {
    Body(String),
    Fail(HealthError),
    Hang,
}

/// In-memory source; unknown URLs answer 404
#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentSource {
    responses: Arc<Mutex<HashMap<String, Canned>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MemoryDocumentSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` at `url`
    pub fn insert(&self, url: impl Into<String>, body: impl Into<String>) {
        self.set(url.into(), Canned::Body(body.into()));
    }

    /// Fail requests for `url` with `error`
    pub fn fail(&self, url: impl Into<String>, error: HealthError) {
        self.set(url.into(), Canned::Fail(error));
    }

    /// Never answer requests for `url`
    pub fn hang(&self, url: impl Into<String>) {
        self.set(url.into(), Canned::Hang);
    }

    /// Drop every canned response
    pub fn clear(&self) {
        if let Ok(mut map) = self.responses.lock() {
            map.clear();
        }
    }

    /// URLs requested so far, in order
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn set(&self, url: String, canned: Canned) {
        if let Ok(mut map) = self.responses.lock() {
            map.insert(url, canned);
        }
    }
}

#[async_trait]
impl DocumentSource for MemoryDocumentSource {
    async fn fetch(&self, url: &str, max_bytes: usize) -> Result<String> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(url.to_string());
        }
        let canned = self
            .responses
            .lock()
            .map_err(|_| HealthError::Internal("memory source poisoned".into()))?
            .get(url)
            .cloned();

        match canned {
            Some(Canned::Body(body)) if body.len() > max_bytes => Err(HealthError::DocumentTooLarge {
                url: url.to_string(),
                limit: max_bytes,
            }),
            Some(Canned::Body(body)) => Ok(body),
            Some(Canned::Fail(err)) => Err(err),
            Some(Canned::Hang) => futures::future::pending().await,
            None => Err(HealthError::HttpStatus {
                url: url.to_string(),
                status: 404,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_source() {
        let source = MemoryDocumentSource::new();
        source.insert("http://m/a", "hello");
        source.fail("http://m/b", HealthError::ConnectionFailed("refused".into()));

        assert_eq!(source.fetch("http://m/a", 100).await.unwrap(), "hello");
        assert!(matches!(
            source.fetch("http://m/a", 3).await,
            Err(HealthError::DocumentTooLarge { .. })
        ));
        assert!(matches!(
            source.fetch("http://m/b", 100).await,
            Err(HealthError::ConnectionFailed(_))
        ));
        assert!(matches!(
            source.fetch("http://m/c", 100).await,
            Err(HealthError::HttpStatus { status: 404, .. })
        ));
        assert_eq!(source.requests().len(), 4);
    }

    #[test]
    fn test_http_source_builds() {
        assert!(HttpDocumentSource::new(&MonitorConfig::default()).is_ok());
    }
}
