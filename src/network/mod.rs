//! Network abstraction layer for SNICKER proposal distribution
//!
//! Provides a unified interface for publishing and fetching proposals
//! across different relay backends (HTTP relay servers, a local store file).

pub mod file_based;
pub mod http;
pub mod serialization;

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use serialization::RelayRecord;

/// Trait for proposal network backends
#[async_trait]
pub trait ProposalNetwork: Send + Sync {
    /// Publish a batch of proposals
    ///
    /// The batch is accepted or refused as a whole.
    ///
    /// # Returns
    /// A receipt confirming publication with metadata
    async fn publish_proposals(&self, records: &[RelayRecord]) -> Result<PublishReceipt>;

    /// Fetch every proposal the backend holds, in storage order
    ///
    /// Lines that are not well-formed records are skipped.
    async fn fetch_proposals(&self) -> Result<Vec<RelayRecord>>;

    /// Health check / connection status
    async fn check_connection(&self) -> Result<NetworkStatus>;
}

/// Receipt confirming successful proposal publication
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    /// Where the batch went (relay URL, file path)
    pub id: String,

    /// Number of records in the accepted batch
    pub accepted: usize,

    /// Publication timestamp (Unix seconds)
    pub timestamp: u64,
}

/// Network connection status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkStatus {
    /// Connected and operational
    Connected,

    /// Disconnected (not reachable)
    Disconnected,

    /// Error state with description
    Error(String),
}

/// Bounded retry with a fixed delay between attempts
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one (at least 1)
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// attempts run out
    ///
    /// # Arguments
    /// * `what` - Short description used in log messages
    /// * `op` - Produces a fresh future per attempt
    /// * `is_retryable` - Decides whether an error is worth another attempt
    pub async fn run<T, E, F, Fut>(
        &self,
        what: &str,
        mut op: F,
        is_retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts && is_retryable(&e) => {
                    tracing::warn!(
                        "⚠️  {} failed (attempt {}/{}): {}; retrying in {:?}",
                        what,
                        attempt,
                        attempts,
                        e,
                        self.delay
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub(crate) fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
