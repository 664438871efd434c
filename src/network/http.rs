//! HTTP relay client
//!
//! Talks to a SNICKER relay server (see [`crate::relay`]): a single `GET /`
//! returns every stored record, `POST /` submits a newline-separated batch.
//! Requests may be routed through a SOCKS5 proxy, e.g. a local Tor daemon
//! for onion relays.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::StatusCode;

use super::serialization::{format_records, parse_records, RelayRecord};
use super::{unix_timestamp, NetworkStatus, ProposalNetwork, PublishReceipt, RetryPolicy};
use crate::relay::{ErrorBody, ACCEPTED_BODY};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Relay rejected the batch ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("Relay returned status {0}")]
    Status(StatusCode),

    #[error("Unexpected relay response: {0}")]
    UnexpectedResponse(String),
}

impl RelayError {
    /// Transport failures and server errors are retried; a rejection is final
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::Http(_) => true,
            RelayError::Status(status) => status.is_server_error(),
            RelayError::Rejected { .. } | RelayError::UnexpectedResponse(_) => false,
        }
    }
}

/// Client for one relay server
pub struct HttpRelay {
    url: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpRelay {
    /// Create a client for the relay at `url`
    ///
    /// # Arguments
    /// * `url` - Relay base URL, e.g. `http://xyz.onion` or `http://127.0.0.1:8080`
    /// * `timeout` - Per-request timeout
    /// * `proxy` - Optional SOCKS5 proxy, `host:port` or a full `socks5h://` URL
    /// * `retry` - Attempts and delay for transient failures
    pub fn new(
        url: impl Into<String>,
        timeout: Duration,
        proxy: Option<&str>,
        retry: RetryPolicy,
    ) -> Result<Self, RelayError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(proxy) = proxy {
            let proxy_url = if proxy.contains("://") {
                proxy.to_string()
            } else {
                format!("socks5h://{}", proxy)
            };
            builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
        }

        Ok(Self {
            url: url.into(),
            client: builder.build()?,
            retry,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post_once(&self, body: &str) -> Result<(), RelayError> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(body.to_string())
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if status == StatusCode::BAD_REQUEST {
            return Err(match serde_json::from_str::<ErrorBody>(&text) {
                Ok(error) => RelayError::Rejected {
                    code: error.error_code,
                    message: error.message,
                },
                Err(_) => RelayError::UnexpectedResponse(text),
            });
        }
        if !status.is_success() {
            return Err(RelayError::Status(status));
        }
        if text.trim() != ACCEPTED_BODY {
            return Err(RelayError::UnexpectedResponse(text));
        }
        Ok(())
    }

    async fn get_once(&self) -> Result<String, RelayError> {
        let response = self.client.get(&self.url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Status(status));
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl ProposalNetwork for HttpRelay {
    async fn publish_proposals(&self, records: &[RelayRecord]) -> Result<PublishReceipt> {
        let body = format_records(records);

        self.retry
            .run(
                &format!("POST to {}", self.url),
                || self.post_once(&body),
                RelayError::is_retryable,
            )
            .await?;

        tracing::info!("📤 Relay {} accepted {} proposal(s)", self.url, records.len());

        Ok(PublishReceipt {
            id: self.url.clone(),
            accepted: records.len(),
            timestamp: unix_timestamp(),
        })
    }

    async fn fetch_proposals(&self) -> Result<Vec<RelayRecord>> {
        let text = self
            .retry
            .run(
                &format!("GET from {}", self.url),
                || self.get_once(),
                RelayError::is_retryable,
            )
            .await?;

        let (records, skipped) = parse_records(&text);
        if skipped > 0 {
            tracing::warn!(
                "⚠️  Skipped {} malformed line(s) from relay {}",
                skipped,
                self.url
            );
        }
        tracing::info!("📥 Fetched {} proposal(s) from {}", records.len(), self.url);

        Ok(records)
    }

    async fn check_connection(&self) -> Result<NetworkStatus> {
        match self.get_once().await {
            Ok(_) => Ok(NetworkStatus::Connected),
            Err(RelayError::Http(e)) if e.is_connect() || e.is_timeout() => {
                Ok(NetworkStatus::Disconnected)
            }
            Err(e) => Ok(NetworkStatus::Error(e.to_string())),
        }
    }
}
