//! File-based proposal network implementation
//!
//! Reads and writes a relay store file directly, without an HTTP server.
//! Useful for:
//! - Local testing
//! - Air-gapped setups (carry the file across)
//! - Running a proposer and receiver on the same machine

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::serialization::{format_records, parse_records, RelayRecord};
use super::{unix_timestamp, NetworkStatus, ProposalNetwork, PublishReceipt};
use crate::relay::{PostOutcome, RelayStore};

/// File-based proposal network
pub struct FileBasedNetwork {
    store: RelayStore,
}

impl FileBasedNetwork {
    /// Open (or create) the store file at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            store: RelayStore::open(path).await?,
        })
    }

    /// Get the store file path
    pub fn path(&self) -> &Path {
        self.store.path()
    }
}

#[async_trait]
impl ProposalNetwork for FileBasedNetwork {
    async fn publish_proposals(&self, records: &[RelayRecord]) -> Result<PublishReceipt> {
        let batch = format_records(records);

        match self.store.post(batch.as_bytes()).await? {
            PostOutcome::Accepted(accepted) => {
                tracing::info!(
                    "📝 Published {} proposal(s) to {}",
                    accepted,
                    self.path().display()
                );
                Ok(PublishReceipt {
                    id: self.path().to_string_lossy().to_string(),
                    accepted,
                    timestamp: unix_timestamp(),
                })
            }
            PostOutcome::Rejected(reason) => bail!("Proposal batch rejected: {}", reason),
        }
    }

    async fn fetch_proposals(&self) -> Result<Vec<RelayRecord>> {
        let contents = self.store.get_all().await?;
        let text = String::from_utf8_lossy(&contents);

        let (records, skipped) = parse_records(&text);
        if skipped > 0 {
            tracing::warn!(
                "⚠️  Skipped {} malformed line(s) in {}",
                skipped,
                self.path().display()
            );
        }
        tracing::debug!("📂 Read {} proposal(s) from {}", records.len(), self.path().display());

        Ok(records)
    }

    async fn check_connection(&self) -> Result<NetworkStatus> {
        Ok(match tokio::fs::metadata(self.path()).await {
            Ok(meta) if meta.is_file() => NetworkStatus::Connected,
            Ok(_) => NetworkStatus::Error(format!("{} is not a file", self.path().display())),
            Err(_) => NetworkStatus::Disconnected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bdk_wallet::bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

    fn record(tag: u8) -> RelayRecord {
        let secp = Secp256k1::new();
        let pk = PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[tag; 32]).unwrap());
        let mut blob = vec![0x01];
        blob.extend_from_slice(&[tag; 40]);
        RelayRecord {
            blob,
            sender_key: pk.serialize(),
        }
    }

    #[tokio::test]
    async fn test_publish_then_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let network = FileBasedNetwork::open(dir.path().join("proposals.txt")).await.unwrap();

        let receipt = network.publish_proposals(&[record(1), record(2)]).await.unwrap();
        assert_eq!(receipt.accepted, 2);
        network.publish_proposals(&[record(3)]).await.unwrap();

        let fetched = network.fetch_proposals().await.unwrap();
        assert_eq!(fetched, vec![record(1), record(2), record(3)]);
        assert_eq!(network.check_connection().await.unwrap(), NetworkStatus::Connected);
    }

    #[tokio::test]
    async fn test_fetch_skips_foreign_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proposals.txt");
        tokio::fs::write(&path, format!("junk line\n{}\n", record(7)))
            .await
            .unwrap();

        let network = FileBasedNetwork::open(&path).await.unwrap();
        assert_eq!(network.fetch_proposals().await.unwrap(), vec![record(7)]);
    }
}
