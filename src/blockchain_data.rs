//! Blockchain data access abstraction
//!
//! Provides a unified interface for accessing blockchain data from various sources:
//! - Esplora-compatible HTTP APIs such as mempool.space (current implementation)
//! - Bitcoin Core RPC (future)

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use bdk_wallet::bitcoin::{
    consensus::encode::{deserialize, serialize_hex},
    Amount, Block, BlockHash, Network, ScriptBuf, Transaction, TxOut, Txid,
};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum BlockchainDataError {
    #[error("Network not supported without an explicit API URL: {0:?}")]
    UnsupportedNetwork(Network),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("API returned status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Block not found at height {0}")]
    BlockNotFound(u32),

    #[error("Invalid block hash returned: {0}")]
    InvalidBlockHash(String),

    #[error("Transaction rejected: {0}")]
    BroadcastRejected(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

impl BlockchainDataError {
    /// Connectivity problems and server-side errors are worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            BlockchainDataError::HttpError(e) => !e.is_builder(),
            BlockchainDataError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Trait for accessing blockchain data from various sources
#[async_trait::async_trait]
pub trait BlockchainDataProvider: Send + Sync {
    /// Fetch the full block at a specific height
    async fn get_block(&self, height: u32) -> Result<Block, BlockchainDataError>;

    /// Fetch current blockchain tip height
    async fn get_tip_height(&self) -> Result<u32, BlockchainDataError>;

    /// Submit a signed transaction to the network
    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, BlockchainDataError>;

    /// Fee rate in sat/vB for confirmation within `target_blocks`
    async fn estimate_fee(&self, target_blocks: u32) -> Result<f64, BlockchainDataError>;

    /// Outputs spent by each input of `txid`, in input order
    async fn get_prevouts(&self, txid: Txid) -> Result<Vec<TxOut>, BlockchainDataError>;
}

/// The parts of an Esplora `/tx/:txid` response we read
#[derive(Debug, Deserialize)]
struct EsploraTx {
    vin: Vec<EsploraVin>,
}

#[derive(Debug, Deserialize)]
struct EsploraVin {
    #[serde(default)]
    prevout: Option<EsploraPrevout>,
}

#[derive(Debug, Deserialize)]
struct EsploraPrevout {
    scriptpubkey: String,
    value: u64,
}

fn prevouts_from_esplora(json: &str) -> Result<Vec<TxOut>, BlockchainDataError> {
    let tx: EsploraTx =
        serde_json::from_str(json).map_err(|e| BlockchainDataError::ParseError(e.to_string()))?;

    tx.vin
        .into_iter()
        .enumerate()
        .map(|(i, vin)| {
            // Coinbase inputs carry no prevout
            let prevout = vin.prevout.ok_or_else(|| {
                BlockchainDataError::ParseError(format!("input {} has no prevout", i))
            })?;
            let script_pubkey = ScriptBuf::from_hex(&prevout.scriptpubkey)
                .map_err(|e| BlockchainDataError::ParseError(e.to_string()))?;
            Ok(TxOut {
                value: Amount::from_sat(prevout.value),
                script_pubkey,
            })
        })
        .collect()
}

/// Esplora API implementation (mempool.space by default)
pub struct MempoolSpaceApi {
    network: Network,
    base_url: Option<String>,
    timeout_secs: u64,
}

impl MempoolSpaceApi {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            base_url: None,
            timeout_secs: 10,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Use a specific Esplora instance (required for regtest)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    fn base_url(&self) -> Result<&str, BlockchainDataError> {
        if let Some(url) = &self.base_url {
            return Ok(url.as_str());
        }
        match self.network {
            Network::Bitcoin => Ok("https://mempool.space/api"),
            Network::Testnet => Ok("https://mempool.space/testnet/api"),
            Network::Signet => Ok("https://mempool.space/signet/api"),
            Network::Regtest => Err(BlockchainDataError::UnsupportedNetwork(Network::Regtest)),
            _ => Err(BlockchainDataError::UnsupportedNetwork(self.network)),
        }
    }

    fn client(&self) -> Result<reqwest::Client, BlockchainDataError> {
        Ok(reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?)
    }

    async fn get_text(&self, url: &str) -> Result<String, BlockchainDataError> {
        let response = self.client()?.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BlockchainDataError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.text().await?)
    }

    async fn get_block_hash(&self, height: u32) -> Result<BlockHash, BlockchainDataError> {
        let url = format!("{}/block-height/{}", self.base_url()?, height);
        tracing::debug!("Fetching block hash from {}", url);

        let block_hash_str = match self.get_text(&url).await {
            Ok(text) => text,
            Err(BlockchainDataError::Status { status: 404, .. }) => {
                return Err(BlockchainDataError::BlockNotFound(height))
            }
            Err(e) => return Err(e),
        };
        let block_hash_str = block_hash_str.trim();

        // Validate it's a valid 64-character hex string
        if block_hash_str.len() != 64 || !block_hash_str.chars().all(|c| c.is_ascii_hexdigit()) {
            tracing::error!("Invalid block hash from API: {}", block_hash_str);
            return Err(BlockchainDataError::InvalidBlockHash(block_hash_str.to_string()));
        }

        BlockHash::from_str(block_hash_str).map_err(|e| BlockchainDataError::ParseError(e.to_string()))
    }
}

#[async_trait::async_trait]
impl BlockchainDataProvider for MempoolSpaceApi {
    async fn get_block(&self, height: u32) -> Result<Block, BlockchainDataError> {
        let hash = self.get_block_hash(height).await?;
        let url = format!("{}/block/{}/raw", self.base_url()?, hash);

        let response = self.client()?.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BlockchainDataError::Status {
                status: status.as_u16(),
                url,
            });
        }
        let bytes = response.bytes().await?;

        let block: Block =
            deserialize(&bytes).map_err(|e| BlockchainDataError::ParseError(e.to_string()))?;

        tracing::debug!(
            "📦 Fetched block {} ({}) with {} transactions",
            height,
            hash,
            block.txdata.len()
        );
        Ok(block)
    }

    async fn get_tip_height(&self) -> Result<u32, BlockchainDataError> {
        let url = format!("{}/blocks/tip/height", self.base_url()?);
        tracing::debug!("Fetching tip height from {}", url);

        let height_str = self.get_text(&url).await?;
        let height = height_str
            .trim()
            .parse::<u32>()
            .map_err(|e| BlockchainDataError::ParseError(e.to_string()))?;

        tracing::debug!("Current tip height: {}", height);
        Ok(height)
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, BlockchainDataError> {
        let url = format!("{}/tx", self.base_url()?);

        let response = self.client()?.post(&url).body(serialize_hex(tx)).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_server_error() {
            return Err(BlockchainDataError::Status {
                status: status.as_u16(),
                url,
            });
        }
        if !status.is_success() {
            return Err(BlockchainDataError::BroadcastRejected(body));
        }

        let txid = Txid::from_str(body.trim())
            .map_err(|e| BlockchainDataError::ParseError(e.to_string()))?;
        tracing::info!("📡 Broadcast transaction {}", txid);
        Ok(txid)
    }

    async fn estimate_fee(&self, target_blocks: u32) -> Result<f64, BlockchainDataError> {
        let url = format!("{}/fee-estimates", self.base_url()?);
        tracing::debug!("Fetching fee estimates from {}", url);

        let response = self.client()?.get(&url).send().await?;
        let estimates: HashMap<String, f64> = response.json().await?;
        let estimates: HashMap<u32, f64> = estimates
            .into_iter()
            .filter_map(|(k, v)| k.parse().ok().map(|k| (k, v)))
            .collect();

        pick_fee_rate(&estimates, target_blocks).ok_or_else(|| {
            BlockchainDataError::ParseError("API returned no fee estimates".to_string())
        })
    }

    async fn get_prevouts(&self, txid: Txid) -> Result<Vec<TxOut>, BlockchainDataError> {
        let url = format!("{}/tx/{}", self.base_url()?, txid);
        tracing::debug!("Fetching prevouts from {}", url);

        let json = self.get_text(&url).await?;
        prevouts_from_esplora(&json)
    }
}

/// Choose the estimate for the closest target at or above `target_blocks`,
/// falling back to the slowest one available
fn pick_fee_rate(estimates: &HashMap<u32, f64>, target_blocks: u32) -> Option<f64> {
    estimates
        .iter()
        .filter(|&(&target, _)| target >= target_blocks)
        .min_by_key(|&(&target, _)| target)
        .or_else(|| estimates.iter().max_by_key(|&(&target, _)| target))
        .map(|(_, &rate)| rate)
}
