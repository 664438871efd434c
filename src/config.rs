//! Configuration management for the SNICKER tools
//!
//! One TOML file is shared by every subcommand: relay server, finder,
//! proposer and receiver each read their own section.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::network::RetryPolicy;
use crate::snicker::finder::FinderOptions;
use crate::snicker::receiver::AcceptancePolicy;

/// Network type for Bitcoin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Regtest,
    Signet,
    #[value(alias = "bitcoin")]
    Mainnet,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Regtest => "regtest",
            Network::Signet => "signet",
            Network::Mainnet => "mainnet",
        }
    }

    pub fn to_bdk_network(&self) -> bdk_wallet::bitcoin::Network {
        match self {
            Network::Regtest => bdk_wallet::bitcoin::Network::Regtest,
            Network::Signet => bdk_wallet::bitcoin::Network::Signet,
            Network::Mainnet => bdk_wallet::bitcoin::Network::Bitcoin,
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Network {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "regtest" => Ok(Network::Regtest),
            "signet" => Ok(Network::Signet),
            "mainnet" | "bitcoin" => Ok(Network::Mainnet),
            _ => Err(anyhow::anyhow!("Invalid network: {}", s)),
        }
    }
}

/// Relay servers we publish to and fetch from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay base URLs, e.g. `http://xyz.onion`
    pub servers: Vec<String>,

    /// SOCKS5 proxy for relay traffic, `host:port` (e.g. Tor on 127.0.0.1:9050)
    pub proxy: Option<String>,

    pub timeout_secs: u64,

    /// Extra attempts after the first one fails
    pub max_retries: u32,

    pub retry_delay_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            proxy: None,
            timeout_secs: 30,
            max_retries: 2,
            retry_delay_ms: 1_000,
        }
    }
}

/// The relay server (`snicker serve`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on, `ip:port`
    pub listen: String,

    /// Proposal store file; relative paths are under the network data dir
    pub database: PathBuf,

    /// Largest accepted POST body
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            database: PathBuf::from("snicker-proposals.txt"),
            max_body_bytes: 1024 * 1024,
        }
    }
}

/// Block explorer access
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockchainConfig {
    /// Esplora API URL; defaults to mempool.space for the network
    pub esplora_url: Option<String>,

    pub timeout_secs: u64,

    /// Extra attempts after the first one fails
    pub max_retries: u32,

    pub retry_delay_ms: u64,

    /// Fixed fee rate in sat/vB; when unset the explorer's estimate is used
    pub fee_rate: Option<f64>,

    /// Confirmation target for fee estimation
    pub fee_target_blocks: u32,
}

impl Default for BlockchainConfig {
    fn default() -> Self {
        Self {
            esplora_url: None,
            timeout_secs: 10,
            max_retries: 3,
            retry_delay_ms: 2_000,
            fee_rate: None,
            fee_target_blocks: 3,
        }
    }
}

/// Receiver acceptance rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Minimum sats we must gain from a proposal (may be negative)
    pub lowest_net_gain: i64,

    /// Largest fee estimate we accept
    pub max_fee: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            lowest_net_gain: 0,
            max_fee: 10_000,
        }
    }
}

/// Candidate finder (`snicker find`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinderConfig {
    /// Candidate log; relative paths are under the network data dir
    pub candidates_file: PathBuf,

    /// Blocks fetched concurrently
    pub concurrency: usize,

    /// Look up spent outputs and drop candidates whose values cannot be a coinjoin
    pub check_values: bool,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            candidates_file: PathBuf::from("candidates.txt"),
            concurrency: 4,
            check_values: true,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bitcoin network to use
    pub network: Network,

    /// Directory where data files and logs are stored
    pub data_dir: PathBuf,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub blockchain: BlockchainConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub finder: FinderConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::Signet,
            data_dir: default_data_dir(),
            relay: RelayConfig::default(),
            server: ServerConfig::default(),
            blockchain: BlockchainConfig::default(),
            policy: PolicyConfig::default(),
            finder: FinderConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, or create it
    pub fn load() -> Result<Self> {
        Self::load_from(&config_file_path()?)
    }

    /// Load configuration from `config_path`, writing a default file if it
    /// doesn't exist
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let contents = fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

            tracing::info!("📝 Loaded config from: {}", config_path.display());
            Ok(config)
        } else {
            tracing::info!("📝 No config file found, creating default at: {}", config_path.display());
            let config = Self::default();
            config.save_to(config_path)?;
            Ok(config)
        }
    }

    /// Save configuration to `config_path`
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        // Ensure config directory exists
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(config_path, contents)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        tracing::info!("💾 Saved config to: {}", config_path.display());
        Ok(())
    }

    /// Get the path where data for this network is stored
    pub fn network_data_dir(&self) -> PathBuf {
        self.data_dir.join(self.network.as_str())
    }

    /// Resolve a configured path: relative paths live in the network data dir
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.network_data_dir().join(path)
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve_path(&self.server.database)
    }

    pub fn candidates_path(&self) -> PathBuf {
        self.resolve_path(&self.finder.candidates_file)
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_secs(self.relay.timeout_secs)
    }

    pub fn relay_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.relay.max_retries.saturating_add(1),
            Duration::from_millis(self.relay.retry_delay_ms),
        )
    }

    pub fn blockchain_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.blockchain.max_retries.saturating_add(1),
            Duration::from_millis(self.blockchain.retry_delay_ms),
        )
    }

    pub fn finder_options(&self) -> FinderOptions {
        FinderOptions {
            concurrency: self.finder.concurrency,
            retry: self.blockchain_retry(),
            check_values: self.finder.check_values,
        }
    }

    pub fn acceptance_policy(&self) -> AcceptancePolicy {
        AcceptancePolicy {
            lowest_net_gain: self.policy.lowest_net_gain,
            max_fee: self.policy.max_fee,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for server in &self.relay.servers {
            if !(server.starts_with("http://") || server.starts_with("https://")) {
                return Err(anyhow::anyhow!(
                    "Relay server must be an http(s) URL, got: {}",
                    server
                ));
            }
        }

        // Validate proxy format if provided
        if let Some(ref proxy) = self.relay.proxy {
            let host_port = proxy.rsplit("://").next().unwrap_or(proxy);
            let Some((_, port_str)) = host_port.rsplit_once(':') else {
                return Err(anyhow::anyhow!("Proxy must be in format 'host:port', got: {}", proxy));
            };
            port_str
                .parse::<u16>()
                .with_context(|| format!("Invalid port in proxy: {}", proxy))?;
        }

        self.server
            .listen
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid listen address: {}", self.server.listen))?;

        if self.server.max_body_bytes == 0 {
            return Err(anyhow::anyhow!("server.max_body_bytes must be positive"));
        }
        if self.relay.timeout_secs == 0 || self.blockchain.timeout_secs == 0 {
            return Err(anyhow::anyhow!("Timeouts must be at least one second"));
        }
        if self.finder.concurrency == 0 {
            return Err(anyhow::anyhow!("finder.concurrency must be at least 1"));
        }
        if let Some(rate) = self.blockchain.fee_rate {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(anyhow::anyhow!("Invalid fee rate: {}", rate));
            }
        }
        if self.network == Network::Regtest && self.blockchain.esplora_url.is_none() {
            return Err(anyhow::anyhow!("Regtest requires blockchain.esplora_url"));
        }

        // Validate data directory can be created
        let network_dir = self.network_data_dir();
        if !network_dir.exists() {
            fs::create_dir_all(&network_dir)
                .with_context(|| format!("Cannot create data directory: {}", network_dir.display()))?;
        }

        Ok(())
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "snicker")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".snicker")
        })
}

/// Get the configuration file path
fn config_file_path() -> Result<PathBuf> {
    let config_dir = directories::ProjectDirs::from("", "", "snicker")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config").join("snicker")
        });

    Ok(config_dir.join("config.toml"))
}

/// Get the config file path for display purposes
pub fn get_config_path() -> Result<PathBuf> {
    config_file_path()
}
