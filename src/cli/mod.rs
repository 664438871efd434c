//! Command-line front end
//!
//! One binary, four subcommands: `serve` runs a relay, `find` scans blocks
//! for candidates, `propose` builds and publishes a proposal, `receive`
//! fetches proposals and completes the ones we accept.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use bdk_wallet::bitcoin::{
    consensus::encode::{deserialize, serialize_hex},
    Amount, ScriptBuf, Transaction,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::blockchain_data::{BlockchainDataError, BlockchainDataProvider, MempoolSpaceApi};
use crate::config::{Config, Network};
use crate::network::file_based::FileBasedNetwork;
use crate::network::http::HttpRelay;
use crate::network::serialization::RelayRecord;
use crate::network::ProposalNetwork;
use crate::relay::{self, RelayStore};
use crate::snicker::codec::propose_for_candidate;
use crate::snicker::finder::{find_candidates, CandidateLog};
use crate::snicker::pattern::classify_raw;
use crate::snicker::receiver::scan_in_background;
use crate::snicker::ProposalVersion;
use crate::wallet::tx_builder::estimate_coinjoin_fee;
use crate::wallet::{KeyFileWallet, SnickerWallet};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_ARGERROR: u8 = 2;

#[derive(Parser, Debug)]
#[command(author, version, about = "SNICKER coinjoin proposals: relay, finder, proposer and receiver")]
pub struct Cli {
    /// Config file (default: platform config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the configured network
    #[arg(long, global = true, value_enum)]
    pub network: Option<Network>,

    /// Log to stderr instead of the log file
    #[arg(long, global = true)]
    pub log_stderr: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a proposal relay server
    Serve {
        /// Listen address, overrides server.listen
        #[arg(long)]
        listen: Option<String>,

        /// Proposals file, overrides server.database
        #[arg(long)]
        database: Option<PathBuf>,
    },

    /// Scan a block range for SNICKER candidates
    Find {
        /// First block to scan
        start: u32,

        /// Last block to scan (default: current tip)
        end: Option<u32>,

        /// Candidates file, overrides finder.candidates_file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Create a proposal against a candidate transaction
    Propose {
        /// Key file holding the coin to contribute
        #[arg(short, long)]
        keys: PathBuf,

        /// Candidate transaction, hex encoded
        hex_tx: String,

        /// Input whose witness reveals the counterparty's key
        input_index: usize,

        /// Output of the candidate to co-spend
        output_index: usize,

        /// Sats the proposer collects; negative pays the receiver
        #[arg(allow_negative_numbers = true)]
        net_transfer: i64,

        /// Mixdepth to take our coin from
        #[arg(short, long, default_value_t = 0)]
        mixdepth: u32,

        /// Print the relay line instead of uploading it
        #[arg(short = 'n', long)]
        no_upload: bool,

        /// Fee rate in sat/vB, overrides config and estimation
        #[arg(short = 'f', long)]
        fee_rate: Option<f64>,
    },

    /// Fetch proposals, complete and broadcast the acceptable ones
    Receive {
        /// Key file whose keys proposals may be addressed to
        #[arg(short, long)]
        keys: PathBuf,

        /// Mixdepth for our coinjoin output
        #[arg(short, long, default_value_t = 0)]
        mixdepth: u32,

        /// Read proposals from a local store file instead of the relays
        #[arg(long)]
        from_file: Option<PathBuf>,

        /// Print signed transactions instead of broadcasting them
        #[arg(long)]
        dry_run: bool,
    },
}

/// Failure of a subcommand, split by exit code
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Bad input from the user; exits with [`EXIT_ARGERROR`]
    #[error("{0}")]
    Argument(String),

    /// Anything that went wrong while doing the work; exits with [`EXIT_FAILURE`]
    #[error(transparent)]
    Operational(#[from] anyhow::Error),
}

impl CliError {
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::Argument(_) => EXIT_ARGERROR,
            CliError::Operational(_) => EXIT_FAILURE,
        }
    }
}

fn argument(message: impl Into<String>) -> CliError {
    CliError::Argument(message.into())
}

/// Run one subcommand to completion
pub async fn run(command: Command, config: &Config, cancel: CancellationToken) -> Result<(), CliError> {
    match command {
        Command::Serve { listen, database } => serve(config, listen, database, cancel).await,
        Command::Find { start, end, output } => find(config, start, end, output, cancel).await,
        Command::Propose {
            keys,
            hex_tx,
            input_index,
            output_index,
            net_transfer,
            mixdepth,
            no_upload,
            fee_rate,
        } => {
            let request = ProposeRequest {
                hex_tx,
                input_index,
                output_index,
                net_transfer,
                mixdepth,
                no_upload,
                fee_rate,
            };
            propose(config, keys, request).await
        }
        Command::Receive {
            keys,
            mixdepth,
            from_file,
            dry_run,
        } => receive(config, keys, mixdepth, from_file, dry_run, cancel).await,
    }
}

async fn serve(
    config: &Config,
    listen: Option<String>,
    database: Option<PathBuf>,
    cancel: CancellationToken,
) -> Result<(), CliError> {
    let listen = listen.unwrap_or_else(|| config.server.listen.clone());
    let addr: SocketAddr = listen
        .parse()
        .map_err(|_| argument(format!("Invalid listen address: {}", listen)))?;
    let database = database
        .map(|path| config.resolve_path(&path))
        .unwrap_or_else(|| config.database_path());

    let store = Arc::new(RelayStore::open(&database).await?);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let local = listener.local_addr().context("Listener has no local address")?;

    println!("📡 SNICKER relay listening on http://{}", local);
    println!("   Proposals file: {}", database.display());

    relay::serve(listener, store, config.server.max_body_bytes, cancel).await?;

    println!("🛑 Relay stopped");
    Ok(())
}

fn blockchain_provider(config: &Config) -> MempoolSpaceApi {
    let api = MempoolSpaceApi::new(config.network.to_bdk_network())
        .with_timeout(config.blockchain.timeout_secs);
    match &config.blockchain.esplora_url {
        Some(url) => api.with_base_url(url),
        None => api,
    }
}

fn relay_clients(config: &Config) -> Result<Vec<HttpRelay>, CliError> {
    config
        .relay
        .servers
        .iter()
        .map(|url| {
            HttpRelay::new(
                url,
                config.relay_timeout(),
                config.relay.proxy.as_deref(),
                config.relay_retry(),
            )
            .with_context(|| format!("Failed to create client for relay {}", url))
            .map_err(CliError::from)
        })
        .collect()
}

async fn find(
    config: &Config,
    start: u32,
    end: Option<u32>,
    output: Option<PathBuf>,
    cancel: CancellationToken,
) -> Result<(), CliError> {
    let provider = blockchain_provider(config);

    let end = match end {
        Some(end) => end,
        None => config
            .blockchain_retry()
            .run(
                "Fetching tip height",
                || provider.get_tip_height(),
                BlockchainDataError::is_retryable,
            )
            .await
            .context("Failed to fetch tip height")?,
    };
    if start > end {
        return Err(argument(format!(
            "Start block {} is above end block {}",
            start, end
        )));
    }

    let log_path = output
        .map(|path| config.resolve_path(&path))
        .unwrap_or_else(|| config.candidates_path());
    if let Some(parent) = log_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let log = CandidateLog::new(log_path);

    println!("🔎 Scanning blocks {} to {}...", start, end);
    let report = find_candidates(
        &provider,
        start,
        end,
        &config.finder_options(),
        Some(&log),
        &cancel,
    )
    .await?;

    for candidate in &report.candidates {
        println!("Found: {} in block: {}", candidate.txid(), candidate.block_height);
    }
    println!(
        "✅ Scanned {} blocks, found {} candidates",
        report.blocks_scanned,
        report.candidates.len()
    );
    if !report.failed_blocks.is_empty() {
        println!(
            "⚠️  {} block(s) could not be fetched: {:?}",
            report.failed_blocks.len(),
            report.failed_blocks
        );
    }
    if report.cancelled {
        println!("🛑 Scan interrupted");
    }
    println!("📝 Candidates written to {}", log.path().display());

    if report.cancelled {
        return Err(anyhow!("Scan interrupted").into());
    }
    Ok(())
}

/// Arguments of `propose` besides the key file
struct ProposeRequest {
    hex_tx: String,
    input_index: usize,
    output_index: usize,
    net_transfer: i64,
    mixdepth: u32,
    no_upload: bool,
    fee_rate: Option<f64>,
}

fn parse_candidate(hex_tx: &str) -> Result<Transaction, CliError> {
    let raw = hex::decode(hex_tx.trim())
        .map_err(|e| argument(format!("Candidate is not valid hex: {}", e)))?;
    let tx = deserialize(&raw)
        .map_err(|e| argument(format!("Candidate is not a valid transaction: {}", e)))?;
    if !classify_raw(&raw) {
        tracing::warn!("⚠️  Candidate does not fit the SNICKER pattern; proposing anyway");
        println!("⚠️  Candidate does not look like a SNICKER candidate");
    }
    Ok(tx)
}

async fn resolve_fee_rate(
    config: &Config,
    provider: &MempoolSpaceApi,
    requested: Option<f64>,
) -> Result<f64, CliError> {
    if let Some(rate) = requested {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(argument(format!("Invalid fee rate: {}", rate)));
        }
        return Ok(rate);
    }
    if let Some(rate) = config.blockchain.fee_rate {
        return Ok(rate);
    }

    let target = config.blockchain.fee_target_blocks;
    let rate = config
        .blockchain_retry()
        .run(
            "Fetching fee estimate",
            || provider.estimate_fee(target),
            BlockchainDataError::is_retryable,
        )
        .await
        .context("Failed to estimate fee rate; pass --fee-rate")?;
    tracing::info!("💸 Estimated fee rate {} sat/vB for {} blocks", rate, target);
    Ok(rate)
}

async fn propose(config: &Config, keys: PathBuf, request: ProposeRequest) -> Result<(), CliError> {
    let candidate = parse_candidate(&request.hex_tx)?;
    if request.input_index >= candidate.input.len() {
        return Err(argument(format!(
            "Input index {} out of range ({} inputs)",
            request.input_index,
            candidate.input.len()
        )));
    }
    let Some(target) = candidate.output.get(request.output_index) else {
        return Err(argument(format!(
            "Output index {} out of range ({} outputs)",
            request.output_index,
            candidate.output.len()
        )));
    };

    let relays = if request.no_upload {
        Vec::new()
    } else {
        let relays = relay_clients(config)?;
        if relays.is_empty() {
            return Err(argument(
                "No relay servers configured; set relay.servers or use --no-upload",
            ));
        }
        relays
    };

    let wallet = KeyFileWallet::load(&keys, config.network.to_bdk_network())?;
    let provider = blockchain_provider(config);

    let fee_rate = resolve_fee_rate(config, &provider, request.fee_rate).await?;
    let fee = estimate_coinjoin_fee(fee_rate);

    let required = target
        .value
        .checked_add(Amount::from_sat(fee))
        .ok_or_else(|| anyhow!("Required amount overflows"))?;
    let utxo = wallet.select_utxo(request.mixdepth, required).await?;
    let key = wallet.private_key_for(&utxo).await?;
    let change_script = wallet.new_change_script(request.mixdepth).await?;

    tracing::info!(
        "🤝 Proposing to {}:{} with {} ({} sats), net transfer {} sats, fee {} sats",
        candidate.compute_txid(),
        request.output_index,
        utxo.outpoint,
        utxo.txout.value.to_sat(),
        request.net_transfer,
        fee
    );

    let envelope = propose_for_candidate(
        &candidate,
        request.input_index,
        request.output_index,
        utxo,
        key,
        change_script,
        request.net_transfer,
        fee,
        ProposalVersion::CURRENT,
    )
    .context("Failed to build proposal")?;
    let record = RelayRecord::from_envelope(&envelope);

    if request.no_upload {
        println!("{}", record);
        return Ok(());
    }

    let batch = [record];
    let mut published = 0;
    for relay in &relays {
        match relay.publish_proposals(&batch).await {
            Ok(_) => {
                published += 1;
                println!("✅ Proposal uploaded to {}", relay.url());
            }
            Err(e) => {
                tracing::warn!("Upload to {} failed: {:#}", relay.url(), e);
                println!("❌ Upload to {} failed: {:#}", relay.url(), e);
            }
        }
    }

    if published == 0 {
        return Err(anyhow!("Proposal was not accepted by any relay").into());
    }
    Ok(())
}

/// Drop repeated records, keeping the first occurrence
fn dedup_records(records: Vec<RelayRecord>) -> Vec<RelayRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| seen.insert(record.to_string()))
        .collect()
}

async fn fetch_all(config: &Config, from_file: Option<PathBuf>) -> Result<Vec<RelayRecord>, CliError> {
    if let Some(path) = from_file {
        let network = FileBasedNetwork::open(config.resolve_path(&path)).await?;
        return Ok(network.fetch_proposals().await?);
    }

    let relays = relay_clients(config)?;
    if relays.is_empty() {
        return Err(argument(
            "No relay servers configured; set relay.servers or use --from-file",
        ));
    }

    let mut records = Vec::new();
    let mut reached = 0;
    for relay in &relays {
        match relay.fetch_proposals().await {
            Ok(fetched) => {
                reached += 1;
                println!("📥 {} proposal(s) from {}", fetched.len(), relay.url());
                records.extend(fetched);
            }
            Err(e) => {
                tracing::warn!("Fetch from {} failed: {:#}", relay.url(), e);
                println!("❌ Fetch from {} failed: {:#}", relay.url(), e);
            }
        }
    }

    if reached == 0 {
        return Err(anyhow!("No relay could be reached").into());
    }
    Ok(dedup_records(records))
}

async fn receive(
    config: &Config,
    keys: PathBuf,
    mixdepth: u32,
    from_file: Option<PathBuf>,
    dry_run: bool,
    cancel: CancellationToken,
) -> Result<(), CliError> {
    let wallet = KeyFileWallet::load(&keys, config.network.to_bdk_network())?;
    let records = fetch_all(config, from_file).await?;

    let owned_keys = wallet.owned_keys().await;
    let owned_scripts: HashSet<ScriptBuf> = wallet.owned_scripts().await.into_iter().collect();
    let policy = config.acceptance_policy();
    let accept = move |plaintext: &crate::snicker::ProposalPlaintext| {
        if !owned_scripts.contains(&plaintext.counterparty_output.script_pubkey) {
            tracing::debug!(
                "Proposal co-spends {} which is not ours",
                plaintext.counterparty_outpoint
            );
            return false;
        }
        policy.accepts(plaintext)
    };

    let outcome = scan_in_background(records, owned_keys, accept, cancel.clone()).await?;
    println!(
        "🔍 Scanned {} proposal(s): {} accepted, {} refused, {} not for us, {} malformed, {} unsupported",
        outcome.records_scanned,
        outcome.accepted.len(),
        outcome.rejected_by_policy,
        outcome.not_for_us,
        outcome.malformed,
        outcome.unsupported_version
    );

    let provider = blockchain_provider(config);
    let retry = config.blockchain_retry();
    let mut failures = 0;
    for proposal in &outcome.accepted {
        if cancel.is_cancelled() {
            break;
        }
        let result = if dry_run {
            wallet
                .complete(proposal, mixdepth)
                .await
                .map(|tx| println!("{}", serialize_hex(&tx)))
        } else {
            wallet
                .complete_and_broadcast(proposal, mixdepth, &provider, &retry)
                .await
                .map(|txid| println!("✅ Broadcast coinjoin {}", txid))
        };
        if let Err(e) = result {
            failures += 1;
            tracing::warn!("Proposal {} could not be completed: {:#}", proposal.record_index, e);
            println!("❌ Proposal {} could not be completed: {:#}", proposal.record_index, e);
        }
    }

    if outcome.cancelled || cancel.is_cancelled() {
        return Err(anyhow!("Receive interrupted").into());
    }
    if failures > 0 && failures == outcome.accepted.len() {
        return Err(anyhow!("None of the accepted proposals could be completed").into());
    }
    Ok(())
}
