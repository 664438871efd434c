//! Wallet capabilities needed by proposers and receivers
//!
//! The SNICKER tools do not manage a full wallet. They need a handful of
//! operations: pick a coin, produce its key, hand out a fresh script, and
//! finish a coinjoin. [`SnickerWallet`] is that seam; [`KeyFileWallet`] is
//! a minimal implementation backed by a TOML file of WIF keys.

pub mod tx_builder;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bdk_wallet::bitcoin::{
    secp256k1::{Secp256k1, SecretKey},
    Amount, CompressedPublicKey, Network, NetworkKind, OutPoint, PrivateKey, ScriptBuf,
    Transaction, TxOut, Txid,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::blockchain_data::{BlockchainDataError, BlockchainDataProvider};
use crate::network::RetryPolicy;
use crate::snicker::receiver::ReceivedProposal;
use crate::snicker::Utxo;
use tx_builder::{build_coinjoin, output_values};

/// Operations the SNICKER flows need from a wallet
#[async_trait]
pub trait SnickerWallet: Send + Sync {
    /// Pick one coin from `mixdepth` worth at least `minimum`
    async fn select_utxo(&self, mixdepth: u32, minimum: Amount) -> Result<Utxo>;

    /// Private key controlling `utxo`
    async fn private_key_for(&self, utxo: &Utxo) -> Result<SecretKey>;

    /// A fresh script in `mixdepth` for change or coinjoin output
    async fn new_change_script(&self, mixdepth: u32) -> Result<ScriptBuf>;

    /// Every key a proposal might have been encrypted to
    async fn owned_keys(&self) -> Vec<SecretKey>;

    /// Scripts this wallet can sign for
    async fn owned_scripts(&self) -> Vec<ScriptBuf>;

    /// Build and fully sign the coinjoin for an accepted proposal
    ///
    /// Our output goes to a fresh script in `mixdepth`.
    async fn complete(&self, proposal: &ReceivedProposal, mixdepth: u32) -> Result<Transaction> {
        let plaintext = &proposal.plaintext;
        let ours = Utxo {
            outpoint: plaintext.counterparty_outpoint,
            txout: plaintext.counterparty_output.clone(),
        };
        let our_key = self.private_key_for(&ours).await?;
        output_values(plaintext)?;
        let destination = self.new_change_script(mixdepth).await?;

        let mut skeleton = build_coinjoin(plaintext, destination)?;
        skeleton.sign(&[
            (ours.outpoint, our_key),
            (plaintext.proposer_utxo.outpoint, plaintext.proposer_key),
        ])?;

        tracing::info!(
            "✍️  Signed coinjoin {} for proposal {}",
            skeleton.tx.compute_txid(),
            proposal.record_index
        );
        Ok(skeleton.tx)
    }

    /// [`complete`](Self::complete) and hand the result to the network
    async fn complete_and_broadcast(
        &self,
        proposal: &ReceivedProposal,
        mixdepth: u32,
        provider: &dyn BlockchainDataProvider,
        retry: &RetryPolicy,
    ) -> Result<Txid> {
        let tx = self.complete(proposal, mixdepth).await?;
        let txid = retry
            .run(
                "Broadcasting coinjoin",
                || provider.broadcast(&tx),
                BlockchainDataError::is_retryable,
            )
            .await
            .context("Failed to broadcast coinjoin")?;
        Ok(txid)
    }
}

/// On-disk form of one key
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CoinEntry {
    wif: String,

    #[serde(default)]
    mixdepth: u32,

    /// Unspent output controlled by this key, `txid:vout`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    outpoint: Option<String>,

    /// Value of that output in sats
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KeyFile {
    #[serde(default)]
    coins: Vec<CoinEntry>,
}

#[derive(Debug, Clone)]
struct Coin {
    entry: CoinEntry,
    key: SecretKey,
    script: ScriptBuf,
    utxo: Option<Utxo>,
}

/// Wallet backed by a TOML file of WIF keys
///
/// ```toml
/// [[coins]]
/// wif = "cVt4o7BGAig1UXywgGSmARhxMdzP5qvQsxKkSsc1XEkw3tDTQFpy"
/// mixdepth = 0
/// outpoint = "<txid>:1"
/// value = 250000
/// ```
/// Keys without an outpoint are receive-only: they can decrypt proposals
/// and sign for outputs proposals point at. Fresh change keys are appended
/// to the file before their script is handed out.
pub struct KeyFileWallet {
    path: PathBuf,
    network: Network,
    coins: Mutex<Vec<Coin>>,
}

impl KeyFileWallet {
    /// Load the key file at `path`; keys must belong to `network`
    pub fn load(path: impl Into<PathBuf>, network: Network) -> Result<Self> {
        let path = path.into();
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read key file: {}", path.display()))?;
        let file: KeyFile = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse key file: {}", path.display()))?;

        let coins = file
            .coins
            .into_iter()
            .enumerate()
            .map(|(i, entry)| {
                parse_coin(entry, network).with_context(|| format!("Invalid entry {} in key file", i + 1))
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            "🔑 Loaded {} key(s) ({} spendable) from {}",
            coins.len(),
            coins.iter().filter(|c| c.utxo.is_some()).count(),
            path.display()
        );

        Ok(Self {
            path,
            network,
            coins: Mutex::new(coins),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, coins: &[Coin]) -> Result<()> {
        let file = KeyFile {
            coins: coins.iter().map(|c| c.entry.clone()).collect(),
        };
        let contents = toml::to_string_pretty(&file).context("Failed to serialize key file")?;
        tokio::fs::write(&self.path, contents)
            .await
            .with_context(|| format!("Failed to write key file: {}", self.path.display()))
    }
}

fn parse_coin(entry: CoinEntry, network: Network) -> Result<Coin> {
    let private_key = PrivateKey::from_wif(&entry.wif).context("Invalid WIF key")?;
    if !private_key.compressed {
        bail!("Uncompressed keys are not supported");
    }
    if private_key.network != NetworkKind::from(network) {
        bail!("Key is for a different network");
    }

    let secp = Secp256k1::new();
    let pubkey = CompressedPublicKey(private_key.inner.public_key(&secp));
    let script = ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash());

    let utxo = match (&entry.outpoint, entry.value) {
        (Some(outpoint), Some(value)) => Some(Utxo {
            outpoint: outpoint
                .parse::<OutPoint>()
                .with_context(|| format!("Invalid outpoint: {}", outpoint))?,
            txout: TxOut {
                value: Amount::from_sat(value),
                script_pubkey: script.clone(),
            },
        }),
        (None, None) => None,
        _ => bail!("outpoint and value must be given together"),
    };

    Ok(Coin {
        key: private_key.inner,
        script,
        utxo,
        entry,
    })
}

#[async_trait]
impl SnickerWallet for KeyFileWallet {
    async fn select_utxo(&self, mixdepth: u32, minimum: Amount) -> Result<Utxo> {
        let coins = self.coins.lock().await;

        // Smallest coin that is large enough
        coins
            .iter()
            .filter(|c| c.entry.mixdepth == mixdepth)
            .filter_map(|c| c.utxo.as_ref())
            .filter(|u| u.txout.value >= minimum)
            .min_by_key(|u| u.txout.value)
            .cloned()
            .ok_or_else(|| {
                anyhow!(
                    "No coin in mixdepth {} worth at least {} sats",
                    mixdepth,
                    minimum.to_sat()
                )
            })
    }

    async fn private_key_for(&self, utxo: &Utxo) -> Result<SecretKey> {
        let coins = self.coins.lock().await;
        coins
            .iter()
            .find(|c| c.script == utxo.txout.script_pubkey)
            .map(|c| c.key)
            .ok_or_else(|| anyhow!("No key for output {}", utxo.outpoint))
    }

    async fn new_change_script(&self, mixdepth: u32) -> Result<ScriptBuf> {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let key = SecretKey::from_slice(&bytes).context("Failed to generate key")?;

        let entry = CoinEntry {
            wif: PrivateKey::new(key, self.network).to_wif(),
            mixdepth,
            outpoint: None,
            value: None,
        };
        let coin = parse_coin(entry, self.network)?;
        let script = coin.script.clone();

        let mut coins = self.coins.lock().await;
        coins.push(coin);
        self.persist(&coins).await?;

        tracing::debug!("New script in mixdepth {}: {}", mixdepth, script);
        Ok(script)
    }

    async fn owned_keys(&self) -> Vec<SecretKey> {
        self.coins.lock().await.iter().map(|c| c.key).collect()
    }

    async fn owned_scripts(&self) -> Vec<ScriptBuf> {
        self.coins.lock().await.iter().map(|c| c.script.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snicker::ProposalPlaintext;
    use bdk_wallet::bitcoin::{hashes::Hash, Txid};

    fn wif(byte: u8) -> String {
        PrivateKey::new(SecretKey::from_slice(&[byte; 32]).unwrap(), Network::Regtest).to_wif()
    }

    fn write_key_file(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("keys.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn sample_file(dir: &Path) -> PathBuf {
        let txid = Txid::from_byte_array([0x33; 32]);
        write_key_file(
            dir,
            &format!(
                r#"
[[coins]]
wif = "{}"
mixdepth = 0
outpoint = "{}:0"
value = 100000

[[coins]]
wif = "{}"
mixdepth = 0
outpoint = "{}:1"
value = 40000

[[coins]]
wif = "{}"
mixdepth = 1
"#,
                wif(1),
                txid,
                wif(2),
                txid,
                wif(3)
            ),
        )
    }

    #[tokio::test]
    async fn test_select_smallest_sufficient_coin() {
        let dir = tempfile::tempdir().unwrap();
        let wallet = KeyFileWallet::load(sample_file(dir.path()), Network::Regtest).unwrap();

        let utxo = wallet.select_utxo(0, Amount::from_sat(30_000)).await.unwrap();
        assert_eq!(utxo.txout.value, Amount::from_sat(40_000));

        let utxo = wallet.select_utxo(0, Amount::from_sat(50_000)).await.unwrap();
        assert_eq!(utxo.txout.value, Amount::from_sat(100_000));

        assert!(wallet.select_utxo(0, Amount::from_sat(200_000)).await.is_err());
        assert!(wallet.select_utxo(1, Amount::from_sat(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_private_key_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let wallet = KeyFileWallet::load(sample_file(dir.path()), Network::Regtest).unwrap();

        let utxo = wallet.select_utxo(0, Amount::from_sat(50_000)).await.unwrap();
        let key = wallet.private_key_for(&utxo).await.unwrap();
        assert_eq!(key, SecretKey::from_slice(&[1; 32]).unwrap());

        assert_eq!(wallet.owned_keys().await.len(), 3);
    }

    #[tokio::test]
    async fn test_change_key_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_file(dir.path());
        let wallet = KeyFileWallet::load(&path, Network::Regtest).unwrap();

        let script = wallet.new_change_script(2).await.unwrap();
        assert!(script.is_p2wpkh());

        let reloaded = KeyFileWallet::load(&path, Network::Regtest).unwrap();
        assert_eq!(reloaded.owned_keys().await.len(), 4);
        assert!(reloaded.owned_scripts().await.contains(&script));
    }

    fn script_for(byte: u8) -> ScriptBuf {
        let key = SecretKey::from_slice(&[byte; 32]).unwrap();
        let pubkey = CompressedPublicKey(key.public_key(&Secp256k1::new()));
        ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash())
    }

    /// Proposal co-spending the 40_000 sat coin of key 2
    fn proposal_for_second_coin(net_transfer: i64) -> ReceivedProposal {
        let proposer_key = SecretKey::from_slice(&[9; 32]).unwrap();
        ReceivedProposal {
            plaintext: ProposalPlaintext {
                counterparty_outpoint: OutPoint {
                    txid: Txid::from_byte_array([0x33; 32]),
                    vout: 1,
                },
                counterparty_output: TxOut {
                    value: Amount::from_sat(40_000),
                    script_pubkey: script_for(2),
                },
                proposer_utxo: Utxo {
                    outpoint: OutPoint {
                        txid: Txid::from_byte_array([0x44; 32]),
                        vout: 0,
                    },
                    txout: TxOut {
                        value: Amount::from_sat(80_000),
                        script_pubkey: script_for(9),
                    },
                },
                change_script: script_for(8),
                net_transfer,
                fee_estimate: 500,
                proposer_key,
            },
            receiver_key: SecretKey::from_slice(&[2; 32]).unwrap(),
            sender_pubkey: proposer_key.public_key(&Secp256k1::new()),
            record_index: 0,
        }
    }

    #[tokio::test]
    async fn test_refused_coinjoin_adds_no_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_file(dir.path());
        let wallet = KeyFileWallet::load(&path, Network::Regtest).unwrap();

        // Our output would be 300 sats
        assert!(wallet.complete(&proposal_for_second_coin(39_700), 0).await.is_err());
        assert_eq!(wallet.owned_keys().await.len(), 3);
        let reloaded = KeyFileWallet::load(&path, Network::Regtest).unwrap();
        assert_eq!(reloaded.owned_keys().await.len(), 3);

        let tx = wallet.complete(&proposal_for_second_coin(-1_000), 0).await.unwrap();
        assert!(tx.input.iter().all(|input| !input.witness.is_empty()));
        assert_eq!(wallet.owned_keys().await.len(), 4);
    }

    #[test]
    fn test_invalid_entries_rejected() {
        let dir = tempfile::tempdir().unwrap();

        let path = write_key_file(dir.path(), "[[coins]]\nwif = \"not-a-key\"\n");
        assert!(KeyFileWallet::load(&path, Network::Regtest).is_err());

        let path = write_key_file(dir.path(), &format!("[[coins]]\nwif = \"{}\"\nvalue = 5\n", wif(4)));
        assert!(KeyFileWallet::load(&path, Network::Regtest).is_err());

        // Regtest key loaded as mainnet
        let path = write_key_file(dir.path(), &format!("[[coins]]\nwif = \"{}\"\n", wif(4)));
        assert!(KeyFileWallet::load(&path, Network::Bitcoin).is_err());
    }
}
