#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use bdk_wallet::bitcoin::{
    absolute::LockTime,
    hashes::Hash,
    secp256k1::{PublicKey, Secp256k1, SecretKey},
    transaction::Version,
    Amount, CompressedPublicKey, Network, OutPoint, PrivateKey, ScriptBuf, Sequence, Transaction,
    TxIn, TxOut, Txid, Witness,
};
use snicker::relay::{self, RelayStore};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ============================================================
// KEYS AND TRANSACTIONS
// ============================================================

pub fn secret(byte: u8) -> SecretKey {
    SecretKey::from_slice(&[byte; 32]).expect("valid secret key")
}

pub fn public(key: &SecretKey) -> PublicKey {
    key.public_key(&Secp256k1::new())
}

pub fn p2wpkh_script(key: &SecretKey) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&CompressedPublicKey(public(key)).wpubkey_hash())
}

pub fn wif(key: &SecretKey) -> String {
    PrivateKey::new(*key, Network::Regtest).to_wif()
}

/// P2WPKH-shaped witness revealing `key`'s public key
fn witness_for(key: &SecretKey) -> Witness {
    let mut sig = vec![0x30];
    sig.extend_from_slice(&[0x44; 70]);
    sig.push(0x01);
    Witness::from_slice(&[sig, public(key).serialize().to_vec()])
}

/// A 2-in/2-out transaction that looks like a past coinjoin
///
/// Input 0 is spent by `receiver_key`; output 1 pays `receiver_value` to
/// `receiver_key`'s P2WPKH script.
pub fn candidate_tx(receiver_key: &SecretKey, receiver_value: u64) -> Transaction {
    let other = secret(0x51);
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: [receiver_key, &other]
            .iter()
            .enumerate()
            .map(|(i, key)| TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_byte_array([0xa0 + i as u8; 32]),
                    vout: 0,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: witness_for(key),
            })
            .collect(),
        output: vec![
            TxOut {
                value: Amount::from_sat(70_000),
                script_pubkey: p2wpkh_script(&other),
            },
            TxOut {
                value: Amount::from_sat(receiver_value),
                script_pubkey: p2wpkh_script(receiver_key),
            },
        ],
    }
}

// ============================================================
// KEY FILES
// ============================================================

/// One `[[coins]]` entry; `utxo` makes it spendable
pub struct KeyEntry {
    pub key: SecretKey,
    pub mixdepth: u32,
    pub utxo: Option<(OutPoint, u64)>,
}

pub fn write_key_file(dir: &Path, name: &str, entries: &[KeyEntry]) -> PathBuf {
    let mut body = String::new();
    for entry in entries {
        body.push_str(&format!(
            "[[coins]]\nwif = \"{}\"\nmixdepth = {}\n",
            wif(&entry.key),
            entry.mixdepth
        ));
        if let Some((outpoint, value)) = entry.utxo {
            body.push_str(&format!("outpoint = \"{}\"\nvalue = {}\n", outpoint, value));
        }
        body.push('\n');
    }

    let path = dir.join(name);
    std::fs::write(&path, body).expect("write key file");
    path
}

// ============================================================
// RELAY SERVER
// ============================================================

pub struct TestRelay {
    pub url: String,
    pub addr: SocketAddr,
    pub store: Arc<RelayStore>,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl TestRelay {
    /// Start a relay on an ephemeral port with its store in `dir`
    pub async fn start(dir: &Path, max_body_bytes: usize) -> Result<Self> {
        let store = Arc::new(RelayStore::open(dir.join("snicker-proposals.txt")).await?);
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(relay::serve(
            listener,
            store.clone(),
            max_body_bytes,
            shutdown.clone(),
        ));

        Ok(Self {
            url: format!("http://{}/", addr),
            addr,
            store,
            shutdown,
            handle,
        })
    }

    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.handle.await?
    }
}
