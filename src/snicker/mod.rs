//! SNICKER (Simple Non-Interactive Coinjoin with Keys for Encryption Reused)
//!
//! This module implements both Proposer and Receiver functionality for SNICKER proposals.
//!
//! - [`pattern`]: classifying on-chain transactions as SNICKER candidates
//! - [`finder`]: scanning a block range for candidates
//! - [`ecdh`]: shared secret derivation and authenticated encryption
//! - [`codec`]: plaintext layout and the versioned proposal envelope
//! - [`receiver`]: trying every relayed envelope against our keys
//!
//! # Example Usage
//!
//! ```no_run
//! use snicker::snicker::{codec, ProposalVersion, Utxo};
//! # fn example(
//! #     candidate: bdk_wallet::bitcoin::Transaction,
//! #     our_utxo: Utxo,
//! #     our_key: bdk_wallet::bitcoin::secp256k1::SecretKey,
//! #     change: bdk_wallet::bitcoin::ScriptBuf,
//! #     receiver_keys: Vec<bdk_wallet::bitcoin::secp256k1::SecretKey>,
//! # ) -> anyhow::Result<()> {
//! // As a proposer: encrypt a proposal to the owner of input 0, co-spending output 1
//! let envelope = codec::propose_for_candidate(
//!     &candidate, 0, 1, our_utxo, our_key, change, -1_000, 300, ProposalVersion::V1,
//! )?;
//!
//! // As a receiver: try all of our keys
//! if let Some(plaintext) = codec::decode(&envelope, &receiver_keys)? {
//!     println!("proposal offers net transfer {}", plaintext.net_transfer);
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod ecdh;
pub mod finder;
pub mod pattern;
pub mod receiver;

use bdk_wallet::bitcoin::{
    secp256k1::{PublicKey, SecretKey},
    OutPoint, ScriptBuf, Transaction, TxOut, Txid,
};

/// Errors produced while building, encrypting or decrypting proposals
#[derive(Debug, thiserror::Error)]
pub enum ProposalError {
    #[error("Cannot extract counterparty public key: {0}")]
    KeyExtraction(String),

    #[error("Invalid candidate transaction: {0}")]
    InvalidCandidate(String),

    #[error("Proposal encoding failed: {0}")]
    Encoding(String),

    #[error("Unsupported proposal version: 0x{0:02x}")]
    UnsupportedVersion(u8),

    #[error("Malformed proposal envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed (wrong key or corrupted data)")]
    Decryption,
}

/// Known plaintext layouts, selected by the envelope version byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProposalVersion {
    V1,
}

impl ProposalVersion {
    /// Version used for newly created proposals
    pub const CURRENT: ProposalVersion = ProposalVersion::V1;

    pub fn as_byte(self) -> u8 {
        match self {
            ProposalVersion::V1 => 0x01,
        }
    }
}

impl TryFrom<u8> for ProposalVersion {
    type Error = ProposalError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0x01 => Ok(ProposalVersion::V1),
            other => Err(ProposalError::UnsupportedVersion(other)),
        }
    }
}

/// A spendable output: where it is and what it pays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub txout: TxOut,
}

/// A transaction found on-chain that fits the SNICKER pattern
#[derive(Debug, Clone)]
pub struct CandidateMatch {
    /// Height of the block the transaction was found in
    pub block_height: u32,
    pub tx: Transaction,
}

impl CandidateMatch {
    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }
}

/// Everything the receiver needs to rebuild and complete the coinjoin
///
/// Nothing here has to be looked up on-chain by the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalPlaintext {
    /// The candidate output being co-spent (candidate txid, output index)
    pub counterparty_outpoint: OutPoint,
    /// Value and script of that output, copied from the candidate
    pub counterparty_output: TxOut,
    /// The proposer's coin
    pub proposer_utxo: Utxo,
    /// Where the proposer's change goes
    pub change_script: ScriptBuf,
    /// Sats moved from the counterparty to the proposer.
    /// Negative means the proposer pays the counterparty.
    pub net_transfer: i64,
    /// Miner fee estimate, paid out of the proposer's change
    pub fee_estimate: u64,
    /// Key controlling `proposer_utxo`, needed to complete signing
    pub proposer_key: SecretKey,
}

/// Encrypted proposal as carried on the wire
///
/// `version` is kept as the raw byte so that envelopes from newer
/// proposers can be represented and rejected explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalEnvelope {
    pub version: u8,
    /// `nonce || ciphertext || tag`
    pub ciphertext: Vec<u8>,
    /// Public key of the proposer key used for ECDH
    pub sender_pubkey: PublicKey,
}
