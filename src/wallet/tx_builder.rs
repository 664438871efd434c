//! Coinjoin construction and signing
//!
//! Rebuilds the two-party transaction described by a proposal plaintext and
//! signs its P2WPKH inputs.

use bdk_wallet::bitcoin::{
    absolute::LockTime,
    ecdsa,
    hashes::Hash,
    secp256k1::{Message, Secp256k1, SecretKey},
    sighash::{EcdsaSighashType, SighashCache},
    transaction::Version,
    Amount, CompressedPublicKey, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};

use crate::snicker::pattern::DUST_LIMIT_SATS;
use crate::snicker::ProposalPlaintext;

/// Virtual size of a 2-input, 2-output P2WPKH transaction
pub const COINJOIN_VSIZE: u64 = 209;

#[derive(Debug, thiserror::Error)]
pub enum CoinjoinError {
    #[error("{which} output would be {value} sats, below dust")]
    Dust { which: &'static str, value: i128 },

    #[error("Both inputs spend the same outpoint {0}")]
    DuplicateInput(OutPoint),

    #[error("No input spends {0}")]
    UnknownInput(OutPoint),

    #[error("Key does not control input {0}")]
    WrongKey(OutPoint),

    #[error("Sighash computation failed: {0}")]
    Sighash(String),
}

/// Miner fee for the coinjoin at `fee_rate` sat/vB, rounded up
pub fn estimate_coinjoin_fee(fee_rate: f64) -> u64 {
    (COINJOIN_VSIZE as f64 * fee_rate.max(0.0)).ceil() as u64
}

/// Unsigned coinjoin plus the outputs its inputs spend, in input order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinjoinSkeleton {
    pub tx: Transaction,
    pub prevouts: Vec<TxOut>,
}

/// Rebuild the coinjoin a proposal describes
///
/// The counterparty receives `their_value - net_transfer` at
/// `receiver_script`; the proposer's change receives
/// `proposer_value + net_transfer - fee`. Inputs and outputs are in BIP69
/// order so neither side's position gives it away.
pub fn build_coinjoin(
    plaintext: &ProposalPlaintext,
    receiver_script: ScriptBuf,
) -> Result<CoinjoinSkeleton, CoinjoinError> {
    let (receiver_value, change_value) = output_values(plaintext)?;

    let mut inputs = vec![
        (plaintext.counterparty_outpoint, plaintext.counterparty_output.clone()),
        (plaintext.proposer_utxo.outpoint, plaintext.proposer_utxo.txout.clone()),
    ];
    inputs.sort_by(|(a, _), (b, _)| bip69_outpoint_key(a).cmp(&bip69_outpoint_key(b)));

    let mut outputs = vec![
        TxOut {
            value: receiver_value,
            script_pubkey: receiver_script,
        },
        TxOut {
            value: change_value,
            script_pubkey: plaintext.change_script.clone(),
        },
    ];
    outputs.sort_by(|a, b| {
        a.value
            .cmp(&b.value)
            .then_with(|| a.script_pubkey.as_bytes().cmp(b.script_pubkey.as_bytes()))
    });

    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|(outpoint, _)| TxIn {
                previous_output: *outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_LOCKTIME_NO_RBF,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs,
    };

    Ok(CoinjoinSkeleton {
        tx,
        prevouts: inputs.into_iter().map(|(_, txout)| txout).collect(),
    })
}

/// Receiver and proposer-change values of the coinjoin a proposal describes
///
/// Fails on the same grounds as [`build_coinjoin`], without needing a
/// destination script.
pub fn output_values(plaintext: &ProposalPlaintext) -> Result<(Amount, Amount), CoinjoinError> {
    if plaintext.counterparty_outpoint == plaintext.proposer_utxo.outpoint {
        return Err(CoinjoinError::DuplicateInput(plaintext.counterparty_outpoint));
    }

    let their_value = plaintext.counterparty_output.value.to_sat() as i128;
    let proposer_value = plaintext.proposer_utxo.txout.value.to_sat() as i128;
    let net = plaintext.net_transfer as i128;
    let fee = plaintext.fee_estimate as i128;

    Ok((
        dust_checked("receiver", their_value - net)?,
        dust_checked("proposer change", proposer_value + net - fee)?,
    ))
}

impl CoinjoinSkeleton {
    /// Sign the inputs spending each outpoint with its key
    ///
    /// Every key must control the P2WPKH script of the output it spends.
    pub fn sign(&mut self, keys: &[(OutPoint, SecretKey)]) -> Result<(), CoinjoinError> {
        let secp = Secp256k1::new();
        let mut witnesses = Vec::with_capacity(keys.len());

        {
            let mut cache = SighashCache::new(&self.tx);
            for (outpoint, key) in keys {
                let index = self
                    .tx
                    .input
                    .iter()
                    .position(|input| input.previous_output == *outpoint)
                    .ok_or(CoinjoinError::UnknownInput(*outpoint))?;
                let prevout = &self.prevouts[index];

                let pubkey = CompressedPublicKey(key.public_key(&secp));
                if prevout.script_pubkey != ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash()) {
                    return Err(CoinjoinError::WrongKey(*outpoint));
                }

                let sighash = cache
                    .p2wpkh_signature_hash(
                        index,
                        &prevout.script_pubkey,
                        prevout.value,
                        EcdsaSighashType::All,
                    )
                    .map_err(|e| CoinjoinError::Sighash(e.to_string()))?;

                let msg = Message::from_digest(sighash.to_byte_array());
                let signature = ecdsa::Signature {
                    signature: secp.sign_ecdsa(&msg, key),
                    sighash_type: EcdsaSighashType::All,
                };
                witnesses.push((index, Witness::p2wpkh(&signature, &pubkey.0)));
            }
        }

        for (index, witness) in witnesses {
            self.tx.input[index].witness = witness;
        }
        Ok(())
    }

    /// True once every input carries a witness
    pub fn is_fully_signed(&self) -> bool {
        self.tx.input.iter().all(|input| !input.witness.is_empty())
    }
}

/// BIP69 compares txids as displayed (reversed byte order), then vout
fn bip69_outpoint_key(outpoint: &OutPoint) -> ([u8; 32], u32) {
    let mut txid = outpoint.txid.to_byte_array();
    txid.reverse();
    (txid, outpoint.vout)
}

fn dust_checked(which: &'static str, value: i128) -> Result<Amount, CoinjoinError> {
    if value < DUST_LIMIT_SATS as i128 || value > Amount::MAX_MONEY.to_sat() as i128 {
        return Err(CoinjoinError::Dust { which, value });
    }
    Ok(Amount::from_sat(value as u64))
}
