//! Proposal encoding: plaintext layout and the encrypted envelope
//!
//! ## Envelope blob
//! ```text
//! [Version(1) | Nonce(12) | Ciphertext | Tag(16)]
//! ```
//! The version byte and the sender public key are authenticated as
//! associated data, so neither can be swapped without failing decryption.
//!
//! ## Plaintext layout, version 1
//! Integers are little-endian; outpoints, outputs and scripts use Bitcoin
//! consensus encoding.
//! ```text
//! counterparty outpoint | counterparty output | proposer outpoint |
//! proposer output | change script | net transfer (i64) | fee (u64) |
//! proposer secret key (32)
//! ```

use bdk_wallet::bitcoin::{
    consensus::encode::{deserialize_partial, serialize, Decodable},
    secp256k1::{PublicKey, Secp256k1, SecretKey},
    Amount, OutPoint, ScriptBuf, Transaction, TxOut,
};

use super::ecdh::{
    calculate_dh_shared_secret, decrypt_proposal, derive_proposal_key, encrypt_proposal,
    NONCE_LEN, TAG_LEN,
};
use super::pattern::extract_pubkey_from_witness;
use super::{ProposalEnvelope, ProposalError, ProposalPlaintext, ProposalVersion, Utxo};

/// Scripts longer than this cannot be spent and are refused in proposals
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Smallest possible envelope blob: version byte, nonce and tag
pub const MIN_ENVELOPE_LEN: usize = 1 + NONCE_LEN + TAG_LEN;

impl ProposalEnvelope {
    /// Bytes carried in the base64 part of a relay record
    pub fn to_blob(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(1 + self.ciphertext.len());
        blob.push(self.version);
        blob.extend_from_slice(&self.ciphertext);
        blob
    }

    /// Rebuild an envelope from a relay blob and its cleartext sender key
    pub fn from_blob(blob: &[u8], sender_pubkey: PublicKey) -> Result<Self, ProposalError> {
        if blob.len() < MIN_ENVELOPE_LEN {
            return Err(ProposalError::MalformedEnvelope(format!(
                "blob too short: {} bytes (minimum {})",
                blob.len(),
                MIN_ENVELOPE_LEN
            )));
        }

        Ok(Self {
            version: blob[0],
            ciphertext: blob[1..].to_vec(),
            sender_pubkey,
        })
    }

    fn associated_data(&self) -> Vec<u8> {
        associated_data(self.version, &self.sender_pubkey)
    }
}

fn associated_data(version: u8, sender_pubkey: &PublicKey) -> Vec<u8> {
    let mut aad = Vec::with_capacity(34);
    aad.push(version);
    aad.extend_from_slice(&sender_pubkey.serialize());
    aad
}

/// Build and encrypt a proposal for the owner of `counterparty_pubkey`
///
/// `net_transfer` is not checked for economic sense; any value in the money
/// range round-trips unchanged.
///
/// # Errors
/// [`ProposalError::Encoding`] if an amount is outside the money range or a
/// script is larger than [`MAX_SCRIPT_SIZE`].
#[allow(clippy::too_many_arguments)]
pub fn encode(
    candidate_outpoint: OutPoint,
    candidate_output: &TxOut,
    proposer_utxo: &Utxo,
    proposer_key: &SecretKey,
    counterparty_pubkey: &PublicKey,
    change_script: &ScriptBuf,
    net_transfer: i64,
    fee_estimate: u64,
    version: ProposalVersion,
) -> Result<ProposalEnvelope, ProposalError> {
    let plaintext = ProposalPlaintext {
        counterparty_outpoint: candidate_outpoint,
        counterparty_output: candidate_output.clone(),
        proposer_utxo: proposer_utxo.clone(),
        change_script: change_script.clone(),
        net_transfer,
        fee_estimate,
        proposer_key: *proposer_key,
    };

    seal(&plaintext, counterparty_pubkey, version)
}

/// Encrypt an assembled plaintext to `counterparty_pubkey`
///
/// The envelope's sender key is the public key of `plaintext.proposer_key`.
pub fn seal(
    plaintext: &ProposalPlaintext,
    counterparty_pubkey: &PublicKey,
    version: ProposalVersion,
) -> Result<ProposalEnvelope, ProposalError> {
    let secp = Secp256k1::new();
    let sender_pubkey = plaintext.proposer_key.public_key(&secp);

    let serialized = serialize_plaintext(plaintext, version)?;

    let shared_secret = calculate_dh_shared_secret(&plaintext.proposer_key, counterparty_pubkey);
    let key = derive_proposal_key(&shared_secret);
    let ciphertext = encrypt_proposal(
        &serialized,
        &key,
        &associated_data(version.as_byte(), &sender_pubkey),
    )?;

    tracing::debug!(
        "Sealed v{} proposal: {} plaintext bytes → {} ciphertext bytes",
        version.as_byte(),
        serialized.len(),
        ciphertext.len()
    );

    Ok(ProposalEnvelope {
        version: version.as_byte(),
        ciphertext,
        sender_pubkey,
    })
}

/// Build a proposal against a candidate transaction found on-chain
///
/// The counterparty key comes from the witness of `input_index`; the output
/// at `output_index` is the coin we propose to co-spend.
///
/// # Errors
/// - [`ProposalError::KeyExtraction`] if the input does not reveal a public key
/// - [`ProposalError::InvalidCandidate`] if `output_index` does not exist
/// - [`ProposalError::Encoding`] as for [`encode`]
#[allow(clippy::too_many_arguments)]
pub fn propose_for_candidate(
    candidate: &Transaction,
    input_index: usize,
    output_index: usize,
    proposer_utxo: Utxo,
    proposer_key: SecretKey,
    change_script: ScriptBuf,
    net_transfer: i64,
    fee_estimate: u64,
    version: ProposalVersion,
) -> Result<ProposalEnvelope, ProposalError> {
    let counterparty_pubkey = extract_pubkey_from_witness(candidate, input_index)?;

    let candidate_output = candidate.output.get(output_index).ok_or_else(|| {
        ProposalError::InvalidCandidate(format!(
            "output index {} out of range ({} outputs)",
            output_index,
            candidate.output.len()
        ))
    })?;
    let vout = u32::try_from(output_index)
        .map_err(|_| ProposalError::InvalidCandidate("output index too large".to_string()))?;
    let candidate_outpoint = OutPoint {
        txid: candidate.compute_txid(),
        vout,
    };

    encode(
        candidate_outpoint,
        candidate_output,
        &proposer_utxo,
        &proposer_key,
        &counterparty_pubkey,
        &change_script,
        net_transfer,
        fee_estimate,
        version,
    )
}

/// Try a single key against an envelope
///
/// `Ok(None)` means the envelope is not addressed to this key.
///
/// # Errors
/// [`ProposalError::UnsupportedVersion`] before any decryption is attempted,
/// or [`ProposalError::MalformedEnvelope`] if the ciphertext is truncated.
pub fn try_decrypt(
    envelope: &ProposalEnvelope,
    key: &SecretKey,
) -> Result<Option<ProposalPlaintext>, ProposalError> {
    let version = ProposalVersion::try_from(envelope.version)?;

    let shared_secret = calculate_dh_shared_secret(key, &envelope.sender_pubkey);
    let proposal_key = derive_proposal_key(&shared_secret);

    let bytes = match decrypt_proposal(&envelope.ciphertext, &proposal_key, &envelope.associated_data()) {
        Ok(bytes) => bytes,
        Err(ProposalError::Decryption) => return Ok(None),
        Err(e) => return Err(e),
    };

    match parse_plaintext(&bytes, version) {
        Ok(plaintext) => Ok(Some(plaintext)),
        Err(e) => {
            tracing::warn!("Decrypted proposal does not parse: {}", e);
            Ok(None)
        }
    }
}

/// Try every key against an envelope, stopping at the first match
///
/// Cost is one ECDH and one AEAD attempt per key; callers scanning many
/// records should run this off the async executor.
pub fn decode<'a, I>(
    envelope: &ProposalEnvelope,
    keys: I,
) -> Result<Option<ProposalPlaintext>, ProposalError>
where
    I: IntoIterator<Item = &'a SecretKey>,
{
    ProposalVersion::try_from(envelope.version)?;

    for key in keys {
        if let Some(plaintext) = try_decrypt(envelope, key)? {
            return Ok(Some(plaintext));
        }
    }

    Ok(None)
}

/// Serialize a plaintext in the layout of `version`
pub fn serialize_plaintext(
    plaintext: &ProposalPlaintext,
    version: ProposalVersion,
) -> Result<Vec<u8>, ProposalError> {
    match version {
        ProposalVersion::V1 => serialize_v1(plaintext),
    }
}

/// Parse a plaintext in the layout of `version`
pub fn parse_plaintext(
    bytes: &[u8],
    version: ProposalVersion,
) -> Result<ProposalPlaintext, ProposalError> {
    match version {
        ProposalVersion::V1 => parse_v1(bytes),
    }
}

fn serialize_v1(p: &ProposalPlaintext) -> Result<Vec<u8>, ProposalError> {
    check_amount("counterparty output", p.counterparty_output.value)?;
    check_amount("proposer output", p.proposer_utxo.txout.value)?;
    check_script("counterparty output", &p.counterparty_output.script_pubkey)?;
    check_script("proposer output", &p.proposer_utxo.txout.script_pubkey)?;
    check_script("change", &p.change_script)?;

    if p.net_transfer.unsigned_abs() > Amount::MAX_MONEY.to_sat() {
        return Err(ProposalError::Encoding(format!(
            "net transfer {} outside money range",
            p.net_transfer
        )));
    }
    if p.fee_estimate > Amount::MAX_MONEY.to_sat() {
        return Err(ProposalError::Encoding(format!(
            "fee estimate {} outside money range",
            p.fee_estimate
        )));
    }

    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(&serialize(&p.counterparty_outpoint));
    out.extend_from_slice(&serialize(&p.counterparty_output));
    out.extend_from_slice(&serialize(&p.proposer_utxo.outpoint));
    out.extend_from_slice(&serialize(&p.proposer_utxo.txout));
    out.extend_from_slice(&serialize(&p.change_script));
    out.extend_from_slice(&p.net_transfer.to_le_bytes());
    out.extend_from_slice(&p.fee_estimate.to_le_bytes());
    out.extend_from_slice(&p.proposer_key.secret_bytes());

    Ok(out)
}

fn parse_v1(bytes: &[u8]) -> Result<ProposalPlaintext, ProposalError> {
    let mut reader = LayoutReader { bytes, pos: 0 };

    let counterparty_outpoint: OutPoint = reader.consensus("counterparty outpoint")?;
    let counterparty_output: TxOut = reader.consensus("counterparty output")?;
    let proposer_outpoint: OutPoint = reader.consensus("proposer outpoint")?;
    let proposer_output: TxOut = reader.consensus("proposer output")?;
    let change_script: ScriptBuf = reader.consensus("change script")?;
    let net_transfer = i64::from_le_bytes(reader.fixed::<8>("net transfer")?);
    let fee_estimate = u64::from_le_bytes(reader.fixed::<8>("fee estimate")?);
    let key_bytes = reader.fixed::<32>("proposer key")?;

    if reader.pos != bytes.len() {
        return Err(ProposalError::MalformedEnvelope(format!(
            "{} trailing bytes after plaintext",
            bytes.len() - reader.pos
        )));
    }

    let proposer_key = SecretKey::from_slice(&key_bytes)
        .map_err(|e| ProposalError::MalformedEnvelope(format!("invalid proposer key: {}", e)))?;

    Ok(ProposalPlaintext {
        counterparty_outpoint,
        counterparty_output,
        proposer_utxo: Utxo {
            outpoint: proposer_outpoint,
            txout: proposer_output,
        },
        change_script,
        net_transfer,
        fee_estimate,
        proposer_key,
    })
}

fn check_amount(what: &str, amount: Amount) -> Result<(), ProposalError> {
    if amount > Amount::MAX_MONEY {
        return Err(ProposalError::Encoding(format!(
            "{} amount {} outside money range",
            what,
            amount.to_sat()
        )));
    }
    Ok(())
}

fn check_script(what: &str, script: &ScriptBuf) -> Result<(), ProposalError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ProposalError::Encoding(format!(
            "{} script is {} bytes (maximum {})",
            what,
            script.len(),
            MAX_SCRIPT_SIZE
        )));
    }
    Ok(())
}

struct LayoutReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl LayoutReader<'_> {
    fn consensus<T: Decodable>(&mut self, what: &str) -> Result<T, ProposalError> {
        let (value, consumed) = deserialize_partial::<T>(&self.bytes[self.pos..])
            .map_err(|e| ProposalError::MalformedEnvelope(format!("bad {}: {}", what, e)))?;
        self.pos += consumed;
        Ok(value)
    }

    fn fixed<const N: usize>(&mut self, what: &str) -> Result<[u8; N], ProposalError> {
        let end = self.pos + N;
        let slice = self.bytes.get(self.pos..end).ok_or_else(|| {
            ProposalError::MalformedEnvelope(format!("plaintext truncated at {}", what))
        })?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.pos = end;
        Ok(out)
    }
}
