//! Relay record serialization
//!
//! A relay record is one line of text: `<base64 envelope blob>,<hex sender pubkey>`.
//! The relay server and every client share this format; the server only
//! checks it is well-formed, it cannot look inside the blob.

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bdk_wallet::bitcoin::secp256k1::PublicKey;

use crate::snicker::codec::MIN_ENVELOPE_LEN;
use crate::snicker::{ProposalEnvelope, ProposalError};

/// Length of a compressed secp256k1 public key
pub const PUBKEY_LEN: usize = 33;

/// Reasons a relay line is not a well-formed record
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordFormatError {
    #[error("expected exactly one ',' separator, found {0}")]
    Separator(usize),

    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),

    #[error("payload too short for an envelope: {0} bytes")]
    PayloadTooShort(usize),

    #[error("invalid hex public key: {0}")]
    InvalidHex(String),

    #[error("public key must be {PUBKEY_LEN} bytes, got {0}")]
    WrongKeyLength(usize),
}

/// One `base64,hex` line as stored by a relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRecord {
    /// Version byte followed by nonce, ciphertext and tag
    pub blob: Vec<u8>,
    /// Compressed sender public key, not yet checked to be on the curve
    pub sender_key: [u8; PUBKEY_LEN],
}

impl RelayRecord {
    pub fn from_envelope(envelope: &ProposalEnvelope) -> Self {
        Self {
            blob: envelope.to_blob(),
            sender_key: envelope.sender_pubkey.serialize(),
        }
    }

    /// Parse the record into an envelope ready for decryption
    pub fn to_envelope(&self) -> Result<ProposalEnvelope, ProposalError> {
        let sender_pubkey = PublicKey::from_slice(&self.sender_key)
            .map_err(|e| ProposalError::MalformedEnvelope(format!("invalid sender key: {}", e)))?;
        ProposalEnvelope::from_blob(&self.blob, sender_pubkey)
    }
}

impl FromStr for RelayRecord {
    type Err = RecordFormatError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut fields = line.split(',');
        let (Some(payload), Some(key), None) = (fields.next(), fields.next(), fields.next()) else {
            return Err(RecordFormatError::Separator(line.matches(',').count()));
        };

        let blob = STANDARD
            .decode(payload)
            .map_err(|e| RecordFormatError::InvalidBase64(e.to_string()))?;
        if blob.len() < MIN_ENVELOPE_LEN {
            return Err(RecordFormatError::PayloadTooShort(blob.len()));
        }

        let key_bytes = hex::decode(key).map_err(|e| RecordFormatError::InvalidHex(e.to_string()))?;
        let sender_key: [u8; PUBKEY_LEN] = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| RecordFormatError::WrongKeyLength(key_bytes.len()))?;

        Ok(Self { blob, sender_key })
    }
}

impl fmt::Display for RelayRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", STANDARD.encode(&self.blob), hex::encode(self.sender_key))
    }
}

/// Format records as a relay batch: one per line, each newline-terminated
pub fn format_records(records: &[RelayRecord]) -> String {
    records.iter().map(|r| format!("{}\n", r)).collect()
}

/// Parse a relay GET body, skipping lines that are not well-formed
///
/// # Returns
/// Tuple of (parsed records in order, number of skipped lines)
pub fn parse_records(text: &str) -> (Vec<RelayRecord>, usize) {
    let mut records = Vec::new();
    let mut skipped = 0;

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        match line.parse::<RelayRecord>() {
            Ok(record) => records.push(record),
            Err(e) => {
                skipped += 1;
                if skipped <= 10 {
                    tracing::debug!("Skipped malformed relay line: {}", e);
                }
            }
        }
    }

    (records, skipped)
}
