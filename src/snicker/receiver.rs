//! Receiver side: find the proposals addressed to us among all relayed records
//!
//! Most records on a relay are for somebody else. Failing to decrypt is the
//! normal case and is only counted, never treated as an error.

use anyhow::{Context, Result};
use bdk_wallet::bitcoin::secp256k1::{PublicKey, SecretKey};
use tokio_util::sync::CancellationToken;

use super::codec::try_decrypt;
use super::{ProposalError, ProposalPlaintext, ProposalVersion};
use crate::network::serialization::RelayRecord;

/// Log a progress line every this many records
const PROGRESS_INTERVAL: usize = 100;

/// A decrypted proposal that passed the acceptance predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedProposal {
    pub plaintext: ProposalPlaintext,
    /// Our key that opened the envelope
    pub receiver_key: SecretKey,
    pub sender_pubkey: PublicKey,
    /// Position of the record in the scanned batch
    pub record_index: usize,
}

/// Result of scanning a batch of relay records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub accepted: Vec<ReceivedProposal>,
    pub records_scanned: usize,
    /// Envelope could not be parsed (bad sender key, truncated blob)
    pub malformed: usize,
    pub unsupported_version: usize,
    /// No owned key decrypts the envelope
    pub not_for_us: usize,
    /// Decrypted but refused by the acceptance predicate
    pub rejected_by_policy: usize,
    /// Scan stopped early because the token was cancelled
    pub cancelled: bool,
}

/// Receiver-side economic checks on a decrypted proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptancePolicy {
    /// Minimum sats we must gain; negative values tolerate paying the proposer
    pub lowest_net_gain: i64,
    /// Largest fee estimate we accept in the proposal
    pub max_fee: u64,
}

impl AcceptancePolicy {
    /// Our gain is the negated net transfer: positive transfers go to the proposer.
    pub fn accepts(&self, plaintext: &ProposalPlaintext) -> bool {
        let gain = plaintext.net_transfer.saturating_neg();
        gain >= self.lowest_net_gain && plaintext.fee_estimate <= self.max_fee
    }
}

/// Try every record against every owned key
///
/// Records are processed in order; `cancel` is checked between records.
///
/// # Arguments
/// * `records` - Everything fetched from the relays
/// * `owned_keys` - Private keys for outputs we might be asked to co-spend
/// * `accept` - Caller policy applied to each decrypted plaintext
/// * `cancel` - Stops the scan between records
pub fn scan<F>(
    records: &[RelayRecord],
    owned_keys: &[SecretKey],
    mut accept: F,
    cancel: &CancellationToken,
) -> ScanOutcome
where
    F: FnMut(&ProposalPlaintext) -> bool,
{
    let mut outcome = ScanOutcome::default();

    tracing::info!(
        "🔍 Scanning {} proposal(s) against {} key(s)",
        records.len(),
        owned_keys.len()
    );

    for (index, record) in records.iter().enumerate() {
        if cancel.is_cancelled() {
            tracing::info!("🛑 Scan cancelled after {} record(s)", outcome.records_scanned);
            outcome.cancelled = true;
            break;
        }
        outcome.records_scanned += 1;

        match open_record(record, owned_keys) {
            Opened::Malformed(e) => {
                tracing::debug!("Skipping record {}: {}", index, e);
                outcome.malformed += 1;
            }
            Opened::UnsupportedVersion(version) => {
                tracing::debug!("Skipping record {}: unsupported version 0x{:02x}", index, version);
                outcome.unsupported_version += 1;
            }
            Opened::NotForUs => outcome.not_for_us += 1,
            Opened::Proposal {
                plaintext,
                receiver_key,
                sender_pubkey,
            } => {
                if accept(&plaintext) {
                    tracing::info!(
                        "✅ Proposal {} accepted: net transfer {} sats, fee {} sats",
                        index,
                        plaintext.net_transfer,
                        plaintext.fee_estimate
                    );
                    outcome.accepted.push(ReceivedProposal {
                        plaintext,
                        receiver_key,
                        sender_pubkey,
                        record_index: index,
                    });
                } else {
                    tracing::info!(
                        "Proposal {} decrypted but refused by policy (net transfer {})",
                        index,
                        plaintext.net_transfer
                    );
                    outcome.rejected_by_policy += 1;
                }
            }
        }

        if outcome.records_scanned % PROGRESS_INTERVAL == 0 {
            tracing::info!(
                "📊 Scanned {}/{} proposals, {} accepted so far",
                outcome.records_scanned,
                records.len(),
                outcome.accepted.len()
            );
        }
    }

    tracing::info!(
        "🔍 Scan finished: {} scanned, {} accepted, {} not for us, {} refused, {} malformed, {} unsupported",
        outcome.records_scanned,
        outcome.accepted.len(),
        outcome.not_for_us,
        outcome.rejected_by_policy,
        outcome.malformed,
        outcome.unsupported_version
    );

    outcome
}

enum Opened {
    Malformed(ProposalError),
    UnsupportedVersion(u8),
    NotForUs,
    Proposal {
        plaintext: ProposalPlaintext,
        receiver_key: SecretKey,
        sender_pubkey: PublicKey,
    },
}

fn open_record(record: &RelayRecord, owned_keys: &[SecretKey]) -> Opened {
    let envelope = match record.to_envelope() {
        Ok(envelope) => envelope,
        Err(e) => return Opened::Malformed(e),
    };

    if ProposalVersion::try_from(envelope.version).is_err() {
        return Opened::UnsupportedVersion(envelope.version);
    }

    for key in owned_keys {
        match try_decrypt(&envelope, key) {
            Ok(Some(plaintext)) => {
                return Opened::Proposal {
                    plaintext,
                    receiver_key: *key,
                    sender_pubkey: envelope.sender_pubkey,
                }
            }
            Ok(None) => {}
            Err(ProposalError::UnsupportedVersion(version)) => {
                return Opened::UnsupportedVersion(version)
            }
            Err(e) => return Opened::Malformed(e),
        }
    }

    Opened::NotForUs
}

/// Run [`scan`] on the blocking thread pool
///
/// Each record costs one ECDH per owned key.
pub async fn scan_in_background<F>(
    records: Vec<RelayRecord>,
    owned_keys: Vec<SecretKey>,
    accept: F,
    cancel: CancellationToken,
) -> Result<ScanOutcome>
where
    F: FnMut(&ProposalPlaintext) -> bool + Send + 'static,
{
    tokio::task::spawn_blocking(move || scan(&records, &owned_keys, accept, &cancel))
        .await
        .context("Receiver scan task failed")
}
