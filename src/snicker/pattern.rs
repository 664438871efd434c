//! SNICKER transaction pattern detection
//!
//! Heuristics to identify on-chain transactions that a proposer can target:
//! two-party, two-output spends by standard single-sig wallets. Such a
//! transaction looks like an ordinary payment, and so does the coinjoin
//! we propose against it.

use bdk_wallet::bitcoin::{
    consensus::encode::deserialize, secp256k1::PublicKey, Script, Transaction, TxOut, Witness,
};

use super::ProposalError;

/// Outputs below this value are dust and never part of a candidate
pub const DUST_LIMIT_SATS: u64 = 546;

/// Largest implied miner fee we consider plausible for a 2-in/2-out spend
pub const MAX_PLAUSIBLE_FEE_SATS: u64 = 500_000;

/// Largest net-transfer adjustment between an input and an output leg
pub const MAX_NET_ADJUSTMENT_SATS: u64 = 1_000_000;

/// Detect if a transaction matches the SNICKER candidate pattern
///
/// A candidate must have:
/// - Exactly 2 inputs, each spent by a single-sig witness
///   (P2WPKH / P2SH-P2WPKH, or a taproot key-path signature)
/// - Exactly 2 outputs, each a standard single-sig script type
///   (P2PKH, P2SH, P2WPKH, P2TR) and not dust
///
/// Same-type transactions are accepted. Never panics on odd input.
pub fn classify(tx: &Transaction) -> bool {
    if tx.input.len() != 2 || tx.output.len() != 2 {
        return false;
    }

    if !tx.input.iter().all(|input| is_single_sig_witness(&input.witness)) {
        return false;
    }

    tx.output.iter().all(|out| {
        is_single_sig_script(&out.script_pubkey) && out.value.to_sat() >= DUST_LIMIT_SATS
    })
}

/// Classify a transaction from its wire encoding
///
/// Malformed or truncated bytes (including trailing garbage) are not a candidate.
pub fn classify_raw(raw_tx: &[u8]) -> bool {
    match deserialize::<Transaction>(raw_tx) {
        Ok(tx) => classify(&tx),
        Err(e) => {
            tracing::trace!("Skipping undecodable transaction: {}", e);
            false
        }
    }
}

/// Classify with the spent outputs known
///
/// On top of [`classify`], the values must tell the SNICKER story: the
/// implied fee is non-negative and plausible, and one output equals one
/// input's value up to the fee plus a bounded net transfer.
/// `prevouts` must be in input order.
pub fn classify_with_prevouts(tx: &Transaction, prevouts: &[TxOut]) -> bool {
    if !classify(tx) || prevouts.len() != tx.input.len() {
        return false;
    }

    let total_in = prevouts
        .iter()
        .try_fold(0u64, |acc, p| acc.checked_add(p.value.to_sat()));
    let total_out = tx
        .output
        .iter()
        .try_fold(0u64, |acc, o| acc.checked_add(o.value.to_sat()));

    let (Some(total_in), Some(total_out)) = (total_in, total_out) else {
        return false;
    };

    let Some(fee) = total_in.checked_sub(total_out) else {
        return false;
    };
    if fee > MAX_PLAUSIBLE_FEE_SATS {
        return false;
    }

    let tolerance = fee + MAX_NET_ADJUSTMENT_SATS;
    prevouts.iter().any(|prevout| {
        tx.output
            .iter()
            .any(|out| prevout.value.to_sat().abs_diff(out.value.to_sat()) <= tolerance)
    })
}

/// Extract the public key revealed by the witness of one input
///
/// Works for P2WPKH and P2SH-P2WPKH spends (`[signature, pubkey]`).
/// Taproot key-path spends only reveal a signature, so they fail.
pub fn extract_pubkey_from_witness(
    tx: &Transaction,
    input_index: usize,
) -> Result<PublicKey, ProposalError> {
    let input = tx.input.get(input_index).ok_or_else(|| {
        ProposalError::KeyExtraction(format!(
            "input index {} out of range ({} inputs)",
            input_index,
            tx.input.len()
        ))
    })?;

    let witness = &input.witness;
    match witness.len() {
        2 => {
            let pubkey_bytes = witness.nth(1).unwrap_or_default();
            PublicKey::from_slice(pubkey_bytes)
                .map_err(|e| ProposalError::KeyExtraction(format!("invalid public key in witness: {}", e)))
        }
        1 => Err(ProposalError::KeyExtraction(
            "taproot key-path spend does not reveal a public key".to_string(),
        )),
        0 => Err(ProposalError::KeyExtraction(
            "input has no witness (non-segwit spend)".to_string(),
        )),
        n => Err(ProposalError::KeyExtraction(format!(
            "unsupported witness with {} items (not single-sig)",
            n
        ))),
    }
}

/// Multi-line description of a transaction for the candidates log
pub fn human_readable_transaction(tx: &Transaction) -> String {
    let mut out = format!(
        "txid: {}\nversion: {}\nlocktime: {}\n",
        tx.compute_txid(),
        tx.version.0,
        tx.lock_time
    );
    for (i, input) in tx.input.iter().enumerate() {
        out.push_str(&format!(
            "input {}: {} (witness items: {})\n",
            i,
            input.previous_output,
            input.witness.len()
        ));
    }
    for (i, output) in tx.output.iter().enumerate() {
        out.push_str(&format!(
            "output {}: {} sats to {}\n",
            i,
            output.value.to_sat(),
            output.script_pubkey
        ));
    }
    out
}

fn is_single_sig_script(script: &Script) -> bool {
    script.is_p2wpkh() || script.is_p2tr() || script.is_p2pkh() || script.is_p2sh()
}

fn is_single_sig_witness(witness: &Witness) -> bool {
    match witness.len() {
        // [DER signature + sighash byte, compressed pubkey]
        2 => {
            let sig = witness.nth(0).unwrap_or_default();
            let pubkey = witness.nth(1).unwrap_or_default();
            (9..=73).contains(&sig.len())
                && sig[0] == 0x30
                && pubkey.len() == 33
                && (pubkey[0] == 0x02 || pubkey[0] == 0x03)
        }
        // Schnorr signature, optionally with sighash byte
        1 => matches!(witness.nth(0).map(<[u8]>::len), Some(64) | Some(65)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bdk_wallet::bitcoin::{
        consensus::encode::serialize, hashes::Hash, secp256k1::Secp256k1, secp256k1::SecretKey,
        Amount, OutPoint, ScriptBuf, Sequence, TxIn, Txid,
    };

    fn test_pubkey(byte: u8) -> PublicKey {
        let secp = Secp256k1::new();
        SecretKey::from_slice(&[byte; 32]).unwrap().public_key(&secp)
    }

    fn create_p2wpkh_output(value_sats: u64) -> TxOut {
        let script = ScriptBuf::from_hex("001400000000000000000000000000000000000000").unwrap();
        TxOut {
            value: Amount::from_sat(value_sats),
            script_pubkey: script,
        }
    }

    fn create_p2tr_output(value_sats: u64) -> TxOut {
        let script = ScriptBuf::from_hex(
            "51200000000000000000000000000000000000000000000000000000000000000000",
        )
        .unwrap();
        TxOut {
            value: Amount::from_sat(value_sats),
            script_pubkey: script,
        }
    }

    fn p2wpkh_input(vout: u32, key_byte: u8) -> TxIn {
        let mut sig = vec![0x30u8; 71];
        sig[70] = 0x01;
        TxIn {
            previous_output: OutPoint {
                txid: Txid::from_byte_array([0xab; 32]),
                vout,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::from_slice(&[sig, test_pubkey(key_byte).serialize().to_vec()]),
        }
    }

    fn taproot_input(vout: u32) -> TxIn {
        TxIn {
            previous_output: OutPoint {
                txid: Txid::from_byte_array([0xcd; 32]),
                vout,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::from_slice(&[vec![0x55u8; 64]]),
        }
    }

    fn tx(input: Vec<TxIn>, output: Vec<TxOut>) -> Transaction {
        Transaction {
            version: bdk_wallet::bitcoin::transaction::Version::TWO,
            lock_time: bdk_wallet::bitcoin::locktime::absolute::LockTime::ZERO,
            input,
            output,
        }
    }

    #[test]
    fn test_two_in_two_out_is_candidate() {
        let t = tx(
            vec![p2wpkh_input(0, 1), p2wpkh_input(1, 2)],
            vec![create_p2wpkh_output(50_000), create_p2wpkh_output(30_000)],
        );
        assert!(classify(&t));
    }

    #[test]
    fn test_three_outputs_not_candidate() {
        let t = tx(
            vec![p2wpkh_input(0, 1), p2wpkh_input(1, 2)],
            vec![
                create_p2wpkh_output(50_000),
                create_p2wpkh_output(30_000),
                create_p2wpkh_output(20_000),
            ],
        );
        assert!(!classify(&t));
    }

    #[test]
    fn test_one_input_not_candidate() {
        let t = tx(
            vec![p2wpkh_input(0, 1)],
            vec![create_p2wpkh_output(50_000), create_p2wpkh_output(30_000)],
        );
        assert!(!classify(&t));
    }

    #[test]
    fn test_mixed_taproot_and_segwit_accepted() {
        let t = tx(
            vec![taproot_input(0), p2wpkh_input(1, 2)],
            vec![create_p2tr_output(80_000), create_p2wpkh_output(12_000)],
        );
        assert!(classify(&t));
    }

    #[test]
    fn test_multisig_witness_rejected() {
        let mut multisig = p2wpkh_input(0, 1);
        multisig.witness = Witness::from_slice(&[
            vec![],
            vec![0x30u8; 71],
            vec![0x30u8; 71],
            vec![0x52u8; 71],
        ]);
        let t = tx(
            vec![multisig, p2wpkh_input(1, 2)],
            vec![create_p2wpkh_output(50_000), create_p2wpkh_output(30_000)],
        );
        assert!(!classify(&t));
    }

    #[test]
    fn test_non_standard_outputs_rejected() {
        let op_return = TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: ScriptBuf::from_hex("6a0401020304").unwrap(),
        };
        let p2wsh = TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: ScriptBuf::from_hex(
                "00200000000000000000000000000000000000000000000000000000000000000000",
            )
            .unwrap(),
        };

        for bad in [op_return, p2wsh] {
            let t = tx(
                vec![p2wpkh_input(0, 1), p2wpkh_input(1, 2)],
                vec![bad, create_p2wpkh_output(30_000)],
            );
            assert!(!classify(&t));
        }
    }

    #[test]
    fn test_dust_output_rejected() {
        let t = tx(
            vec![p2wpkh_input(0, 1), p2wpkh_input(1, 2)],
            vec![create_p2wpkh_output(50_000), create_p2wpkh_output(545)],
        );
        assert!(!classify(&t));
    }

    #[test]
    fn test_classify_is_deterministic_on_raw_bytes() {
        let t = tx(
            vec![p2wpkh_input(0, 1), p2wpkh_input(1, 2)],
            vec![create_p2wpkh_output(50_000), create_p2wpkh_output(30_000)],
        );
        let raw = serialize(&t);

        assert!(classify_raw(&raw));
        assert_eq!(classify_raw(&raw), classify_raw(&raw.clone()));
    }

    #[test]
    fn test_truncated_and_garbage_bytes_rejected() {
        let t = tx(
            vec![p2wpkh_input(0, 1), p2wpkh_input(1, 2)],
            vec![create_p2wpkh_output(50_000), create_p2wpkh_output(30_000)],
        );
        let raw = serialize(&t);

        assert!(!classify_raw(&raw[..raw.len() / 2]));
        assert!(!classify_raw(&[]));
        assert!(!classify_raw(&[0xff; 40]));
    }

    #[test]
    fn test_prevout_values_must_explain_outputs() {
        let t = tx(
            vec![p2wpkh_input(0, 1), p2wpkh_input(1, 2)],
            vec![create_p2wpkh_output(50_000), create_p2wpkh_output(30_000)],
        );

        // 51_000 + 29_500 in, 500 sat fee
        let plausible = vec![create_p2wpkh_output(51_000), create_p2wpkh_output(29_500)];
        assert!(classify_with_prevouts(&t, &plausible));

        // Outputs exceed inputs
        let negative_fee = vec![create_p2wpkh_output(10_000), create_p2wpkh_output(10_000)];
        assert!(!classify_with_prevouts(&t, &negative_fee));

        // Absurd fee
        let huge_fee = vec![create_p2wpkh_output(5_000_000), create_p2wpkh_output(29_500)];
        assert!(!classify_with_prevouts(&t, &huge_fee));

        // Wrong number of prevouts
        assert!(!classify_with_prevouts(&t, &plausible[..1]));
    }

    #[test]
    fn test_extract_pubkey_from_witness() {
        let t = tx(
            vec![p2wpkh_input(0, 1), p2wpkh_input(1, 2)],
            vec![create_p2wpkh_output(50_000), create_p2wpkh_output(30_000)],
        );

        assert_eq!(extract_pubkey_from_witness(&t, 0).unwrap(), test_pubkey(1));
        assert_eq!(extract_pubkey_from_witness(&t, 1).unwrap(), test_pubkey(2));
        assert!(matches!(
            extract_pubkey_from_witness(&t, 2),
            Err(ProposalError::KeyExtraction(_))
        ));
    }

    #[test]
    fn test_extract_pubkey_fails_for_taproot() {
        let t = tx(
            vec![taproot_input(0), p2wpkh_input(1, 2)],
            vec![create_p2tr_output(80_000), create_p2wpkh_output(12_000)],
        );

        assert!(matches!(
            extract_pubkey_from_witness(&t, 0),
            Err(ProposalError::KeyExtraction(_))
        ));
    }

    #[test]
    fn test_human_readable_lists_outputs() {
        let t = tx(
            vec![p2wpkh_input(0, 1), p2wpkh_input(1, 2)],
            vec![create_p2wpkh_output(50_000), create_p2wpkh_output(30_000)],
        );
        let text = human_readable_transaction(&t);

        assert!(text.contains(&t.compute_txid().to_string()));
        assert!(text.contains("output 0: 50000 sats"));
        assert!(text.contains("output 1: 30000 sats"));
    }
}
