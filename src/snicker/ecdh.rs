//! Diffie-Hellman shared secrets and proposal encryption

use bdk_wallet::bitcoin::{
    hashes::{sha256, Hash},
    secp256k1::{ecdh::SharedSecret, PublicKey, SecretKey},
};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Nonce,
};

use super::ProposalError;

/// Nonce length for ChaCha20-Poly1305
pub const NONCE_LEN: usize = 12;

/// Authentication tag length for Poly1305
pub const TAG_LEN: usize = 16;

/// Domain separator for the proposal key derivation
const PROPOSAL_KEY_DOMAIN: &[u8] = b"SNICKER/proposal-key";

/// Calculate Diffie-Hellman shared secret between our secret key and their public key
///
/// Both parties can independently derive the same shared secret:
/// - Proposer: `SharedSecret::new(&receiver_pubkey, &proposer_seckey)`
/// - Receiver: `SharedSecret::new(&proposer_pubkey, &receiver_seckey)`
///
/// # Returns
/// 32-byte shared secret (SHA256 hash of the compressed ECDH point)
pub fn calculate_dh_shared_secret(
    our_seckey: &SecretKey,
    their_pubkey: &PublicKey,
) -> [u8; 32] {
    let shared = SharedSecret::new(their_pubkey, our_seckey);
    shared.secret_bytes()
}

/// Derive the symmetric proposal key from a shared secret
///
/// `SHA256("SNICKER/proposal-key" || shared_secret)`. Poly1305 derives its
/// one-time authentication key from this key and the nonce.
pub fn derive_proposal_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let mut preimage = Vec::with_capacity(PROPOSAL_KEY_DOMAIN.len() + 32);
    preimage.extend_from_slice(PROPOSAL_KEY_DOMAIN);
    preimage.extend_from_slice(shared_secret);

    sha256::Hash::hash(&preimage).to_byte_array()
}

/// Encrypt a serialized proposal using ChaCha20-Poly1305
///
/// The nonce is randomly generated and prepended to the ciphertext.
/// `aad` is authenticated but not encrypted.
///
/// # Returns
/// Encrypted data with format: [12-byte nonce || ciphertext || 16-byte tag]
pub fn encrypt_proposal(
    plaintext: &[u8],
    key: &[u8; 32],
    aad: &[u8],
) -> Result<Vec<u8>, ProposalError> {
    let cipher = ChaCha20Poly1305::new(key.into());

    let nonce = ChaCha20Poly1305::generate_nonce(OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| ProposalError::Encryption(e.to_string()))?;

    let mut result = Vec::with_capacity(nonce.len() + ciphertext.len());
    result.extend_from_slice(&nonce);
    result.extend_from_slice(&ciphertext);

    Ok(result)
}

/// Decrypt a proposal using ChaCha20-Poly1305
///
/// Fails with [`ProposalError::Decryption`] when the tag does not verify,
/// which is the normal outcome for a proposal addressed to someone else.
pub fn decrypt_proposal(
    encrypted: &[u8],
    key: &[u8; 32],
    aad: &[u8],
) -> Result<Vec<u8>, ProposalError> {
    if encrypted.len() < NONCE_LEN + TAG_LEN {
        return Err(ProposalError::MalformedEnvelope(format!(
            "encrypted data too short: {} bytes",
            encrypted.len()
        )));
    }

    let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher = ChaCha20Poly1305::new(key.into());

    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| ProposalError::Decryption)
}
