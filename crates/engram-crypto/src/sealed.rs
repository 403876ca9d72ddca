//! Authenticated sealing under a raw 256-bit key
//!
//! AES-256-GCM with a fresh random nonce prepended to the ciphertext. Used by
//! the provider for payload encryption and by the store for at-rest sealing.

use crate::types::Nonce;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce as AesNonce};
use engram_core::{EngramError, Result};

/// Length of the nonce prepended to every sealed blob.
pub const NONCE_LEN: usize = 12;

/// Seal plaintext under a key; the blob is self-contained
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| EngramError::crypto(format!("failed to create cipher: {e}")))?;

    let nonce = Nonce::random();
    let ciphertext = cipher
        .encrypt(AesNonce::from_slice(nonce.as_bytes()), plaintext)
        .map_err(|e| EngramError::crypto(format!("encryption failed: {e}")))?;

    let mut blob = nonce.as_bytes().to_vec();
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Unseal a blob produced by [`seal`] under the same key
pub fn unseal(key: &[u8; 32], blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < NONCE_LEN {
        return Err(EngramError::crypto("ciphertext too short"));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| EngramError::crypto(format!("failed to create cipher: {e}")))?;

    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    cipher
        .decrypt(AesNonce::from_slice(nonce), ciphertext)
        .map_err(|e| EngramError::crypto(format!("decryption failed: {e}")))
}
