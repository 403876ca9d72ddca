//! Trust requests and their transport encoding
//!
//! A new device introduces itself with a self-signed request proving it owns
//! the public key it presents. The request travels out-of-band in a compact
//! prefixed encoding (QR code, copy-paste) rather than through the relay.

use engram_core::{DeviceId, EngramError, Result};
use engram_crypto::wire::{hex_key, hex_nonce};
use engram_crypto::{hash, CryptoProvider, SignatureBytes};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

/// Fixed prefix tagging the transport encoding of a trust request.
pub const TRANSPORT_PREFIX: &str = "ENGRAM-PAIR:";

/// A new device's self-signed introduction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRequest {
    /// Requesting device
    pub device_id: DeviceId,
    /// Requesting device's public signing key
    #[serde(with = "hex_key")]
    pub public_key: [u8; 32],
    /// Human nickname shown during the ceremony
    pub nickname: String,
    /// Creation time, milliseconds since the epoch
    pub timestamp_ms: i64,
    /// Random nonce making each request unique
    #[serde(with = "hex_nonce")]
    pub nonce: [u8; 16],
    /// Self-signature over the canonical request fields, proving key ownership
    pub signature: SignatureBytes,
}

impl TrustRequest {
    /// Build and self-sign a request for the given device
    pub fn new(crypto: &CryptoProvider, nickname: impl Into<String>, now_ms: i64) -> Self {
        let device_id = crypto.device_id().clone();
        let public_key = crypto.public_key_bytes();
        let nonce: [u8; 16] = rand::random();
        let digest = hash::hash(&canonical_bytes(&device_id, &public_key, now_ms, &nonce));
        let signature = crypto.sign(&digest);
        Self {
            device_id,
            public_key,
            nickname: nickname.into(),
            timestamp_ms: now_ms,
            nonce,
            signature,
        }
    }

    /// Check the self-signature against the embedded public key
    ///
    /// Fails closed: an undecodable key or a bad signature both return false.
    pub fn verify_self_signature(&self) -> bool {
        let digest = hash::hash(&canonical_bytes(
            &self.device_id,
            &self.public_key,
            self.timestamp_ms,
            &self.nonce,
        ));
        let Ok(verifying_key) = VerifyingKey::from_bytes(&self.public_key) else {
            return false;
        };
        verifying_key
            .verify(digest.as_bytes(), &Signature::from(self.signature))
            .is_ok()
    }

    /// Render into the compact transport form
    pub fn encode_transport(&self) -> Result<String> {
        let body = serde_json::to_vec(self)
            .map_err(|e| EngramError::serialization(format!("request encoding failed: {e}")))?;
        Ok(format!("{TRANSPORT_PREFIX}{}", BASE64.encode(body)))
    }

    /// Decode the transport form back into a request
    pub fn decode_transport(encoded: &str) -> Result<Self> {
        let body = encoded.strip_prefix(TRANSPORT_PREFIX).ok_or_else(|| {
            EngramError::malformed(format!(
                "pairing payload does not start with '{TRANSPORT_PREFIX}'"
            ))
        })?;
        let bytes = BASE64
            .decode(body)
            .map_err(|e| EngramError::malformed(format!("pairing payload is not base64: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| EngramError::malformed(format!("pairing payload is not a request: {e}")))
    }
}

/// Canonical byte string the self-signature covers.
fn canonical_bytes(
    device_id: &DeviceId,
    public_key: &[u8; 32],
    timestamp_ms: i64,
    nonce: &[u8; 16],
) -> Vec<u8> {
    format!(
        "{device_id}|{}|{timestamp_ms}|{}",
        hex::encode(public_key),
        hex::encode(nonce)
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_core::ManualTimeSource;
    use engram_crypto::DeviceKeyPair;

    fn provider(name: &str) -> CryptoProvider {
        let time = ManualTimeSource::new(1_000);
        CryptoProvider::new(DeviceKeyPair::generate(DeviceId::new(name), &time))
    }

    #[test]
    fn test_request_self_signature_verifies() {
        let crypto = provider("new-phone");
        let request = TrustRequest::new(&crypto, "New Phone", 5_000);
        assert!(request.verify_self_signature());
    }

    #[test]
    fn test_tampered_request_fails_self_signature() {
        let crypto = provider("new-phone");
        let mut request = TrustRequest::new(&crypto, "New Phone", 5_000);
        request.timestamp_ms += 1;
        assert!(!request.verify_self_signature());

        let mut swapped_key = TrustRequest::new(&crypto, "New Phone", 5_000);
        swapped_key.public_key = provider("other").public_key_bytes();
        assert!(!swapped_key.verify_self_signature());
    }

    #[test]
    fn test_transport_roundtrip() {
        let crypto = provider("new-phone");
        let request = TrustRequest::new(&crypto, "New Phone", 5_000);
        let encoded = request.encode_transport().unwrap();
        assert!(encoded.starts_with(TRANSPORT_PREFIX));
        let decoded = TrustRequest::decode_transport(&encoded).unwrap();
        assert_eq!(decoded, request);
        assert!(decoded.verify_self_signature());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(TrustRequest::decode_transport("no prefix here").is_err());
        assert!(TrustRequest::decode_transport("ENGRAM-PAIR:!!!not base64!!!").is_err());
        let valid_b64 = format!("{TRANSPORT_PREFIX}{}", BASE64.encode(b"{\"not\": \"a request\"}"));
        assert!(TrustRequest::decode_transport(&valid_b64).is_err());
    }
}
