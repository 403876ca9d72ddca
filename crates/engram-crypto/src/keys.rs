//! Device key material
//!
//! Each device generates, once, an Ed25519 signing keypair and an AES-256
//! payload key. The symmetric key only ever encrypts that device's own
//! payloads; peers receive the signing public key through pairing.

use crate::wire::hex_key;
use engram_core::{DeviceId, EngramError, Result, TimeSource};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// A device's long-lived key material
///
/// Holds the private half of the signing keypair and the symmetric payload
/// key. Never serialized directly; persist through [`KeyPairRecord`] inside
/// an encrypted keyring entry.
pub struct DeviceKeyPair {
    device_id: DeviceId,
    signing: SigningKey,
    payload_key: [u8; 32],
    created_ms: i64,
}

impl DeviceKeyPair {
    /// Generate fresh key material for a device (first run only)
    pub fn generate(device_id: DeviceId, time: &dyn TimeSource) -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let mut payload_key = [0u8; 32];
        OsRng.fill_bytes(&mut payload_key);
        Self {
            device_id,
            signing,
            payload_key,
            created_ms: time.now_ms(),
        }
    }

    /// The owning device
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The private signing key
    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    /// The symmetric payload key
    pub(crate) fn payload_key(&self) -> &[u8; 32] {
        &self.payload_key
    }

    /// The public half of the signing keypair
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Public signing key as raw bytes (the form peers store and exchange)
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Creation time in milliseconds since the epoch
    pub fn created_ms(&self) -> i64 {
        self.created_ms
    }

    /// Export to a persistable record
    pub fn to_record(&self) -> KeyPairRecord {
        KeyPairRecord {
            device_id: self.device_id.clone(),
            signing_secret: self.signing.to_bytes(),
            payload_key: self.payload_key,
            created_ms: self.created_ms,
        }
    }

    /// Restore from a persisted record
    pub fn from_record(record: &KeyPairRecord) -> Result<Self> {
        if record.device_id.as_str().is_empty() {
            return Err(EngramError::crypto("keypair record has empty device id"));
        }
        Ok(Self {
            device_id: record.device_id.clone(),
            signing: SigningKey::from_bytes(&record.signing_secret),
            payload_key: record.payload_key,
            created_ms: record.created_ms,
        })
    }
}

impl Drop for DeviceKeyPair {
    fn drop(&mut self) {
        // SigningKey zeroizes itself; the payload key is ours to clear.
        self.payload_key.zeroize();
    }
}

impl std::fmt::Debug for DeviceKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKeyPair")
            .field("device_id", &self.device_id)
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .field("created_ms", &self.created_ms)
            .finish_non_exhaustive()
    }
}

/// Serializable form of [`DeviceKeyPair`]
///
/// Contains secret material; only ever written inside a sealed keyring blob.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyPairRecord {
    /// Owning device
    pub device_id: DeviceId,
    /// Ed25519 signing secret
    #[serde(with = "hex_key")]
    pub signing_secret: [u8; 32],
    /// AES-256 payload key
    #[serde(with = "hex_key")]
    pub payload_key: [u8; 32],
    /// Generation time in milliseconds since the epoch
    pub created_ms: i64,
}

impl Drop for KeyPairRecord {
    fn drop(&mut self) {
        self.signing_secret.zeroize();
        self.payload_key.zeroize();
    }
}

impl std::fmt::Debug for KeyPairRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPairRecord")
            .field("device_id", &self.device_id)
            .field("created_ms", &self.created_ms)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_core::ManualTimeSource;

    #[test]
    fn test_generate_and_restore() {
        let time = ManualTimeSource::new(1_000);
        let keypair = DeviceKeyPair::generate(DeviceId::new("laptop"), &time);
        assert_eq!(keypair.created_ms(), 1_000);

        let restored = DeviceKeyPair::from_record(&keypair.to_record()).unwrap();
        assert_eq!(restored.device_id(), keypair.device_id());
        assert_eq!(restored.public_key_bytes(), keypair.public_key_bytes());
    }

    #[test]
    fn test_distinct_devices_get_distinct_keys() {
        let time = ManualTimeSource::new(0);
        let a = DeviceKeyPair::generate(DeviceId::new("a"), &time);
        let b = DeviceKeyPair::generate(DeviceId::new("b"), &time);
        assert_ne!(a.public_key_bytes(), b.public_key_bytes());
    }
}
