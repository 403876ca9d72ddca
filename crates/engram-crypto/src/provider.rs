//! Per-device crypto provider
//!
//! One explicitly constructed service object per device: owns the device's
//! key material and the trust table. Never a process-global, so tests can run
//! several simulated devices side by side in one process.

use crate::hash;
use crate::keys::{DeviceKeyPair, KeyPairRecord};
use crate::sealed;
use crate::trust::{TrustedDevice, TrustLevel};
use crate::types::{Hash256, SignatureBytes};
use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use engram_core::{DeviceId, EngramError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-device cryptographic operations and trust table
pub struct CryptoProvider {
    keypair: DeviceKeyPair,
    trust: RwLock<HashMap<DeviceId, TrustedDevice>>,
}

impl CryptoProvider {
    /// Build a provider around existing key material
    pub fn new(keypair: DeviceKeyPair) -> Self {
        Self {
            keypair,
            trust: RwLock::new(HashMap::new()),
        }
    }

    /// The owning device
    pub fn device_id(&self) -> &DeviceId {
        self.keypair.device_id()
    }

    /// This device's public signing key
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.keypair.public_key_bytes()
    }

    /// Encrypt a payload under this device's own symmetric key
    ///
    /// AES-256-GCM with a fresh random nonce per call; the nonce is prepended
    /// to the ciphertext so the blob is self-contained.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        sealed::seal(self.keypair.payload_key(), plaintext)
    }

    /// Decrypt a blob produced by this device's [`encrypt`](Self::encrypt)
    ///
    /// Blobs encrypted under a different device's key fail authentication
    /// here; peers can verify such events but not read their payloads.
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        sealed::unseal(self.keypair.payload_key(), blob)
    }

    /// Sign a digest with this device's private signing key
    pub fn sign(&self, digest: &Hash256) -> SignatureBytes {
        let signature: Signature = self.keypair.signing_key().sign(digest.as_bytes());
        SignatureBytes::from(signature)
    }

    /// Verify a signature over a digest attributed to a device
    ///
    /// For this device, verification uses its own public key; for peers, the
    /// trust table. Fails closed: unknown devices, compromised devices, and
    /// undecodable keys all return `false`, never an error.
    pub fn verify(&self, digest: &Hash256, signature: &SignatureBytes, device_id: &DeviceId) -> bool {
        let key = if device_id == self.keypair.device_id() {
            Some(self.keypair.public_key_bytes())
        } else {
            let trust = self.trust.read();
            trust
                .get(device_id)
                .filter(|peer| peer.accepts_signatures())
                .map(|peer| peer.public_key)
        };

        let Some(key) = key else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&key) else {
            return false;
        };
        verifying_key
            .verify(digest.as_bytes(), &Signature::from(*signature))
            .is_ok()
    }

    /// Hash bytes with the shared content-hash function
    pub fn hash(&self, data: &[u8]) -> Hash256 {
        hash::hash(data)
    }

    /// Record or replace a peer in the trust table
    ///
    /// A compromised record is terminal: re-adding the same device does not
    /// resurrect it.
    pub fn trust_device(&self, record: TrustedDevice) -> Result<()> {
        let mut trust = self.trust.write();
        if let Some(existing) = trust.get(&record.device_id) {
            if existing.trust_level == TrustLevel::Compromised {
                return Err(EngramError::invalid(format!(
                    "device {} is marked compromised; revocation is not auto-cleared",
                    record.device_id
                )));
            }
        }
        trust.insert(record.device_id.clone(), record);
        Ok(())
    }

    /// Look up a peer's trust record
    pub fn trusted_device(&self, device_id: &DeviceId) -> Option<TrustedDevice> {
        self.trust.read().get(device_id).cloned()
    }

    /// All known peers
    pub fn trusted_devices(&self) -> Vec<TrustedDevice> {
        let mut devices: Vec<_> = self.trust.read().values().cloned().collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    /// Revoke a peer (user action); local-only, never propagated
    pub fn mark_compromised(&self, device_id: &DeviceId) -> Result<()> {
        let mut trust = self.trust.write();
        let record = trust.get_mut(device_id).ok_or_else(|| {
            EngramError::not_found(format!("no trust record for device {device_id}"))
        })?;
        record.trust_level = TrustLevel::Compromised;
        Ok(())
    }

    /// Export key material and trust table for sealed persistence
    pub fn to_record(&self) -> ProviderRecord {
        ProviderRecord {
            keypair: self.keypair.to_record(),
            trusted: self.trusted_devices(),
        }
    }

    /// Restore a provider from a persisted record
    pub fn from_record(record: &ProviderRecord) -> Result<Self> {
        let provider = Self::new(DeviceKeyPair::from_record(&record.keypair)?);
        {
            let mut trust = provider.trust.write();
            for peer in &record.trusted {
                trust.insert(peer.device_id.clone(), peer.clone());
            }
        }
        Ok(provider)
    }
}

impl std::fmt::Debug for CryptoProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoProvider")
            .field("device_id", self.device_id())
            .field("trusted_peers", &self.trust.read().len())
            .finish()
    }
}

/// Persistable provider state: keypair plus trust table
///
/// Secret-bearing; only ever written inside a sealed keyring blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRecord {
    /// Device key material
    pub keypair: KeyPairRecord,
    /// Known peers
    pub trusted: Vec<TrustedDevice>,
}
