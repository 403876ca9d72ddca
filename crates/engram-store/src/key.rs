//! At-rest store key
//!
//! A 32-byte key generated once per device and held only on-device. It seals
//! the payload-bearing columns (derived entity state, snapshots, keyring);
//! event ciphertexts are already sealed by their owning device's payload key.

use engram_core::{EngramError, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs;
use std::path::Path;
use zeroize::Zeroize;

/// Store encryption key
pub struct StoreKey([u8; 32]);

impl StoreKey {
    /// Generate a fresh key
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap existing key bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Load the key from a file, generating and writing it on first run
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let encoded = fs::read_to_string(path)?;
            let mut bytes = [0u8; 32];
            hex::decode_to_slice(encoded.trim(), &mut bytes)
                .map_err(|e| EngramError::crypto(format!("store key file is corrupt: {e}")))?;
            return Ok(Self(bytes));
        }

        let key = Self::generate();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, hex::encode(key.as_bytes()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(key)
    }
}

impl Drop for StoreKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StoreKey(..)")
    }
}
