//! Engram crypto: per-device signing, payload encryption, and peer trust
//!
//! Each device owns an Ed25519 signing keypair and an AES-256 payload key,
//! plus a trust table of peer public keys built by the pairing ceremony.
//! The [`CryptoProvider`] is an explicitly constructed, injected service
//! object rather than module-level state, so one process can host several
//! simulated devices in tests.

pub mod hash;
pub mod keys;
pub mod provider;
pub mod sealed;
pub mod trust;
pub mod types;
pub mod wire;

pub use keys::{DeviceKeyPair, KeyPairRecord};
pub use provider::{CryptoProvider, ProviderRecord};
pub use trust::{TrustLevel, TrustedDevice};
pub use types::{Hash256, Nonce, SignatureBytes};

// Re-export commonly used dalek types for downstream signature handling
pub use ed25519_dalek::{
    Signature as Ed25519Signature, SigningKey as Ed25519SigningKey,
    VerifyingKey as Ed25519VerifyingKey,
};
