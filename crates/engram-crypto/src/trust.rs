//! Peer trust records
//!
//! The trust table maps peer device ids to their public signing keys plus the
//! provenance of that trust. `Compromised` is a terminal revocation state set
//! by the user; nothing clears it automatically.

use crate::types::Hash256;
use crate::wire::hex_key;
use engram_core::DeviceId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How far a peer device's key has been authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Key recorded but the pairing ceremony has not completed
    Initial,
    /// Pairing ceremony completed; signatures from this device are accepted
    Verified,
    /// Revoked by the user; terminal, never auto-cleared
    Compromised,
}

impl TrustLevel {
    /// Stable wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Initial => "initial",
            TrustLevel::Verified => "verified",
            TrustLevel::Compromised => "compromised",
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A peer device this device has exchanged keys with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedDevice {
    /// Peer device id
    pub device_id: DeviceId,
    /// Peer's public signing key
    #[serde(with = "hex_key")]
    pub public_key: [u8; 32],
    /// Human-readable nickname chosen during pairing
    pub nickname: String,
    /// Current trust level
    pub trust_level: TrustLevel,
    /// When this peer was first recorded, milliseconds since the epoch
    pub first_seen_ms: i64,
    /// When the pairing ceremony last confirmed this peer
    pub last_verified_ms: Option<i64>,
    /// Digest binding this record to the pairing ceremony that produced it
    pub trust_evidence_hash: Option<Hash256>,
}

impl TrustedDevice {
    /// Record a peer at the initial trust level
    pub fn new(
        device_id: DeviceId,
        public_key: [u8; 32],
        nickname: impl Into<String>,
        now_ms: i64,
    ) -> Self {
        Self {
            device_id,
            public_key,
            nickname: nickname.into(),
            trust_level: TrustLevel::Initial,
            first_seen_ms: now_ms,
            last_verified_ms: None,
            trust_evidence_hash: None,
        }
    }

    /// Promote to verified with the ceremony evidence
    pub fn verified(mut self, evidence: Hash256, now_ms: i64) -> Self {
        self.trust_level = TrustLevel::Verified;
        self.last_verified_ms = Some(now_ms);
        self.trust_evidence_hash = Some(evidence);
        self
    }

    /// Whether events signed by this device should be accepted
    pub fn accepts_signatures(&self) -> bool {
        !matches!(self.trust_level, TrustLevel::Compromised)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_is_initial() {
        let record = TrustedDevice::new(DeviceId::new("phone"), [1u8; 32], "Phone", 1_000);
        assert_eq!(record.trust_level, TrustLevel::Initial);
        assert!(record.accepts_signatures());
        assert!(record.trust_evidence_hash.is_none());
    }

    #[test]
    fn test_verified_promotion() {
        let record = TrustedDevice::new(DeviceId::new("phone"), [1u8; 32], "Phone", 1_000)
            .verified(Hash256::new([2u8; 32]), 2_000);
        assert_eq!(record.trust_level, TrustLevel::Verified);
        assert_eq!(record.last_verified_ms, Some(2_000));
        assert!(record.trust_evidence_hash.is_some());
    }

    #[test]
    fn test_compromised_rejects_signatures() {
        let mut record = TrustedDevice::new(DeviceId::new("phone"), [1u8; 32], "Phone", 1_000);
        record.trust_level = TrustLevel::Compromised;
        assert!(!record.accepts_signatures());
    }
}
