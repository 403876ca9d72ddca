//! Pairing ceremony
//!
//! The already-trusted device runs the ceremony: it checks a decoded trust
//! request, hands the user a short numeric code, and on code confirmation
//! records the new device. The code is single-use and expires after five
//! minutes; the request itself goes stale after ten.

use crate::request::TrustRequest;
use engram_core::{DeviceId, EngramError, Result, TimeSource};
use engram_crypto::{hash, CryptoProvider, Hash256, TrustedDevice};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ceremony timing and code shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfig {
    /// Maximum age of a trust request before it is rejected as stale
    pub request_freshness_ms: i64,
    /// Lifetime of an issued verification code
    pub code_ttl_ms: i64,
    /// Number of digits in a verification code
    pub code_digits: u32,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            request_freshness_ms: 10 * 60 * 1_000,
            code_ttl_ms: 5 * 60 * 1_000,
            code_digits: 6,
        }
    }
}

/// A verification code handed to the user for out-of-band transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCode {
    /// The numeric code, leading zeros preserved
    pub code: String,
    /// Issue time, milliseconds since the epoch
    pub issued_at_ms: i64,
    /// Expiry time, milliseconds since the epoch
    pub expires_at_ms: i64,
}

/// What the issuing side hands back after a code confirms
///
/// The new device records the issuer from this grant; both sides end up with
/// the same evidence hash binding their trust records to this ceremony.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustGrant {
    /// Issuing (already-trusted) device
    pub issuer_device_id: DeviceId,
    /// Issuer's public signing key
    #[serde(with = "engram_crypto::wire::hex_key")]
    pub issuer_public_key: [u8; 32],
    /// Digest derived from the code and its issue time
    pub evidence_hash: Hash256,
    /// Confirmation time, milliseconds since the epoch
    pub verified_at_ms: i64,
}

impl TrustGrant {
    /// Record the issuer in the new device's trust table
    pub fn adopt(&self, crypto: &CryptoProvider, nickname: impl Into<String>) -> Result<()> {
        crypto.trust_device(
            TrustedDevice::new(
                self.issuer_device_id.clone(),
                self.issuer_public_key,
                nickname,
                self.verified_at_ms,
            )
            .verified(self.evidence_hash, self.verified_at_ms),
        )
    }
}

#[derive(Debug, Clone)]
struct PendingCode {
    device_id: DeviceId,
    public_key: [u8; 32],
    nickname: String,
    issued_at_ms: i64,
    expires_at_ms: i64,
    used_at_ms: Option<i64>,
}

/// Runs the issuing side of the pairing flow
pub struct PairingCeremony {
    config: PairingConfig,
    time: Arc<dyn TimeSource>,
    pending: Mutex<HashMap<String, PendingCode>>,
}

impl PairingCeremony {
    /// Create a ceremony with default timing
    pub fn new(time: Arc<dyn TimeSource>) -> Self {
        Self::with_config(PairingConfig::default(), time)
    }

    /// Create a ceremony with explicit timing
    pub fn with_config(config: PairingConfig, time: Arc<dyn TimeSource>) -> Self {
        Self {
            config,
            time,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Verify a decoded trust request and issue a verification code
    ///
    /// Rejects requests with a bad self-signature (fail closed) and requests
    /// older than the freshness window. The returned code is bound to the
    /// request's device id and public key.
    pub fn issue_code(&self, request: &TrustRequest) -> Result<IssuedCode> {
        if !request.verify_self_signature() {
            warn!(device = %request.device_id, "trust request self-signature rejected");
            return Err(EngramError::verification(format!(
                "trust request from {} has an invalid self-signature",
                request.device_id
            )));
        }

        let now = self.time.now_ms();
        let age = now - request.timestamp_ms;
        if age > self.config.request_freshness_ms {
            return Err(EngramError::invalid(format!(
                "trust request from {} is stale ({age} ms old)",
                request.device_id
            )));
        }

        let mut pending = self.pending.lock();
        reap_expired(&mut pending, now);

        let code = loop {
            let candidate = random_code(self.config.code_digits);
            if !pending.contains_key(&candidate) {
                break candidate;
            }
        };
        let expires_at_ms = now + self.config.code_ttl_ms;
        pending.insert(
            code.clone(),
            PendingCode {
                device_id: request.device_id.clone(),
                public_key: request.public_key,
                nickname: request.nickname.clone(),
                issued_at_ms: now,
                expires_at_ms,
                used_at_ms: None,
            },
        );

        info!(device = %request.device_id, expires_at_ms, "verification code issued");
        Ok(IssuedCode {
            code,
            issued_at_ms: now,
            expires_at_ms,
        })
    }

    /// Confirm a code the user relayed back and record trust on the issuer
    ///
    /// The code must exist, be unused, and be unexpired. Confirmation marks
    /// it used (replay fails even inside the window), records the requesting
    /// device in the issuer's trust table as verified, and returns the grant
    /// the new device adopts for the reverse direction.
    pub fn confirm_code(&self, code: &str, issuer: &CryptoProvider) -> Result<TrustGrant> {
        let now = self.time.now_ms();
        let mut pending = self.pending.lock();
        reap_expired(&mut pending, now);

        let entry = pending
            .get_mut(code)
            .ok_or_else(|| EngramError::invalid("verification code is unknown or expired"))?;

        if entry.used_at_ms.is_some() {
            warn!(device = %entry.device_id, "verification code replayed");
            return Err(EngramError::invalid("verification code was already used"));
        }
        entry.used_at_ms = Some(now);

        let evidence_hash = evidence_hash(code, entry.issued_at_ms);
        issuer.trust_device(
            TrustedDevice::new(
                entry.device_id.clone(),
                entry.public_key,
                entry.nickname.clone(),
                now,
            )
            .verified(evidence_hash, now),
        )?;

        info!(device = %entry.device_id, "pairing confirmed, trust recorded");
        Ok(TrustGrant {
            issuer_device_id: issuer.device_id().clone(),
            issuer_public_key: issuer.public_key_bytes(),
            evidence_hash,
            verified_at_ms: now,
        })
    }

    /// Number of outstanding codes (tests and status displays)
    pub fn pending_codes(&self) -> usize {
        let mut pending = self.pending.lock();
        reap_expired(&mut pending, self.time.now_ms());
        pending.len()
    }
}

impl std::fmt::Debug for PairingCeremony {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingCeremony")
            .field("config", &self.config)
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

/// Evidence digest binding a trust record to the ceremony that produced it.
fn evidence_hash(code: &str, issued_at_ms: i64) -> Hash256 {
    hash::hash(format!("{code}|{issued_at_ms}").as_bytes())
}

fn random_code(digits: u32) -> String {
    let bound = 10u64.pow(digits);
    let value = rand::thread_rng().gen_range(0..bound);
    format!("{value:0width$}", width = digits as usize)
}

fn reap_expired(pending: &mut HashMap<String, PendingCode>, now: i64) {
    pending.retain(|_, entry| {
        let keep = entry.expires_at_ms > now;
        if !keep {
            debug!(device = %entry.device_id, "expired verification code removed");
        }
        keep
    });
}
