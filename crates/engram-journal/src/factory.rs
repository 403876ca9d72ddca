//! Oplog event factory
//!
//! Builds signed, encrypted, hash-chained events from local entity mutations.
//! The factory keeps the device's chain tail in memory; persist it through
//! the store and restore with [`EventFactory::with_chain_tail`] on startup.

use crate::event::{EntityType, OpKind, OpLogEvent};
use engram_core::{EngramError, EntityId, HybridLogicalClock, OpId, Result};
use engram_crypto::{CryptoProvider, Hash256};
use parking_lot::Mutex;
use std::sync::Arc;

/// Builds this device's oplog events
pub struct EventFactory {
    clock: Arc<HybridLogicalClock>,
    crypto: Arc<CryptoProvider>,
    chain_tail: Mutex<Option<Hash256>>,
}

impl EventFactory {
    /// Create a factory with an empty chain (first run)
    pub fn new(clock: Arc<HybridLogicalClock>, crypto: Arc<CryptoProvider>) -> Self {
        Self::with_chain_tail(clock, crypto, None)
    }

    /// Create a factory resuming from a persisted chain tail
    pub fn with_chain_tail(
        clock: Arc<HybridLogicalClock>,
        crypto: Arc<CryptoProvider>,
        chain_tail: Option<Hash256>,
    ) -> Self {
        Self {
            clock,
            crypto,
            chain_tail: Mutex::new(chain_tail),
        }
    }

    /// Hash of the most recent event emitted by this device
    pub fn chain_tail(&self) -> Option<Hash256> {
        *self.chain_tail.lock()
    }

    /// Build a new event from a local mutation
    ///
    /// Stamps a fresh HLC timestamp, encrypts the payload under this device's
    /// own key, hashes the ciphertext, links to the previous event, and signs
    /// the hash. The chain tail advances to the new event's hash.
    pub fn create_event(
        &self,
        entity_type: EntityType,
        entity_id: EntityId,
        op: OpKind,
        payload: &serde_json::Value,
    ) -> Result<OpLogEvent> {
        // Hold the tail across creation so back-to-back events chain in order.
        let mut tail = self.chain_tail.lock();

        let timestamp = self.clock.now();
        let op_id = OpId::new(timestamp.physical, timestamp.logical, &timestamp.device_id);

        let plaintext = serde_json::to_vec(payload)
            .map_err(|e| EngramError::serialization(format!("payload encoding failed: {e}")))?;
        let cipher_blob = self.crypto.encrypt(&plaintext)?;
        let hash = self.crypto.hash(&cipher_blob);
        let sig = self.crypto.sign(&hash);

        let event = OpLogEvent {
            op_id,
            hlc: timestamp.stringify(),
            device_id: self.crypto.device_id().clone(),
            entity_type,
            entity_id,
            op,
            cipher_blob,
            prev_hash: *tail,
            hash,
            sig,
        };

        *tail = Some(hash);
        Ok(event)
    }

    /// Decrypt an event's payload
    ///
    /// Only meaningful for this device's own events: payload keys are never
    /// shared, so a peer's blob fails authentication here even though its
    /// signature verifies.
    pub fn decrypt_event(&self, event: &OpLogEvent) -> Result<serde_json::Value> {
        if &event.device_id != self.crypto.device_id() {
            return Err(EngramError::crypto(format!(
                "payload key for device {} is not held; event {} is verifiable but not readable",
                event.device_id, event.op_id
            )));
        }
        let plaintext = self.crypto.decrypt(&event.cipher_blob)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| EngramError::serialization(format!("payload decoding failed: {e}")))
    }
}

impl std::fmt::Debug for EventFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFactory")
            .field("device_id", self.crypto.device_id())
            .field("chain_tail", &self.chain_tail.lock().map(|h| h.to_hex()))
            .finish()
    }
}
