//! Relay contract
//!
//! The relay is a dumb store-and-forward peer: it never decrypts payloads and
//! never mutates events, it only buffers opaque blobs plus routing metadata.
//! The trait seam lets tests run against an in-process relay with the same
//! contract as the HTTP one.

use async_trait::async_trait;
use engram_core::{DeviceId, EngramError, HlcTimestamp, Result};
use engram_journal::OpLogEvent;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Relay liveness probe response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayHealth {
    /// Human-readable status, `"ok"` when healthy
    pub status: String,
    /// Relay uptime in seconds
    pub uptime_secs: u64,
    /// Number of events currently buffered
    pub buffered_events: u64,
}

/// One page of pulled events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPage {
    /// Events after the requested watermark, ascending by timestamp
    pub events: Vec<OpLogEvent>,
    /// Whether another page is available
    pub has_more: bool,
}

/// Per-event push rejection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRejection {
    /// Rejected event
    pub op_id: String,
    /// Relay-side reason
    pub reason: String,
}

/// Outcome of one push call
///
/// Rejections are per-event; the rest of the batch is still accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushReport {
    /// Events the relay stored
    pub accepted: u32,
    /// Events the relay refused
    pub rejected: u32,
    /// Reasons, one per rejected event
    pub errors: Vec<PushRejection>,
}

/// Metadata sent with device registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Human-readable device nickname
    pub nickname: String,
    /// Platform tag ("macos", "ios", ...)
    pub platform: String,
}

/// Relay-side aggregate counters, observability only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMetrics {
    /// Devices that have registered
    pub connected_devices: u64,
    /// Events relayed since start
    pub events_relayed: u64,
}

/// Store-and-forward relay seam
#[async_trait]
pub trait Relay: Send + Sync {
    /// Liveness probe; an error or non-ok status marks the device offline for
    /// the current cycle
    async fn health(&self) -> Result<RelayHealth>;

    /// Events after a watermark, excluding the requesting device's own.
    /// Callers page by passing the last received timestamp back in while
    /// `has_more` is true.
    async fn events_since(
        &self,
        after: Option<&HlcTimestamp>,
        device: &DeviceId,
        limit: usize,
    ) -> Result<SyncPage>;

    /// Push a batch of events; per-event rejections do not abort the batch
    async fn push_events(&self, device: &DeviceId, events: &[OpLogEvent]) -> Result<PushReport>;

    /// Announce a device to the relay; idempotent
    async fn register_device(&self, device: &DeviceId, info: &DeviceInfo) -> Result<()>;

    /// Relay-side counters
    async fn metrics(&self) -> Result<RelayMetrics>;
}

/// In-process relay with the same contract as the HTTP relay
///
/// Buffers events in timestamp order and forwards them to any device that
/// asks. Failure knobs let tests drive the offline, partial-push, and
/// tamper paths.
#[derive(Default)]
pub struct InMemoryRelay {
    events: Mutex<BTreeMap<(String, String), OpLogEvent>>,
    registered: Mutex<HashMap<DeviceId, DeviceInfo>>,
    reject_ops: Mutex<HashSet<String>>,
    offline: AtomicBool,
    pushes_before_failure: Mutex<Option<u32>>,
    events_relayed: AtomicU64,
}

impl InMemoryRelay {
    /// Empty relay
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle the relay unreachable
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Refuse the given op id on push (per-event rejection)
    pub fn reject_op(&self, op_id: impl Into<String>) {
        self.reject_ops.lock().insert(op_id.into());
    }

    /// Let `n` more push calls through, then fail the transport
    pub fn fail_pushes_after(&self, n: u32) {
        *self.pushes_before_failure.lock() = Some(n);
    }

    /// Clear the push failure knob
    pub fn clear_push_failures(&self) {
        *self.pushes_before_failure.lock() = None;
    }

    /// Mutate a buffered event in place (corruption-in-transit tests)
    pub fn tamper_event(&self, op_id: &str, tamper: impl FnOnce(&mut OpLogEvent)) {
        let mut events = self.events.lock();
        if let Some(event) = events.values_mut().find(|e| e.op_id.as_str() == op_id) {
            tamper(event);
        }
    }

    /// Number of buffered events
    pub fn buffered(&self) -> usize {
        self.events.lock().len()
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(EngramError::network("relay unreachable"));
        }
        Ok(())
    }
}

#[async_trait]
impl Relay for InMemoryRelay {
    async fn health(&self) -> Result<RelayHealth> {
        self.check_online()?;
        Ok(RelayHealth {
            status: "ok".to_string(),
            uptime_secs: 1,
            buffered_events: self.events.lock().len() as u64,
        })
    }

    async fn events_since(
        &self,
        after: Option<&HlcTimestamp>,
        device: &DeviceId,
        limit: usize,
    ) -> Result<SyncPage> {
        self.check_online()?;
        let watermark = after.map(|ts| ts.stringify()).unwrap_or_default();
        let events = self.events.lock();
        let mut matching = events
            .iter()
            .filter(|((hlc, _), event)| hlc.as_str() > watermark.as_str() && &event.device_id != device)
            .map(|(_, event)| event.clone());

        let page: Vec<OpLogEvent> = matching.by_ref().take(limit).collect();
        let has_more = matching.next().is_some();
        Ok(SyncPage {
            events: page,
            has_more,
        })
    }

    async fn push_events(&self, _device: &DeviceId, events: &[OpLogEvent]) -> Result<PushReport> {
        self.check_online()?;
        {
            let mut remaining = self.pushes_before_failure.lock();
            if let Some(n) = remaining.as_mut() {
                if *n == 0 {
                    return Err(EngramError::network("relay dropped the connection"));
                }
                *n -= 1;
            }
        }

        let reject_ops = self.reject_ops.lock();
        let mut buffered = self.events.lock();
        let mut report = PushReport {
            accepted: 0,
            rejected: 0,
            errors: Vec::new(),
        };
        for event in events {
            if reject_ops.contains(event.op_id.as_str()) {
                report.rejected += 1;
                report.errors.push(PushRejection {
                    op_id: event.op_id.as_str().to_string(),
                    reason: "rejected by relay policy".to_string(),
                });
                continue;
            }
            let key = (event.hlc.clone(), event.op_id.as_str().to_string());
            if buffered.insert(key, event.clone()).is_none() {
                self.events_relayed.fetch_add(1, Ordering::SeqCst);
            }
            report.accepted += 1;
        }
        Ok(report)
    }

    async fn register_device(&self, device: &DeviceId, info: &DeviceInfo) -> Result<()> {
        self.check_online()?;
        self.registered.lock().insert(device.clone(), info.clone());
        Ok(())
    }

    async fn metrics(&self) -> Result<RelayMetrics> {
        self.check_online()?;
        Ok(RelayMetrics {
            connected_devices: self.registered.lock().len() as u64,
            events_relayed: self.events_relayed.load(Ordering::SeqCst),
        })
    }
}

impl std::fmt::Debug for InMemoryRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryRelay")
            .field("buffered", &self.events.lock().len())
            .field("registered", &self.registered.lock().len())
            .finish()
    }
}
