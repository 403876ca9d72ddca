//! Synchronization service
//!
//! One periodic loop per device: check relay health, push local events past
//! the persisted push watermark in batches, pull remote pages, and fold every
//! verified event into the store, the derived tables, and the local clock.
//! Transient network trouble surfaces only as offline status and capped
//! exponential backoff; verification failures reject single events; chain
//! breaks halt acceptance from the offending device.

use crate::relay::{DeviceInfo, Relay, RelayMetrics};
use engram_core::{
    EngramError, HlcTimestamp, HybridLogicalClock, OpId, Result, TimeSource,
};
use engram_crypto::CryptoProvider;
use engram_journal::{validate_device_chain, verify_event, EntityState, OpLogEvent};
use engram_store::LocalStore;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Sync bookkeeping key for the push watermark (last pushed op id).
///
/// Deliberately independent from the device's emission clock: the watermark
/// only advances past batches the relay actually took, so a partial push
/// failure re-pushes the remainder next cycle.
pub const PUSH_WATERMARK_KEY: &str = "push.last_op";

/// Sync bookkeeping key under which the status snapshot is persisted.
const STATUS_KEY: &str = "sync.status";

/// Sync loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Interval between sync cycles
    pub sync_interval: Duration,
    /// Events per push batch
    pub batch_size: usize,
    /// Events requested per pull page
    pub page_limit: usize,
    /// Consecutive failures tolerated before backoff starts
    pub error_threshold: u32,
    /// First backoff delay; doubles per additional failure
    pub base_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// Per-request timeout for relay calls
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
            batch_size: 50,
            page_limit: 200,
            error_threshold: 3,
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Point-in-time sync status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Whether the relay was reachable on the last cycle
    pub online: bool,
    /// Completion time of the last successful cycle
    pub last_sync_ms: Option<i64>,
    /// Consecutive failed cycles
    pub consecutive_errors: u32,
    /// If backing off, when the next attempt is allowed
    pub in_backoff_until_ms: Option<i64>,
    /// Events pushed across the service lifetime
    pub pushed_total: u64,
    /// Events pulled and applied across the service lifetime
    pub pulled_total: u64,
    /// Events rejected by verification or the relay
    pub rejected_total: u64,
    /// Devices halted for chain integrity failures
    pub chain_breaks: u64,
}

/// What one call to [`SyncService::sync_once`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Full cycle ran
    Completed {
        /// Events accepted by the relay
        pushed: u64,
        /// Remote events applied locally
        pulled: u64,
        /// Events rejected (verification, malformed, or relay policy)
        rejected: u64,
    },
    /// Relay unreachable or a transport call failed; retried next cycle
    Offline,
    /// Still inside the backoff window; nothing attempted
    Backoff,
    /// Another cycle was already in flight
    SkippedInFlight,
}

#[derive(Default)]
struct CycleCounters {
    pushed: u64,
    pulled: u64,
    rejected: u64,
    chain_breaks: u64,
}

/// Periodic push/pull synchronization against one relay
pub struct SyncService {
    config: SyncConfig,
    relay: Arc<dyn Relay>,
    store: Arc<LocalStore>,
    clock: Arc<HybridLogicalClock>,
    crypto: Arc<CryptoProvider>,
    device_info: DeviceInfo,
    time: Arc<dyn TimeSource>,
    status: RwLock<SyncStatus>,
    in_flight: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl SyncService {
    /// Build a service; nothing runs until [`run`](Self::run) or
    /// [`sync_once`](Self::sync_once)
    pub fn new(
        config: SyncConfig,
        relay: Arc<dyn Relay>,
        store: Arc<LocalStore>,
        clock: Arc<HybridLogicalClock>,
        crypto: Arc<CryptoProvider>,
        device_info: DeviceInfo,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            relay,
            store,
            clock,
            crypto,
            device_info,
            time,
            status: RwLock::new(SyncStatus::default()),
            in_flight: tokio::sync::Mutex::new(()),
            shutdown,
        }
    }

    /// Current status snapshot
    pub fn status(&self) -> SyncStatus {
        self.status.read().clone()
    }

    /// Relay-side counters, observability only
    pub async fn relay_metrics(&self) -> Result<RelayMetrics> {
        self.relay.metrics().await
    }

    /// Announce this device to the relay; idempotent
    pub async fn register(&self) -> Result<()> {
        self.relay
            .register_device(self.crypto.device_id(), &self.device_info)
            .await
    }

    /// Drive the periodic loop until [`stop`](Self::stop) is called
    pub async fn run(&self) {
        if let Err(err) = self.register().await {
            warn!(%err, "device registration failed; will retry on relay contact");
        }

        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.sync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sync_once().await {
                        Ok(outcome) => debug!(?outcome, "sync cycle finished"),
                        Err(err) => error!(%err, "sync cycle failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Stop the loop, wait for any in-flight cycle, and persist state
    ///
    /// An in-progress cycle is allowed to finish; cycle logic is idempotent,
    /// so there is no partial-cycle rollback to perform.
    pub async fn stop(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        loop {
            if self.in_flight.try_lock().is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.persist_status()?;
        self.store.save_clock_state(&self.clock.state())?;
        info!("sync service stopped");
        Ok(())
    }

    /// Run one sync cycle: health check, batched push, paged pull
    pub async fn sync_once(&self) -> Result<CycleOutcome> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            return Ok(CycleOutcome::SkippedInFlight);
        };

        let now = self.time.now_ms();
        if let Some(until) = self.status.read().in_backoff_until_ms {
            if now < until {
                return Ok(CycleOutcome::Backoff);
            }
        }

        if self.relay.health().await.is_err() {
            self.record_failure("relay health check failed")?;
            return Ok(CycleOutcome::Offline);
        }

        let mut counters = CycleCounters::default();
        if !self.push_pending(&mut counters).await? {
            return Ok(CycleOutcome::Offline);
        }
        if !self.pull_remote(&mut counters).await? {
            return Ok(CycleOutcome::Offline);
        }

        self.record_success(&counters)?;
        Ok(CycleOutcome::Completed {
            pushed: counters.pushed,
            pulled: counters.pulled,
            rejected: counters.rejected,
        })
    }

    /// Push local events past the persisted watermark; returns false on a
    /// transport failure (the watermark stays on the last accepted batch)
    async fn push_pending(&self, counters: &mut CycleCounters) -> Result<bool> {
        let own = self.crypto.device_id();
        let watermark = self.store.sync_value(PUSH_WATERMARK_KEY)?.map(OpId::from_string);
        let pending = self.store.device_events_after(own, watermark.as_ref())?;
        if pending.is_empty() {
            return Ok(true);
        }

        debug!(count = pending.len(), "pushing local events");
        for batch in pending.chunks(self.config.batch_size) {
            match self.relay.push_events(own, batch).await {
                Ok(report) => {
                    counters.pushed += u64::from(report.accepted);
                    counters.rejected += u64::from(report.rejected);
                    for rejection in &report.errors {
                        // Surfaced, not requeued: the relay would refuse the
                        // verbatim retry too.
                        warn!(
                            op_id = %rejection.op_id,
                            reason = %rejection.reason,
                            "relay rejected event"
                        );
                    }
                    if let Some(last) = batch.last() {
                        self.store
                            .set_sync_value(PUSH_WATERMARK_KEY, last.op_id.as_str())?;
                    }
                }
                Err(err) => {
                    warn!(%err, "push failed mid-cycle; remainder re-pushed next cycle");
                    self.record_failure("push transport failure")?;
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Pull remote pages since the local watermark; returns false on a
    /// transport failure
    async fn pull_remote(&self, counters: &mut CycleCounters) -> Result<bool> {
        let own = self.crypto.device_id().clone();
        let mut after = self.store.latest_hlc()?;

        loop {
            let page = match self
                .relay
                .events_since(after.as_ref(), &own, self.config.page_limit)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    warn!(%err, "pull failed mid-cycle");
                    self.record_failure("pull transport failure")?;
                    return Ok(false);
                }
            };

            if page.events.is_empty() {
                break;
            }
            for event in &page.events {
                self.ingest_event(event, counters)?;
            }
            if !page.has_more {
                break;
            }

            // Page cursor: last event whose timestamp parses.
            let Some(cursor) = page
                .events
                .iter()
                .rev()
                .find_map(|e| HlcTimestamp::parse(&e.hlc).ok())
            else {
                warn!("pull page had no parseable timestamps; stopping pagination");
                break;
            };
            after = Some(cursor);
        }
        Ok(true)
    }

    /// Fold one pulled event into store, derived state, and the local clock
    fn ingest_event(&self, event: &OpLogEvent, counters: &mut CycleCounters) -> Result<()> {
        if &event.device_id == self.crypto.device_id() {
            return Ok(());
        }
        if self.store.has_event(&event.op_id)? {
            return Ok(());
        }

        if let Err(err) = verify_event(&self.crypto, event) {
            match &err {
                EngramError::Verification { .. } => {
                    warn!(op_id = %event.op_id, %err, "event failed verification")
                }
                EngramError::Malformed { .. } => {
                    warn!(op_id = %event.op_id, %err, "event is malformed")
                }
                _ => warn!(op_id = %event.op_id, %err, "event rejected"),
            }
            counters.rejected += 1;
            return Ok(());
        }

        let chain = self.store.chain_state(&event.device_id)?;
        if let Some(chain) = &chain {
            if !chain.consistent {
                debug!(
                    device = %event.device_id,
                    op_id = %event.op_id,
                    "chain flagged inconsistent; event held back"
                );
                return Ok(());
            }
        }

        let tail = chain.and_then(|c| c.tail_hash);
        if event.prev_hash != tail {
            let is_gap = match event.prev_hash {
                Some(prev) => !self
                    .store
                    .has_device_event_with_hash(&event.device_id, &prev)?,
                None => false,
            };
            if is_gap {
                // The predecessor never arrived (rejected or still in
                // flight); accept and let a later pull heal the gap.
                warn!(
                    device = %event.device_id,
                    op_id = %event.op_id,
                    "chain gap: predecessor not present"
                );
            } else {
                // The predecessor is present but is not the tail, or the
                // device restarted its chain: integrity failure.
                error!(
                    device = %event.device_id,
                    op_id = %event.op_id,
                    "chain integrity failure; halting acceptance from device"
                );
                self.store.mark_chain_inconsistent(&event.device_id)?;
                counters.chain_breaks += 1;
                return Ok(());
            }
        }

        // Verified above, so the timestamp parses.
        let timestamp = event.timestamp()?;
        if self.store.insert_event(event)? {
            self.store.set_chain_tail(&event.device_id, &event.hash)?;
            self.clock.update(&timestamp);
            counters.pulled += 1;
            if let Some(state) = EntityState::from_event(event) {
                self.store.apply_derived(event.entity_type, &state)?;
            }
        }
        Ok(())
    }

    /// Validate a device's full stored history against its hash chain
    ///
    /// Returns whether the chain held; on a break the device is flagged and
    /// further events from it are held back until [`reconcile_device`]
    /// (Self::reconcile_device) clears the flag.
    pub fn audit_device_chain(&self, device_id: &engram_core::DeviceId) -> Result<bool> {
        let history = self.store.device_events_after(device_id, None)?;
        match validate_device_chain(&history, device_id) {
            Ok(()) => Ok(true),
            Err(err) => {
                error!(device = %device_id, %err, "chain audit failed");
                self.store.mark_chain_inconsistent(device_id)?;
                let mut status = self.status.write();
                status.chain_breaks += 1;
                Ok(false)
            }
        }
    }

    /// Clear a device's inconsistency flag after the user reconciled its
    /// history, recomputing the tail from stored events
    pub fn reconcile_device(&self, device_id: &engram_core::DeviceId) -> Result<()> {
        self.store.reset_chain(device_id)
    }

    fn record_failure(&self, reason: &str) -> Result<()> {
        let now = self.time.now_ms();
        {
            let mut status = self.status.write();
            status.online = false;
            status.consecutive_errors += 1;
            if status.consecutive_errors >= self.config.error_threshold {
                let exponent = status.consecutive_errors - self.config.error_threshold;
                let delay = self
                    .config
                    .base_backoff
                    .saturating_mul(2u32.saturating_pow(exponent))
                    .min(self.config.max_backoff);
                status.in_backoff_until_ms = Some(now + delay.as_millis() as i64);
                warn!(
                    reason,
                    errors = status.consecutive_errors,
                    delay_ms = delay.as_millis() as u64,
                    "sync backing off"
                );
            } else {
                debug!(reason, errors = status.consecutive_errors, "sync cycle failed");
            }
        }
        self.persist_status()
    }

    fn record_success(&self, counters: &CycleCounters) -> Result<()> {
        let now = self.time.now_ms();
        {
            let mut status = self.status.write();
            status.online = true;
            status.consecutive_errors = 0;
            status.in_backoff_until_ms = None;
            status.last_sync_ms = Some(now);
            status.pushed_total += counters.pushed;
            status.pulled_total += counters.pulled;
            status.rejected_total += counters.rejected;
            status.chain_breaks += counters.chain_breaks;
        }
        self.store.save_clock_state(&self.clock.state())?;
        self.persist_status()
    }

    fn persist_status(&self) -> Result<()> {
        let status = self.status.read().clone();
        let encoded = serde_json::to_string(&status)
            .map_err(|e| EngramError::serialization(format!("status encoding failed: {e}")))?;
        self.store.set_sync_value(STATUS_KEY, &encoded)
    }
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("device_id", self.crypto.device_id())
            .field("status", &self.status.read().clone())
            .finish()
    }
}
