//! Hybrid logical clock
//!
//! Combines wall-clock milliseconds with a logical counter so every device
//! issues strictly increasing timestamps, and any two devices holding the
//! same event set reconstruct the same total order regardless of clock skew.
//!
//! The comparator is lexicographic on `(physical, logical, device_id)`; the
//! device id is a deterministic tiebreak for events that are otherwise
//! indistinguishable.

use crate::error::{EngramError, Result};
use crate::identifiers::DeviceId;
use crate::time::TimeSource;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Field separator inside a serialized timestamp. Never occurs in the
/// ISO-8601 portion or in a normalized device id.
const HLC_SEPARATOR: char = '_';

/// Width of the zero-padded logical counter in a serialized timestamp.
const LOGICAL_WIDTH: usize = 10;

/// A hybrid logical timestamp
///
/// Total order: physical time first, then logical counter, then device id.
/// The derived `Ord` implements exactly that, so sorting and `max` work
/// directly on timestamp values.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HlcTimestamp {
    /// Wall-clock milliseconds since the Unix epoch
    pub physical: i64,
    /// Logical counter disambiguating same-millisecond events
    pub logical: u32,
    /// Issuing device, normalized (see [`DeviceId`])
    pub device_id: DeviceId,
}

impl HlcTimestamp {
    /// Create a timestamp from parts
    pub fn new(physical: i64, logical: u32, device_id: DeviceId) -> Self {
        Self {
            physical,
            logical,
            device_id,
        }
    }

    /// Serialize to the canonical string form
    ///
    /// `<ISO-8601 millis UTC>_<logical, zero-padded>_<device id>`. All three
    /// fields are fixed-width or restricted-alphabet, so lexicographic order
    /// over serialized timestamps equals the timestamp total order. The store
    /// relies on this for `hlc > ?` range scans.
    pub fn stringify(&self) -> String {
        let iso = Utc
            .timestamp_millis_opt(self.physical)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        format!(
            "{iso}{HLC_SEPARATOR}{logical:0width$}{HLC_SEPARATOR}{device}",
            logical = self.logical,
            width = LOGICAL_WIDTH,
            device = self.device_id,
        )
    }

    /// Parse the canonical string form; exact inverse of [`stringify`](Self::stringify)
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split(HLC_SEPARATOR);
        let (iso, logical, device) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(iso), Some(logical), Some(device), None) => (iso, logical, device),
            _ => {
                return Err(EngramError::malformed(format!(
                    "timestamp '{s}' does not have three '_'-separated fields"
                )))
            }
        };

        let physical = DateTime::parse_from_rfc3339(iso)
            .map_err(|e| EngramError::malformed(format!("bad physical time in '{s}': {e}")))?
            .timestamp_millis();

        if logical.len() != LOGICAL_WIDTH || !logical.bytes().all(|b| b.is_ascii_digit()) {
            return Err(EngramError::malformed(format!(
                "bad logical counter in '{s}'"
            )));
        }
        let logical: u32 = logical
            .parse()
            .map_err(|e| EngramError::malformed(format!("bad logical counter in '{s}': {e}")))?;

        if device.is_empty() || !DeviceId::is_normalized(device) {
            return Err(EngramError::malformed(format!("bad device id in '{s}'")));
        }

        Ok(Self::new(physical, logical, DeviceId::new(device)))
    }
}

impl fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stringify())
    }
}

impl FromStr for HlcTimestamp {
    type Err = EngramError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Compare two timestamps in the total order
///
/// Thin wrapper over the derived `Ord`, exposed as a free function for
/// callers that want the comparator by name.
#[inline]
pub fn compare(a: &HlcTimestamp, b: &HlcTimestamp) -> Ordering {
    a.cmp(b)
}

/// Persisted snapshot of a device's own clock
///
/// Stored alongside the event log so the clock resumes monotonically after a
/// restart instead of reissuing timestamps it already handed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceClockState {
    /// Owning device
    pub device_id: DeviceId,
    /// Last timestamp issued by this clock
    pub last_hlc: HlcTimestamp,
    /// Total number of timestamps issued across the clock's lifetime
    pub lamport_counter: u64,
}

#[derive(Debug)]
struct ClockInner {
    last_physical: i64,
    logical: u32,
    lamport_counter: u64,
}

/// Per-device monotonic, causally-consistent timestamp generator
///
/// `now` and `update` execute atomically behind an internal mutex; the
/// counter increment is not safe under concurrent invocation otherwise, so
/// multi-threaded hosts get the single-writer discipline for free.
pub struct HybridLogicalClock {
    device_id: DeviceId,
    time: Arc<dyn TimeSource>,
    inner: Mutex<ClockInner>,
}

impl HybridLogicalClock {
    /// Create a fresh clock for a device
    pub fn new(device_id: DeviceId, time: Arc<dyn TimeSource>) -> Self {
        Self {
            device_id,
            time,
            inner: Mutex::new(ClockInner {
                last_physical: 0,
                logical: 0,
                lamport_counter: 0,
            }),
        }
    }

    /// Resume a clock from persisted state, preserving monotonicity
    pub fn resume(state: &DeviceClockState, time: Arc<dyn TimeSource>) -> Self {
        Self {
            device_id: state.device_id.clone(),
            time,
            inner: Mutex::new(ClockInner {
                last_physical: state.last_hlc.physical,
                logical: state.last_hlc.logical,
                lamport_counter: state.lamport_counter,
            }),
        }
    }

    /// The device this clock issues timestamps for
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Issue a timestamp strictly greater than every timestamp previously
    /// issued or observed by this instance
    pub fn now(&self) -> HlcTimestamp {
        let mut inner = self.inner.lock();
        let wall = self.time.now_ms();
        if wall > inner.last_physical {
            inner.last_physical = wall;
            inner.logical = 0;
        } else {
            // Wall clock stalled or regressed: pin physical, bump logical.
            inner.logical += 1;
        }
        inner.lamport_counter += 1;
        HlcTimestamp::new(inner.last_physical, inner.logical, self.device_id.clone())
    }

    /// Fold in a timestamp learned from a peer and return a new local
    /// timestamp causally after both
    pub fn update(&self, remote: &HlcTimestamp) -> HlcTimestamp {
        let mut inner = self.inner.lock();
        let wall = self.time.now_ms();
        let merged = wall.max(remote.physical).max(inner.last_physical);

        if merged == wall && merged > inner.last_physical && merged > remote.physical {
            inner.last_physical = merged;
            inner.logical = 0;
        } else if merged == remote.physical && merged > inner.last_physical {
            inner.last_physical = merged;
            inner.logical = remote.logical + 1;
        } else if merged == inner.last_physical {
            let remote_logical = if remote.physical == merged {
                remote.logical
            } else {
                0
            };
            inner.logical = inner.logical.max(remote_logical) + 1;
        } else {
            inner.last_physical = merged;
            inner.logical += 1;
        }
        inner.lamport_counter += 1;
        HlcTimestamp::new(inner.last_physical, inner.logical, self.device_id.clone())
    }

    /// Snapshot the clock for persistence
    pub fn state(&self) -> DeviceClockState {
        let inner = self.inner.lock();
        DeviceClockState {
            device_id: self.device_id.clone(),
            last_hlc: HlcTimestamp::new(inner.last_physical, inner.logical, self.device_id.clone()),
            lamport_counter: inner.lamport_counter,
        }
    }
}

impl fmt::Debug for HybridLogicalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("HybridLogicalClock")
            .field("device_id", &self.device_id)
            .field("last_physical", &inner.last_physical)
            .field("logical", &inner.logical)
            .finish()
    }
}
