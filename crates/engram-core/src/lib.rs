//! Engram core: identifiers, hybrid logical clock, and the unified error type
//!
//! Foundation crate for the Engram replication core. Everything above this
//! layer (crypto, journal, pairing, store, sync) builds on the types here.

pub mod error;
pub mod hlc;
pub mod identifiers;
pub mod time;

pub use error::{EngramError, Result};
pub use hlc::{compare, DeviceClockState, HlcTimestamp, HybridLogicalClock};
pub use identifiers::{DeviceId, EntityId, OpId};
pub use time::{system_time_source, ManualTimeSource, SystemTimeSource, TimeSource};
