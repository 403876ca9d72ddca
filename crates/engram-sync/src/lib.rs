//! Engram sync: periodic replication against an untrusted relay
//!
//! The relay only stores and forwards opaque encrypted events; every device
//! runs its own [`SyncService`] loop that pushes local events, pulls remote
//! ones, verifies them against its trust table, and folds their timestamps
//! into its clock. Devices converge because all of them reconstruct the same
//! HLC total order from the same event set.

pub mod http;
pub mod relay;
pub mod service;

pub use http::HttpRelay;
pub use relay::{
    DeviceInfo, InMemoryRelay, PushRejection, PushReport, Relay, RelayHealth, RelayMetrics,
    SyncPage,
};
pub use service::{CycleOutcome, SyncConfig, SyncService, SyncStatus, PUSH_WATERMARK_KEY};
