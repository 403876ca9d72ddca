//! Engram pairing: manual device trust bootstrap
//!
//! Establishes mutual authentication between two of the user's devices with
//! no central authority: a self-signed trust request travels out-of-band to
//! an already-trusted device, which answers with a short-lived verification
//! code the user relays back. On confirmation both devices record each other
//! in their trust tables with a shared evidence hash.

pub mod ceremony;
pub mod request;

pub use ceremony::{IssuedCode, PairingCeremony, PairingConfig, TrustGrant};
pub use request::{TrustRequest, TRANSPORT_PREFIX};
