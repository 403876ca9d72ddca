//! Unified error system for Engram
//!
//! One error type covers the whole replication core. Variants map onto the
//! failure classes the sync layer has to tell apart: transient network
//! trouble, cryptographic verification failures, per-device chain breaks,
//! malformed data, and storage faults.

use serde::{Deserialize, Serialize};

/// Unified error type for all Engram operations
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum EngramError {
    /// Invalid input or configuration
    #[error("Invalid: {message}")]
    Invalid {
        /// Error message describing the invalid input
        message: String,
    },

    /// Resource not found
    #[error("Not found: {message}")]
    NotFound {
        /// Error message describing what was not found
        message: String,
    },

    /// Cryptographic operation failed (key setup, encrypt/decrypt, signing)
    #[error("Crypto error: {message}")]
    Crypto {
        /// Error message describing the cryptographic failure
        message: String,
    },

    /// Event verification failed: bad hash, bad signature, or unknown signer.
    /// Security-relevant; the event must never reach derived state.
    #[error("Verification failed: {message}")]
    Verification {
        /// Error message describing the verification failure
        message: String,
    },

    /// A device's hash chain is broken: a prev_hash link does not match the
    /// preceding event. Acceptance from that device halts until reconciled.
    #[error("Chain integrity failure for device {device}: {message}")]
    ChainIntegrity {
        /// Device whose chain is inconsistent
        device: String,
        /// Description of where the chain broke
        message: String,
    },

    /// Unparseable wire data: bad timestamp string, unknown entity type, etc.
    /// Rejects the single event; batch processing continues.
    #[error("Malformed data: {message}")]
    Malformed {
        /// Error message describing the parse failure
        message: String,
    },

    /// Network or relay transport error
    #[error("Network error: {message}")]
    Network {
        /// Error message describing the network issue
        message: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message describing the serialization failure
        message: String,
    },

    /// Local storage operation failed; fatal for the current operation
    #[error("Storage error: {message}")]
    Storage {
        /// Error message describing the storage failure
        message: String,
    },

    /// Internal invariant violation
    #[error("Internal error: {message}")]
    Internal {
        /// Error message describing the internal error
        message: String,
    },
}

impl EngramError {
    /// Create an invalid input error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a crypto error
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    /// Create a verification failure
    pub fn verification(message: impl Into<String>) -> Self {
        Self::Verification {
            message: message.into(),
        }
    }

    /// Create a chain integrity failure for a device
    pub fn chain_integrity(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ChainIntegrity {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Create a malformed data error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error is security-relevant (verification or chain break)
    /// as opposed to an ordinary parse or transport problem.
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            Self::Verification { .. } | Self::ChainIntegrity { .. }
        )
    }
}

/// Standard Result type for Engram operations
pub type Result<T> = std::result::Result<T, EngramError>;

impl From<std::io::Error> for EngramError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            _ => Self::storage(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = EngramError::verification("bad signature");
        assert!(matches!(err, EngramError::Verification { .. }));
        assert_eq!(err.to_string(), "Verification failed: bad signature");
    }

    #[test]
    fn test_security_relevance() {
        assert!(EngramError::verification("x").is_security_relevant());
        assert!(EngramError::chain_integrity("dev-a", "x").is_security_relevant());
        assert!(!EngramError::malformed("x").is_security_relevant());
        assert!(!EngramError::network("x").is_security_relevant());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = EngramError::from(io_err);
        assert!(matches!(err, EngramError::NotFound { .. }));
    }
}
