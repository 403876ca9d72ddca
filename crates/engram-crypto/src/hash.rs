//! Content hashing
//!
//! Blake3 everywhere: deterministic, collision-resistant, identical output
//! across devices for identical input, which is what lets independent devices
//! agree on an event's integrity hash.

use crate::types::Hash256;
use blake3::Hasher;

/// Hash a byte slice
pub fn hash(data: &[u8]) -> Hash256 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    Hash256::new(*hasher.finalize().as_bytes())
}

/// Create a hasher for incremental hashing
pub fn hasher() -> Hasher {
    Hasher::new()
}

/// Hash multiple chunks as one stream
pub fn hash_chunks(chunks: &[&[u8]]) -> Hash256 {
    let mut hasher = Hasher::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    Hash256::new(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(hash(b"hello world"), hash(b"hello world"));
        assert_ne!(hash(b"hello world"), hash(b"hello worlD"));
    }

    #[test]
    fn test_hash_chunks_matches_concatenation() {
        let chunked = hash_chunks(&[b"hello", b" ", b"world"]);
        assert_eq!(chunked, hash(b"hello world"));
    }

    #[test]
    fn test_incremental_hasher() {
        let mut h = hasher();
        h.update(b"hello ");
        h.update(b"world");
        assert_eq!(Hash256::new(*h.finalize().as_bytes()), hash(b"hello world"));
    }
}
