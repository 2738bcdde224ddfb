//! Stream name hashing for index keys.

use xxhash_rust::xxh3::xxh3_64;

/// Maps a stream name to its index key. Collisions are expected and are
/// resolved by reading the record behind each candidate entry.
pub trait StreamHasher: Send + Sync {
    fn hash(&self, stream: &str) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Xxh3Hasher;

impl StreamHasher for Xxh3Hasher {
    fn hash(&self, stream: &str) -> u64 {
        xxh3_64(stream.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xxh3_is_stable() {
        let h = Xxh3Hasher;
        assert_eq!(h.hash("stream-1"), h.hash("stream-1"));
        assert_ne!(h.hash("stream-1"), h.hash("stream-2"));
    }
}
