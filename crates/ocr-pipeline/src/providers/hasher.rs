//! Content hashing for cache keys

use sha2::{Digest, Sha256};

/// Hash function used to address cached content
pub trait ContentHasher: Send + Sync {
    fn hash(&self, data: &[u8]) -> Vec<u8>;

    /// Lowercase hex form of [`hash`](Self::hash)
    fn hash_hex(&self, data: &[u8]) -> String {
        hex::encode(self.hash(data))
    }
}

/// SHA-256 content hasher
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl ContentHasher for Sha256Hasher {
    fn hash(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.finalize().to_vec()
    }
}
