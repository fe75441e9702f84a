use crate::hash::Hash;
use bytes::Bytes;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// The atomic unit of persistence: an immutable byte blob addressed by the
/// hash of its bytes. The hash is computed lazily and memoized, so cloning a
/// chunk shares both the bytes and the cached hash.
#[derive(Clone)]
pub struct Chunk(Arc<Inner>);

struct Inner {
    bytes: Bytes,
    hash: OnceLock<Hash>,
}

impl Chunk {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Chunk(Arc::new(Inner { bytes: bytes.into(), hash: OnceLock::new() }))
    }

    /// The empty chunk: zero-length bytes. Stands in for "not found" in
    /// batch-store reads.
    pub fn empty() -> Self {
        Chunk::new(Bytes::new())
    }

    /// Constructs a chunk with an already-known hash, skipping the digest.
    /// The caller asserts that `hash` is the hash of `bytes`; transports use
    /// this when the address arrived alongside the payload.
    pub fn with_hash(bytes: impl Into<Bytes>, hash: Hash) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(hash);
        Chunk(Arc::new(Inner { bytes: bytes.into(), hash: cell }))
    }

    pub fn hash(&self) -> Hash {
        *self.0.hash.get_or_init(|| Hash::of(&self.0.bytes))
    }

    pub fn bytes(&self) -> &Bytes {
        &self.0.bytes
    }

    pub fn len(&self) -> usize {
        self.0.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.bytes.is_empty()
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for Chunk {}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk").field("hash", &self.hash()).field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_matches_bytes() {
        let c = Chunk::new(&b"abc"[..]);
        assert_eq!(c.hash(), Hash::of(b"abc"));
        assert_eq!(c.clone().hash(), c.hash());
    }

    #[test]
    fn empty_chunk() {
        let c = Chunk::empty();
        assert!(c.is_empty());
        assert_eq!(c.len(), 0);
        // Even the empty chunk has a (non-zero) content hash.
        assert_eq!(c.hash(), Hash::of(b""));
    }

    #[test]
    fn with_hash_skips_digest() {
        let c = Chunk::new(&b"payload"[..]);
        let framed = Chunk::with_hash(c.bytes().clone(), c.hash());
        assert_eq!(framed, c);
    }
}
