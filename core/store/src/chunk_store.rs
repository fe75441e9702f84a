//! Synchronous chunk storage.

use noms_primitives::chunk::Chunk;
use noms_primitives::hash::Hash;
use noms_primitives::version::FORMAT_VERSION;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// A flat, content-addressed chunk store with a single root pointer.
///
/// `get` returns the empty chunk when the hash is absent; `update_root` is an
/// atomic compare-and-set over the root. Implementations must retain every
/// chunk once written.
pub trait ChunkStore: Send + Sync {
    fn get(&self, h: &Hash) -> Chunk;
    fn has(&self, h: &Hash) -> bool;
    fn put(&self, c: Chunk);
    fn root(&self) -> Hash;
    fn update_root(&self, current: Hash, last: Hash) -> bool;
    /// Format version tag the store was created with.
    fn version(&self) -> String;
}

/// In-memory chunk store; the backend for local databases and tests.
#[derive(Default)]
pub struct MemoryChunkStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    chunks: HashMap<Hash, Chunk>,
    root: Hash,
}

impl MemoryChunkStore {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryChunkStore::default())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().chunks.is_empty()
    }
}

impl ChunkStore for MemoryChunkStore {
    fn get(&self, h: &Hash) -> Chunk {
        self.inner.lock().chunks.get(h).cloned().unwrap_or_else(Chunk::empty)
    }

    fn has(&self, h: &Hash) -> bool {
        self.inner.lock().chunks.contains_key(h)
    }

    fn put(&self, c: Chunk) {
        self.inner.lock().chunks.insert(c.hash(), c);
    }

    fn root(&self) -> Hash {
        self.inner.lock().root
    }

    fn update_root(&self, current: Hash, last: Hash) -> bool {
        let mut inner = self.inner.lock();
        if inner.root == last {
            inner.root = current;
            true
        } else {
            false
        }
    }

    fn version(&self) -> String {
        FORMAT_VERSION.to_string()
    }
}
