//! The promise-based store interface the value layer writes through.

use crate::chunk_store::ChunkStore;
use crate::StoreError;
use async_trait::async_trait;
use noms_primitives::chunk::Chunk;
use noms_primitives::hash::Hash;
use std::collections::HashSet;
use std::sync::Arc;

/// Batched chunk I/O plus the root compare-and-set.
///
/// `schedule_put` returns synchronously; durability is only guaranteed after
/// `flush` completes. Concurrent `get`s of one hash are coalesced by
/// implementations that batch. `update_root` must only be called after a
/// completed `flush`, so a published root never references chunks that are
/// not yet durable.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// The chunk for `h`, or the empty chunk if the store has no such chunk.
    async fn get(&self, h: Hash) -> Result<Chunk, StoreError>;

    /// Enqueues `c` for eventual write. `hints` is a best-effort set of
    /// ancestor hashes the server may use to validate referential closure.
    fn schedule_put(&self, c: Chunk, hints: HashSet<Hash>) -> Result<(), StoreError>;

    /// Completes once every previously scheduled put is durable.
    async fn flush(&self) -> Result<(), StoreError>;

    /// The current root pointer; the empty hash on a fresh store.
    async fn get_root(&self) -> Result<Hash, StoreError>;

    /// Atomic compare-and-set of the root. True iff the store's root was
    /// `last` at commit time, in which case it is now `current`.
    async fn update_root(&self, current: Hash, last: Hash) -> Result<bool, StoreError>;

    /// Flushes, then releases resources. Further operations fail with
    /// [`StoreError::Closed`].
    async fn close(&self) -> Result<(), StoreError>;

    /// Format version tag of the underlying store.
    fn version(&self) -> String;
}

/// Trivial pass-through over a synchronous local chunk store: puts land
/// immediately, flush is a no-op.
pub struct BatchStoreAdaptor {
    store: Arc<dyn ChunkStore>,
}

impl BatchStoreAdaptor {
    pub fn new(store: Arc<dyn ChunkStore>) -> Self {
        BatchStoreAdaptor { store }
    }
}

#[async_trait]
impl BatchStore for BatchStoreAdaptor {
    async fn get(&self, h: Hash) -> Result<Chunk, StoreError> {
        Ok(self.store.get(&h))
    }

    fn schedule_put(&self, c: Chunk, _hints: HashSet<Hash>) -> Result<(), StoreError> {
        self.store.put(c);
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get_root(&self) -> Result<Hash, StoreError> {
        Ok(self.store.root())
    }

    async fn update_root(&self, current: Hash, last: Hash) -> Result<bool, StoreError> {
        Ok(self.store.update_root(current, last))
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn version(&self) -> String {
        self.store.version()
    }
}
