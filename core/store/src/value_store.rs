//! Read-through / write-through value cache over a batch store.

use crate::batch_store::BatchStore;
use crate::StoreError;
use lru::LruCache;
use noms_primitives::chunk::Chunk;
use noms_primitives::codec;
use noms_primitives::hash::Hash;
use noms_primitives::value::{Ref, Value};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

const VALUE_CACHE_SIZE: usize = 4096;
const HINT_CACHE_SIZE: usize = 65536;

/// Mediates between values and chunks: decodes on read, encodes on write,
/// memoizes recently seen values, and tracks hint sources for writes.
///
/// The value cache is never authoritative; a miss falls through to the
/// batch store.
pub struct ValueStore {
    batch_store: Arc<dyn BatchStore>,
    inner: Mutex<Inner>,
}

struct Inner {
    /// Chunk hash -> decoded value, for repeated reads.
    values: LruCache<Hash, Value>,
    /// Child chunk hash -> hash of a chunk known to reference it. Sent as
    /// the write hint for future chunks that reference the child.
    hint_sources: LruCache<Hash, Hash>,
}

impl ValueStore {
    pub fn new(batch_store: Arc<dyn BatchStore>) -> Self {
        ValueStore {
            batch_store,
            inner: Mutex::new(Inner {
                values: LruCache::new(NonZeroUsize::new(VALUE_CACHE_SIZE).unwrap()),
                hint_sources: LruCache::new(NonZeroUsize::new(HINT_CACHE_SIZE).unwrap()),
            }),
        }
    }

    pub fn batch_store(&self) -> &Arc<dyn BatchStore> {
        &self.batch_store
    }

    /// The value stored at `h`, or None if `h` is the empty hash or the
    /// chunk is absent.
    pub async fn read_value(&self, h: Hash) -> Result<Option<Value>, StoreError> {
        if h.is_empty() {
            return Ok(None);
        }
        if let Some(value) = self.inner.lock().values.get(&h) {
            return Ok(Some(value.clone()));
        }
        let chunk = self.batch_store.get(h).await?;
        if chunk.is_empty() {
            return Ok(None);
        }
        let value = codec::decode_value(chunk.bytes())?;
        let mut inner = self.inner.lock();
        for child in value.child_hashes() {
            inner.hint_sources.put(child, h);
        }
        inner.values.put(h, value.clone());
        Ok(Some(value))
    }

    /// Encodes `v`, schedules its chunk for write with hints covering every
    /// chunk one level below it, and returns a ref to it. Writing the same
    /// value twice returns the same ref; the put cache dedups the second
    /// schedule.
    pub fn write_value(&self, v: &Value) -> Result<Ref, StoreError> {
        let chunk = Chunk::new(codec::encode_value(v));
        let h = chunk.hash();
        let height = v.ref_height();
        let children = v.child_hashes();
        let hints: HashSet<Hash> = {
            let mut inner = self.inner.lock();
            let hints = children
                .iter()
                .map(|child| inner.hint_sources.get(child).copied().unwrap_or(*child))
                .collect();
            // Once this chunk is durable it vouches for its children.
            for child in children {
                inner.hint_sources.put(child, h);
            }
            inner.values.put(h, v.clone());
            hints
        };
        self.batch_store.schedule_put(chunk, hints)?;
        Ok(Ref::new(h, v.type_of(), height))
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.batch_store.flush().await
    }

    pub async fn get_root(&self) -> Result<Hash, StoreError> {
        self.batch_store.get_root().await
    }

    pub async fn update_root(&self, current: Hash, last: Hash) -> Result<bool, StoreError> {
        self.batch_store.update_root(current, last).await
    }

    pub async fn close(&self) -> Result<(), StoreError> {
        self.batch_store.close().await
    }

    pub fn version(&self) -> String {
        self.batch_store.version()
    }
}
