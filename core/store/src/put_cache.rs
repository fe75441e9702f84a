//! Ordered, append-only windows of chunks awaiting write-out.
//!
//! The remote batch store appends scheduled chunks here and extracts
//! contiguous ranges to hand to its delegate; once a range is acknowledged
//! it is dropped from the head. Insertion order equals iteration order,
//! `drop_until` is monotonic, and `extract_chunks`/`get` are safe to call
//! concurrently with `append`.

use crate::serializer;
use crate::StoreError;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use noms_primitives::chunk::Chunk;
use noms_primitives::hash::Hash;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::pin::Pin;
use std::sync::Arc;

/// Consumer-driven stream of chunks in insertion order.
pub type ChunkStream = Pin<Box<dyn futures::Stream<Item = Result<Chunk, StoreError>> + Send>>;

#[async_trait]
pub trait OrderedPutCache: Send + Sync {
    /// False if a chunk with this hash is already in the window; true after
    /// inserting at the tail.
    fn append(&self, chunk: &Chunk) -> Result<bool, StoreError>;
    /// The chunk, if still in the window.
    async fn get(&self, h: &Hash) -> Result<Option<Chunk>, StoreError>;
    /// Removes every entry from the head through `h`, inclusive. Entries
    /// already gone are ignored.
    async fn drop_until(&self, h: &Hash) -> Result<(), StoreError>;
    /// Streams every chunk from `first` through `last` inclusive, in
    /// insertion order. Both entries must still be present.
    async fn extract_chunks(&self, first: &Hash, last: &Hash) -> Result<ChunkStream, StoreError>;
    /// Releases backing storage; the cache is unusable afterwards.
    async fn destroy(&self) -> Result<(), StoreError>;
}

/// In-memory backend: an ordered queue plus a hash index into it.
#[derive(Default)]
pub struct MemoryPutCache {
    inner: Mutex<MemInner>,
}

#[derive(Default)]
struct MemInner {
    chunks: VecDeque<Chunk>,
    /// Hash -> absolute sequence number; `head_seq` is the sequence number
    /// of the queue front.
    index: HashMap<Hash, u64>,
    head_seq: u64,
}

impl MemoryPutCache {
    pub fn new() -> Self {
        MemoryPutCache::default()
    }
}

#[async_trait]
impl OrderedPutCache for MemoryPutCache {
    fn append(&self, chunk: &Chunk) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let h = chunk.hash();
        if inner.index.contains_key(&h) {
            return Ok(false);
        }
        let seq = inner.head_seq + inner.chunks.len() as u64;
        inner.index.insert(h, seq);
        inner.chunks.push_back(chunk.clone());
        Ok(true)
    }

    async fn get(&self, h: &Hash) -> Result<Option<Chunk>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .index
            .get(h)
            .map(|&seq| inner.chunks[(seq - inner.head_seq) as usize].clone()))
    }

    async fn drop_until(&self, h: &Hash) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let Some(&until) = inner.index.get(h) else {
            return Ok(());
        };
        while inner.head_seq <= until {
            let chunk = inner.chunks.pop_front().expect("index and queue out of sync");
            inner.index.remove(&chunk.hash());
            inner.head_seq += 1;
        }
        Ok(())
    }

    async fn extract_chunks(&self, first: &Hash, last: &Hash) -> Result<ChunkStream, StoreError> {
        let inner = self.inner.lock();
        let (Some(&first_seq), Some(&last_seq)) = (inner.index.get(first), inner.index.get(last))
        else {
            return Err(StoreError::Cache("extract range no longer present".to_string()));
        };
        if first_seq > last_seq {
            return Err(StoreError::Cache("extract range inverted".to_string()));
        }
        let lo = (first_seq - inner.head_seq) as usize;
        let hi = (last_seq - inner.head_seq) as usize;
        let chunks: Vec<Chunk> = inner.chunks.iter().skip(lo).take(hi - lo + 1).cloned().collect();
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }

    async fn destroy(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.chunks.clear();
        inner.index.clear();
        Ok(())
    }
}

/// Disk-backed backend: chunk envelopes appended to an anonymous temp file,
/// indexed by offset. Dropped bytes are reclaimed only when the window
/// empties; destroying the cache deletes the file.
pub struct DiskPutCache {
    inner: Arc<Mutex<DiskInner>>,
}

struct DiskInner {
    /// None once destroyed.
    file: Option<File>,
    index: HashMap<Hash, DiskEntry>,
    order: VecDeque<(Hash, DiskEntry)>,
    next_seq: u64,
    write_offset: u64,
}

#[derive(Copy, Clone)]
struct DiskEntry {
    seq: u64,
    offset: u64,
}

impl DiskPutCache {
    pub fn new() -> Result<Self, StoreError> {
        let file = tempfile::tempfile()?;
        Ok(DiskPutCache {
            inner: Arc::new(Mutex::new(DiskInner {
                file: Some(file),
                index: HashMap::new(),
                order: VecDeque::new(),
                next_seq: 0,
                write_offset: 0,
            })),
        })
    }
}

impl DiskInner {
    fn read_at(&mut self, offset: u64) -> Result<Chunk, StoreError> {
        let file = self.file.as_mut().ok_or(StoreError::Closed)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(serializer::read_chunk(file)?)
    }
}

#[async_trait]
impl OrderedPutCache for DiskPutCache {
    fn append(&self, chunk: &Chunk) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let h = chunk.hash();
        if inner.index.contains_key(&h) {
            return Ok(false);
        }
        let offset = inner.write_offset;
        let seq = inner.next_seq;
        let file = inner.file.as_mut().ok_or(StoreError::Closed)?;
        file.seek(SeekFrom::Start(offset))?;
        let written = serializer::write_chunk(chunk, file)?;
        inner.write_offset = offset + written as u64;
        inner.next_seq = seq + 1;
        let entry = DiskEntry { seq, offset };
        inner.index.insert(h, entry);
        inner.order.push_back((h, entry));
        Ok(true)
    }

    async fn get(&self, h: &Hash) -> Result<Option<Chunk>, StoreError> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.index.get(h).copied() else {
            return Ok(None);
        };
        inner.read_at(entry.offset).map(Some)
    }

    async fn drop_until(&self, h: &Hash) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let Some(until) = inner.index.get(h).map(|e| e.seq) else {
            return Ok(());
        };
        while inner.order.front().is_some_and(|(_, e)| e.seq <= until) {
            let (hash, _) = inner.order.pop_front().expect("checked front");
            inner.index.remove(&hash);
        }
        if inner.order.is_empty() {
            // The window emptied; reclaim the file space.
            if let Some(file) = inner.file.as_mut() {
                file.set_len(0)?;
            }
            inner.write_offset = 0;
        }
        Ok(())
    }

    async fn extract_chunks(&self, first: &Hash, last: &Hash) -> Result<ChunkStream, StoreError> {
        let offsets: Vec<u64> = {
            let inner = self.inner.lock();
            let (Some(first_entry), Some(last_entry)) =
                (inner.index.get(first), inner.index.get(last))
            else {
                return Err(StoreError::Cache("extract range no longer present".to_string()));
            };
            if first_entry.seq > last_entry.seq {
                return Err(StoreError::Cache("extract range inverted".to_string()));
            }
            inner
                .order
                .iter()
                .filter(|(_, e)| e.seq >= first_entry.seq && e.seq <= last_entry.seq)
                .map(|(_, e)| e.offset)
                .collect()
        };
        // Frames are read lazily, one per stream item, as the consumer pulls.
        let inner = self.inner.clone();
        Ok(stream::iter(offsets).map(move |offset| inner.lock().read_at(offset)).boxed())
    }

    async fn destroy(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        // Dropping the handle deletes the anonymous temp file.
        inner.file = None;
        inner.index.clear();
        inner.order.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks() -> (Chunk, Chunk, Chunk) {
        (Chunk::new(&b"abc"[..]), Chunk::new(&b"def"[..]), Chunk::new(&b"ghi"[..]))
    }

    async fn collect(stream: ChunkStream) -> Vec<Chunk> {
        stream.map(|r| r.unwrap()).collect().await
    }

    async fn append_get_drop(cache: &dyn OrderedPutCache) {
        let (abc, def, ghi) = chunks();
        assert!(cache.append(&abc).unwrap());
        assert!(cache.append(&def).unwrap());
        assert!(cache.append(&ghi).unwrap());
        // Re-appending an existing chunk is refused.
        assert!(!cache.append(&abc).unwrap());

        let extracted =
            collect(cache.extract_chunks(&abc.hash(), &ghi.hash()).await.unwrap()).await;
        assert_eq!(extracted, vec![abc.clone(), def.clone(), ghi.clone()]);

        cache.drop_until(&def.hash()).await.unwrap();
        assert_eq!(cache.get(&abc.hash()).await.unwrap(), None);
        assert_eq!(cache.get(&def.hash()).await.unwrap(), None);
        assert_eq!(cache.get(&ghi.hash()).await.unwrap(), Some(ghi.clone()));

        // The dropped prefix can no longer anchor an extract.
        match cache.extract_chunks(&abc.hash(), &ghi.hash()).await {
            Err(StoreError::Cache(_)) => {}
            _ => panic!("expected StoreError::Cache"),
        }

        // Appending after a drop keeps insertion order.
        assert!(cache.append(&abc).unwrap());
        let extracted =
            collect(cache.extract_chunks(&ghi.hash(), &abc.hash()).await.unwrap()).await;
        assert_eq!(extracted, vec![ghi.clone(), abc.clone()]);

        cache.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn memory_append_get_drop() {
        append_get_drop(&MemoryPutCache::new()).await;
    }

    #[tokio::test]
    async fn disk_append_get_drop() {
        append_get_drop(&DiskPutCache::new().unwrap()).await;
    }

    #[tokio::test]
    async fn disk_survives_large_window() {
        let cache = DiskPutCache::new().unwrap();
        let chunks: Vec<Chunk> =
            (0u32..100).map(|i| Chunk::new(i.to_be_bytes().to_vec())).collect();
        for c in &chunks {
            assert!(cache.append(c).unwrap());
        }
        let first = chunks.first().unwrap().hash();
        let last = chunks.last().unwrap().hash();
        let extracted = collect(cache.extract_chunks(&first, &last).await.unwrap()).await;
        assert_eq!(extracted, chunks);
        // Dropping everything resets the backing file.
        cache.drop_until(&last).await.unwrap();
        assert_eq!(cache.get(&first).await.unwrap(), None);
        assert!(cache.append(&Chunk::new(&b"fresh"[..])).unwrap());
    }

    #[tokio::test]
    async fn extract_is_concurrent_with_append() {
        let cache = MemoryPutCache::new();
        let (abc, def, ghi) = chunks();
        assert!(cache.append(&abc).unwrap());
        assert!(cache.append(&def).unwrap());
        let stream = cache.extract_chunks(&abc.hash(), &def.hash()).await.unwrap();
        // An append racing the extract never tears the in-flight range.
        assert!(cache.append(&ghi).unwrap());
        assert_eq!(collect(stream).await, vec![abc, def]);
    }

    #[tokio::test]
    async fn destroyed_cache_refuses_appends() {
        let cache = DiskPutCache::new().unwrap();
        cache.append(&Chunk::new(&b"x"[..])).unwrap();
        cache.destroy().await.unwrap();
        assert_matches::assert_matches!(
            cache.append(&Chunk::new(&b"y"[..])),
            Err(StoreError::Closed)
        );
    }
}
