//! Batched transport against a remote chunk endpoint.
//!
//! Reads are coalesced into an unsent map and dispatched as one batch when
//! the map fills or a flush asks for it. Writes flow through an ordered put
//! cache; a single drain task extracts contiguous ranges and hands them to
//! the delegate, dropping each range from the cache once it is acknowledged.
//! A failed write leaves its chunks in the cache: the error is reported by
//! the next flush, and the flush after that retries the same window.

use crate::batch_store::BatchStore;
use crate::chunk_store::ChunkStore;
use crate::put_cache::{ChunkStream, OrderedPutCache};
use crate::StoreError;
use async_trait::async_trait;
use futures::StreamExt;
use noms_primitives::chunk::Chunk;
use noms_primitives::hash::Hash;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::mem;
use std::sync::Arc;
use tokio::sync::oneshot;

/// The four operations a remote transport must provide. The HTTP transport
/// lives outside this crate; [`ChunkStoreDelegate`] adapts any local
/// [`ChunkStore`] for tests and in-process use.
#[async_trait]
pub trait Delegate: Send + Sync + 'static {
    /// Delivers each available chunk to its resolver via
    /// [`ReadBatch::resolve`]. Entries left unresolved are completed with
    /// the empty chunk by the caller; returning an error fails them all.
    async fn read_batch(&self, batch: &mut ReadBatch) -> Result<(), StoreError>;

    /// Persists every chunk of `chunks`, in stream order, along with the
    /// hint set. The order matters: hints for a chunk may name earlier
    /// chunks of the same batch.
    async fn write_batch(
        &self,
        hints: HashSet<Hash>,
        chunks: ChunkStream,
    ) -> Result<(), StoreError>;

    async fn get_root(&self) -> Result<Hash, StoreError>;

    async fn update_root(&self, current: Hash, last: Hash) -> Result<bool, StoreError>;

    /// Format version tag of the remote store.
    fn version(&self) -> String;
}

type ReadResult = Result<Chunk, StoreError>;

/// One dispatched batch of coalesced reads: each hash carries the resolvers
/// of every `get` waiting on it.
pub struct ReadBatch {
    entries: HashMap<Hash, Vec<oneshot::Sender<ReadResult>>>,
}

impl ReadBatch {
    pub fn hashes(&self) -> Vec<Hash> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Delivers `chunk` to every resolver of `h`. True if `h` was pending.
    pub fn resolve(&mut self, h: &Hash, chunk: Chunk) -> bool {
        match self.entries.remove(h) {
            Some(senders) => {
                for sender in senders {
                    let _ = sender.send(Ok(chunk.clone()));
                }
                true
            }
            None => false,
        }
    }

    /// Hashes the delegate did not return resolve with the empty chunk.
    fn finish(mut self) {
        for (_, senders) in self.entries.drain() {
            for sender in senders {
                let _ = sender.send(Ok(Chunk::empty()));
            }
        }
    }

    fn fail(mut self, err: &StoreError) {
        for (_, senders) in self.entries.drain() {
            for sender in senders {
                let _ = sender.send(Err(err.clone()));
            }
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Phase {
    Open,
    Closing,
    Closed,
}

struct State {
    phase: Phase,
    unsent_reads: HashMap<Hash, Vec<oneshot::Sender<ReadResult>>>,
    /// Hashes in the put cache not yet written, in insertion order. The
    /// front is the first unsent chunk, the back the last scheduled one.
    unwritten: VecDeque<Hash>,
    /// Hints accumulated for the chunks currently in `unwritten`.
    pending_hints: HashSet<Hash>,
    drain_running: bool,
    inflight_write: bool,
    /// First error of a failed write batch; taken by the next flush.
    write_error: Option<StoreError>,
}

struct Inner {
    delegate: Box<dyn Delegate>,
    cache: Box<dyn OrderedPutCache>,
    max_reads: usize,
    state: Mutex<State>,
    /// Signaled whenever a drain round or read dispatch completes.
    changed: tokio::sync::Notify,
}

/// A [`BatchStore`] over a [`Delegate`].
#[derive(Clone)]
pub struct RemoteBatchStore {
    inner: Arc<Inner>,
}

impl RemoteBatchStore {
    pub fn new(
        delegate: Box<dyn Delegate>,
        cache: Box<dyn OrderedPutCache>,
        max_reads: usize,
    ) -> Self {
        assert!(max_reads > 0, "max_reads must be positive");
        RemoteBatchStore {
            inner: Arc::new(Inner {
                delegate,
                cache,
                max_reads,
                state: Mutex::new(State {
                    phase: Phase::Open,
                    unsent_reads: HashMap::new(),
                    unwritten: VecDeque::new(),
                    pending_hints: HashSet::new(),
                    drain_running: false,
                    inflight_write: false,
                    write_error: None,
                }),
                changed: tokio::sync::Notify::new(),
            }),
        }
    }

    fn spawn_read(&self, batch: ReadBatch) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            Inner::run_read_batch(&inner, batch).await;
        });
    }

    fn spawn_drain(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            Inner::drain(inner).await;
        });
    }

    /// Flush body, also used while closing.
    async fn flush_inner(&self) -> Result<(), StoreError> {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut start_drain = false;
            let mut read_batch = None;
            {
                let mut state = self.inner.state.lock();
                if let Some(err) = state.write_error.take() {
                    return Err(err);
                }
                if !state.unsent_reads.is_empty() {
                    read_batch =
                        Some(ReadBatch { entries: mem::take(&mut state.unsent_reads) });
                }
                if state.unwritten.is_empty() && !state.inflight_write {
                    if let Some(batch) = read_batch {
                        self.spawn_read(batch);
                    }
                    return Ok(());
                }
                if !state.drain_running {
                    state.drain_running = true;
                    start_drain = true;
                }
            }
            if let Some(batch) = read_batch {
                self.spawn_read(batch);
            }
            if start_drain {
                self.spawn_drain();
            }
            notified.await;
        }
    }
}

impl Inner {
    async fn run_read_batch(inner: &Arc<Inner>, mut batch: ReadBatch) {
        let count = batch.len();
        tracing::debug!(target: "store", count, "dispatching read batch");
        match inner.delegate.read_batch(&mut batch).await {
            Ok(()) => batch.finish(),
            Err(err) => {
                tracing::warn!(target: "store", "read batch failed: {err}");
                batch.fail(&err);
            }
        }
        inner.changed.notify_waiters();
    }

    /// The single write drain: repeatedly snapshots the [first unsent, last
    /// scheduled] range and hands it to the delegate. At most one instance
    /// runs per store; a failed round parks the error and exits.
    async fn drain(inner: Arc<Inner>) {
        loop {
            let (first, last, count, hints) = {
                let mut state = inner.state.lock();
                if state.unwritten.is_empty()
                    || state.write_error.is_some()
                    || state.phase == Phase::Closed
                {
                    state.drain_running = false;
                    drop(state);
                    inner.changed.notify_waiters();
                    return;
                }
                let first = *state.unwritten.front().expect("unwritten non-empty");
                let last = *state.unwritten.back().expect("unwritten non-empty");
                let count = state.unwritten.len();
                let hints = mem::take(&mut state.pending_hints);
                state.inflight_write = true;
                (first, last, count, hints)
            };

            let result = Inner::write_range(&inner, &first, &last, count, hints.clone()).await;

            let mut state = inner.state.lock();
            state.inflight_write = false;
            match result {
                Ok(()) => {
                    for _ in 0..count {
                        state.unwritten.pop_front();
                    }
                }
                Err(err) => {
                    tracing::warn!(target: "store", "write batch failed: {err}");
                    // Keep the window intact for a later retry; the hints
                    // for it must be re-sent then as well.
                    state.pending_hints.extend(hints);
                    state.write_error.get_or_insert(err);
                    state.drain_running = false;
                    drop(state);
                    inner.changed.notify_waiters();
                    return;
                }
            }
            drop(state);
            inner.changed.notify_waiters();
        }
    }

    async fn write_range(
        inner: &Arc<Inner>,
        first: &Hash,
        last: &Hash,
        count: usize,
        hints: HashSet<Hash>,
    ) -> Result<(), StoreError> {
        let chunks = inner.cache.extract_chunks(first, last).await?;
        tracing::debug!(target: "store", count, hints = hints.len(), "writing chunk batch");
        inner.delegate.write_batch(hints, chunks).await?;
        inner.cache.drop_until(last).await
    }
}

#[async_trait]
impl BatchStore for RemoteBatchStore {
    async fn get(&self, h: Hash) -> Result<Chunk, StoreError> {
        let receiver = {
            let mut state = self.inner.state.lock();
            if state.phase != Phase::Open {
                return Err(StoreError::Closed);
            }
            let (sender, receiver) = oneshot::channel();
            state.unsent_reads.entry(h).or_default().push(sender);
            if state.unsent_reads.len() >= self.inner.max_reads {
                let batch = ReadBatch { entries: mem::take(&mut state.unsent_reads) };
                drop(state);
                self.spawn_read(batch);
            }
            receiver
        };
        match receiver.await {
            Ok(result) => result,
            // The store dropped the resolver without answering: closed.
            Err(_) => Err(StoreError::Closed),
        }
    }

    fn schedule_put(&self, c: Chunk, hints: HashSet<Hash>) -> Result<(), StoreError> {
        let mut state = self.inner.state.lock();
        if state.phase != Phase::Open {
            return Err(StoreError::Closed);
        }
        if !self.inner.cache.append(&c)? {
            // Already scheduled; the pending write covers it.
            return Ok(());
        }
        state.unwritten.push_back(c.hash());
        state.pending_hints.extend(hints);
        let start_drain = !state.drain_running;
        state.drain_running = true;
        drop(state);
        if start_drain {
            self.spawn_drain();
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        {
            let state = self.inner.state.lock();
            if state.phase == Phase::Closed {
                return Err(StoreError::Closed);
            }
        }
        self.flush_inner().await
    }

    async fn get_root(&self) -> Result<Hash, StoreError> {
        if self.inner.state.lock().phase != Phase::Open {
            return Err(StoreError::Closed);
        }
        self.inner.delegate.get_root().await
    }

    async fn update_root(&self, current: Hash, last: Hash) -> Result<bool, StoreError> {
        {
            let state = self.inner.state.lock();
            if state.phase != Phase::Open {
                return Err(StoreError::Closed);
            }
            // A root must never reference chunks that are not yet durable.
            debug_assert!(
                state.unwritten.is_empty() && !state.inflight_write,
                "update_root requires a completed flush"
            );
        }
        self.inner.delegate.update_root(current, last).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        {
            let mut state = self.inner.state.lock();
            match state.phase {
                Phase::Closed => return Ok(()),
                Phase::Closing => {}
                Phase::Open => state.phase = Phase::Closing,
            }
        }
        let flushed = self.flush_inner().await;
        let remaining = {
            let mut state = self.inner.state.lock();
            state.phase = Phase::Closed;
            mem::take(&mut state.unsent_reads)
        };
        // Dropping the resolvers rejects every pending get with Closed.
        drop(remaining);
        self.inner.changed.notify_waiters();
        let destroyed = self.inner.cache.destroy().await;
        flushed.and(destroyed)
    }

    fn version(&self) -> String {
        self.inner.delegate.version()
    }
}

/// Adapts a synchronous [`ChunkStore`] into a [`Delegate`]: the in-process
/// "remote" used by tests and by callers that want remote batching semantics
/// over local storage.
pub struct ChunkStoreDelegate {
    store: Arc<dyn ChunkStore>,
}

impl ChunkStoreDelegate {
    pub fn new(store: Arc<dyn ChunkStore>) -> Self {
        ChunkStoreDelegate { store }
    }
}

#[async_trait]
impl Delegate for ChunkStoreDelegate {
    async fn read_batch(&self, batch: &mut ReadBatch) -> Result<(), StoreError> {
        for h in batch.hashes() {
            let chunk = self.store.get(&h);
            if !chunk.is_empty() {
                batch.resolve(&h, chunk);
            }
        }
        Ok(())
    }

    async fn write_batch(
        &self,
        _hints: HashSet<Hash>,
        mut chunks: ChunkStream,
    ) -> Result<(), StoreError> {
        while let Some(chunk) = chunks.next().await {
            self.store.put(chunk?);
        }
        Ok(())
    }

    async fn get_root(&self) -> Result<Hash, StoreError> {
        Ok(self.store.root())
    }

    async fn update_root(&self, current: Hash, last: Hash) -> Result<bool, StoreError> {
        Ok(self.store.update_root(current, last))
    }

    fn version(&self) -> String {
        self.store.version()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_store::MemoryChunkStore;
    use crate::put_cache::MemoryPutCache;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Delegate over a memory store that records batch boundaries and can
    /// fail the next write on demand.
    struct TestDelegate {
        store: Arc<MemoryChunkStore>,
        read_batches: AtomicUsize,
        write_batches: AtomicUsize,
        written: Mutex<Vec<Hash>>,
        hints_seen: Mutex<Vec<HashSet<Hash>>>,
        fail_next_write: AtomicBool,
    }

    impl TestDelegate {
        fn new(store: Arc<MemoryChunkStore>) -> Self {
            TestDelegate {
                store,
                read_batches: AtomicUsize::new(0),
                write_batches: AtomicUsize::new(0),
                written: Mutex::new(Vec::new()),
                hints_seen: Mutex::new(Vec::new()),
                fail_next_write: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Delegate for TestDelegate {
        async fn read_batch(&self, batch: &mut ReadBatch) -> Result<(), StoreError> {
            self.read_batches.fetch_add(1, Ordering::SeqCst);
            for h in batch.hashes() {
                let chunk = self.store.get(&h);
                if !chunk.is_empty() {
                    batch.resolve(&h, chunk);
                }
            }
            Ok(())
        }

        async fn write_batch(
            &self,
            hints: HashSet<Hash>,
            mut chunks: ChunkStream,
        ) -> Result<(), StoreError> {
            if self.fail_next_write.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Transport("injected write failure".to_string()));
            }
            self.write_batches.fetch_add(1, Ordering::SeqCst);
            self.hints_seen.lock().push(hints);
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk?;
                self.written.lock().push(chunk.hash());
                self.store.put(chunk);
            }
            Ok(())
        }

        async fn get_root(&self) -> Result<Hash, StoreError> {
            Ok(self.store.root())
        }

        async fn update_root(&self, current: Hash, last: Hash) -> Result<bool, StoreError> {
            Ok(self.store.update_root(current, last))
        }

        fn version(&self) -> String {
            self.store.version()
        }
    }

    fn remote(max_reads: usize) -> (Arc<MemoryChunkStore>, Arc<TestDelegate>, RemoteBatchStore) {
        noms_o11y::testonly::init_test_logger();
        let cs = MemoryChunkStore::new();
        let delegate = Arc::new(TestDelegate::new(cs.clone()));
        let store = RemoteBatchStore::new(
            Box::new(SharedDelegate(delegate.clone())),
            Box::new(MemoryPutCache::new()),
            max_reads,
        );
        (cs, delegate, store)
    }

    /// Lets tests keep a handle on the delegate the store owns.
    struct SharedDelegate(Arc<TestDelegate>);

    #[async_trait]
    impl Delegate for SharedDelegate {
        async fn read_batch(&self, batch: &mut ReadBatch) -> Result<(), StoreError> {
            self.0.read_batch(batch).await
        }
        async fn write_batch(
            &self,
            hints: HashSet<Hash>,
            chunks: ChunkStream,
        ) -> Result<(), StoreError> {
            self.0.write_batch(hints, chunks).await
        }
        async fn get_root(&self) -> Result<Hash, StoreError> {
            self.0.get_root().await
        }
        async fn update_root(&self, current: Hash, last: Hash) -> Result<bool, StoreError> {
            self.0.update_root(current, last).await
        }
        fn version(&self) -> String {
            self.0.version()
        }
    }

    #[tokio::test]
    async fn gets_coalesce_into_one_batch() {
        let (cs, delegate, store) = remote(8);
        let present = Chunk::new(&b"present"[..]);
        cs.put(present.clone());
        let missing = Hash::of(b"missing");

        // Three pending gets over two distinct hashes, dispatched by flush.
        let (a, b, c, flushed) = tokio::join!(
            store.get(present.hash()),
            store.get(present.hash()),
            store.get(missing),
            store.flush(),
        );
        flushed.unwrap();
        assert_eq!(a.unwrap(), present);
        assert_eq!(b.unwrap(), present);
        assert!(c.unwrap().is_empty());
        assert_eq!(delegate.read_batches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn full_read_map_dispatches_without_flush() {
        let (cs, delegate, store) = remote(2);
        let c1 = Chunk::new(&b"one"[..]);
        let c2 = Chunk::new(&b"two"[..]);
        cs.put(c1.clone());
        cs.put(c2.clone());

        let (a, b) = tokio::join!(store.get(c1.hash()), store.get(c2.hash()));
        assert_eq!(a.unwrap(), c1);
        assert_eq!(b.unwrap(), c2);
        assert_eq!(delegate.read_batches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn writes_drain_in_schedule_order() {
        let (cs, delegate, store) = remote(8);
        let chunks: Vec<Chunk> =
            (0u32..5).map(|i| Chunk::new(i.to_be_bytes().to_vec())).collect();
        for c in &chunks {
            store.schedule_put(c.clone(), HashSet::new()).unwrap();
        }
        store.flush().await.unwrap();
        let order: Vec<Hash> = chunks.iter().map(Chunk::hash).collect();
        assert_eq!(*delegate.written.lock(), order);
        for c in &chunks {
            assert!(cs.has(&c.hash()));
        }
    }

    #[tokio::test]
    async fn duplicate_put_is_deduped() {
        let (_cs, delegate, store) = remote(8);
        let c = Chunk::new(&b"dup"[..]);
        store.schedule_put(c.clone(), HashSet::new()).unwrap();
        store.schedule_put(c.clone(), HashSet::new()).unwrap();
        store.flush().await.unwrap();
        assert_eq!(*delegate.written.lock(), vec![c.hash()]);
        assert_eq!(delegate.write_batches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hints_are_cleared_per_range() {
        let (_cs, delegate, store) = remote(8);
        let hint1 = Hash::of(b"hint1");
        let hint2 = Hash::of(b"hint2");
        store
            .schedule_put(Chunk::new(&b"first"[..]), HashSet::from([hint1]))
            .unwrap();
        store.flush().await.unwrap();
        store
            .schedule_put(Chunk::new(&b"second"[..]), HashSet::from([hint2]))
            .unwrap();
        store.flush().await.unwrap();
        let seen = delegate.hints_seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], HashSet::from([hint1]));
        assert_eq!(seen[1], HashSet::from([hint2]));
    }

    #[tokio::test]
    async fn puts_are_durable_before_update_root() {
        let (cs, _delegate, store) = remote(8);
        let a = Chunk::new(&b"a"[..]);
        let b = Chunk::new(&b"b"[..]);
        store.schedule_put(a.clone(), HashSet::new()).unwrap();
        store.schedule_put(b.clone(), HashSet::new()).unwrap();
        store.flush().await.unwrap();
        assert!(cs.has(&a.hash()) && cs.has(&b.hash()));
        assert!(store.update_root(a.hash(), Hash::default()).await.unwrap());
        assert_eq!(store.get_root().await.unwrap(), a.hash());
        // Losing CAS reports false, not an error.
        assert!(!store.update_root(b.hash(), Hash::default()).await.unwrap());
    }

    #[tokio::test]
    async fn failed_write_is_reported_then_retried() {
        let (cs, delegate, store) = remote(8);
        let c = Chunk::new(&b"retry-me"[..]);
        delegate.fail_next_write.store(true, Ordering::SeqCst);
        store.schedule_put(c.clone(), HashSet::new()).unwrap();
        assert_matches!(store.flush().await, Err(StoreError::Transport(_)));
        assert!(!cs.has(&c.hash()));
        // The chunk stayed in the cache; the next flush retries the window.
        store.flush().await.unwrap();
        assert!(cs.has(&c.hash()));
        assert_eq!(*delegate.written.lock(), vec![c.hash()]);
    }

    #[tokio::test]
    async fn close_rejects_further_operations() {
        let (_cs, _delegate, store) = remote(8);
        let c = Chunk::new(&b"last"[..]);
        store.schedule_put(c.clone(), HashSet::new()).unwrap();
        store.close().await.unwrap();
        assert_matches!(store.get(c.hash()).await, Err(StoreError::Closed));
        assert_matches!(
            store.schedule_put(Chunk::new(&b"nope"[..]), HashSet::new()),
            Err(StoreError::Closed)
        );
        assert_matches!(store.get_root().await, Err(StoreError::Closed));
        // Closing again is a no-op.
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_flushes_pending_writes() {
        let (cs, _delegate, store) = remote(8);
        let c = Chunk::new(&b"flushed-on-close"[..]);
        store.schedule_put(c.clone(), HashSet::new()).unwrap();
        store.close().await.unwrap();
        assert!(cs.has(&c.hash()));
    }
}
