//! Chunk persistence for noms.
//!
//! The layering, bottom up: a [`chunk_store::ChunkStore`] holds chunks and a
//! root pointer; a [`batch_store::BatchStore`] fronts one with batched,
//! promise-based I/O (either the trivial [`batch_store::BatchStoreAdaptor`]
//! or the remote [`remote::RemoteBatchStore`], which coalesces reads and
//! drains writes through an [`put_cache::OrderedPutCache`]); a
//! [`value_store::ValueStore`] translates between values and chunks on top.

pub mod batch_store;
pub mod chunk_store;
pub mod put_cache;
pub mod remote;
pub mod serializer;
pub mod value_store;

use noms_primitives::codec::DecodeError;
use noms_primitives::version::VersionMismatch;

/// Errors surfaced by the store stack. Cloneable so that one transport
/// failure can be fanned out to every waiter of a batch.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Operation on a store that has been closed.
    #[error("store is closed")]
    Closed,
    /// The remote delegate rejected a read or write batch.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("i/o error: {0}")]
    Io(String),
    /// The ordered put cache was asked for entries it no longer holds.
    #[error("ordered put cache: {0}")]
    Cache(String),
    #[error(transparent)]
    Version(#[from] VersionMismatch),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}
