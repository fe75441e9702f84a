use noms_primitives::version::VersionMismatch;
use noms_store::StoreError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Dataset ids must match `[A-Za-z0-9_\-/]+`.
    #[error("invalid dataset id {0:?}")]
    InvalidDatasetId(String),
    /// The dataset head moved underneath a commit and the local parent is
    /// not an ancestor of the new head. The caller must merge and retry.
    #[error("dataset head changed; merge needed")]
    MergeNeeded,
    /// A value that is not a legal commit where one is required.
    #[error("not a commit: {0}")]
    TypeMismatch(String),
    /// The root or a chunk it references decoded to something unexpected.
    #[error("database is corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Version(#[from] VersionMismatch),
}
