//! Named datasets over a noms chunk store.
//!
//! A [`Database`] persists a top-level map from dataset id to a ref of the
//! dataset's head [commit](commit); committing is a root compare-and-set
//! across the batch-store pipeline, with automatic rebase-retry when the CAS
//! is lost to a concurrent committer.

pub mod commit;
pub mod database;
pub mod dataset;
mod errors;

pub use crate::database::{CommitOptions, Database};
pub use crate::dataset::Dataset;
pub use crate::errors::Error;
