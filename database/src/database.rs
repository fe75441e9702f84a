//! The database: a value store plus the persisted dataset map.

use crate::commit;
use crate::dataset::{validate_dataset_id, Dataset};
use crate::Error;
use noms_primitives::hash::Hash;
use noms_primitives::types;
use noms_primitives::value::{Map, Ref, Struct, Value};
use noms_primitives::version;
use noms_store::batch_store::{BatchStore, BatchStoreAdaptor};
use noms_store::chunk_store::ChunkStore;
use noms_store::value_store::ValueStore;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// Options for [`Database::commit`].
#[derive(Default)]
pub struct CommitOptions {
    /// Use this parent set instead of the dataset's head. Preserved across
    /// CAS retries; a rebase adds the new server head alongside them.
    pub parents: Option<Vec<Ref>>,
    /// Commit metadata; the empty struct when absent.
    pub meta: Option<Struct>,
}

/// A decentralized value database: content-addressed chunks below, named
/// dataset heads on top. Cloning shares the underlying value store.
#[derive(Clone)]
pub struct Database {
    values: Arc<ValueStore>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Opens a database over a batch store, rejecting stores written by a
    /// different major format version.
    pub fn new(batch_store: Arc<dyn BatchStore>) -> Result<Self, Error> {
        version::check(&batch_store.version())?;
        Ok(Database { values: Arc::new(ValueStore::new(batch_store)) })
    }

    /// Opens a database directly over a synchronous local chunk store.
    pub fn local(store: Arc<dyn ChunkStore>) -> Result<Self, Error> {
        Database::new(Arc::new(BatchStoreAdaptor::new(store)))
    }

    pub fn values(&self) -> &ValueStore {
        &self.values
    }

    /// Materializes the dataset map behind the current root. The empty root
    /// hash means a fresh store: the empty map.
    pub async fn datasets(&self) -> Result<Map, Error> {
        let root = self.values.get_root().await?;
        self.datasets_at(root).await
    }

    async fn datasets_at(&self, root: Hash) -> Result<Map, Error> {
        if root.is_empty() {
            return Ok(Map::new(vec![]));
        }
        match self.values.read_value(root).await? {
            Some(Value::Map(map)) => Ok(map),
            Some(other) => {
                Err(Error::Corrupt(format!("root is a {:?}, not a map", other.type_of().kind())))
            }
            None => Err(Error::Corrupt(format!("root chunk {root} is missing"))),
        }
    }

    /// Returns the dataset named `id`, with its head resolved from the
    /// current dataset map.
    pub async fn get_dataset(&self, id: &str) -> Result<Dataset, Error> {
        validate_dataset_id(id)?;
        let head = self.head_of(id).await?;
        Ok(Dataset::new(self.clone(), id.to_string(), head))
    }

    async fn head_of(&self, id: &str) -> Result<Option<Ref>, Error> {
        let datasets = self.datasets().await?;
        head_in(&datasets, id)
    }

    /// Commits `value` to `ds` and returns a dataset pinned to the new head.
    ///
    /// The new commit's parents are `opts.parents` when given, otherwise the
    /// dataset's head (empty for a root commit). When a concurrent committer
    /// moved the head, the commit is rebased onto the server head if that
    /// head descends from the local parent; otherwise [`Error::MergeNeeded`]
    /// is returned.
    pub async fn commit(
        &self,
        ds: &Dataset,
        value: Value,
        opts: CommitOptions,
    ) -> Result<Dataset, Error> {
        let id = ds.id();
        // Rebase cursor for the implicit-parent case.
        let mut parent = ds.head_ref().cloned();
        // Server head appended to explicit parents by a rebase.
        let mut rebase_extra: Option<Ref> = None;
        loop {
            let parents = match &opts.parents {
                Some(explicit) => {
                    let mut parents = explicit.clone();
                    if let Some(extra) = &rebase_extra {
                        if !parents.iter().any(|p| p.target() == extra.target()) {
                            parents.push(extra.clone());
                        }
                    }
                    parents
                }
                None => parent.iter().cloned().collect(),
            };
            let meta = opts.meta.clone().unwrap_or_else(Struct::empty);
            let (commit_struct, commit_type) =
                commit::new_commit(value.clone(), parents.clone(), meta)?;
            // Guard the write: only legal commit types may become a head.
            if !types::is_commit_type(commit_type) {
                return Err(Error::TypeMismatch(format!(
                    "commit type for dataset {id:?} is malformed"
                )));
            }

            let root = self.values.get_root().await?;
            let datasets = self.datasets_at(root).await?;
            if let Some(current) = head_in(&datasets, id)? {
                let covered = parents.iter().any(|p| p.target() == current.target());
                if !covered {
                    // The head moved underneath us. Fast-forwardable only if
                    // the server head descends from our parent.
                    let fast_forward = match &parent {
                        Some(local) => self.descends_from(&current, local).await?,
                        None => false,
                    };
                    if !fast_forward {
                        return Err(Error::MergeNeeded);
                    }
                    tracing::debug!(
                        target: "database",
                        dataset = id,
                        server_head = %current.target(),
                        "rebasing commit onto moved head"
                    );
                    if opts.parents.is_some() {
                        rebase_extra = Some(current);
                    } else {
                        parent = Some(current);
                    }
                    continue;
                }
            }

            let written = self.values.write_value(&Value::Struct(commit_struct))?;
            let new_head = Ref::new(written.target(), commit_type, written.height());
            let updated =
                datasets.set(Value::String(id.to_string()), Value::Ref(new_head.clone()));
            let map_ref = self.values.write_value(&Value::Map(updated))?;
            // The root must never get ahead of chunk durability.
            self.values.flush().await?;
            if self.values.update_root(map_ref.target(), root).await? {
                tracing::debug!(
                    target: "database",
                    dataset = id,
                    head = %new_head.target(),
                    "commit accepted"
                );
                return Ok(Dataset::new(self.clone(), id.to_string(), Some(new_head)));
            }
            // Lost the root race; the next attempt re-reads the map and
            // rebases (or fails) through the head check above.
            tracing::debug!(target: "database", dataset = id, "root CAS lost, retrying");
        }
    }

    /// Whether `head` is `ancestor` or a descendant of it, walking parent
    /// refs. Ref heights bound the walk: an ancestor cannot hide below a
    /// shorter DAG.
    async fn descends_from(&self, head: &Ref, ancestor: &Ref) -> Result<bool, Error> {
        let mut queue = VecDeque::from([head.clone()]);
        let mut seen = HashSet::new();
        while let Some(r) = queue.pop_front() {
            if r.target() == ancestor.target() {
                return Ok(true);
            }
            if r.height() <= ancestor.height() {
                continue;
            }
            let value = self
                .values
                .read_value(r.target())
                .await?
                .ok_or_else(|| Error::Corrupt(format!("missing commit {}", r.target())))?;
            let commit = commit::as_commit(value)?;
            for parent in commit::parents(&commit) {
                if seen.insert(parent.target()) {
                    queue.push_back(parent);
                }
            }
        }
        Ok(false)
    }

    /// Removes `ds` from the dataset map (a tombstone commit). Returns a
    /// dataset with no head. Deleting an absent dataset is a no-op.
    pub async fn delete(&self, ds: &Dataset) -> Result<Dataset, Error> {
        loop {
            let root = self.values.get_root().await?;
            let datasets = self.datasets_at(root).await?;
            let key = Value::String(ds.id().to_string());
            if datasets.get(&key).is_none() {
                return Ok(Dataset::new(self.clone(), ds.id().to_string(), None));
            }
            let updated = datasets.remove(&key);
            let map_ref = self.values.write_value(&Value::Map(updated))?;
            self.values.flush().await?;
            if self.values.update_root(map_ref.target(), root).await? {
                tracing::debug!(target: "database", dataset = ds.id(), "dataset deleted");
                return Ok(Dataset::new(self.clone(), ds.id().to_string(), None));
            }
        }
    }

    /// Closes the underlying batch store.
    pub async fn close(&self) -> Result<(), Error> {
        Ok(self.values.close().await?)
    }
}

fn head_in(datasets: &Map, id: &str) -> Result<Option<Ref>, Error> {
    match datasets.get(&Value::String(id.to_string())) {
        Some(Value::Ref(r)) => Ok(Some(r.clone())),
        Some(other) => Err(Error::Corrupt(format!(
            "dataset {id:?} maps to a {:?}, not a ref",
            other.type_of().kind()
        ))),
        None => Ok(None),
    }
}
