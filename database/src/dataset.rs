//! Datasets: named pointers into a database's commit DAG.

use crate::commit::{self, VALUE_FIELD};
use crate::{Database, Error};
use noms_primitives::value::{Ref, Struct, Value};
use once_cell::sync::Lazy;
use regex::Regex;

static DATASET_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9\-_/]+$").expect("dataset id pattern"));

/// Rejects ids outside `[A-Za-z0-9_\-/]+`.
pub fn validate_dataset_id(id: &str) -> Result<(), Error> {
    if DATASET_ID.is_match(id) {
        Ok(())
    } else {
        Err(Error::InvalidDatasetId(id.to_string()))
    }
}

/// An immutable (database, id, head) triple. The head ref is the one
/// observed when the dataset was obtained; a commit returns a fresh dataset
/// pinned to the new head.
#[derive(Clone, Debug)]
pub struct Dataset {
    database: Database,
    id: String,
    head: Option<Ref>,
}

impl Dataset {
    pub(crate) fn new(database: Database, id: String, head: Option<Ref>) -> Self {
        Dataset { database, id, head }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// The head commit ref this dataset was resolved at, if the dataset
    /// existed then.
    pub fn head_ref(&self) -> Option<&Ref> {
        self.head.as_ref()
    }

    /// Dereferences the head commit through the value store. None for a
    /// dataset that does not exist.
    pub async fn head(&self) -> Result<Option<Struct>, Error> {
        let Some(head) = &self.head else {
            return Ok(None);
        };
        let value = self
            .database
            .values()
            .read_value(head.target())
            .await?
            .ok_or_else(|| Error::Corrupt(format!("missing head commit {}", head.target())))?;
        commit::as_commit(value).map(Some)
    }

    /// The `value` field of the head commit, if any.
    pub async fn head_value(&self) -> Result<Option<Value>, Error> {
        Ok(self.head().await?.and_then(|c| c.get(VALUE_FIELD).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn id_grammar() {
        for ok in ["foo", "a/b", "a-b_c/123", "0", "A_Z"] {
            assert_matches!(validate_dataset_id(ok), Ok(()), "{ok:?} should be accepted");
        }
        for bad in [" ", "", "a ", " a", "$", "#", ":", "\n", "💩", "a.b"] {
            assert_matches!(
                validate_dataset_id(bad),
                Err(Error::InvalidDatasetId(_)),
                "{bad:?} should be rejected"
            );
        }
    }
}
