//! Data format versioning.
//!
//! Every store carries the format version it was written with. A database
//! checks the tag explicitly when it opens a store; stores written by a
//! different major version are rejected.

/// Version of the chunk and value format this crate reads and writes.
pub const FORMAT_VERSION: &str = "7.2";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("store is format version {store}, this client supports {supported}")]
pub struct VersionMismatch {
    pub store: String,
    pub supported: String,
}

/// Accepts `tag` iff its major component matches ours.
pub fn check(tag: &str) -> Result<(), VersionMismatch> {
    if major(tag) == major(FORMAT_VERSION) {
        Ok(())
    } else {
        Err(VersionMismatch { store: tag.to_string(), supported: FORMAT_VERSION.to_string() })
    }
}

fn major(tag: &str) -> &str {
    tag.split('.').next().unwrap_or(tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_major_accepted() {
        assert!(check("7.2").is_ok());
        assert!(check("7.9").is_ok());
    }

    #[test]
    fn different_major_rejected() {
        let err = check("6.0").unwrap_err();
        assert_eq!(err.store, "6.0");
        assert_eq!(err.supported, FORMAT_VERSION);
        assert!(check("8.1").is_err());
    }
}
