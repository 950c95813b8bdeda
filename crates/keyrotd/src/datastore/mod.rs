//! Shared key-value datastore abstraction.
//!
//! Every control-plane node talks to the same datastore. It holds the
//! encrypted records the re-encryption pass rewrites and the generation
//! marker nodes converge on. Replication is the backend's business.
//!
//! - [`MemoryDatastore`]: process-local, used by tests and single-node runs.
//! - [`DirDatastore`]: one file per key in a directory every node mounts.

pub mod file;
pub mod memory;

pub use file::DirDatastore;
pub use memory::MemoryDatastore;

use async_trait::async_trait;
use common::EncryptionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("datastore I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid datastore key: {0}")]
    InvalidKey(String),
}

impl From<DatastoreError> for EncryptionError {
    fn from(e: DatastoreError) -> Self {
        EncryptionError::PersistenceFailure(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DatastoreError>;

/// One stored key and its raw value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: String,
    pub value: Vec<u8>,
}

#[async_trait]
pub trait Datastore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write `value` under `key`. Readers observe either the old or the new
    /// value, never a mix.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Write `value` under `key` only if the stored value is still
    /// `expected`. Returns `false`, leaving the record alone, when another
    /// writer replaced or removed it first.
    async fn put_if(&self, key: &str, expected: &[u8], value: Vec<u8>) -> Result<bool>;

    /// Up to `limit` records whose key starts with `prefix`, in key order,
    /// strictly after `start_after` when given.
    async fn list(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Record>>;
}

/// Shared-check for keys accepted by every backend.
pub(crate) fn check_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(DatastoreError::InvalidKey("empty key".into()));
    }
    Ok(())
}
