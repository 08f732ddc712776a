//! Keyed artifact storage.
//!
//! Writers get a sink that only becomes visible under its key on `commit`;
//! `abort` (or dropping an uncommitted sink) leaves nothing resolvable.

mod local;

pub use local::LocalFileStorage;

use std::path::PathBuf;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error("no object stored under key: {0}")]
    NotFound(String),

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Incremental writer for one artifact.
#[async_trait]
pub trait ExportSink: Send {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), StorageError>;

    /// Publish the artifact under its key and return its size in bytes.
    async fn commit(self: Box<Self>) -> Result<u64, StorageError>;

    /// Discard everything written so far.
    async fn abort(self: Box<Self>) -> Result<(), StorageError>;
}

#[async_trait]
pub trait FileStorage: Send + Sync {
    async fn open_for_write(&self, key: &str) -> Result<Box<dyn ExportSink>, StorageError>;

    /// Local path of a committed artifact.
    async fn resolve(&self, key: &str) -> Result<PathBuf, StorageError>;

    /// Idempotent: deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
}

/// Keys are relative, `/`-separated and limited to `[A-Za-z0-9._-]` segments.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() || key.starts_with('/') || key.ends_with('/') {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    for segment in key.split('/') {
        let ok = !segment.is_empty()
            && segment != "."
            && segment != ".."
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !ok {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
    }
    Ok(())
}
