//! Content Store (CS): a content-addressed blob store on a filesystem
//! tree. Unique opaque UUIDs map to compressed-or-raw byte blobs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

pub mod filesystem;

pub use filesystem::FilesystemContentStore;

/// Errors raised by the Content Store, matching the taxonomy `SX` and the
/// REST facade translate from.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("inexistent file: {0}")]
    InexistentFile(Uuid),

    #[error("bad file format: {0}")]
    BadFileFormat(String),

    #[error("cannot write file: {0}")]
    CannotWriteFile(String),

    #[error("storage is full")]
    FullStorage,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Compression applied to a blob before it is written to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompressionKind {
    #[default]
    None,
    Zlib,
}

/// The Content Store contract. A single filesystem-backed implementation
/// (`FilesystemContentStore`) satisfies it; the trait exists so `ServerContext`
/// can be exercised against an in-memory double in tests without touching
/// disk.
#[async_trait]
pub trait ContentStore: Send + Sync + std::fmt::Debug {
    /// Persist `bytes` under a fresh UUID, compressing first if configured.
    async fn create(&self, bytes: &[u8]) -> StorageResult<Uuid>;

    /// Read back the blob at `id`, transparently decompressing if needed.
    async fn read(&self, id: Uuid) -> StorageResult<Vec<u8>>;

    /// Delete the blob at `id`. Best-effort removes now-empty parent
    /// directories; a missing file is not an error.
    async fn remove(&self, id: Uuid) -> StorageResult<()>;

    /// Size on disk (post-compression) of the blob at `id`.
    async fn size(&self, id: Uuid) -> StorageResult<u64>;

    /// Every well-formed UUID blob currently stored.
    async fn list_all(&self) -> StorageResult<HashSet<Uuid>>;

    /// Total capacity of the underlying filesystem, in bytes.
    fn capacity(&self) -> StorageResult<u64>;

    /// Bytes currently available on the underlying filesystem.
    fn available(&self) -> StorageResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn roundtrips_through_the_trait_object() {
        let dir = TempDir::new().unwrap();
        let store: std::sync::Arc<dyn ContentStore> = std::sync::Arc::new(
            FilesystemContentStore::new(dir.path(), CompressionKind::None).unwrap(),
        );
        let id = store.create(b"hello").await.unwrap();
        assert_eq!(store.read(id).await.unwrap(), b"hello");
    }
}
