use crate::storage::{CompressionKind, ContentStore, StorageError, StorageResult};
use async_trait::async_trait;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Filesystem-backed Content Store.
///
/// Blobs are addressed by UUID and fanned out two levels deep
/// (`<root>/<uuid[0:2]>/<uuid[2:4]>/<uuid>`) to keep any single directory
/// from holding an unbounded number of entries.
#[derive(Debug, Clone)]
pub struct FilesystemContentStore {
    root_path: PathBuf,
    compression: CompressionKind,
}

impl FilesystemContentStore {
    pub fn new<P: AsRef<Path>>(root_path: P, compression: CompressionKind) -> StorageResult<Self> {
        let root_path = root_path.as_ref().to_path_buf();
        if !root_path.exists() {
            std::fs::create_dir_all(&root_path)?;
        }
        Ok(Self {
            root_path,
            compression,
        })
    }

    pub fn with_default_path() -> StorageResult<Self> {
        Self::new("./tmp", CompressionKind::None)
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        let hex = id.simple().to_string();
        self.root_path
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(hex)
    }

    fn compress(&self, bytes: &[u8]) -> StorageResult<Vec<u8>> {
        match self.compression {
            CompressionKind::None => Ok(bytes.to_vec()),
            CompressionKind::Zlib => {
                let mut encoder =
                    flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder
                    .write_all(bytes)
                    .map_err(|e| StorageError::CannotWriteFile(e.to_string()))?;
                encoder
                    .finish()
                    .map_err(|e| StorageError::CannotWriteFile(e.to_string()))
            }
        }
    }

    fn decompress(&self, bytes: Vec<u8>) -> StorageResult<Vec<u8>> {
        match self.compression {
            CompressionKind::None => Ok(bytes),
            CompressionKind::Zlib => {
                let mut decoder = flate2::read::ZlibDecoder::new(bytes.as_slice());
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|_| StorageError::BadFileFormat("zlib decode failed".to_string()))?;
                Ok(out)
            }
        }
    }
}

#[async_trait]
impl ContentStore for FilesystemContentStore {
    async fn create(&self, bytes: &[u8]) -> StorageResult<Uuid> {
        let id = Uuid::new_v4();
        let path = self.path_for(id);
        let payload = self.compress(bytes)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, payload)
            .await
            .map_err(|e| StorageError::CannotWriteFile(e.to_string()))?;
        Ok(id)
    }

    async fn read(&self, id: Uuid) -> StorageResult<Vec<u8>> {
        let path = self.path_for(id);
        let raw = tokio::fs::read(&path)
            .await
            .map_err(|_| StorageError::InexistentFile(id))?;
        self.decompress(raw)
    }

    async fn remove(&self, id: Uuid) -> StorageResult<()> {
        let path = self.path_for(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StorageError::Io(e)),
        }
        // Best-effort cleanup of now-empty fan-out directories. Leaving a
        // stray empty directory behind is harmless; failing the delete
        // because rmdir raced with a sibling write is not acceptable.
        if let Some(leaf_dir) = path.parent() {
            let _ = tokio::fs::remove_dir(leaf_dir).await;
            if let Some(top_dir) = leaf_dir.parent() {
                let _ = tokio::fs::remove_dir(top_dir).await;
            }
        }
        Ok(())
    }

    async fn size(&self, id: Uuid) -> StorageResult<u64> {
        let path = self.path_for(id);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| StorageError::InexistentFile(id))?;
        Ok(meta.len())
    }

    async fn list_all(&self) -> StorageResult<HashSet<Uuid>> {
        let root = self.root_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut out = HashSet::new();
            for entry in walkdir::WalkDir::new(&root)
                .min_depth(3)
                .max_depth(3)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(id) = Uuid::parse_str(name) {
                        out.insert(id);
                    }
                }
            }
            out
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e.to_string())))
    }

    fn capacity(&self) -> StorageResult<u64> {
        fs2::total_space(&self.root_path).map_err(StorageError::Io)
    }

    fn available(&self) -> StorageResult<u64> {
        fs2::available_space(&self.root_path).map_err(StorageError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn stores_and_reads_back_uncompressed() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemContentStore::new(dir.path(), CompressionKind::None).unwrap();

        let id = store.create(b"orthanc").await.unwrap();
        assert_eq!(store.read(id).await.unwrap(), b"orthanc");
        assert_eq!(store.size(id).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn stores_and_reads_back_compressed() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemContentStore::new(dir.path(), CompressionKind::Zlib).unwrap();

        let payload = b"a repeated dicom payload ".repeat(50);
        let id = store.create(&payload).await.unwrap();
        assert_eq!(store.read(id).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn fans_blobs_out_two_levels_deep() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemContentStore::new(dir.path(), CompressionKind::None).unwrap();
        let id = store.create(b"x").await.unwrap();
        let hex = id.simple().to_string();
        let expected = dir.path().join(&hex[0..2]).join(&hex[2..4]).join(&hex);
        assert!(expected.exists());
    }

    #[tokio::test]
    async fn reading_missing_blob_is_inexistent_file() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemContentStore::new(dir.path(), CompressionKind::None).unwrap();
        let err = store.read(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StorageError::InexistentFile(_)));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemContentStore::new(dir.path(), CompressionKind::None).unwrap();
        let id = store.create(b"gone").await.unwrap();
        store.remove(id).await.unwrap();
        store.remove(id).await.unwrap();
        assert!(store.read(id).await.is_err());
    }

    #[tokio::test]
    async fn list_all_finds_every_stored_blob() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemContentStore::new(dir.path(), CompressionKind::None).unwrap();
        let a = store.create(b"a").await.unwrap();
        let b = store.create(b"b").await.unwrap();

        let all = store.list_all().await.unwrap();
        assert!(all.contains(&a));
        assert!(all.contains(&b));
        assert_eq!(all.len(), 2);
    }
}
