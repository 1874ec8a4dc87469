//! Filesystem blob store
//!
//! ```text
//! {root}/
//! └── {log_id}/
//!     ├── chunk_{offset:016x}
//!     └── index_{length:016x}
//! ```
//!
//! Writes go to a uniquely named temporary file which is then renamed over
//! the destination, so readers never observe a partially written blob.

use crate::store::{ChunkStore, ChunkStoreResult};
use async_trait::async_trait;
use bytes::Bytes;
use chunklog_common::LogId;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Blob store rooted at a local directory
pub struct FsChunkStore {
    root: PathBuf,
}

impl FsChunkStore {
    /// Create a store rooted at `root`; the directory is created lazily
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn chunk_path(&self, log_id: LogId, offset: u64) -> PathBuf {
        self.root
            .join(log_id.to_string())
            .join(format!("chunk_{offset:016x}"))
    }

    fn index_path(&self, log_id: LogId, length: u64) -> PathBuf {
        self.root
            .join(log_id.to_string())
            .join(format!("index_{length:016x}"))
    }

    async fn read_blob(path: &Path) -> ChunkStoreResult<Option<Bytes>> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_blob(path: &Path, data: &[u8]) -> ChunkStoreResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!("Wrote {} bytes to {:?}", data.len(), path);
        Ok(())
    }
}

#[async_trait]
impl ChunkStore for FsChunkStore {
    async fn read_chunk(&self, log_id: LogId, offset: u64) -> ChunkStoreResult<Option<Bytes>> {
        Self::read_blob(&self.chunk_path(log_id, offset)).await
    }

    async fn write_chunk(&self, log_id: LogId, offset: u64, data: Bytes) -> ChunkStoreResult<()> {
        Self::write_blob(&self.chunk_path(log_id, offset), &data).await
    }

    async fn read_index(&self, log_id: LogId, length: u64) -> ChunkStoreResult<Option<Bytes>> {
        Self::read_blob(&self.index_path(log_id, length)).await
    }

    async fn write_index(&self, log_id: LogId, length: u64, data: Bytes) -> ChunkStoreResult<()> {
        Self::write_blob(&self.index_path(log_id, length), &data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let store = FsChunkStore::new(dir.path());
        let log_id = LogId::new();

        assert!(store.read_chunk(log_id, 0).await.unwrap().is_none());
        store
            .write_chunk(log_id, 0, Bytes::from_static(b"payload"))
            .await
            .unwrap();
        store
            .write_chunk(log_id, 0, Bytes::from_static(b"payload v2"))
            .await
            .unwrap();
        let data = store.read_chunk(log_id, 0).await.unwrap().unwrap();
        assert_eq!(&data[..], b"payload v2");

        store
            .write_index(log_id, 4096, Bytes::from_static(b"idx"))
            .await
            .unwrap();
        assert!(store.read_index(log_id, 4096).await.unwrap().is_some());
        assert!(store.read_index(log_id, 1).await.unwrap().is_none());

        // No temporary files left behind
        let entries: Vec<_> = std::fs::read_dir(dir.path().join(log_id.to_string()))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert!(entries.iter().all(|name| !name.contains("tmp")));
        assert_eq!(entries.len(), 2);
    }
}
