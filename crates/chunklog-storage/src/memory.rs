//! In-memory blob store with failure injection, for tests.

use crate::store::{ChunkStore, ChunkStoreError, ChunkStoreResult};
use async_trait::async_trait;
use bytes::Bytes;
use chunklog_common::LogId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BlobKey {
    Chunk(LogId, u64),
    Index(LogId, u64),
}

/// Blob store backed by a `HashMap`
#[derive(Default)]
pub struct MemoryChunkStore {
    blobs: RwLock<HashMap<BlobKey, Bytes>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read fail until reset
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every write fail until reset
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Whether a chunk blob exists
    pub fn contains_chunk(&self, log_id: LogId, offset: u64) -> bool {
        self.blobs
            .read()
            .contains_key(&BlobKey::Chunk(log_id, offset))
    }

    /// Raw chunk blob, bypassing failure injection
    pub fn chunk_blob(&self, log_id: LogId, offset: u64) -> Option<Bytes> {
        self.blobs
            .read()
            .get(&BlobKey::Chunk(log_id, offset))
            .cloned()
    }

    /// Overwrite a chunk blob with arbitrary bytes
    pub fn put_chunk_blob(&self, log_id: LogId, offset: u64, data: Bytes) {
        self.blobs
            .write()
            .insert(BlobKey::Chunk(log_id, offset), data);
    }

    /// Number of index blobs stored for a log
    pub fn index_count(&self, log_id: LogId) -> usize {
        self.blobs
            .read()
            .keys()
            .filter(|k| matches!(k, BlobKey::Index(id, _) if *id == log_id))
            .count()
    }

    fn check(&self, flag: &AtomicBool, op: &str) -> ChunkStoreResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(ChunkStoreError::Unavailable(format!("injected {op} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn read_chunk(&self, log_id: LogId, offset: u64) -> ChunkStoreResult<Option<Bytes>> {
        self.check(&self.fail_reads, "read")?;
        Ok(self.chunk_blob(log_id, offset))
    }

    async fn write_chunk(&self, log_id: LogId, offset: u64, data: Bytes) -> ChunkStoreResult<()> {
        self.check(&self.fail_writes, "write")?;
        self.put_chunk_blob(log_id, offset, data);
        Ok(())
    }

    async fn read_index(&self, log_id: LogId, length: u64) -> ChunkStoreResult<Option<Bytes>> {
        self.check(&self.fail_reads, "read")?;
        Ok(self
            .blobs
            .read()
            .get(&BlobKey::Index(log_id, length))
            .cloned())
    }

    async fn write_index(&self, log_id: LogId, length: u64, data: Bytes) -> ChunkStoreResult<()> {
        self.check(&self.fail_writes, "write")?;
        self.blobs
            .write()
            .insert(BlobKey::Index(log_id, length), data);
        Ok(())
    }
}
