//! Durable blob store interface.

use async_trait::async_trait;
use bytes::Bytes;
use chunklog_common::LogId;

/// Error type for chunk store operations
#[derive(Debug, thiserror::Error)]
pub enum ChunkStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<ChunkStoreError> for chunklog_common::Error {
    fn from(e: ChunkStoreError) -> Self {
        match e {
            ChunkStoreError::Io(io) => Self::Io(io),
            ChunkStoreError::Unavailable(msg) => Self::Storage(msg),
        }
    }
}

pub type ChunkStoreResult<T> = Result<T, ChunkStoreError>;

/// Keyed blob storage for chunk payloads and search indexes
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Read the payload of the chunk starting at `offset`
    async fn read_chunk(&self, log_id: LogId, offset: u64) -> ChunkStoreResult<Option<Bytes>>;

    /// Write (or overwrite) the payload of the chunk starting at `offset`
    async fn write_chunk(&self, log_id: LogId, offset: u64, data: Bytes) -> ChunkStoreResult<()>;

    /// Read the index covering the first `length` bytes of the log
    async fn read_index(&self, log_id: LogId, length: u64) -> ChunkStoreResult<Option<Bytes>>;

    /// Write the index covering the first `length` bytes of the log
    async fn write_index(&self, log_id: LogId, length: u64, data: Bytes) -> ChunkStoreResult<()>;
}
