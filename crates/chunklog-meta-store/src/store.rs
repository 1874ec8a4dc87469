//! Metadata store interface and optimistic-concurrency mutations.

use async_trait::async_trait;
use chunklog_common::{LogFile, LogId};

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("log already exists: {0}")]
    AlreadyExists(LogId),
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<MetaStoreError> for chunklog_common::Error {
    fn from(e: MetaStoreError) -> Self {
        match e {
            MetaStoreError::Io(io) => Self::Io(io),
            MetaStoreError::Bincode(b) => Self::Serialization(b.to_string()),
            other => Self::Metadata(other.to_string()),
        }
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

/// Final extent of a chunk being sealed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCompletion {
    /// Offset identifying the chunk
    pub offset: u64,
    /// Final byte length
    pub length: u64,
    /// Final line count
    pub line_count: u32,
}

/// Durable store for log metadata records
///
/// Implementations only need to provide the primitive conditional update;
/// the typed mutations are derived from it.
#[async_trait]
pub trait LogMetadataStore: Send + Sync {
    /// Insert a new log record. Fails if the id is already taken.
    async fn create_log(&self, log: LogFile) -> MetaStoreResult<LogFile>;

    /// Fetch the current record for a log
    async fn get_log(&self, id: LogId) -> MetaStoreResult<Option<LogFile>>;

    /// List every log record
    async fn list_logs(&self) -> MetaStoreResult<Vec<LogFile>>;

    /// Replace `current` with `updated` if nobody else has written since
    /// `current` was read.
    ///
    /// The stored record gets version `current.version + 1`. Returns
    /// `Ok(None)` when the stored version no longer matches.
    async fn try_replace(&self, current: &LogFile, updated: LogFile)
    -> MetaStoreResult<Option<LogFile>>;

    /// Add an open chunk at `offset`, sealing the current last chunk at
    /// that boundary.
    async fn try_add_chunk(
        &self,
        current: &LogFile,
        offset: u64,
        line_index: u32,
        server: Option<String>,
    ) -> MetaStoreResult<Option<LogFile>> {
        let mut updated = current.clone();
        if !updated.add_chunk(offset, line_index, server) {
            return Ok(Some(current.clone()));
        }
        self.try_replace(current, updated).await
    }

    /// Seal open chunks with their final length and line count
    async fn try_complete_chunks(
        &self,
        current: &LogFile,
        completions: &[ChunkCompletion],
    ) -> MetaStoreResult<Option<LogFile>> {
        let mut updated = current.clone();
        let mut changed = false;
        for completion in completions {
            changed |=
                updated.complete_chunk(completion.offset, completion.length, completion.line_count);
        }
        if !changed {
            return Ok(Some(current.clone()));
        }
        self.try_replace(current, updated).await
    }

    /// Record the byte length now covered by the persisted search index
    async fn try_update_index(
        &self,
        current: &LogFile,
        index_length: u64,
    ) -> MetaStoreResult<Option<LogFile>> {
        let mut updated = current.clone();
        if !updated.set_index_length(index_length) {
            return Ok(Some(current.clone()));
        }
        self.try_replace(current, updated).await
    }

    /// Drop the persisted index length
    async fn try_reset_index(&self, current: &LogFile) -> MetaStoreResult<Option<LogFile>> {
        let mut updated = current.clone();
        if !updated.reset_index() {
            return Ok(Some(current.clone()));
        }
        self.try_replace(current, updated).await
    }
}
