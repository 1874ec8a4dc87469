//! The log engine handle and its metadata plumbing.

use crate::cache::{CacheStats, ChunkKey, WriteBehindCache};
use crate::repair::{self, ExpectedExtent};
use chunklog_common::{EngineConfig, Error, LogFile, LogId, LogKind, LogMetadata, Result};
use chunklog_meta_store::{ChunkCompletion, LogMetadataStore};
use chunklog_storage::{ChunkStore, LogChunkData};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Chunked log storage engine
///
/// Cheap to clone; clones share the metadata store, the chunk store and
/// the write-behind cache.
#[derive(Clone)]
pub struct LogEngine {
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) meta: Arc<dyn LogMetadataStore>,
    pub(crate) chunks: Arc<dyn ChunkStore>,
    pub(crate) cache: Arc<WriteBehindCache>,
    /// Serializes flush passes
    pub(crate) flush_lock: Arc<tokio::sync::Mutex<()>>,
}

impl LogEngine {
    /// Create an engine over the given stores
    pub fn new(
        config: EngineConfig,
        meta: Arc<dyn LogMetadataStore>,
        chunks: Arc<dyn ChunkStore>,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            "Log engine started: max chunk {} bytes, {} lines per sub-chunk, retention {:?}",
            config.max_chunk_length,
            config.max_sub_chunk_lines,
            config.flush_retention()
        );
        Ok(Self {
            config: Arc::new(config),
            meta,
            chunks,
            cache: Arc::new(WriteBehindCache::new()),
            flush_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// Occupancy of the write-behind cache
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub(crate) fn server(&self) -> Option<String> {
        Some(self.config.server_name.clone())
    }

    /// Register a new, empty log for `job_id`
    pub async fn create_log(&self, job_id: &str, kind: LogKind) -> Result<LogFile> {
        let log = LogFile::new(LogId::new(), job_id, kind, self.server());
        let log = self.meta.create_log(log).await?;
        info!("Created log {} for job {}", log.id, job_id);
        Ok(log)
    }

    /// Fetch the metadata record of a log
    pub async fn get_log(&self, log_id: LogId) -> Result<LogFile> {
        self.meta
            .get_log(log_id)
            .await?
            .ok_or(Error::LogNotFound(log_id))
    }

    pub async fn list_logs(&self) -> Result<Vec<LogFile>> {
        Ok(self.meta.list_logs().await?)
    }

    /// Length and line count of the data currently buffered or durable
    pub async fn get_metadata(&self, log_id: LogId) -> Result<LogMetadata> {
        let log = self.get_log(log_id).await?;
        Ok(self.metadata_of(&log).await)
    }

    pub(crate) async fn metadata_of(&self, log: &LogFile) -> LogMetadata {
        let Some(last) = log.last_chunk() else {
            return LogMetadata::default();
        };
        if !last.is_open() {
            return LogMetadata {
                length: last.offset + last.length,
                line_count: log.max_line_index.unwrap_or(last.line_index),
            };
        }
        let key = ChunkKey::new(log.id, last.offset);
        let (length, lines) = match self.cache.extent(&key) {
            Some(extent) => extent,
            None => self
                .read_durable(log.id, last.offset)
                .await
                .map_or((0, 0), |data| (data.length(), data.line_count())),
        };
        LogMetadata {
            length: last.offset + length,
            line_count: last.line_index + lines,
        }
    }

    /// Decode the durable copy of a chunk
    ///
    /// Missing, unreadable and corrupt blobs all read as absent.
    pub(crate) async fn read_durable(&self, log_id: LogId, offset: u64) -> Option<LogChunkData> {
        let blob = match self.chunks.read_chunk(log_id, offset).await {
            Ok(Some(blob)) => blob,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read chunk {} of log {}: {}", offset, log_id, e);
                return None;
            }
        };
        match LogChunkData::decode(&blob) {
            Ok(data) if data.offset == offset => Some(data),
            Ok(data) => {
                warn!(
                    "Chunk blob {} of log {} claims offset {}; ignoring",
                    offset, log_id, data.offset
                );
                None
            }
            Err(e) => {
                warn!("Corrupt chunk {} of log {}: {}", offset, log_id, e);
                None
            }
        }
    }

    /// Payload of chunk `idx`, reconciled with the metadata
    ///
    /// Sealed chunks always come back covering exactly their extent; a
    /// repaired payload that was read from durable storage is written back.
    pub(crate) async fn load_chunk(&self, log: &LogFile, idx: usize) -> Result<LogChunkData> {
        let chunk = log
            .chunks
            .get(idx)
            .ok_or_else(|| Error::internal(format!("chunk {idx} out of range")))?;
        let key = ChunkKey::new(log.id, chunk.offset);

        let (mut data, from_cache) = match self.cache.snapshot(&key) {
            Some(snapshot) => (snapshot.data, true),
            None => match self.read_durable(log.id, chunk.offset).await {
                Some(data) => (data, false),
                None => (LogChunkData::new(chunk.offset, chunk.line_index), false),
            },
        };

        if let Some(end) = log.chunk_end(idx) {
            let expected = ExpectedExtent {
                length: end - chunk.offset,
                line_count: log.chunk_line_count(idx),
            };
            let repaired = repair::reconcile(
                &mut data,
                idx,
                chunk.server.as_deref(),
                log.kind,
                expected,
            );
            // Buffered chunks may still receive late data, so only durable
            // copies are rewritten
            if repaired && !from_cache {
                match data.encode() {
                    Ok(blob) => {
                        if let Err(e) = self.chunks.write_chunk(log.id, chunk.offset, blob).await {
                            warn!("Failed to persist repaired chunk {} of log {}: {}", idx, log.id, e);
                        }
                    }
                    Err(e) => warn!("Failed to encode repaired chunk {}: {}", idx, e),
                }
            }
        }
        Ok(data)
    }

    /// Add an open chunk at `offset`, retrying on concurrent modification
    ///
    /// The buffered predecessor, if any, is sealed at its new boundary.
    pub(crate) async fn add_chunk(
        &self,
        mut current: LogFile,
        offset: u64,
        line_index: u32,
    ) -> Result<LogFile> {
        loop {
            if let Some(updated) = self
                .meta
                .try_add_chunk(&current, offset, line_index, self.server())
                .await?
            {
                if let Ok(idx) = updated.chunks.binary_search_by_key(&offset, |c| c.offset)
                    && idx > 0
                {
                    let prev = &updated.chunks[idx - 1];
                    let key = ChunkKey::new(updated.id, prev.offset);
                    self.cache.complete_chunk(&key, Some(prev.length));
                }
                debug!("Log {} now has chunk at {}", updated.id, offset);
                return Ok(updated);
            }
            current = self.get_log(current.id).await?;
        }
    }

    /// Seal open chunks in the metadata, retrying on concurrent modification
    pub(crate) async fn complete_chunks(
        &self,
        mut current: LogFile,
        completions: &[ChunkCompletion],
    ) -> Result<LogFile> {
        loop {
            if let Some(updated) = self.meta.try_complete_chunks(&current, completions).await? {
                return Ok(updated);
            }
            current = self.get_log(current.id).await?;
        }
    }

    /// Record a new persisted index length, retrying on concurrent
    /// modification
    pub(crate) async fn set_index_length(&self, mut current: LogFile, length: u64) -> Result<LogFile> {
        loop {
            if let Some(updated) = self.meta.try_update_index(&current, length).await? {
                return Ok(updated);
            }
            current = self.get_log(current.id).await?;
        }
    }

    /// Drop the index length so the next update rebuilds the index
    pub(crate) async fn reset_index(&self, mut current: LogFile) -> Result<LogFile> {
        loop {
            if let Some(updated) = self.meta.try_reset_index(&current).await? {
                return Ok(updated);
            }
            current = self.get_log(current.id).await?;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[tokio::test]
    async fn test_create_and_get_metadata() {
        let h = harness(EngineConfig::default());
        let log = h.engine.create_log("job-1", LogKind::Text).await.unwrap();
        assert_eq!(log.chunks.len(), 1);
        assert_eq!(log.chunks[0].server.as_deref(), Some("chunklog"));

        let meta = h.engine.get_metadata(log.id).await.unwrap();
        assert_eq!(meta, LogMetadata::default());

        let missing = h.engine.get_metadata(LogId::new()).await;
        assert!(matches!(missing, Err(Error::LogNotFound(_))));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = EngineConfig {
            max_sub_chunk_lines: 100,
            ..EngineConfig::default()
        };
        let meta = Arc::new(chunklog_meta_store::MemoryLogStore::new());
        let chunks = Arc::new(chunklog_storage::MemoryChunkStore::new());
        assert!(LogEngine::new(config, meta, chunks).is_err());
    }

    #[tokio::test]
    async fn test_add_chunk_retries_conflicts() {
        let h = harness(EngineConfig::default());
        let log = h.engine.create_log("job", LogKind::Text).await.unwrap();
        h.meta.inject_conflicts(3);
        let log = h.engine.add_chunk(log, 100, 4).await.unwrap();
        assert_eq!(log.chunks.len(), 2);
        assert_eq!(log.chunks[0].length, 100);
        assert!(log.chunks_are_consistent());
    }

    #[tokio::test]
    async fn test_corrupt_durable_chunk_reads_as_absent() {
        let h = harness(EngineConfig::default());
        let log = h.engine.create_log("job", LogKind::Text).await.unwrap();
        let mut data = LogChunkData::new(0, 0);
        data.push_text(bytes::Bytes::from_static(b"hello\n"));
        let mut blob = data.encode().unwrap().to_vec();
        h.chunks.put_chunk_blob(log.id, 0, blob.clone().into());
        assert_eq!(h.engine.read_durable(log.id, 0).await, Some(data));

        blob[0] ^= 0x55;
        h.chunks.put_chunk_blob(log.id, 0, blob.into());
        assert_eq!(h.engine.read_durable(log.id, 0).await, None);

        h.chunks.set_fail_reads(true);
        assert_eq!(h.engine.read_durable(log.id, 0).await, None);
    }

    #[tokio::test]
    async fn test_durable_backends_survive_restart() {
        use chunklog_meta_store::RedbLogStore;
        use chunklog_storage::FsChunkStore;
        use futures::StreamExt;

        let dir = tempfile::tempdir().unwrap();
        let open = |path: &std::path::Path| {
            let meta = Arc::new(RedbLogStore::open(path.join("meta.redb")).unwrap());
            let chunks = Arc::new(FsChunkStore::new(path.join("chunks")));
            LogEngine::new(EngineConfig::default(), meta, chunks).unwrap()
        };

        let log_id = {
            let engine = open(dir.path());
            let log = engine.create_log("job", LogKind::Text).await.unwrap();
            engine
                .append(log.id, 0, 0, b"persisted\nlines\n", false)
                .await
                .unwrap();
            engine.shutdown(None).await.unwrap();
            log.id
        };

        let engine = open(dir.path());
        assert_eq!(engine.read_all(log_id).await.unwrap(), b"persisted\nlines\n");
        let meta = engine.get_metadata(log_id).await.unwrap();
        assert_eq!(meta, LogMetadata { length: 16, line_count: 2 });
        let found: Vec<u32> = engine.search(log_id, "LINES", 0, 10).await.unwrap().collect().await;
        assert_eq!(found, vec![1]);
    }
}
