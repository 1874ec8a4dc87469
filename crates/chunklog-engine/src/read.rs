//! Range reads and line addressing.

use crate::engine::LogEngine;
use bytes::Bytes;
use chunklog_common::{LogFile, LogId, Result};
use chunklog_storage::LogChunkData;
use futures::Stream;
use std::sync::Arc;
use tracing::warn;

/// Lazy reader over a byte range of a log
///
/// Yields one slice per sub-chunk. Chunk payloads are fetched (and
/// repaired if needed) only when the reader crosses into them.
pub struct LogReader {
    engine: LogEngine,
    log: LogFile,
    offset: u64,
    end: u64,
    current: Option<CurrentChunk>,
}

struct CurrentChunk {
    data: Arc<LogChunkData>,
    /// End of the chunk's extent, if sealed
    limit: Option<u64>,
    sub_idx: usize,
}

impl LogReader {
    async fn enter_chunk(&mut self) -> Option<CurrentChunk> {
        let idx = self.log.locate_chunk_for_offset(self.offset).ok()?;
        let data = match self.engine.load_chunk(&self.log, idx).await {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to load chunk {} of log {}: {}", idx, self.log.id, e);
                return None;
            }
        };
        let sub_idx = data.sub_chunk_for_offset(self.offset)?;
        Some(CurrentChunk {
            data: Arc::new(data),
            limit: self.log.chunk_end(idx),
            sub_idx,
        })
    }

    /// Next slice of the range, or `None` once it is exhausted
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        while self.offset < self.end {
            let mut current = match self.current.take() {
                Some(current) => current,
                None => self.enter_chunk().await?,
            };
            let Some(sub) = current.data.sub_chunks.get(current.sub_idx) else {
                continue;
            };
            let stop = self
                .end
                .min(sub.end())
                .min(current.limit.unwrap_or(u64::MAX));
            if self.offset >= stop {
                if stop == sub.end() {
                    current.sub_idx += 1;
                    self.current = Some(current);
                }
                continue;
            }
            let start = usize::try_from(self.offset - sub.offset).ok()?;
            let len = usize::try_from(stop - self.offset).ok()?;
            let slice = sub.text.slice(start..start + len);
            self.offset = stop;
            self.current = Some(current);
            return Some(slice);
        }
        None
    }

    /// Read the rest of the range into one buffer
    pub async fn read_to_end(&mut self) -> Vec<u8> {
        let mut buf = Vec::new();
        while let Some(slice) = self.next_chunk().await {
            buf.extend_from_slice(&slice);
        }
        buf
    }

    /// Turn the reader into a stream of slices
    pub fn into_stream(self) -> impl Stream<Item = Bytes> {
        futures::stream::unfold(self, |mut reader| async move {
            reader.next_chunk().await.map(|slice| (slice, reader))
        })
    }
}

impl LogEngine {
    /// Reader over `[offset, offset + length)`, clamped to the current end
    /// of the log
    pub async fn read_range(&self, log_id: LogId, offset: u64, length: u64) -> Result<LogReader> {
        let log = self.get_log(log_id).await?;
        let meta = self.metadata_of(&log).await;
        let end = offset.saturating_add(length).min(meta.length);
        Ok(LogReader {
            engine: self.clone(),
            log,
            offset: offset.min(end),
            end,
            current: None,
        })
    }

    /// Every byte currently in the log
    pub async fn read_all(&self, log_id: LogId) -> Result<Vec<u8>> {
        let mut reader = self.read_range(log_id, 0, u64::MAX).await?;
        Ok(reader.read_to_end().await)
    }

    /// Byte offset of the start of `line_index`
    ///
    /// Lines past the end are clamped to the line count; the returned pair
    /// is the clamped line and its offset.
    pub async fn get_line_offset(&self, log_id: LogId, line_index: u32) -> Result<(u32, u64)> {
        let log = self.get_log(log_id).await?;
        let meta = self.metadata_of(&log).await;
        let line = line_index.min(meta.line_count);
        if line == meta.line_count {
            return Ok((line, meta.length));
        }
        let Ok(idx) = log.locate_chunk_for_line(line) else {
            return Ok((line, meta.length));
        };
        let data = self.load_chunk(&log, idx).await?;
        let offset = data.line_offset(line).unwrap_or_else(|| data.end());
        Ok((line, offset))
    }
}
