//! Index maintenance and full-text search.
//!
//! The persisted index covers a prefix of the log made of sealed, durable
//! chunks. A search answers lines inside that prefix from the index and
//! scans the remaining tail chunk by chunk.

use crate::cache::ChunkKey;
use crate::engine::LogEngine;
use chunklog_common::{Error, LogFile, LogId, Result};
use chunklog_index::{LogIndexBlock, LogIndexData, SearchStats, SearchStatsSnapshot, SearchTerm};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tracing::{debug, info, warn};

impl LogEngine {
    /// Load the persisted index covering the first `length` bytes
    async fn load_index(&self, log_id: LogId, length: u64) -> Option<LogIndexData> {
        let blob = match self.chunks.read_index(log_id, length).await {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                warn!("Index of log {} at {} bytes is missing", log_id, length);
                return None;
            }
            Err(e) => {
                warn!("Failed to read index of log {}: {}", log_id, e);
                return None;
            }
        };
        match LogIndexData::decode(&blob) {
            Ok(index) if index.offset == 0 && index.end() == length => Some(index),
            Ok(index) => {
                warn!(
                    "Index of log {} covers [{}, {}), expected [0, {})",
                    log_id,
                    index.offset,
                    index.end(),
                    length
                );
                None
            }
            Err(e) => {
                warn!("Corrupt index of log {}: {}", log_id, e);
                None
            }
        }
    }

    /// Index fragment for one sealed chunk
    async fn index_chunk(&self, log: &LogFile, idx: usize) -> Result<LogIndexData> {
        let data = self.load_chunk(log, idx).await?;
        let offset = log.chunks[idx].offset;
        if data.offset != offset {
            return Err(Error::internal(format!(
                "payload of chunk {idx} starts at {}, not {offset}",
                data.offset
            )));
        }
        let fragment = LogIndexData::merge(data.sub_chunks.iter().map(LogIndexData::build))?;
        if fragment.length > 0 && fragment.offset != offset {
            return Err(Error::internal(format!("fragment of chunk {idx} is misplaced")));
        }
        Ok(fragment)
    }

    /// Extend the persisted index over sealed chunks that are durable
    ///
    /// Returns the new indexed length, or `None` if nothing was added.
    pub async fn update_index(&self, log_id: LogId) -> Result<Option<u64>> {
        let log = self.get_log(log_id).await?;
        let mut index = match log.index_length {
            Some(length) if length > 0 => match self.load_index(log_id, length).await {
                Some(index) => index,
                None => {
                    warn!("Rebuilding index of log {} from the start", log_id);
                    LogIndexData::empty_at(0, 0)
                }
            },
            _ => LogIndexData::empty_at(0, 0),
        };
        let start = index.end();

        for (idx, chunk) in log.chunks.iter().enumerate() {
            let Some(end) = log.chunk_end(idx) else {
                break;
            };
            if end <= index.end() {
                continue;
            }
            if chunk.offset != index.end() {
                warn!(
                    "Index of log {} ends at {} inside chunk {}",
                    log_id,
                    index.end(),
                    idx
                );
                break;
            }
            // Buffered chunks may still take late data
            if self.cache.contains(&ChunkKey::new(log_id, chunk.offset)) {
                break;
            }
            let appended = match self.index_chunk(&log, idx).await {
                Ok(fragment) => index.append(fragment),
                Err(e) => Err(e),
            };
            if let Err(e) = appended {
                warn!("Failed to index chunk {} of log {}: {}", idx, log_id, e);
                break;
            }
        }

        let length = index.end();
        if length <= start {
            return Ok(None);
        }
        let blob = index.encode()?;
        self.chunks.write_index(log_id, length, blob).await?;
        self.set_index_length(log, length).await?;
        info!(
            "Indexed log {} up to {} bytes, {} lines",
            log_id,
            length,
            index.line_end()
        );
        Ok(Some(length))
    }

    /// Lines containing `text` (ASCII case-insensitive), starting at
    /// `first_line`, in ascending order, at most `max_results` of them
    ///
    /// The result is a lazy stream; chunks are only read as it is polled.
    pub async fn search(
        &self,
        log_id: LogId,
        text: &str,
        first_line: u32,
        max_results: usize,
    ) -> Result<LogSearch> {
        let log = self.get_log(log_id).await?;
        let stats = Arc::new(SearchStats::default());

        let phase = match log.index_length {
            Some(length) if length > 0 => match self.load_index(log_id, length).await {
                Some(index) if first_line < index.line_end() => Phase::Indexed {
                    block: index.first_block_for_line(first_line),
                    index: Arc::new(index),
                },
                _ => Phase::Linear,
            },
            _ => Phase::Linear,
        };
        debug!(
            "Searching log {} from line {} ({})",
            log_id,
            first_line,
            if matches!(phase, Phase::Indexed { .. }) { "indexed" } else { "linear" }
        );

        let cursor = SearchCursor {
            engine: self.clone(),
            log,
            term: SearchTerm::new(text),
            stats: Arc::clone(&stats),
            next_line: first_line,
            remaining: max_results,
            pending: VecDeque::new(),
            phase,
        };
        let inner = futures::stream::unfold(cursor, |mut cursor| async move {
            cursor.next_match().await.map(|line| (line, cursor))
        })
        .boxed();
        Ok(LogSearch { stats, inner })
    }
}

enum Phase {
    /// Walking the blocks of the persisted index
    Indexed {
        index: Arc<LogIndexData>,
        block: usize,
    },
    /// Scanning chunks past the indexed prefix
    Linear,
    Done,
}

struct SearchCursor {
    engine: LogEngine,
    log: LogFile,
    term: SearchTerm,
    stats: Arc<SearchStats>,
    /// First line not yet examined
    next_line: u32,
    remaining: usize,
    pending: VecDeque<u32>,
    phase: Phase,
}

impl SearchCursor {
    async fn next_match(&mut self) -> Option<u32> {
        loop {
            if self.remaining == 0 {
                return None;
            }
            if let Some(line) = self.pending.pop_front() {
                self.remaining -= 1;
                return Some(line);
            }
            let started = Instant::now();
            let more = self.advance().await;
            self.stats.add_elapsed(started.elapsed());
            if !more {
                return None;
            }
        }
    }

    /// Examine the next block or chunk; `false` once nothing is left
    async fn advance(&mut self) -> bool {
        let next = match self.phase {
            Phase::Indexed { .. } => self.search_block(),
            Phase::Linear => self.scan_chunk().await,
            Phase::Done => return false,
        };
        if let Some(next) = next {
            self.phase = next;
        }
        true
    }

    /// Query the next block of the persisted index
    fn search_block(&mut self) -> Option<Phase> {
        let Phase::Indexed { index, block } = &mut self.phase else {
            return None;
        };
        let Some(b) = index.blocks.get(*block) else {
            self.next_line = self.next_line.max(index.line_end());
            return Some(Phase::Linear);
        };
        *block += 1;
        for line in b.search(&self.term, self.next_line, &self.stats) {
            self.stats.record_indexed_match();
            self.pending.push_back(line);
        }
        self.next_line = self.next_line.max(b.sub_chunk.line_end());
        None
    }

    /// Scan the chunk holding `next_line`; returns the phase change, if any
    async fn scan_chunk(&mut self) -> Option<Phase> {
        let Ok(idx) = self.log.locate_chunk_for_line(self.next_line) else {
            return Some(Phase::Done);
        };
        let data = match self.engine.load_chunk(&self.log, idx).await {
            Ok(data) => data,
            Err(e) => {
                warn!("Search of log {} stopped at chunk {}: {}", self.log.id, idx, e);
                return Some(Phase::Done);
            }
        };
        for sub in &data.sub_chunks {
            if sub.line_end() <= self.next_line {
                continue;
            }
            let block = LogIndexBlock::build(sub.clone());
            self.pending
                .extend(block.search(&self.term, self.next_line, &self.stats));
        }
        match self.log.chunks.get(idx + 1) {
            Some(next) => {
                self.next_line = self.next_line.max(next.line_index);
                None
            }
            None => Some(Phase::Done),
        }
    }
}

/// Lazy, ordered stream of matching line numbers
pub struct LogSearch {
    stats: Arc<SearchStats>,
    inner: BoxStream<'static, u32>,
}

impl LogSearch {
    /// Work done so far
    pub fn stats(&self) -> SearchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Counters shared with the running search
    pub fn shared_stats(&self) -> Arc<SearchStats> {
        Arc::clone(&self.stats)
    }
}

impl Stream for LogSearch {
    type Item = u32;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<u32>> {
        self.inner.poll_next_unpin(cx)
    }
}
