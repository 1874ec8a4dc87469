//! Appending lines to a log.

use crate::cache::{AppendOutcome, ChunkKey, line_boundary_at_or_after};
use crate::engine::LogEngine;
use chunklog_common::{Error, LogFile, LogId, Result};
use chunklog_storage::LogChunkData;
use chunklog_storage::data::count_lines;
use tracing::debug;

/// Cursor over the part of a write that has not been placed yet
#[derive(Debug)]
struct WriteState<'a> {
    offset: u64,
    line_index: u32,
    data: &'a [u8],
}

impl<'a> WriteState<'a> {
    const fn new(offset: u64, line_index: u32, data: &'a [u8]) -> Self {
        Self {
            offset,
            line_index,
            data,
        }
    }

    const fn is_done(&self) -> bool {
        self.data.is_empty()
    }

    /// Move past the first `bytes` bytes
    fn advance(&mut self, bytes: usize) {
        let (done, rest) = self.data.split_at(bytes.min(self.data.len()));
        self.offset += done.len() as u64;
        self.line_index += count_lines(done);
        self.data = rest;
    }
}

impl LogEngine {
    /// Append whole lines to a log
    ///
    /// `offset` and `line_index` give the position of the first byte of
    /// `data` in the log; data already present at that position is skipped,
    /// so a retried write is harmless. A write that starts past the end of
    /// the log leaves a gap that reads back as placeholder lines. With
    /// `flush` set, buffered data of the log is made durable before
    /// returning, without sealing the open chunk.
    pub async fn append(
        &self,
        log_id: LogId,
        offset: u64,
        line_index: u32,
        data: &[u8],
        flush: bool,
    ) -> Result<LogFile> {
        if !data.is_empty() && !data.ends_with(b"\n") {
            return Err(Error::invalid_argument(
                "appended data must end with a line terminator",
            ));
        }

        let mut log = self.get_log(log_id).await?;
        let mut state = WriteState::new(offset, line_index, data);
        while !state.is_done() {
            log = self.place(log, &mut state).await?;
        }

        if flush {
            self.flush_log(log_id, true).await?;
            log = self.get_log(log_id).await?;
        }
        Ok(log)
    }

    /// Buffer an evicted sealed chunk again so a late write can fill it
    ///
    /// Only chunks whose written data, placeholders aside, falls short of
    /// their extent are reopened. An index already covering the chunk is
    /// dropped so that it gets rebuilt with the real text. Returns whether
    /// the chunk is buffered.
    async fn reopen_sealed_chunk(&self, log: &LogFile, idx: usize, end: u64) -> Result<bool> {
        let chunk = &log.chunks[idx];
        let mut base = self
            .read_durable(log.id, chunk.offset)
            .await
            .unwrap_or_else(|| LogChunkData::new(chunk.offset, chunk.line_index));
        base.strip_placeholder();
        let length = end - chunk.offset;
        if base.length() >= length {
            return Ok(false);
        }

        debug!(
            "Reopening chunk {} of log {} at {} of {} bytes for a late write",
            idx,
            log.id,
            base.length(),
            length
        );
        let key = ChunkKey::new(log.id, chunk.offset);
        self.cache.insert_if_absent(key, base);
        self.cache.complete_chunk(&key, Some(length));
        if log.index_length.is_some_and(|indexed| indexed > chunk.offset) {
            self.reset_index(log.clone()).await?;
        }
        Ok(true)
    }

    /// Place as much of `state` as the chunk at its offset takes
    async fn place(&self, log: LogFile, state: &mut WriteState<'_>) -> Result<LogFile> {
        let idx = match log.locate_chunk_for_offset(state.offset) {
            Ok(idx) => idx,
            Err(_) => return self.add_chunk(log, state.offset, state.line_index).await,
        };
        let chunk = &log.chunks[idx];
        let key = ChunkKey::new(log.id, chunk.offset);

        if let Some(end) = log.chunk_end(idx) {
            // Sealed: late data is accepted while the chunk has room for it
            let outcome = self.cache.append(&key, state.offset, state.data, &self.config);
            if outcome == AppendOutcome::Missing
                && self.reopen_sealed_chunk(&log, idx, end).await?
            {
                return Ok(log);
            }
            match outcome {
                AppendOutcome::Appended { bytes, .. } | AppendOutcome::Duplicate { bytes } => {
                    state.advance(bytes);
                }
                _ => {
                    let remaining = usize::try_from(end - state.offset).unwrap_or(usize::MAX);
                    let skip = line_boundary_at_or_after(state.data, remaining);
                    debug!(
                        "Dropping {} bytes at {} of log {}: chunk {} is sealed",
                        skip, state.offset, log.id, idx
                    );
                    state.advance(skip);
                }
            }
            return Ok(log);
        }

        match self.cache.append(&key, state.offset, state.data, &self.config) {
            AppendOutcome::Missing => {
                let base = self
                    .read_durable(log.id, chunk.offset)
                    .await
                    .unwrap_or_else(|| LogChunkData::new(chunk.offset, chunk.line_index));
                self.cache.insert_if_absent(key, base);
                Ok(log)
            }
            AppendOutcome::Appended { bytes, sealed } => {
                state.advance(bytes);
                if sealed {
                    self.add_chunk(log, state.offset, state.line_index).await
                } else {
                    Ok(log)
                }
            }
            AppendOutcome::Duplicate { bytes } => {
                state.advance(bytes);
                Ok(log)
            }
            AppendOutcome::Gap { end } => {
                debug!(
                    "Gap in log {} between {} and {}; starting a new chunk",
                    log.id, end, state.offset
                );
                self.add_chunk(log, state.offset, state.line_index).await
            }
            AppendOutcome::Sealed { .. } => {
                self.add_chunk(log, state.offset, state.line_index).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::test_util::*;
    use chunklog_common::{EngineConfig, LogId, LogKind, LogMetadata};
    use futures::StreamExt;

    #[tokio::test]
    async fn test_append_sequence() {
        let h = harness(EngineConfig::default());
        let log = h.engine.create_log("job", LogKind::Text).await.unwrap();
        h.engine.append(log.id, 0, 0, b"hello\n", false).await.unwrap();
        h.engine.append(log.id, 6, 1, b"world\n", false).await.unwrap();

        let meta = h.engine.get_metadata(log.id).await.unwrap();
        assert_eq!(meta, LogMetadata { length: 12, line_count: 2 });
        assert_eq!(h.engine.read_all(log.id).await.unwrap(), b"hello\nworld\n");
    }

    #[tokio::test]
    async fn test_retried_write_is_idempotent() {
        let h = harness(EngineConfig::default());
        let log = h.engine.create_log("job", LogKind::Text).await.unwrap();
        h.engine.append(log.id, 0, 0, b"a\nb\n", false).await.unwrap();
        h.engine.append(log.id, 0, 0, b"a\nb\n", false).await.unwrap();
        // Overlapping retry that also carries new data
        h.engine.append(log.id, 2, 1, b"b\nc\n", false).await.unwrap();

        assert_eq!(h.engine.read_all(log.id).await.unwrap(), b"a\nb\nc\n");
        let meta = h.engine.get_metadata(log.id).await.unwrap();
        assert_eq!(meta.line_count, 3);
    }

    #[tokio::test]
    async fn test_rejects_partial_lines() {
        let h = harness(EngineConfig::default());
        let log = h.engine.create_log("job", LogKind::Text).await.unwrap();
        let err = h.engine.append(log.id, 0, 0, b"no newline", false).await;
        assert!(err.unwrap_err().is_contract_violation());
    }

    #[tokio::test]
    async fn test_chunks_roll_over_at_threshold() {
        let config = EngineConfig {
            max_chunk_length: 64,
            max_sub_chunk_lines: 4,
            ..EngineConfig::default()
        };
        let h = harness(config);
        let log = h.engine.create_log("job", LogKind::Text).await.unwrap();
        let data = numbered_lines(0, 40);
        h.engine.append(log.id, 0, 0, &data, false).await.unwrap();

        let log = h.engine.get_log(log.id).await.unwrap();
        assert!(log.chunks.len() > 1);
        assert!(log.chunks_are_consistent());
        for chunk in &log.chunks {
            // Chunks start on sub-chunk boundaries
            assert_eq!(chunk.line_index % 4, 0);
        }
        assert_eq!(h.engine.read_all(log.id).await.unwrap(), data);
        let meta = h.engine.get_metadata(log.id).await.unwrap();
        assert_eq!(meta.length, data.len() as u64);
        assert_eq!(meta.line_count, 40);
    }

    #[tokio::test]
    async fn test_gap_starts_new_chunk() {
        let h = harness(EngineConfig::default());
        let log = h.engine.create_log("job", LogKind::Text).await.unwrap();
        h.engine.append(log.id, 0, 0, b"first\n", false).await.unwrap();
        let log = h.engine.append(log.id, 100, 10, b"later\n", false).await.unwrap();

        assert_eq!(log.chunks.len(), 2);
        assert_eq!(log.chunks[0].length, 100);
        assert_eq!(log.chunks[1].offset, 100);
        assert_eq!(log.chunks[1].line_index, 10);

        // The gap can still be filled while the chunk is buffered
        h.engine.append(log.id, 6, 1, b"second\n", false).await.unwrap();
        let text = h.engine.read_all(log.id).await.unwrap();
        assert!(text.starts_with(b"first\nsecond\n"));
        assert_eq!(text.len(), 106);
        assert!(text.ends_with(b"later\n"));
    }

    #[tokio::test]
    async fn test_resumes_from_durable_snapshot() {
        let h = harness(EngineConfig::default());
        let log = h.engine.create_log("job", LogKind::Text).await.unwrap();
        h.engine.append(log.id, 0, 0, b"one\ntwo\n", true).await.unwrap();
        assert!(h.chunks.contains_chunk(log.id, 0));

        // Simulate a restart: same stores, fresh cache
        let restarted = crate::LogEngine::new(
            EngineConfig::default(),
            h.meta.clone(),
            h.chunks.clone(),
        )
        .unwrap();
        let log = restarted.append(log.id, 8, 2, b"three\n", false).await.unwrap();
        assert_eq!(log.chunks.len(), 1);
        assert_eq!(restarted.read_all(log.id).await.unwrap(), b"one\ntwo\nthree\n");
    }

    #[tokio::test]
    async fn test_restart_without_snapshot_seals_at_write_offset() {
        let h = harness(EngineConfig::default());
        let log = h.engine.create_log("job", LogKind::Text).await.unwrap();
        h.engine.append(log.id, 0, 0, b"lost\n", false).await.unwrap();

        let restarted = crate::LogEngine::new(
            EngineConfig::default(),
            h.meta.clone(),
            h.chunks.clone(),
        )
        .unwrap();
        let log = restarted.append(log.id, 5, 1, b"kept\n", false).await.unwrap();
        assert_eq!(log.chunks.len(), 2);
        assert_eq!(log.chunks[0].length, 5);

        let text = restarted.read_all(log.id).await.unwrap();
        assert_eq!(text.len(), 10);
        assert_eq!(&text[5..], b"kept\n");
        assert_eq!(text[4], b'\n');
    }

    const START: &[u8] = b"start\n";
    const WRITER_A: &[u8] = b"from writer a\n";
    const WRITER_B: &[u8] = b"from writer b\n";
    const ALL: &[u8] = b"start\nfrom writer a\nfrom writer b\n";

    /// Log holding `START`, then `WRITER_B` landed ahead of `WRITER_A`
    async fn later_writer_first(h: &Harness) -> LogId {
        let log = h.engine.create_log("job", LogKind::Text).await.unwrap();
        h.engine.append(log.id, 0, 0, START, false).await.unwrap();
        let log = h.engine.append(log.id, 20, 2, WRITER_B, false).await.unwrap();
        let extents: Vec<_> = log.chunks.iter().map(|c| (c.offset, c.length)).collect();
        assert_eq!(extents, vec![(0, 20), (20, 0)]);
        log.id
    }

    #[tokio::test]
    async fn test_earlier_write_after_later_writer() {
        let h = harness(EngineConfig::default());
        let log_id = later_writer_first(&h).await;
        h.engine.append(log_id, 6, 1, WRITER_A, false).await.unwrap();

        assert_eq!(h.engine.read_all(log_id).await.unwrap(), ALL);
        let meta = h.engine.get_metadata(log_id).await.unwrap();
        assert_eq!(meta, LogMetadata { length: 34, line_count: 3 });
    }

    #[tokio::test]
    async fn test_earlier_write_after_expiry_flush() {
        let h = harness(EngineConfig::default());
        let log_id = later_writer_first(&h).await;
        h.engine.flush_expired().await.unwrap();
        h.engine.append(log_id, 6, 1, WRITER_A, false).await.unwrap();

        assert_eq!(h.engine.read_all(log_id).await.unwrap(), ALL);
        h.engine.flush_all().await.unwrap();
        assert_eq!(h.engine.read_all(log_id).await.unwrap(), ALL);
        let blob = h.chunks.chunk_blob(log_id, 0).unwrap();
        let data = chunklog_storage::LogChunkData::decode(&blob).unwrap();
        assert_eq!(data.length(), 20);
        assert_eq!(data.placeholder_from, None);
    }

    #[tokio::test]
    async fn test_earlier_write_after_forced_flush() {
        let h = harness(EngineConfig::default());
        let log_id = later_writer_first(&h).await;
        // Chunk 0 is persisted short, evicted, then repaired and indexed
        h.engine.flush_all().await.unwrap();
        assert_eq!(h.engine.get_log(log_id).await.unwrap().index_length, Some(34));
        let text = h.engine.read_all(log_id).await.unwrap();
        assert!(text[6..].starts_with(b"[data missing"));

        h.engine.append(log_id, 6, 1, WRITER_A, false).await.unwrap();
        assert_eq!(h.engine.read_all(log_id).await.unwrap(), ALL);
        // The index covering the placeholder is dropped and rebuilt
        assert_eq!(h.engine.get_log(log_id).await.unwrap().index_length, None);

        h.engine.flush_all().await.unwrap();
        assert_eq!(h.engine.get_log(log_id).await.unwrap().index_length, Some(34));
        let found: Vec<u32> = h
            .engine
            .search(log_id, "writer a", 0, 10)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(found, vec![1]);
        assert_eq!(h.engine.read_all(log_id).await.unwrap(), ALL);
    }

    #[tokio::test]
    async fn test_fully_written_sealed_chunk_drops_overlap() {
        let h = harness(EngineConfig::default());
        let log_id = later_writer_first(&h).await;
        h.engine.append(log_id, 6, 1, WRITER_A, false).await.unwrap();
        h.engine.flush_all().await.unwrap();

        // A retried write of persisted data changes nothing
        h.engine.append(log_id, 6, 1, WRITER_A, false).await.unwrap();
        assert_eq!(h.engine.cache_stats().chunks, 0);
        assert_eq!(h.engine.read_all(log_id).await.unwrap(), ALL);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_to_open_chunk() {
        for _ in 0..16 {
            let h = harness(EngineConfig::default());
            let log = h.engine.create_log("job", LogKind::Text).await.unwrap();
            h.engine.append(log.id, 0, 0, START, false).await.unwrap();

            let (a, b) = (h.engine.clone(), h.engine.clone());
            let writer_b = tokio::spawn(async move { b.append(log.id, 20, 2, WRITER_B, false).await });
            let writer_a = tokio::spawn(async move { a.append(log.id, 6, 1, WRITER_A, false).await });
            writer_a.await.unwrap().unwrap();
            writer_b.await.unwrap().unwrap();

            let current = h.engine.get_log(log.id).await.unwrap();
            assert!(current.chunks_are_consistent());
            assert_eq!(h.engine.read_all(log.id).await.unwrap(), ALL);
            let meta = h.engine.get_metadata(log.id).await.unwrap();
            assert_eq!(meta.line_count, 3);

            h.engine.flush_all().await.unwrap();
            assert_eq!(h.engine.read_all(log.id).await.unwrap(), ALL);
        }
    }
}
