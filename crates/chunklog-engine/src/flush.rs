//! Write-behind flushing: the background ticker and forced flushes.
//!
//! A flush pass persists every complete buffered chunk and drops it from
//! the cache once the durable copy matches what is buffered. Open chunks
//! are either sealed first (aged out, or forced) or, for an append that
//! asked for durability, persisted as a snapshot while staying open.

use crate::cache::ChunkKey;
use crate::engine::LogEngine;
use chunklog_common::{Error, LogId, Result};
use chunklog_meta_store::ChunkCompletion;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What to do with buffered chunks that are still open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenChunks {
    /// Seal them and persist their final payload
    Seal,
    /// Persist a copy and leave them open
    Snapshot,
    /// Persist a copy, leave them open and drop them from the cache
    Release,
}

/// Outcome of one flush pass
#[derive(Debug, Default)]
struct FlushReport {
    written: usize,
    failed: usize,
    /// Logs that had a sealed chunk persisted
    sealed_logs: BTreeSet<LogId>,
}

impl LogEngine {
    /// Force every buffered chunk of a log to durable storage
    ///
    /// Open chunks are sealed, so the next append starts a new chunk.
    pub async fn flush(&self, log_id: LogId) -> Result<()> {
        let keys = self.cache.chunks_of(log_id);
        self.run_flush(&keys, OpenChunks::Seal).await
    }

    /// Force every buffered chunk of every log to durable storage
    pub async fn flush_all(&self) -> Result<()> {
        let keys = self.cache.touch_chunks(Duration::ZERO);
        self.run_flush(&keys, OpenChunks::Seal).await
    }

    /// Persist complete chunks and chunks idle past the retention window
    pub async fn flush_expired(&self) -> Result<()> {
        let keys = self.cache.touch_chunks(self.config.flush_retention());
        self.run_flush(&keys, OpenChunks::Seal).await
    }

    /// Persist a log's buffered chunks, sealing open ones unless
    /// `snapshot_open` is set
    pub(crate) async fn flush_log(&self, log_id: LogId, snapshot_open: bool) -> Result<()> {
        let keys = self.cache.chunks_of(log_id);
        let mode = if snapshot_open {
            OpenChunks::Snapshot
        } else {
            OpenChunks::Seal
        };
        self.run_flush(&keys, mode).await
    }

    async fn run_flush(&self, keys: &[ChunkKey], mode: OpenChunks) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let report = {
            let _guard = self.flush_lock.lock().await;
            let mut report = FlushReport::default();
            for key in keys {
                self.flush_chunk(key, mode, &mut report).await;
            }
            report
        };

        for log_id in &report.sealed_logs {
            if let Err(e) = self.update_index(*log_id).await {
                warn!("Failed to update index of log {}: {}", log_id, e);
            }
        }

        if report.written > 0 || report.failed > 0 {
            info!(
                "Flushed {}/{} buffered chunks",
                report.written,
                report.written + report.failed
            );
        }
        if report.failed > 0 {
            return Err(Error::storage(format!(
                "{} chunks could not be flushed and remain buffered",
                report.failed
            )));
        }
        Ok(())
    }

    async fn flush_chunk(&self, key: &ChunkKey, mode: OpenChunks, report: &mut FlushReport) {
        let Some(snapshot) = self.cache.snapshot(key) else {
            return;
        };

        if !snapshot.complete {
            if mode != OpenChunks::Seal {
                let length = snapshot.data.length();
                let durable = self.cache.is_durable(key)
                    || snapshot.data.sub_chunks.is_empty()
                    || self.write_chunk(key, &snapshot.data, report).await;
                if !durable {
                    return;
                }
                if length > 0 {
                    self.cache.mark_durable(key, length);
                }
                if mode == OpenChunks::Release && !self.cache.remove_if_durable(key) {
                    debug!(
                        "Chunk {} of log {} changed while releasing; keeping it buffered",
                        key.offset, key.log_id
                    );
                }
                return;
            }
            if let Err(e) = self.seal_open_chunk(key).await {
                error!(
                    "Failed to seal chunk {} of log {}: {}",
                    key.offset, key.log_id, e
                );
                report.failed += 1;
                return;
            }
        }

        // Re-read: the entry may have taken late data since the first copy
        let Some(snapshot) = self.cache.snapshot(key) else {
            return;
        };
        let length = snapshot.data.length();
        if length == 0 {
            self.cache.remove_if_unchanged(key, 0);
            return;
        }
        if self.cache.is_durable(key) || self.write_chunk(key, &snapshot.data, report).await {
            if self.cache.remove_if_unchanged(key, length) {
                report.sealed_logs.insert(key.log_id);
            } else {
                debug!(
                    "Chunk {} of log {} changed while flushing; keeping it buffered",
                    key.offset, key.log_id
                );
            }
        }
    }

    /// Seal a buffered open chunk at its current length, in the cache and
    /// then in the metadata
    async fn seal_open_chunk(&self, key: &ChunkKey) -> Result<()> {
        self.cache.complete_chunk(key, None);
        let Some((length, line_count)) = self.cache.extent(key) else {
            return Ok(());
        };
        if length == 0 {
            return Ok(());
        }
        let log = self.get_log(key.log_id).await?;
        let completion = ChunkCompletion {
            offset: key.offset,
            length,
            line_count,
        };
        self.complete_chunks(log, &[completion]).await?;
        debug!(
            "Sealed chunk {} of log {} at {} bytes, {} lines",
            key.offset, key.log_id, length, line_count
        );
        Ok(())
    }

    async fn write_chunk(
        &self,
        key: &ChunkKey,
        data: &chunklog_storage::LogChunkData,
        report: &mut FlushReport,
    ) -> bool {
        let blob = match data.encode() {
            Ok(blob) => blob,
            Err(e) => {
                error!("Failed to encode chunk {} of log {}: {}", key.offset, key.log_id, e);
                report.failed += 1;
                return false;
            }
        };
        match self.chunks.write_chunk(key.log_id, key.offset, blob).await {
            Ok(()) => {
                report.written += 1;
                true
            }
            Err(e) => {
                warn!(
                    "Failed to flush chunk {} of log {}: {}",
                    key.offset, key.log_id, e
                );
                report.failed += 1;
                false
            }
        }
    }

    /// Spawn the background flush ticker
    pub fn start_flush_ticker(&self) -> FlushTicker {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(flush_loop(self.clone(), shutdown_rx));
        FlushTicker {
            shutdown_tx,
            handle,
        }
    }

    /// Stop the ticker, if any, then persist everything still buffered
    ///
    /// Open chunks are written as snapshots and stay open in the metadata,
    /// so a later append resumes them instead of starting a new chunk.
    pub async fn shutdown(&self, ticker: Option<FlushTicker>) -> Result<()> {
        if let Some(ticker) = ticker {
            ticker.stop().await;
        }
        let keys = self.cache.touch_chunks(Duration::ZERO);
        self.run_flush(&keys, OpenChunks::Release).await?;
        info!("Log engine shut down; write-behind cache drained");
        Ok(())
    }
}

/// Handle to a running flush ticker
pub struct FlushTicker {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl FlushTicker {
    /// Signal the ticker and wait for it to finish its current pass
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            error!("Flush ticker task failed: {}", e);
        }
    }
}

/// Long-running background task: flush expired chunks every interval
pub async fn flush_loop(engine: LogEngine, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(engine.config.flush_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = engine.flush_expired().await {
                    warn!("Background flush incomplete: {}", e);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Flush ticker stopped");
}

#[cfg(test)]
mod tests {
    use crate::cache::ChunkKey;
    use crate::engine::test_util::*;
    use chunklog_common::{EngineConfig, LogKind};
    use chunklog_storage::LogChunkData;
    use std::time::Duration;

    #[tokio::test]
    async fn test_flush_all_drains_cache() {
        let config = EngineConfig {
            max_chunk_length: 64,
            max_sub_chunk_lines: 4,
            ..EngineConfig::default()
        };
        let h = harness(config);
        let a = h.engine.create_log("job-a", LogKind::Text).await.unwrap();
        let b = h.engine.create_log("job-b", LogKind::Text).await.unwrap();
        h.engine.append(a.id, 0, 0, &numbered_lines(0, 30), false).await.unwrap();
        h.engine.append(b.id, 0, 0, b"just one\n", false).await.unwrap();
        assert!(h.engine.cache_stats().chunks > 2);

        h.engine.flush_all().await.unwrap();
        assert_eq!(h.engine.cache_stats().chunks, 0);

        for id in [a.id, b.id] {
            let log = h.engine.get_log(id).await.unwrap();
            assert!(!log.is_open());
            for (idx, chunk) in log.chunks.iter().enumerate() {
                let blob = h.chunks.chunk_blob(id, chunk.offset).unwrap();
                let data = LogChunkData::decode(&blob).unwrap();
                assert_eq!(data.length(), chunk.length);
                assert_eq!(Some(data.line_count()), log.chunk_line_count(idx));
            }
        }
        let meta = h.engine.get_metadata(b.id).await.unwrap();
        assert_eq!(meta.length, 9);
        assert_eq!(meta.line_count, 1);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_chunk_buffered() {
        let h = harness(EngineConfig::default());
        let log = h.engine.create_log("job", LogKind::Text).await.unwrap();
        h.engine.append(log.id, 0, 0, b"precious\n", false).await.unwrap();

        h.chunks.set_fail_writes(true);
        assert!(h.engine.flush(log.id).await.is_err());
        assert!(h.engine.cache.contains(&ChunkKey::new(log.id, 0)));
        // Still readable from the cache
        assert_eq!(h.engine.read_all(log.id).await.unwrap(), b"precious\n");

        h.chunks.set_fail_writes(false);
        h.engine.flush(log.id).await.unwrap();
        assert!(h.engine.cache_stats().chunks == 0);
        assert!(h.chunks.contains_chunk(log.id, 0));
    }

    #[tokio::test]
    async fn test_expired_flush_respects_retention() {
        let config = EngineConfig {
            max_chunk_length: 8,
            max_sub_chunk_lines: 2,
            flush_retention_secs: 3600,
            ..EngineConfig::default()
        };
        let h = harness(config);
        let log = h.engine.create_log("job", LogKind::Text).await.unwrap();
        // Two lines reach the threshold, sealing chunk 0 and opening chunk 8
        h.engine.append(log.id, 0, 0, b"one\ntwo\nthree\n", false).await.unwrap();

        h.engine.flush_expired().await.unwrap();
        assert!(h.chunks.contains_chunk(log.id, 0));
        assert!(!h.engine.cache.contains(&ChunkKey::new(log.id, 0)));
        assert!(!h.chunks.contains_chunk(log.id, 8));
        assert!(h.engine.cache.contains(&ChunkKey::new(log.id, 8)));
        assert!(h.engine.get_log(log.id).await.unwrap().is_open());
    }

    #[tokio::test]
    async fn test_chunk_sealed_by_gap_stays_buffered_until_retention() {
        let config = EngineConfig {
            flush_retention_secs: 3600,
            ..EngineConfig::default()
        };
        let h = harness(config);
        let log = h.engine.create_log("job", LogKind::Text).await.unwrap();
        h.engine.append(log.id, 0, 0, b"one\n", false).await.unwrap();
        // A gap seals chunk 0 at 10 bytes with only 4 of them written
        h.engine.append(log.id, 10, 2, b"two\n", false).await.unwrap();

        h.engine.flush_expired().await.unwrap();
        assert!(!h.chunks.contains_chunk(log.id, 0));
        assert!(h.engine.cache.contains(&ChunkKey::new(log.id, 0)));

        h.engine.append(log.id, 4, 1, b"late!\n", false).await.unwrap();
        h.engine.flush_expired().await.unwrap();
        assert!(h.chunks.contains_chunk(log.id, 0));
        assert_eq!(h.engine.read_all(log.id).await.unwrap(), b"one\nlate!\ntwo\n");
    }

    #[tokio::test]
    async fn test_append_with_flush_snapshots_open_chunk() {
        let h = harness(EngineConfig::default());
        let log = h.engine.create_log("job", LogKind::Text).await.unwrap();
        let log = h.engine.append(log.id, 0, 0, b"durable\n", true).await.unwrap();

        assert!(log.is_open());
        assert!(h.chunks.contains_chunk(log.id, 0));
        let key = ChunkKey::new(log.id, 0);
        assert!(h.engine.cache.contains(&key));

        h.engine.append(log.id, 8, 1, b"more\n", false).await.unwrap();
        assert_eq!(h.engine.read_all(log.id).await.unwrap(), b"durable\nmore\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_flushes_idle_chunks() {
        let config = EngineConfig {
            flush_retention_secs: 0,
            flush_interval_secs: 1,
            ..EngineConfig::default()
        };
        let h = harness(config);
        let ticker = h.engine.start_flush_ticker();
        let log = h.engine.create_log("job", LogKind::Text).await.unwrap();
        h.engine.append(log.id, 0, 0, b"tick\n", false).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(h.chunks.contains_chunk(log.id, 0));
        assert_eq!(h.engine.cache_stats().chunks, 0);

        h.engine.shutdown(Some(ticker)).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_everything() {
        let h = harness(EngineConfig::default());
        let ticker = h.engine.start_flush_ticker();
        let log = h.engine.create_log("job", LogKind::Json).await.unwrap();
        h.engine
            .append(log.id, 0, 0, b"{\"msg\":\"hi\"}\n", false)
            .await
            .unwrap();

        h.engine.shutdown(Some(ticker)).await.unwrap();
        assert_eq!(h.engine.cache_stats().chunks, 0);
        let blob = h.chunks.chunk_blob(log.id, 0).unwrap();
        let data = LogChunkData::decode(&blob).unwrap();
        assert_eq!(data.length(), 13);
        assert_eq!(data.line_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_open_chunk_open() {
        let h = harness(EngineConfig::default());
        let log = h.engine.create_log("job", LogKind::Text).await.unwrap();
        h.engine.append(log.id, 0, 0, b"one\n", false).await.unwrap();
        h.engine.shutdown(None).await.unwrap();

        let log = h.engine.get_log(log.id).await.unwrap();
        assert_eq!(log.chunks.len(), 1);
        assert!(log.is_open());

        // The next session carries on in the same chunk
        let log = h.engine.append(log.id, 4, 1, b"two\n", false).await.unwrap();
        h.engine.shutdown(None).await.unwrap();
        assert_eq!(log.chunks.len(), 1);
        assert_eq!(h.engine.read_all(log.id).await.unwrap(), b"one\ntwo\n");
        let meta = h.engine.get_metadata(log.id).await.unwrap();
        assert_eq!((meta.length, meta.line_count), (8, 2));
    }
}
