//! Write-behind cache for open log chunks
//!
//! Appended lines are buffered per chunk until the chunk is sealed or has
//! sat untouched for longer than the retention window, at which point the
//! flusher persists it and drops the entry. Each entry has its own lock so
//! that appends to different chunks never contend.

use bytes::{Bytes, BytesMut};
use chunklog_common::{EngineConfig, LogId};
use chunklog_storage::LogChunkData;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Identifies a buffered chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    pub log_id: LogId,
    /// Byte offset of the chunk within the log
    pub offset: u64,
}

impl ChunkKey {
    pub const fn new(log_id: LogId, offset: u64) -> Self {
        Self { log_id, offset }
    }
}

/// Result of offering a write to a buffered chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// No entry is buffered for the chunk
    Missing,
    /// `bytes` leading bytes of the write were appended; `sealed` is set if
    /// the chunk reached its size threshold while appending
    Appended { bytes: usize, sealed: bool },
    /// `bytes` leading bytes of the write are already buffered
    Duplicate { bytes: usize },
    /// The write starts after the buffered data, which ends at `end`
    Gap { end: u64 },
    /// The chunk is complete and has no room left at `end`
    Sealed { end: u64 },
}

/// A point-in-time copy of a buffered chunk
#[derive(Debug, Clone)]
pub struct ChunkSnapshot {
    pub data: LogChunkData,
    /// Whether the entry was complete when the copy was taken
    pub complete: bool,
}

/// Cache occupancy counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of buffered chunks
    pub chunks: usize,
    /// Number of buffered chunks that are complete
    pub complete_chunks: usize,
    /// Total buffered bytes
    pub bytes: u64,
}

/// Buffered state of one chunk
struct CacheEntry {
    /// Completed sub-chunks
    data: LogChunkData,
    /// Lines of the sub-chunk currently being filled
    current: BytesMut,
    current_lines: u32,
    /// Set once the chunk is sealed; no more data is accepted past
    /// `sealed_length`
    complete: bool,
    sealed_length: u64,
    /// Length of the last copy written to durable storage
    durable_length: Option<u64>,
    last_touched: Instant,
}

impl CacheEntry {
    fn new(data: LogChunkData) -> Self {
        let durable_length = (!data.sub_chunks.is_empty()).then(|| data.length());
        Self {
            data,
            current: BytesMut::new(),
            current_lines: 0,
            complete: false,
            sealed_length: 0,
            durable_length,
            last_touched: Instant::now(),
        }
    }

    fn length(&self) -> u64 {
        self.data.length() + self.current.len() as u64
    }

    fn end(&self) -> u64 {
        self.data.end() + self.current.len() as u64
    }

    fn line_count(&self) -> u32 {
        self.data.line_count() + self.current_lines
    }

    fn line_end(&self) -> u32 {
        self.data.line_end() + self.current_lines
    }

    fn close_sub_chunk(&mut self) {
        if !self.current.is_empty() {
            let text = self.current.split().freeze();
            self.data.push_text(text);
            self.current_lines = 0;
        }
    }

    fn complete(&mut self, limit: Option<u64>) -> bool {
        if self.complete {
            return false;
        }
        self.close_sub_chunk();
        self.complete = true;
        self.sealed_length = limit.unwrap_or_else(|| self.length()).max(self.length());
        true
    }

    /// Complete and holding everything up to its sealed length
    fn is_full(&self) -> bool {
        self.complete && self.length() >= self.sealed_length
    }

    fn snapshot(&self) -> ChunkSnapshot {
        let mut data = self.data.clone();
        if !self.current.is_empty() {
            data.push_text(Bytes::copy_from_slice(&self.current));
        }
        ChunkSnapshot {
            data,
            complete: self.complete,
        }
    }

    fn append(&mut self, offset: u64, data: &[u8], config: &EngineConfig) -> AppendOutcome {
        let end = self.end();
        if offset < end {
            let overlap = usize::try_from(end - offset).unwrap_or(usize::MAX);
            return AppendOutcome::Duplicate {
                bytes: line_boundary_at_or_after(data, overlap),
            };
        }
        if offset > end {
            return AppendOutcome::Gap { end };
        }

        let mut input = data;
        if self.complete {
            let room = usize::try_from(self.sealed_length.saturating_sub(self.length()))
                .unwrap_or(usize::MAX);
            let fits = line_boundary_at_or_before(input, room);
            if fits == 0 {
                return AppendOutcome::Sealed { end };
            }
            input = &input[..fits];
        }

        let max_lines = config.max_sub_chunk_lines;
        let mask = max_lines - 1;
        let mut consumed = 0;
        while consumed < input.len() {
            let room = max_lines - (self.line_end() & mask);
            let rest = &input[consumed..];
            let (take, lines) = take_lines(rest, room);
            self.current.extend_from_slice(&rest[..take]);
            self.current_lines += lines;
            consumed += take;

            if self.line_end() & mask == 0 {
                self.close_sub_chunk();
                if !self.complete && self.length() >= config.max_chunk_length {
                    self.complete(None);
                    self.last_touched = Instant::now();
                    return AppendOutcome::Appended {
                        bytes: consumed,
                        sealed: true,
                    };
                }
            }
        }
        self.last_touched = Instant::now();
        AppendOutcome::Appended {
            bytes: consumed,
            sealed: false,
        }
    }
}

/// Take up to `max_lines` whole lines from the front of `data`
///
/// Returns the byte length taken and the number of lines in it. A trailing
/// fragment without a terminator is taken as part of the last line.
fn take_lines(data: &[u8], max_lines: u32) -> (usize, u32) {
    let mut lines = 0;
    for (pos, byte) in data.iter().enumerate() {
        if *byte == b'\n' {
            lines += 1;
            if lines == max_lines {
                return (pos + 1, lines);
            }
        }
    }
    (data.len(), lines)
}

/// Smallest line boundary in `data` at or after `pos`
pub(crate) fn line_boundary_at_or_after(data: &[u8], pos: usize) -> usize {
    if pos == 0 || pos >= data.len() {
        return pos.min(data.len());
    }
    if data[pos - 1] == b'\n' {
        return pos;
    }
    data[pos..]
        .iter()
        .position(|b| *b == b'\n')
        .map_or(data.len(), |p| pos + p + 1)
}

/// Largest line boundary in `data` at or before `pos`
fn line_boundary_at_or_before(data: &[u8], pos: usize) -> usize {
    let pos = pos.min(data.len());
    data[..pos]
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |p| p + 1)
}

/// Per-chunk write-behind buffer shared by all appenders
#[derive(Default)]
pub struct WriteBehindCache {
    entries: DashMap<ChunkKey, Arc<Mutex<CacheEntry>>>,
}

impl WriteBehindCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &ChunkKey) -> Option<Arc<Mutex<CacheEntry>>> {
        self.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    /// Start buffering a chunk from `base` unless it is already buffered
    pub fn insert_if_absent(&self, key: ChunkKey, base: LogChunkData) {
        self.entries.entry(key).or_insert_with(|| {
            debug!(
                "Buffering chunk {} of log {} from {} bytes",
                key.offset,
                key.log_id,
                base.length()
            );
            Arc::new(Mutex::new(CacheEntry::new(base)))
        });
    }

    /// Offer `data`, starting at absolute byte `offset`, to a buffered chunk
    pub fn append(
        &self,
        key: &ChunkKey,
        offset: u64,
        data: &[u8],
        config: &EngineConfig,
    ) -> AppendOutcome {
        let Some(entry) = self.entry(key) else {
            return AppendOutcome::Missing;
        };
        let mut entry = entry.lock();
        entry.append(offset, data, config)
    }

    /// Seal a buffered chunk
    ///
    /// Further data is only accepted up to `limit` bytes from the chunk
    /// start, or not at all when `limit` is `None`. Completing an already
    /// complete entry is a no-op. Returns whether the entry changed.
    pub fn complete_chunk(&self, key: &ChunkKey, limit: Option<u64>) -> bool {
        self.entry(key).is_some_and(|entry| entry.lock().complete(limit))
    }

    /// Copy of the buffered data
    pub fn snapshot(&self, key: &ChunkKey) -> Option<ChunkSnapshot> {
        self.entry(key).map(|entry| entry.lock().snapshot())
    }

    /// Buffered byte length and line count
    pub fn extent(&self, key: &ChunkKey) -> Option<(u64, u32)> {
        self.entry(key).map(|entry| {
            let entry = entry.lock();
            (entry.length(), entry.line_count())
        })
    }

    /// Keys of entries that are complete and full, or were last touched at
    /// least `min_age` ago
    ///
    /// A complete entry still short of its sealed length is waiting for
    /// late writes and only becomes due once it ages out.
    pub fn touch_chunks(&self, min_age: Duration) -> Vec<ChunkKey> {
        let now = Instant::now();
        let mut keys: Vec<_> = self
            .entries
            .iter()
            .filter(|e| {
                let entry = e.value().lock();
                entry.is_full() || now.saturating_duration_since(entry.last_touched) >= min_age
            })
            .map(|e| *e.key())
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Keys of every buffered chunk of `log_id`, in offset order
    pub fn chunks_of(&self, log_id: LogId) -> Vec<ChunkKey> {
        let mut keys: Vec<_> = self
            .entries
            .iter()
            .map(|e| *e.key())
            .filter(|k| k.log_id == log_id)
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Whether the copy durable at `length` bytes is already current
    pub fn is_durable(&self, key: &ChunkKey) -> bool {
        self.entry(key).is_some_and(|entry| {
            let entry = entry.lock();
            entry.durable_length == Some(entry.length())
        })
    }

    /// Record that `length` bytes of the entry are now durable
    pub fn mark_durable(&self, key: &ChunkKey, length: u64) {
        if let Some(entry) = self.entry(key) {
            entry.lock().durable_length = Some(length);
        }
    }

    /// Drop an entry if it is complete and still holds exactly `length`
    /// bytes. Returns whether the entry was removed.
    pub fn remove_if_unchanged(&self, key: &ChunkKey, length: u64) -> bool {
        self.entries
            .remove_if(key, |_, entry| {
                let entry = entry.lock();
                entry.complete && entry.length() == length
            })
            .is_some()
    }

    /// Drop an entry, complete or not, whose buffered data is all durable.
    /// Returns whether the entry was removed.
    pub fn remove_if_durable(&self, key: &ChunkKey) -> bool {
        self.entries
            .remove_if(key, |_, entry| {
                let entry = entry.lock();
                entry.length() == 0 || entry.durable_length == Some(entry.length())
            })
            .is_some()
    }

    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for e in &self.entries {
            let entry = e.value().lock();
            stats.chunks += 1;
            stats.bytes += entry.length();
            if entry.complete {
                stats.complete_chunks += 1;
            }
        }
        stats
    }
}
