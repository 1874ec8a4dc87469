//! Core type definitions for chunklog
//!
//! A log is tiled by chunks: every chunk except the last is sealed and ends
//! exactly where its successor begins. Only the last chunk may still be
//! open (`length == 0`), in which case it extends to the end of the log.
//!
//! ```text
//! LogFile
//! ├── Chunk 0: offset 0,      length 262_201, line 0
//! ├── Chunk 1: offset 262_201, length 262_150, line 2_048
//! └── Chunk 2: offset 524_351, length 0 (open), line 4_096
//! ```

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a log
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct LogId(Uuid);

impl LogId {
    /// Generate a new random log ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LogId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogId({})", self.0)
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LogId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Format of the records stored in a log
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogKind {
    /// Plain text lines
    #[default]
    Text,
    /// One JSON record per line
    Json,
}

/// Descriptor for a contiguous, independently persisted byte range of a log
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChunk {
    /// Absolute byte offset of the first byte in the chunk
    pub offset: u64,
    /// Byte length of the chunk, or zero while the chunk is still open
    pub length: u64,
    /// Absolute index of the first line in the chunk
    pub line_index: u32,
    /// Server instance that created the chunk
    pub server: Option<String>,
}

impl LogChunk {
    /// Create a new open chunk
    #[must_use]
    pub const fn new(offset: u64, line_index: u32, server: Option<String>) -> Self {
        Self {
            offset,
            length: 0,
            line_index,
            server,
        }
    }

    /// Whether the chunk is still accepting data
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.length == 0
    }
}

/// Metadata record for a log stream
///
/// Mutations are applied to clones and committed through a conditional
/// update keyed on `version`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFile {
    /// Unique log identifier
    pub id: LogId,
    /// Reference to the job that owns the log
    pub job_id: String,
    /// Record format
    pub kind: LogKind,
    /// Chunks sorted by ascending offset
    pub chunks: Vec<LogChunk>,
    /// Total line count, known once the last chunk is sealed
    pub max_line_index: Option<u32>,
    /// Byte length covered by the persisted search index
    pub index_length: Option<u64>,
    /// Optimistic concurrency version
    pub version: u64,
}

impl LogFile {
    /// Create a new log with an open chunk at offset zero
    #[must_use]
    pub fn new(id: LogId, job_id: impl Into<String>, kind: LogKind, server: Option<String>) -> Self {
        Self {
            id,
            job_id: job_id.into(),
            kind,
            chunks: vec![LogChunk::new(0, 0, server)],
            max_line_index: None,
            index_length: None,
            version: 0,
        }
    }

    /// The last chunk, if any
    #[must_use]
    pub fn last_chunk(&self) -> Option<&LogChunk> {
        self.chunks.last()
    }

    /// Whether the last chunk is still open
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.chunks.last().is_some_and(LogChunk::is_open)
    }

    /// Byte offset one past the end of chunk `idx`, or `None` if it is open
    #[must_use]
    pub fn chunk_end(&self, idx: usize) -> Option<u64> {
        let chunk = self.chunks.get(idx)?;
        if chunk.is_open() {
            None
        } else {
            Some(chunk.offset + chunk.length)
        }
    }

    /// Line count of chunk `idx`, when it is implied by the metadata
    #[must_use]
    pub fn chunk_line_count(&self, idx: usize) -> Option<u32> {
        let chunk = self.chunks.get(idx)?;
        if let Some(next) = self.chunks.get(idx + 1) {
            Some(next.line_index.saturating_sub(chunk.line_index))
        } else if chunk.is_open() {
            None
        } else {
            self.max_line_index
                .map(|max| max.saturating_sub(chunk.line_index))
        }
    }

    /// Locate the chunk containing `offset`
    ///
    /// Returns `Ok(idx)` when a chunk covers the offset, otherwise
    /// `Err(insertion_point)`.
    pub fn locate_chunk_for_offset(&self, offset: u64) -> Result<usize, usize> {
        let idx = self.chunks.partition_point(|c| c.offset <= offset);
        if idx == 0 {
            return Err(0);
        }
        let chunk = &self.chunks[idx - 1];
        if chunk.is_open() || offset < chunk.offset + chunk.length {
            Ok(idx - 1)
        } else {
            Err(idx)
        }
    }

    /// Locate the chunk containing line `line_index`
    ///
    /// Returns `Ok(idx)` when a chunk covers the line, otherwise
    /// `Err(insertion_point)`.
    pub fn locate_chunk_for_line(&self, line_index: u32) -> Result<usize, usize> {
        let idx = self.chunks.partition_point(|c| c.line_index <= line_index);
        if idx == 0 {
            return Err(0);
        }
        let last = idx - 1;
        if last + 1 < self.chunks.len() || self.chunks[last].is_open() {
            return Ok(last);
        }
        match self.max_line_index {
            Some(max) if line_index >= max => Err(idx),
            _ => Ok(last),
        }
    }

    /// Append a new open chunk at `offset`
    ///
    /// The current last chunk is sealed (or extended) so that it ends exactly
    /// at `offset`. Returns `false` without modifying anything when a chunk
    /// already starts at or covers `offset`.
    pub fn add_chunk(&mut self, offset: u64, line_index: u32, server: Option<String>) -> bool {
        let Some(last) = self.chunks.last_mut() else {
            self.chunks.push(LogChunk::new(offset, line_index, server));
            self.max_line_index = None;
            return true;
        };
        if offset <= last.offset || (!last.is_open() && offset < last.offset + last.length) {
            return false;
        }
        last.length = offset - last.offset;
        let line_index = line_index.max(last.line_index);
        self.chunks.push(LogChunk::new(offset, line_index, server));
        self.max_line_index = None;
        true
    }

    /// Seal the open chunk starting at `offset`
    ///
    /// Completing a chunk that is already sealed is a no-op and returns
    /// `false`, as does a zero `length`.
    pub fn complete_chunk(&mut self, offset: u64, length: u64, line_count: u32) -> bool {
        let Ok(idx) = self.chunks.binary_search_by_key(&offset, |c| c.offset) else {
            return false;
        };
        let is_last = idx + 1 == self.chunks.len();
        let chunk = &mut self.chunks[idx];
        if !chunk.is_open() || length == 0 {
            return false;
        }
        chunk.length = length;
        if is_last {
            self.max_line_index = Some(chunk.line_index + line_count);
        }
        true
    }

    /// Record a new index length; only ever grows
    pub fn set_index_length(&mut self, length: u64) -> bool {
        if self.index_length.is_some_and(|current| current >= length) {
            return false;
        }
        self.index_length = Some(length);
        true
    }

    /// Forget the persisted index so that it is rebuilt from the start
    pub fn reset_index(&mut self) -> bool {
        self.index_length.take().is_some()
    }

    /// Check the chunk ordering invariants
    #[must_use]
    pub fn chunks_are_consistent(&self) -> bool {
        let Some(first) = self.chunks.first() else {
            return false;
        };
        if first.offset != 0 {
            return false;
        }
        self.chunks.windows(2).all(|pair| {
            !pair[0].is_open()
                && pair[0].offset + pair[0].length == pair[1].offset
                && pair[0].line_index <= pair[1].line_index
        })
    }
}

/// Summary of a log's currently known extent
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMetadata {
    /// Byte length of the data currently buffered or durable
    pub length: u64,
    /// Number of lines currently buffered or durable
    pub line_count: u32,
}
