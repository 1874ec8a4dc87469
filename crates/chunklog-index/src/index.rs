//! Mergeable search index over a contiguous byte range of a log.

use crate::search::{SearchStats, SearchTerm, tokenize};
use bytes::Bytes;
use chunklog_common::{Error, Result};
use chunklog_storage::LogSubChunkData;
use chunklog_storage::data::{decode_blob, encode_blob};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One indexed sub-chunk
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogIndexBlock {
    /// The indexed text and its position in the log
    pub sub_chunk: LogSubChunkData,
    /// Sorted lowercase trigrams present in the text
    pub tokens: Vec<u32>,
}

impl LogIndexBlock {
    #[must_use]
    pub fn build(sub_chunk: LogSubChunkData) -> Self {
        let tokens = tokenize(&sub_chunk.text);
        Self { sub_chunk, tokens }
    }

    /// Lines of this block that match `term`, at or after `first_line`
    pub fn matching_lines<'a>(
        &'a self,
        term: &'a SearchTerm,
        first_line: u32,
    ) -> impl Iterator<Item = u32> + 'a {
        self.sub_chunk
            .lines()
            .filter(move |(idx, _)| *idx >= first_line)
            .filter(move |(_, line)| term.matches(line))
            .map(|(idx, _)| idx)
    }

    /// Matching lines, or nothing if the trigram set rules the block out
    ///
    /// The work done is recorded in `stats`.
    pub fn search(&self, term: &SearchTerm, first_line: u32, stats: &SearchStats) -> Vec<u32> {
        if !term.may_match(&self.tokens) {
            stats.record_skip();
            return Vec::new();
        }
        stats.record_scan(self.sub_chunk.length(), u64::from(self.sub_chunk.line_count));
        self.matching_lines(term, first_line).collect()
    }
}

/// Immutable index covering `[offset, offset + length)` of a log
///
/// The persisted index of a log always starts at offset zero.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogIndexData {
    /// First byte covered
    pub offset: u64,
    /// Number of bytes covered
    pub length: u64,
    /// First line covered
    pub line_index: u32,
    /// Number of lines covered
    pub line_count: u32,
    /// Blocks in ascending offset order
    pub blocks: Vec<LogIndexBlock>,
}

impl LogIndexData {
    /// An empty index positioned at `offset` / `line_index`
    #[must_use]
    pub const fn empty_at(offset: u64, line_index: u32) -> Self {
        Self {
            offset,
            length: 0,
            line_index,
            line_count: 0,
            blocks: Vec::new(),
        }
    }

    /// Build a single-block index fragment for one sub-chunk
    #[must_use]
    pub fn build(sub_chunk: &LogSubChunkData) -> Self {
        Self {
            offset: sub_chunk.offset,
            length: sub_chunk.length(),
            line_index: sub_chunk.line_index,
            line_count: sub_chunk.line_count,
            blocks: vec![LogIndexBlock::build(sub_chunk.clone())],
        }
    }

    /// Byte offset one past the covered range
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Line index one past the covered range
    #[must_use]
    pub const fn line_end(&self) -> u32 {
        self.line_index + self.line_count
    }

    /// Extend this index with one covering the immediately following range
    pub fn append(&mut self, next: Self) -> Result<()> {
        if next.length == 0 {
            return Ok(());
        }
        if self.length == 0 && self.blocks.is_empty() && self.offset == next.offset {
            *self = next;
            return Ok(());
        }
        if next.offset != self.end() {
            return Err(Error::invalid_argument(format!(
                "index fragment at {} does not follow index ending at {}",
                next.offset,
                self.end()
            )));
        }
        self.length += next.length;
        self.line_count = next.line_end().saturating_sub(self.line_index);
        self.blocks.extend(next.blocks);
        Ok(())
    }

    /// Merge adjacent fragments, in order, into one index
    pub fn merge(fragments: impl IntoIterator<Item = Self>) -> Result<Self> {
        let mut iter = fragments.into_iter();
        let Some(mut merged) = iter.next() else {
            return Ok(Self::default());
        };
        for fragment in iter {
            merged.append(fragment)?;
        }
        debug!(
            "Merged index covers {} bytes in {} blocks",
            merged.length,
            merged.blocks.len()
        );
        Ok(merged)
    }

    /// Lazily yield matching line numbers at or after `first_line`, in
    /// ascending order
    pub fn search<'a>(
        &'a self,
        term: &'a SearchTerm,
        first_line: u32,
        stats: &'a SearchStats,
    ) -> impl Iterator<Item = u32> + 'a {
        self.blocks[self.first_block_for_line(first_line)..]
            .iter()
            .flat_map(move |block| block.search(term, first_line, stats))
            .inspect(move |_| stats.record_indexed_match())
    }

    /// Position of the first block ending after `line_index`
    #[must_use]
    pub fn first_block_for_line(&self, line_index: u32) -> usize {
        self.blocks
            .partition_point(|b| b.sub_chunk.line_end() <= line_index)
    }

    /// Serialize to a checksummed blob
    pub fn encode(&self) -> Result<Bytes> {
        encode_blob(self)
    }

    /// Deserialize from a checksummed blob
    pub fn decode(blob: &[u8]) -> Result<Self> {
        decode_blob(blob)
    }
}
