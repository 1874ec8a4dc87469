//! Persisted chunk payload format
//!
//! A chunk's payload is a list of sub-chunks, each holding whole lines.
//! Blobs are bincode with a little-endian CRC32C trailer:
//!
//! ```text
//! ┌──────────────────────────────┬──────────────┐
//! │ bincode(LogChunkData)        │ crc32c (u32) │
//! └──────────────────────────────┴──────────────┘
//! ```

use bytes::Bytes;
use chunklog_common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Size of the checksum trailer appended to every blob
const CHECKSUM_LEN: usize = 4;

/// Encode a value as bincode followed by its CRC32C
pub fn encode_blob<T: Serialize>(value: &T) -> Result<Bytes> {
    let mut buf =
        bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))?;
    let crc = crc32c::crc32c(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(Bytes::from(buf))
}

/// Verify the CRC32C trailer and decode the bincode body
pub fn decode_blob<T: DeserializeOwned>(blob: &[u8]) -> Result<T> {
    if blob.len() < CHECKSUM_LEN {
        return Err(Error::Serialization(format!(
            "blob too short: {} bytes",
            blob.len()
        )));
    }
    let (body, trailer) = blob.split_at(blob.len() - CHECKSUM_LEN);
    let mut expected = [0u8; CHECKSUM_LEN];
    expected.copy_from_slice(trailer);
    let expected = u32::from_le_bytes(expected);
    let actual = crc32c::crc32c(body);
    if expected != actual {
        return Err(Error::ChecksumMismatch { expected, actual });
    }
    bincode::deserialize(body).map_err(|e| Error::Serialization(e.to_string()))
}

/// A run of whole lines inside a chunk
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSubChunkData {
    /// Absolute byte offset of the first byte
    pub offset: u64,
    /// Absolute index of the first line
    pub line_index: u32,
    /// Number of lines in `text`
    pub line_count: u32,
    /// Raw text; always ends on a line boundary
    pub text: Bytes,
}

impl LogSubChunkData {
    /// Create a sub-chunk from whole lines of text
    #[must_use]
    pub fn new(offset: u64, line_index: u32, text: Bytes) -> Self {
        let line_count = count_lines(&text);
        Self {
            offset,
            line_index,
            line_count,
            text,
        }
    }

    /// Byte length of the sub-chunk
    #[must_use]
    pub fn length(&self) -> u64 {
        self.text.len() as u64
    }

    /// Byte offset one past the last byte
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + self.length()
    }

    /// Line index one past the last line
    #[must_use]
    pub const fn line_end(&self) -> u32 {
        self.line_index + self.line_count
    }

    /// Absolute byte offset of the start of `line_index`
    ///
    /// The line one past the end maps to [`Self::end`].
    #[must_use]
    pub fn line_offset(&self, line_index: u32) -> Option<u64> {
        if line_index < self.line_index || line_index > self.line_end() {
            return None;
        }
        let skip = (line_index - self.line_index) as usize;
        if skip == 0 {
            return Some(self.offset);
        }
        self.text
            .iter()
            .enumerate()
            .filter(|(_, b)| **b == b'\n')
            .nth(skip - 1)
            .map(|(pos, _)| self.offset + pos as u64 + 1)
    }

    /// Iterate over `(line_index, line)` pairs, without terminators
    pub fn lines(&self) -> impl Iterator<Item = (u32, &[u8])> + '_ {
        let text = self.text.strip_suffix(b"\n").unwrap_or(&self.text[..]);
        let empty = self.text.is_empty();
        text.split(|b| *b == b'\n')
            .filter(move |_| !empty)
            .zip(self.line_index..)
            .map(|(line, idx)| (idx, line))
    }
}

/// Payload of one chunk
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChunkData {
    /// Absolute byte offset of the chunk
    pub offset: u64,
    /// Absolute index of the chunk's first line
    pub line_index: u32,
    /// Sub-chunks in ascending offset order
    pub sub_chunks: Vec<LogSubChunkData>,
    /// Absolute offset where synthesized placeholder lines begin
    pub placeholder_from: Option<u64>,
}

impl LogChunkData {
    /// Create an empty payload
    #[must_use]
    pub const fn new(offset: u64, line_index: u32) -> Self {
        Self {
            offset,
            line_index,
            sub_chunks: Vec::new(),
            placeholder_from: None,
        }
    }

    /// Total byte length
    #[must_use]
    pub fn length(&self) -> u64 {
        self.sub_chunks.iter().map(LogSubChunkData::length).sum()
    }

    /// Total line count
    #[must_use]
    pub fn line_count(&self) -> u32 {
        self.sub_chunks.iter().map(|s| s.line_count).sum()
    }

    /// Byte offset one past the last byte
    #[must_use]
    pub fn end(&self) -> u64 {
        self.sub_chunks.last().map_or(self.offset, LogSubChunkData::end)
    }

    /// Line index one past the last line
    #[must_use]
    pub fn line_end(&self) -> u32 {
        self.sub_chunks
            .last()
            .map_or(self.line_index, LogSubChunkData::line_end)
    }

    /// Append a sub-chunk at the current end of the payload
    pub fn push_text(&mut self, text: Bytes) {
        let sub_chunk = LogSubChunkData::new(self.end(), self.line_end(), text);
        self.sub_chunks.push(sub_chunk);
    }

    /// Drop placeholder lines, keeping only data that was actually written
    ///
    /// Returns whether anything was dropped.
    pub fn strip_placeholder(&mut self) -> bool {
        let Some(from) = self.placeholder_from.take() else {
            return false;
        };
        let before = self.sub_chunks.len();
        self.sub_chunks.retain(|s| s.offset < from);
        self.sub_chunks.len() != before
    }

    /// Index of the sub-chunk containing absolute byte `offset`
    #[must_use]
    pub fn sub_chunk_for_offset(&self, offset: u64) -> Option<usize> {
        let idx = self.sub_chunks.partition_point(|s| s.offset <= offset);
        let idx = idx.checked_sub(1)?;
        (offset < self.sub_chunks[idx].end()).then_some(idx)
    }

    /// Index of the sub-chunk containing absolute line `line_index`
    #[must_use]
    pub fn sub_chunk_for_line(&self, line_index: u32) -> Option<usize> {
        let idx = self.sub_chunks.partition_point(|s| s.line_index <= line_index);
        let idx = idx.checked_sub(1)?;
        (line_index < self.sub_chunks[idx].line_end()).then_some(idx)
    }

    /// Absolute byte offset of the start of `line_index`
    #[must_use]
    pub fn line_offset(&self, line_index: u32) -> Option<u64> {
        if line_index == self.line_end() {
            return Some(self.end());
        }
        let idx = self.sub_chunk_for_line(line_index)?;
        self.sub_chunks[idx].line_offset(line_index)
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

/// Count line terminators in `text`
#[must_use]
pub fn count_lines(text: &[u8]) -> u32 {
    let count = text.iter().filter(|b| **b == b'\n').count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LogChunkData {
        let mut data = LogChunkData::new(1000, 40);
        data.push_text(Bytes::from_static(b"alpha\nbeta\n"));
        data.push_text(Bytes::from_static(b"gamma\n"));
        data
    }

    #[test]
    fn test_extent() {
        let data = sample();
        assert_eq!(data.length(), 17);
        assert_eq!(data.line_count(), 3);
        assert_eq!(data.end(), 1017);
        assert_eq!(data.line_end(), 43);
        assert_eq!(data.sub_chunks[1].offset, 1011);
        assert_eq!(data.sub_chunks[1].line_index, 42);
    }

    #[test]
    fn test_sub_chunk_lookup() {
        let data = sample();
        assert_eq!(data.sub_chunk_for_offset(999), None);
        assert_eq!(data.sub_chunk_for_offset(1000), Some(0));
        assert_eq!(data.sub_chunk_for_offset(1010), Some(0));
        assert_eq!(data.sub_chunk_for_offset(1011), Some(1));
        assert_eq!(data.sub_chunk_for_offset(1017), None);
        assert_eq!(data.sub_chunk_for_line(41), Some(0));
        assert_eq!(data.sub_chunk_for_line(42), Some(1));
        assert_eq!(data.sub_chunk_for_line(43), None);
    }

    #[test]
    fn test_line_offsets() {
        let data = sample();
        assert_eq!(data.line_offset(40), Some(1000));
        assert_eq!(data.line_offset(41), Some(1006));
        assert_eq!(data.line_offset(42), Some(1011));
        assert_eq!(data.line_offset(43), Some(1017));
        assert_eq!(data.line_offset(44), None);
    }

    #[test]
    fn test_lines_iterator() {
        let data = sample();
        let lines: Vec<_> = data.sub_chunks[0].lines().collect();
        assert_eq!(lines, vec![(40, &b"alpha"[..]), (41, &b"beta"[..])]);
        let empty = LogSubChunkData::new(0, 0, Bytes::new());
        assert_eq!(empty.lines().count(), 0);
        let blank = LogSubChunkData::new(0, 5, Bytes::from_static(b"\n\n"));
        assert_eq!(blank.lines().collect::<Vec<_>>(), vec![(5, &b""[..]), (6, &b""[..])]);
    }

    #[test]
    fn test_strip_placeholder() {
        let mut data = sample();
        assert!(!data.strip_placeholder());

        data.placeholder_from = Some(data.end());
        data.push_text(Bytes::from_static(b"[missing]\n"));
        let blob = data.encode().unwrap();
        let mut decoded = LogChunkData::decode(&blob).unwrap();
        assert_eq!(decoded.placeholder_from, Some(1017));

        assert!(decoded.strip_placeholder());
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_corrupt_blob_is_rejected() {
        let blob = sample().encode().unwrap();
        assert_eq!(LogChunkData::decode(&blob).unwrap(), sample());

        let mut corrupt = blob.to_vec();
        corrupt[3] ^= 0xff;
        assert!(matches!(
            LogChunkData::decode(&corrupt),
            Err(Error::ChecksumMismatch { .. })
        ));
        assert!(LogChunkData::decode(&[1, 2]).is_err());
    }
}
