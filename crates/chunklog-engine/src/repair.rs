//! Reconciliation of chunk payloads with their metadata
//!
//! A sealed chunk's extent is fixed by the metadata. When the payload that
//! can be found (buffered or durable) is shorter, the missing range is
//! filled with placeholder lines so that byte and line addressing of the
//! rest of the log stays intact. Each placeholder line carries a marker
//! naming the chunk and the server that originally held it.

use bytes::{Bytes, BytesMut};
use chunklog_common::LogKind;
use chunklog_storage::LogChunkData;
use chunklog_storage::data::count_lines;
use tracing::warn;

/// Extent a sealed chunk is expected to have
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedExtent {
    pub length: u64,
    pub line_count: Option<u32>,
}

/// Human readable marker placed on every synthesized line
pub fn missing_data_message(chunk_idx: usize, server: Option<&str>) -> String {
    format!(
        "[data missing for chunk {} on server {}]",
        chunk_idx,
        server.unwrap_or("unknown")
    )
}

/// Build `lines` placeholder lines totalling exactly `bytes` bytes
///
/// Lengths are spread evenly, earlier lines taking the remainder. Text logs
/// get the marker truncated to fit and padded with spaces; JSON logs get a
/// JSON record per line, or a blank line when the record does not fit.
/// Requires `0 < lines <= bytes`.
pub fn placeholder_text(lines: u32, bytes: u64, message: &str, kind: LogKind) -> Bytes {
    let record = match kind {
        LogKind::Text => message.to_string(),
        LogKind::Json => format!(r#"{{"level":"Error","message":"{message}"}}"#),
    };
    let lines = u64::from(lines.max(1));
    let base = bytes / lines;
    let extra = bytes % lines;

    let mut text = BytesMut::with_capacity(usize::try_from(bytes).unwrap_or(0));
    for i in 0..lines {
        let line_len = base + u64::from(i < extra);
        let width = usize::try_from(line_len.saturating_sub(1)).unwrap_or(usize::MAX);
        let fill: &[u8] = match kind {
            LogKind::Text => &record.as_bytes()[..record.len().min(width)],
            LogKind::Json if record.len() <= width => record.as_bytes(),
            LogKind::Json => &[],
        };
        text.extend_from_slice(fill);
        text.resize(text.len() + (width - fill.len()), b' ');
        text.extend_from_slice(b"\n");
    }
    text.freeze()
}

/// Drop payload past `length` bytes from the chunk start
///
/// A sub-chunk straddling the limit keeps its whole lines before it.
fn truncate(data: &mut LogChunkData, length: u64) {
    let limit = data.offset + length;
    data.sub_chunks.retain(|s| s.offset < limit);
    if let Some(last) = data.sub_chunks.last_mut()
        && last.end() > limit
    {
        let keep = usize::try_from(limit - last.offset).unwrap_or(usize::MAX);
        let keep = last.text[..keep]
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |p| p + 1);
        last.text = last.text.slice(..keep);
        last.line_count = count_lines(&last.text);
        if last.text.is_empty() {
            data.sub_chunks.pop();
        }
    }
}

/// Make `data` cover exactly the expected extent of chunk `chunk_idx`
///
/// Returns whether the payload was modified.
pub fn reconcile(
    data: &mut LogChunkData,
    chunk_idx: usize,
    server: Option<&str>,
    kind: LogKind,
    expected: ExpectedExtent,
) -> bool {
    let mut changed = false;
    if data.length() > expected.length {
        warn!(
            "Chunk {} payload is {} bytes, longer than its {} byte extent; truncating",
            chunk_idx,
            data.length(),
            expected.length
        );
        truncate(data, expected.length);
        changed = true;
    }

    let gap_bytes = expected.length - data.length();
    if gap_bytes == 0 {
        return changed;
    }
    let gap_lines = expected
        .line_count
        .map_or(0, |lines| lines.saturating_sub(data.line_count()));
    // Each line needs at least its terminator
    let lines = u64::from(gap_lines.max(1)).min(gap_bytes);
    let lines = u32::try_from(lines).unwrap_or(u32::MAX);

    warn!(
        "Chunk {} is missing {} bytes; synthesizing {} placeholder lines",
        chunk_idx, gap_bytes, lines
    );
    let message = missing_data_message(chunk_idx, server);
    data.placeholder_from.get_or_insert(data.end());
    data.push_text(placeholder_text(lines, gap_bytes, &message, kind));
    true
}
