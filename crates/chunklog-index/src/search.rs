//! Search terms, trigram tokens and scan statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Pack three lowercase bytes into a trigram token
const fn trigram(a: u8, b: u8, c: u8) -> u32 {
    ((a.to_ascii_lowercase() as u32) << 16)
        | ((b.to_ascii_lowercase() as u32) << 8)
        | c.to_ascii_lowercase() as u32
}

/// Sorted, de-duplicated trigrams of every line in `text`
///
/// Trigrams never span a line terminator.
#[must_use]
pub fn tokenize(text: &[u8]) -> Vec<u32> {
    let mut tokens: Vec<u32> = text
        .split(|b| *b == b'\n')
        .flat_map(|line| line.windows(3).map(|w| trigram(w[0], w[1], w[2])))
        .collect();
    tokens.sort_unstable();
    tokens.dedup();
    tokens
}

/// A prepared case-insensitive substring query
#[derive(Debug, Clone)]
pub struct SearchTerm {
    needle: Vec<u8>,
    tokens: Vec<u32>,
}

impl SearchTerm {
    #[must_use]
    pub fn new(text: &str) -> Self {
        let needle = text.as_bytes().to_ascii_lowercase();
        let tokens = tokenize(&needle);
        Self { needle, tokens }
    }

    /// Whether a block with the given trigram set may contain a match
    ///
    /// Terms shorter than three bytes have no trigrams and can't be filtered.
    #[must_use]
    pub fn may_match(&self, tokens: &[u32]) -> bool {
        self.tokens
            .iter()
            .all(|token| tokens.binary_search(token).is_ok())
    }

    /// Whether `line` contains the term, ignoring ASCII case
    #[must_use]
    pub fn matches(&self, line: &[u8]) -> bool {
        if self.needle.is_empty() {
            return true;
        }
        line.windows(self.needle.len())
            .any(|window| window.eq_ignore_ascii_case(&self.needle))
    }
}

/// Counters describing the work done by a search
///
/// Shared between the lazy search and its caller, so it can be read while
/// the search is still running.
#[derive(Debug, Default)]
pub struct SearchStats {
    scanned_bytes: AtomicU64,
    scanned_lines: AtomicU64,
    scanned_blocks: AtomicU64,
    skipped_blocks: AtomicU64,
    indexed_matches: AtomicU64,
    elapsed_micros: AtomicU64,
}

impl SearchStats {
    pub(crate) fn record_scan(&self, bytes: u64, lines: u64) {
        self.scanned_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.scanned_lines.fetch_add(lines, Ordering::Relaxed);
        self.scanned_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skip(&self) {
        self.skipped_blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// Account for a match served from the persisted index
    pub fn record_indexed_match(&self) {
        self.indexed_matches.fetch_add(1, Ordering::Relaxed);
    }

    /// Add to the time spent searching
    pub fn add_elapsed(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.elapsed_micros.fetch_add(micros, Ordering::Relaxed);
    }

    /// Current values of the counters
    #[must_use]
    pub fn snapshot(&self) -> SearchStatsSnapshot {
        SearchStatsSnapshot {
            scanned_bytes: self.scanned_bytes.load(Ordering::Relaxed),
            scanned_lines: self.scanned_lines.load(Ordering::Relaxed),
            scanned_blocks: self.scanned_blocks.load(Ordering::Relaxed),
            skipped_blocks: self.skipped_blocks.load(Ordering::Relaxed),
            indexed_matches: self.indexed_matches.load(Ordering::Relaxed),
            elapsed: Duration::from_micros(self.elapsed_micros.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time copy of [`SearchStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchStatsSnapshot {
    /// Bytes of text compared against the term
    pub scanned_bytes: u64,
    /// Lines compared against the term
    pub scanned_lines: u64,
    /// Blocks (indexed or not) whose text was scanned
    pub scanned_blocks: u64,
    /// Indexed blocks ruled out by their trigram set
    pub skipped_blocks: u64,
    /// Matches served from the persisted index
    pub indexed_matches: u64,
    /// Time spent searching
    pub elapsed: Duration,
}
