//! Chunklog Index - full-text search over log text
//!
//! An index is a list of blocks, one per sub-chunk, each carrying the
//! sub-chunk's text and the sorted set of lowercase trigrams appearing in
//! it. A query only scans blocks whose trigram set contains every trigram
//! of the search text.
//!
//! Indexes built for adjacent byte ranges can be merged into one covering
//! the union, which is how the persisted index grows with the log.

pub mod index;
pub mod search;

pub use index::{LogIndexBlock, LogIndexData};
pub use search::{SearchStats, SearchStatsSnapshot, SearchTerm};
