//! Chunklog Engine - chunked log storage with write-behind caching
//!
//! This crate ties the metadata store, the durable chunk store and the
//! search index together:
//! - Appends are buffered per chunk in a [`WriteBehindCache`] and split into
//!   sub-chunks at power-of-two line boundaries
//! - A background ticker persists sealed and idle chunks
//! - Reads and searches prefer buffered data, fall back to durable storage
//!   and repair chunks whose payload no longer matches the metadata
//!
//! Metadata is updated with optimistic concurrency: every mutation reads
//! the current record, applies the change and retries if another writer
//! got there first.

pub mod cache;
mod engine;
mod flush;
mod read;
pub mod repair;
mod search;
mod write;

pub use cache::{CacheStats, ChunkKey, WriteBehindCache};
pub use engine::LogEngine;
pub use flush::{FlushTicker, flush_loop};
pub use read::LogReader;
pub use search::LogSearch;

pub use chunklog_index::SearchStatsSnapshot;
