//! Chunklog Storage - durable chunk and index blobs
//!
//! This crate implements the durable side of the log engine:
//! - The persisted chunk payload format ([`LogChunkData`])
//! - A keyed blob store interface ([`ChunkStore`])
//! - A filesystem backend and an in-memory backend for tests
//!
//! Blobs are keyed by `(log, byte offset)` for chunks and by
//! `(log, covered length)` for search indexes. The store has no business
//! logic; callers decide what a missing or unreadable blob means.

pub mod data;
pub mod fs;
pub mod memory;
pub mod store;

// Re-exports
pub use data::{LogChunkData, LogSubChunkData};
pub use fs::FsChunkStore;
pub use memory::MemoryChunkStore;
pub use store::{ChunkStore, ChunkStoreError, ChunkStoreResult};
