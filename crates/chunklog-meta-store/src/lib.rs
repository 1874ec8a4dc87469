//! Chunklog Metadata Store - versioned log metadata
//!
//! Holds one [`LogFile`](chunklog_common::LogFile) record per log. Every
//! mutation is a conditional update keyed on the version the caller last
//! observed; stale writers get `Ok(None)` back and must re-fetch.

pub mod memory;
pub mod redb_store;
pub mod store;
mod tables;

// Re-exports
pub use memory::MemoryLogStore;
pub use redb_store::RedbLogStore;
pub use store::{ChunkCompletion, LogMetadataStore, MetaStoreError, MetaStoreResult};
