//! In-memory metadata store, used by tests and single-process tooling.

use crate::store::{LogMetadataStore, MetaStoreError, MetaStoreResult};
use async_trait::async_trait;
use chunklog_common::{LogFile, LogId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Metadata store backed by a `HashMap`
#[derive(Default)]
pub struct MemoryLogStore {
    logs: RwLock<HashMap<LogId, LogFile>>,
    /// Number of upcoming conditional updates to reject as if another
    /// writer got there first
    injected_conflicts: AtomicUsize,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` conditional updates lose the race: the stored
    /// version is bumped and the update is rejected.
    pub fn inject_conflicts(&self, count: usize) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    fn take_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl LogMetadataStore for MemoryLogStore {
    async fn create_log(&self, log: LogFile) -> MetaStoreResult<LogFile> {
        let mut logs = self.logs.write();
        if logs.contains_key(&log.id) {
            return Err(MetaStoreError::AlreadyExists(log.id));
        }
        logs.insert(log.id, log.clone());
        Ok(log)
    }

    async fn get_log(&self, id: LogId) -> MetaStoreResult<Option<LogFile>> {
        Ok(self.logs.read().get(&id).cloned())
    }

    async fn list_logs(&self) -> MetaStoreResult<Vec<LogFile>> {
        let mut logs: Vec<_> = self.logs.read().values().cloned().collect();
        logs.sort_by_key(|log| log.id);
        Ok(logs)
    }

    async fn try_replace(
        &self,
        current: &LogFile,
        mut updated: LogFile,
    ) -> MetaStoreResult<Option<LogFile>> {
        let mut logs = self.logs.write();
        let Some(stored) = logs.get_mut(&current.id) else {
            return Ok(None);
        };
        if self.take_conflict() {
            stored.version += 1;
            return Ok(None);
        }
        if stored.version != current.version {
            return Ok(None);
        }
        updated.version = current.version + 1;
        *stored = updated.clone();
        Ok(Some(updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChunkCompletion;
    use chunklog_common::LogKind;

    fn new_log() -> LogFile {
        LogFile::new(LogId::new(), "job-7", LogKind::Text, None)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryLogStore::new();
        let log = store.create_log(new_log()).await.unwrap();
        let fetched = store.get_log(log.id).await.unwrap().unwrap();
        assert_eq!(fetched, log);
        assert!(matches!(
            store.create_log(log.clone()).await,
            Err(MetaStoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_writer_is_rejected() {
        let store = MemoryLogStore::new();
        let log = store.create_log(new_log()).await.unwrap();

        let winner = store.try_add_chunk(&log, 100, 4, None).await.unwrap();
        assert_eq!(winner.as_ref().unwrap().version, 1);

        // Second writer still holds version 0
        let loser = store.try_add_chunk(&log, 200, 8, None).await.unwrap();
        assert!(loser.is_none());

        let fresh = store.get_log(log.id).await.unwrap().unwrap();
        assert_eq!(fresh.chunks.len(), 2);
        let retried = store.try_add_chunk(&fresh, 200, 8, None).await.unwrap().unwrap();
        assert_eq!(retried.chunks.len(), 3);
        assert!(retried.chunks_are_consistent());
    }

    #[tokio::test]
    async fn test_noop_mutation_does_not_bump_version() {
        let store = MemoryLogStore::new();
        let log = store.create_log(new_log()).await.unwrap();
        let log = store.try_add_chunk(&log, 100, 4, None).await.unwrap().unwrap();

        let same = store.try_add_chunk(&log, 100, 4, None).await.unwrap().unwrap();
        assert_eq!(same.version, log.version);

        let sealed = store
            .try_complete_chunks(
                &log,
                &[ChunkCompletion {
                    offset: 100,
                    length: 60,
                    line_count: 3,
                }],
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sealed.max_line_index, Some(7));
        let again = store
            .try_complete_chunks(
                &sealed,
                &[ChunkCompletion {
                    offset: 100,
                    length: 90,
                    line_count: 9,
                }],
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again, sealed);
    }

    #[tokio::test]
    async fn test_injected_conflict() {
        let store = MemoryLogStore::new();
        let log = store.create_log(new_log()).await.unwrap();
        store.inject_conflicts(1);
        assert!(store.try_update_index(&log, 10).await.unwrap().is_none());
        let fresh = store.get_log(log.id).await.unwrap().unwrap();
        assert_eq!(fresh.version, 1);
        let updated = store.try_update_index(&fresh, 10).await.unwrap().unwrap();
        assert_eq!(updated.index_length, Some(10));
    }
}
