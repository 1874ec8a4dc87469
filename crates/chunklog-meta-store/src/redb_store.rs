//! Persistent metadata store backed by redb.
//!
//! Records are bincode-encoded `LogFile`s keyed by log id. Conditional
//! updates read, compare and write inside a single write transaction, so a
//! stale version never gets committed.

use crate::store::{LogMetadataStore, MetaStoreError, MetaStoreResult};
use crate::tables;
use async_trait::async_trait;
use chunklog_common::{LogFile, LogId};
use redb::{Database, ReadableTable};
use std::path::Path;
use tracing::{debug, error};

/// Persistent metadata store backed by redb.
pub struct RedbLogStore {
    db: Database,
}

impl RedbLogStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::LOGS)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    fn read_log(&self, id: LogId) -> MetaStoreResult<Option<LogFile>> {
        let key = id.to_string();
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::LOGS)?;
        match table.get(key.as_str())? {
            Some(val) => Ok(Some(bincode::deserialize(val.value())?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl LogMetadataStore for RedbLogStore {
    async fn create_log(&self, log: LogFile) -> MetaStoreResult<LogFile> {
        let key = log.id.to_string();
        let bytes = bincode::serialize(&log)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::LOGS)?;
            if table.get(key.as_str())?.is_some() {
                return Err(MetaStoreError::AlreadyExists(log.id));
            }
            table.insert(key.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        debug!("Created log {}", log.id);
        Ok(log)
    }

    async fn get_log(&self, id: LogId) -> MetaStoreResult<Option<LogFile>> {
        self.read_log(id)
    }

    async fn list_logs(&self) -> MetaStoreResult<Vec<LogFile>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::LOGS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let key = entry.0.value().to_string();
            match bincode::deserialize::<LogFile>(entry.1.value()) {
                Ok(log) => result.push(log),
                Err(e) => error!("Failed to decode log '{}': {}", key, e),
            }
        }
        Ok(result)
    }

    async fn try_replace(
        &self,
        current: &LogFile,
        mut updated: LogFile,
    ) -> MetaStoreResult<Option<LogFile>> {
        let key = current.id.to_string();
        updated.version = current.version + 1;
        let new_bytes = bincode::serialize(&updated)?;

        let write_txn = self.db.begin_write()?;
        let swapped = {
            let mut table = write_txn.open_table(tables::LOGS)?;
            // Read and compare, then drop the guard before mutating
            let matches = match table.get(key.as_str())? {
                Some(val) => bincode::deserialize::<LogFile>(val.value())?.version == current.version,
                None => false,
            };
            if matches {
                table.insert(key.as_str(), new_bytes.as_slice())?;
            }
            matches
        };
        if swapped {
            write_txn.commit()?;
            Ok(Some(updated))
        } else {
            write_txn.abort()?;
            debug!(
                "Stale update for log {} at version {}",
                current.id, current.version
            );
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunklog_common::LogKind;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_cas_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.redb");
        let id = LogId::new();

        {
            let store = RedbLogStore::open(&path).unwrap();
            let log = store
                .create_log(LogFile::new(id, "job-1", LogKind::Json, Some("a".into())))
                .await
                .unwrap();
            let log = store.try_add_chunk(&log, 64, 2, None).await.unwrap().unwrap();
            assert_eq!(log.version, 1);
            // stale
            let stale = LogFile { version: 0, ..log.clone() };
            assert!(store.try_update_index(&stale, 64).await.unwrap().is_none());
        }

        let store = RedbLogStore::open(&path).unwrap();
        let log = store.get_log(id).await.unwrap().unwrap();
        assert_eq!(log.version, 1);
        assert_eq!(log.kind, LogKind::Json);
        assert_eq!(log.chunks.len(), 2);
        assert_eq!(log.index_length, None);
        assert_eq!(store.list_logs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_create_fails() {
        let dir = tempdir().unwrap();
        let store = RedbLogStore::open(dir.path().join("meta.redb")).unwrap();
        let log = LogFile::new(LogId::new(), "job-1", LogKind::Text, None);
        store.create_log(log.clone()).await.unwrap();
        assert!(matches!(
            store.create_log(log).await,
            Err(MetaStoreError::AlreadyExists(_))
        ));
    }
}
