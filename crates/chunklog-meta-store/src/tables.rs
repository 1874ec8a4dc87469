//! redb table definitions for the metadata store.

use redb::TableDefinition;

/// Logs: log_id (str) → bincode(LogFile)
pub const LOGS: TableDefinition<&str, &[u8]> = TableDefinition::new("logs");
