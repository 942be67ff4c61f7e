//! Version database
//!
//! The root coordinator: owns the named version tables and the
//! transaction table, carries the two partition functions, and routes
//! table-qualified record operations to the owning table.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::txn::tx_table::TxTable;
use crate::txn::version_entry::VersionEntry;
use crate::txn::version_table::{Partitioner, VersionTable};
use crate::types::{RecordKey, TableId, Ts, TxId, VersionKey};

/// Root of the engine: table registry, transaction table, partition
/// functions
///
/// The registry is read-mostly; table creation and deletion serialize
/// on the registry write lock. Tables receive a clone of the shared
/// physical partitioner handle instead of a back-pointer to the
/// database, which keeps the ownership graph acyclic.
pub struct VersionDb {
    config: EngineConfig,
    tables: RwLock<HashMap<TableId, Arc<VersionTable>>>,
    tx_table: TxTable,
    physical_partitioner: Partitioner,
    logical_partitioner: Partitioner,
}

impl VersionDb {
    /// Engine with uniform hash partitioning on both axes
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Self::with_partitioners(config, hash_partitioner(), hash_partitioner())
    }

    /// Engine with caller-supplied partition functions
    ///
    /// The functions are fixed for the lifetime of the database;
    /// rerouting keys after tables are populated would scatter version
    /// chains, so there is deliberately no setter.
    pub fn with_partitioners(
        config: EngineConfig,
        physical: Partitioner,
        logical: Partitioner,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            tables: RwLock::new(HashMap::new()),
            tx_table: TxTable::new(),
            physical_partitioner: physical,
            logical_partitioner: logical,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tx_table(&self) -> &TxTable {
        &self.tx_table
    }

    /// Process-wide partition used to place a transaction on a worker
    /// with affinity for its keys
    pub fn logical_partition_by_key(&self, key: &RecordKey) -> usize {
        (self.logical_partitioner)(key) % self.config.logical_partitions.max(1)
    }

    /// Install a table; idempotent, returning the existing table if the
    /// id is already present
    pub fn create_version_table(&self, table_id: &str) -> Arc<VersionTable> {
        if let Some(table) = self.tables.read().get(table_id) {
            return table.clone();
        }
        let mut tables = self.tables.write();
        tables
            .entry(table_id.to_string())
            .or_insert_with(|| {
                debug!(table = table_id, "creating version table");
                Arc::new(VersionTable::new(
                    table_id.to_string(),
                    self.config.physical_partitions,
                    self.config.backend,
                    self.physical_partitioner.clone(),
                ))
            })
            .clone()
    }

    /// Remove a table; subsequent operations on it fail with
    /// TableNotFound
    pub fn delete_table(&self, table_id: &str) -> bool {
        let removed = self.tables.write().remove(table_id).is_some();
        if removed {
            debug!(table = table_id, "deleted version table");
        }
        removed
    }

    pub fn get_version_table(&self, table_id: &str) -> Option<Arc<VersionTable>> {
        self.tables.read().get(table_id).cloned()
    }

    fn table(&self, table_id: &str) -> Result<Arc<VersionTable>> {
        self.get_version_table(table_id)
            .ok_or_else(|| EngineError::TableNotFound(table_id.to_string()))
    }

    pub fn get_version_list(&self, table_id: &str, key: &RecordKey) -> Result<Vec<VersionEntry>> {
        Ok(self.table(table_id)?.get_version_list(key))
    }

    pub fn init_and_get_version_list(
        &self,
        table_id: &str,
        key: &RecordKey,
    ) -> Result<Vec<VersionEntry>> {
        Ok(self.table(table_id)?.init_and_get_version_list(key))
    }

    pub fn upload_new_version_entry(
        &self,
        table_id: &str,
        key: &RecordKey,
        version_key: VersionKey,
        entry: VersionEntry,
    ) -> Result<bool> {
        Ok(self
            .table(table_id)?
            .upload_new_version_entry(key, version_key, entry))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn replace_version_entry(
        &self,
        table_id: &str,
        key: &RecordKey,
        version_key: VersionKey,
        begin_ts: Ts,
        end_ts: Ts,
        tx_id: TxId,
        read_tx_id: TxId,
        expected_end_ts: Ts,
    ) -> Result<Option<VersionEntry>> {
        Ok(self.table(table_id)?.replace_version_entry(
            key,
            version_key,
            begin_ts,
            end_ts,
            tx_id,
            read_tx_id,
            expected_end_ts,
        ))
    }

    pub fn replace_whole_version_entry(
        &self,
        table_id: &str,
        key: &RecordKey,
        version_key: VersionKey,
        entry: VersionEntry,
    ) -> Result<Option<VersionEntry>> {
        Ok(self
            .table(table_id)?
            .replace_whole_version_entry(key, version_key, entry))
    }

    pub fn update_version_max_commit_ts(
        &self,
        table_id: &str,
        key: &RecordKey,
        version_key: VersionKey,
        ts: Ts,
    ) -> Result<Option<VersionEntry>> {
        Ok(self
            .table(table_id)?
            .update_version_max_commit_ts(key, version_key, ts))
    }

    pub fn get_version_entry_by_key(
        &self,
        table_id: &str,
        key: &RecordKey,
        version_key: VersionKey,
    ) -> Result<Option<VersionEntry>> {
        Ok(self
            .table(table_id)?
            .get_version_entry_by_key(key, version_key))
    }

    pub fn get_version_entries(
        &self,
        table_id: &str,
        batch: &[(RecordKey, VersionKey)],
    ) -> Result<HashMap<(RecordKey, VersionKey), VersionEntry>> {
        Ok(self.table(table_id)?.get_version_entries(batch))
    }

    pub fn delete_version_entry(
        &self,
        table_id: &str,
        key: &RecordKey,
        version_key: VersionKey,
    ) -> Result<bool> {
        Ok(self
            .table(table_id)?
            .delete_version_entry(key, version_key))
    }
}

/// Default partitioner: uniform hash over the key bytes
pub(crate) fn hash_partitioner() -> Partitioner {
    Arc::new(|key: &RecordKey| {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish() as usize
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Payload, INF_TS, NONE_TX};

    fn test_db() -> Arc<VersionDb> {
        VersionDb::new(EngineConfig::for_testing())
    }

    #[test]
    fn test_create_is_idempotent() {
        let db = test_db();
        let first = db.create_version_table("orders");
        let second = db.create_version_table("orders");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.partition_count(), 4);
    }

    #[test]
    fn test_operations_on_deleted_table_fail() {
        let db = test_db();
        db.create_version_table("orders");
        assert!(db.delete_table("orders"));
        assert!(!db.delete_table("orders"));

        let err = db.get_version_list("orders", &b"k".to_vec()).unwrap_err();
        assert!(matches!(err, EngineError::TableNotFound(_)));
    }

    #[test]
    fn test_dispatch_routes_to_owning_table() {
        let db = test_db();
        db.create_version_table("orders");
        let key = b"k".to_vec();

        let entry = VersionEntry::new(
            key.clone(),
            0,
            0,
            INF_TS,
            NONE_TX,
            0,
            Payload::Value(b"v".to_vec()),
        );
        assert!(db
            .upload_new_version_entry("orders", &key, 0, entry)
            .unwrap());

        let found = db
            .get_version_entry_by_key("orders", &key, 0)
            .unwrap()
            .unwrap();
        assert_eq!(found.version_key, 0);

        // Other tables are unaffected
        db.create_version_table("items");
        assert!(db.get_version_list("items", &key).unwrap().is_empty());
    }

    #[test]
    fn test_partition_functions_are_deterministic() {
        let db = test_db();
        let table = db.create_version_table("orders");
        let key = b"warehouse-7".to_vec();

        let physical = table.partition_of(&key);
        let logical = db.logical_partition_by_key(&key);
        for _ in 0..10 {
            assert_eq!(table.partition_of(&key), physical);
            assert_eq!(db.logical_partition_by_key(&key), logical);
        }
        assert!(logical < db.config().logical_partitions);
    }
}
