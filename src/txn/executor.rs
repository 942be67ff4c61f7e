//! Transaction executor
//!
//! Drives one transaction end-to-end through the MVCC protocol:
//! read and write-set accumulation, upload, validation, commit
//! decision, post-processing. One execution handle is bound to one
//! worker and is never re-entered from another thread; it is recycled
//! across transactions with [`Execution::begin`].
//!
//! Writes are optimistic. Uploading installs a provisional version
//! (`begin = end = inf`, writer id set) and closes the predecessor with
//! the writer id as a placeholder end timestamp; validation claims a
//! commit time past every floor the transaction observed, re-checks the
//! read set, and pushes concurrent rivals to commit later; post-
//! processing stamps the real timestamps, or rolls everything back on
//! abort.

use std::sync::Arc;

use tracing::trace;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::txn::tx_table::TxStatus;
use crate::txn::version_db::VersionDb;
use crate::txn::version_entry::VersionEntry;
use crate::txn::version_table::Partitioner;
use crate::types::{
    Payload, RecordKey, TableId, Ts, TxId, VersionKey, INF_TS, NONE_TX, RETURN_ERROR_CODE,
    UNSET_TS,
};

/// Terminal outcome of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxFinalStatus {
    Committed,
    Aborted,
}

/// One observed read, enough to re-validate it at commit time
struct ReadSetEntry {
    table_id: TableId,
    key: RecordKey,
    version_key: VersionKey,
    /// Floor observed at read time; feeds the commit time proposal
    max_commit_ts: Ts,
}

/// One staged write plus the upload bookkeeping rollback needs
struct WriteSetEntry {
    table_id: TableId,
    key: RecordKey,
    /// Slot of the new version: predecessor's key + 1
    version_key: VersionKey,
    payload: Payload,
    /// Head image observed when the write was staged
    predecessor: VersionEntry,
    /// Refreshed from the close CAS post-image during upload
    predecessor_max_commit_ts: Ts,
    uploaded: bool,
    predecessor_closed: bool,
}

/// How one version entry relates to a read timestamp
///
/// A visible version carries the floor the reader must out-propose:
/// normally the entry's max_commit_ts, but never below the effective
/// begin timestamp of a version resolved through a committed writer.
enum Visibility {
    Visible { floor: Ts },
    Skip,
}

/// Per-worker transaction execution handle
pub struct Execution {
    db: Arc<VersionDb>,
    tx_id: TxId,
    read_ts: Ts,
    commit_ts: Ts,
    aborted: bool,
    read_set: Vec<ReadSetEntry>,
    write_set: Vec<WriteSetEntry>,
}

impl Execution {
    pub fn new(db: Arc<VersionDb>) -> Self {
        Self {
            db,
            tx_id: NONE_TX,
            read_ts: INF_TS - 1,
            commit_ts: UNSET_TS,
            aborted: false,
            read_set: Vec::new(),
            write_set: Vec::new(),
        }
    }

    pub fn db(&self) -> &Arc<VersionDb> {
        &self.db
    }

    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    /// Commit time of the last committed transaction, or -1
    pub fn commit_ts(&self) -> Ts {
        self.commit_ts
    }

    /// Start a transaction reading the latest committed state
    pub fn begin(&mut self) -> TxId {
        self.begin_at(INF_TS - 1)
    }

    /// Start a transaction with an explicit snapshot-read timestamp
    pub fn begin_at(&mut self, read_ts: Ts) -> TxId {
        self.tx_id = self.db.tx_table().insert_new_tx();
        self.read_ts = read_ts;
        self.commit_ts = UNSET_TS;
        self.aborted = false;
        self.read_set.clear();
        self.write_set.clear();
        self.tx_id
    }

    /// Read a record at the transaction's snapshot timestamp
    pub fn read(&mut self, table_id: &str, key: &RecordKey) -> Result<Option<Vec<u8>>> {
        let rts = self.read_ts;
        self.read_internal(table_id, key, rts)
    }

    /// Time-travel read at an explicit timestamp
    pub fn read_at(&mut self, table_id: &str, key: &RecordKey, rts: Ts) -> Result<Option<Vec<u8>>> {
        self.read_internal(table_id, key, rts)
    }

    /// Stage an update of an existing key
    pub fn write(&mut self, table_id: &str, key: &RecordKey, value: Vec<u8>) -> Result<()> {
        self.stage(table_id, key, Payload::Value(value), false)
    }

    /// Stage an insert; initializes the version list so the new-key and
    /// existing-key paths stay uniform
    pub fn insert(&mut self, table_id: &str, key: &RecordKey, value: Vec<u8>) -> Result<()> {
        self.stage(table_id, key, Payload::Value(value), true)
    }

    /// Stage a delete: a new version carrying the tombstone
    pub fn delete(&mut self, table_id: &str, key: &RecordKey) -> Result<()> {
        self.stage(table_id, key, Payload::Tombstone, false)
    }

    /// Self-abort: mark the transaction aborted and roll back every
    /// provisional version it installed
    pub fn abort(&mut self) -> Result<TxFinalStatus> {
        self.finish_abort()
    }

    /// Run upload, validation, and post-processing; returns the
    /// terminal status
    pub fn commit(&mut self) -> Result<TxFinalStatus> {
        if self.tx_id == NONE_TX {
            return Err(EngineError::Transaction("no active transaction".to_string()));
        }
        if self.aborted {
            return self.finish_abort();
        }
        match self.upload() {
            Ok(true) => {}
            Ok(false) => return self.finish_abort(),
            Err(e) => {
                self.finish_abort()?;
                return Err(e);
            }
        }
        match self.validate() {
            Ok(true) => self.finish_commit(),
            Ok(false) => self.finish_abort(),
            Err(fault) => {
                self.finish_abort()?;
                Err(fault)
            }
        }
    }

    fn read_internal(
        &mut self,
        table_id: &str,
        key: &RecordKey,
        rts: Ts,
    ) -> Result<Option<Vec<u8>>> {
        // Read-your-own-writes from the staged write set
        if let Some(write) = self
            .write_set
            .iter()
            .find(|w| w.table_id == table_id && w.key == *key)
        {
            return Ok(write.payload.as_value().map(<[u8]>::to_vec));
        }

        let list = match self.db.get_version_list(table_id, key) {
            Ok(list) => list,
            Err(e) => {
                self.aborted = true;
                return Err(e);
            }
        };
        for entry in list.iter().rev() {
            if let Visibility::Visible { floor } = self.resolve(entry, rts) {
                self.read_set.push(ReadSetEntry {
                    table_id: table_id.to_string(),
                    key: key.clone(),
                    version_key: entry.version_key,
                    max_commit_ts: floor,
                });
                return Ok(entry.payload.as_value().map(<[u8]>::to_vec));
            }
        }
        Ok(None)
    }

    /// Resolve one entry against a read timestamp, looking provisional
    /// begin/end fields up in the transaction table. A reader never
    /// waits for a writer: ONGOING writers are skipped, ONGOING closers
    /// leave the entry open.
    fn resolve(&self, entry: &VersionEntry, rts: Ts) -> Visibility {
        if entry.tx_id == NONE_TX {
            if entry.begin_ts <= rts && rts < entry.end_ts {
                return Visibility::Visible {
                    floor: entry.max_commit_ts,
                };
            }
            return Visibility::Skip;
        }

        if entry.begin_ts == INF_TS {
            // Provisional upload. Visible only once its writer has
            // committed at or before the read timestamp.
            if entry.tx_id == self.tx_id {
                return Visibility::Skip;
            }
            return match self.db.tx_table().get_tx_table_entry(entry.tx_id) {
                Some(writer)
                    if writer.status == TxStatus::Committed && writer.commit_time <= rts =>
                {
                    Visibility::Visible {
                        floor: entry.max_commit_ts.max(writer.commit_time),
                    }
                }
                _ => Visibility::Skip,
            };
        }

        // A closed-pending predecessor: the end field holds the closer's
        // id until that transaction post-processes.
        if entry.begin_ts > rts {
            return Visibility::Skip;
        }
        if entry.tx_id == self.tx_id {
            // Our own pending closure has not committed yet
            return Visibility::Visible {
                floor: entry.max_commit_ts,
            };
        }
        match self.db.tx_table().get_tx_table_entry(entry.tx_id) {
            Some(closer) if closer.status == TxStatus::Committed => {
                if rts < closer.commit_time {
                    Visibility::Visible {
                        floor: entry.max_commit_ts,
                    }
                } else {
                    Visibility::Skip
                }
            }
            // ONGOING or ABORTED closers leave the version open; a
            // recycled id means the closure was already finalized away
            _ => Visibility::Visible {
                floor: entry.max_commit_ts,
            },
        }
    }

    fn stage(
        &mut self,
        table_id: &str,
        key: &RecordKey,
        payload: Payload,
        init: bool,
    ) -> Result<()> {
        if self.tx_id == NONE_TX {
            return Err(EngineError::Transaction("no active transaction".to_string()));
        }
        // A second write to the same key folds into the staged slot
        if let Some(write) = self
            .write_set
            .iter_mut()
            .find(|w| w.table_id == table_id && w.key == *key)
        {
            write.payload = payload;
            return Ok(());
        }

        let fetched = if init {
            self.db.init_and_get_version_list(table_id, key)
        } else {
            self.db.get_version_list(table_id, key)
        };
        let list = match fetched {
            Ok(list) => list,
            Err(e) => {
                self.aborted = true;
                return Err(e);
            }
        };
        let Some(head) = list.last().cloned() else {
            self.aborted = true;
            return Err(EngineError::Transaction(format!(
                "update of uninitialized key in table {}",
                table_id
            )));
        };

        self.write_set.push(WriteSetEntry {
            table_id: table_id.to_string(),
            key: key.clone(),
            version_key: head.version_key + 1,
            payload,
            predecessor_max_commit_ts: head.max_commit_ts,
            predecessor: head,
            uploaded: false,
            predecessor_closed: false,
        });
        Ok(())
    }

    /// Upload phase: install every staged version and close its
    /// predecessor. Any lost race aborts the transaction.
    fn upload(&mut self) -> Result<bool> {
        for i in 0..self.write_set.len() {
            let (table_id, key, version_key, payload, predecessor) = {
                let w = &self.write_set[i];
                (
                    w.table_id.clone(),
                    w.key.clone(),
                    w.version_key,
                    w.payload.clone(),
                    w.predecessor.clone(),
                )
            };

            let entry = VersionEntry::uploaded(key.clone(), version_key, self.tx_id, payload);
            if !self
                .db
                .upload_new_version_entry(&table_id, &key, version_key, entry)?
            {
                trace!(tx = self.tx_id, table = %table_id, "upload lost the slot race");
                return Ok(false);
            }
            self.write_set[i].uploaded = true;

            // Only a fully post-processed head can be closed; a
            // predecessor still held by another writer is a conflict
            if predecessor.tx_id != NONE_TX {
                trace!(tx = self.tx_id, table = %table_id, "predecessor still provisional");
                return Ok(false);
            }
            let closed = self.db.replace_version_entry(
                &table_id,
                &key,
                predecessor.version_key,
                predecessor.begin_ts,
                self.tx_id,
                self.tx_id,
                NONE_TX,
                INF_TS,
            )?;
            match closed {
                Some(current) if current.tx_id == self.tx_id && current.end_ts == self.tx_id => {
                    self.write_set[i].predecessor_closed = true;
                    self.write_set[i].predecessor_max_commit_ts = current.max_commit_ts;
                }
                _ => {
                    trace!(tx = self.tx_id, table = %table_id, "predecessor close was beaten");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Validation phase: claim a commit time past every observed floor,
    /// re-check the read set, and force concurrent rivals after us.
    fn validate(&mut self) -> Result<bool> {
        let mut proposed: Ts = 0;
        for read in &self.read_set {
            proposed = proposed.max(read.max_commit_ts + 1);
        }
        for write in &self.write_set {
            proposed = proposed.max(write.predecessor_max_commit_ts + 1);
        }
        if let Some(own) = self.db.tx_table().get_tx_table_entry(self.tx_id) {
            proposed = proposed.max(own.commit_lower_bound);
        }

        let commit_ts = self.db.tx_table().set_and_get_commit_time(self.tx_id, proposed);
        if commit_ts < 0 {
            trace!(tx = self.tx_id, proposed, "commit time proposal rejected");
            return Ok(false);
        }
        self.commit_ts = commit_ts;

        // Read validation: raise the floor on every read version, then
        // confirm none of them was superseded at or before our commit
        for read in &self.read_set {
            let Some(current) = self.db.update_version_max_commit_ts(
                &read.table_id,
                &read.key,
                read.version_key,
                commit_ts,
            )?
            else {
                // The version was rolled back under us
                return Ok(false);
            };

            if current.tx_id == NONE_TX {
                if current.end_ts != INF_TS && current.end_ts <= commit_ts {
                    trace!(tx = self.tx_id, "read version superseded");
                    return Ok(false);
                }
                continue;
            }
            if current.tx_id == self.tx_id || current.begin_ts == INF_TS {
                // Closed by our own write, or still the provisional
                // image of the committed writer we resolved at read time
                continue;
            }

            // A pending closer holds the version: it must either commit
            // after us or already be fixed before us
            match self.db.tx_table().get_tx_table_entry(current.tx_id) {
                Some(closer) if closer.status == TxStatus::Ongoing => {
                    let ret = self
                        .db
                        .tx_table()
                        .update_commit_lower_bound(current.tx_id, commit_ts + 1);
                    if ret == RETURN_ERROR_CODE {
                        return Err(EngineError::ProtocolFault(format!(
                            "commit lower bound push failed for tx {}",
                            current.tx_id
                        )));
                    }
                    if ret >= 0 && ret <= commit_ts {
                        trace!(tx = self.tx_id, closer = current.tx_id, "closer fixed before us");
                        return Ok(false);
                    }
                }
                Some(closer)
                    if closer.status == TxStatus::Committed
                        && closer.commit_time <= commit_ts =>
                {
                    trace!(tx = self.tx_id, "read version closed before our commit");
                    return Ok(false);
                }
                _ => {}
            }
        }

        // Write validation: every ONGOING transaction visible in the
        // chains we wrote must land after us
        for write in &self.write_set {
            let list = self.db.get_version_list(&write.table_id, &write.key)?;
            for entry in &list {
                if entry.tx_id == NONE_TX || entry.tx_id == self.tx_id {
                    continue;
                }
                let Some(rival) = self.db.tx_table().get_tx_table_entry(entry.tx_id) else {
                    continue;
                };
                if rival.status != TxStatus::Ongoing {
                    continue;
                }
                let ret = self
                    .db
                    .tx_table()
                    .update_commit_lower_bound(entry.tx_id, commit_ts + 1);
                if ret == RETURN_ERROR_CODE {
                    return Err(EngineError::ProtocolFault(format!(
                        "commit lower bound push failed for tx {}",
                        entry.tx_id
                    )));
                }
                if ret >= 0 && ret <= commit_ts {
                    trace!(tx = self.tx_id, rival = entry.tx_id, "rival fixed before us");
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    /// Commit post-processing: stamp the real timestamps on every
    /// provisional image this transaction owns
    fn finish_commit(&mut self) -> Result<TxFinalStatus> {
        self.db
            .tx_table()
            .update_tx_status(self.tx_id, TxStatus::Committed);

        for write in &self.write_set {
            // Invariant: a committed version's floor covers its own
            // begin timestamp, so successors propose strictly later
            self.db.update_version_max_commit_ts(
                &write.table_id,
                &write.key,
                write.version_key,
                self.commit_ts,
            )?;
            // New version becomes [commit_ts, inf) with no writer
            self.db.replace_version_entry(
                &write.table_id,
                &write.key,
                write.version_key,
                self.commit_ts,
                INF_TS,
                NONE_TX,
                self.tx_id,
                INF_TS,
            )?;
            if write.predecessor_closed {
                // We own the predecessor through the placeholder closure
                let closed = VersionEntry::new(
                    write.key.clone(),
                    write.predecessor.version_key,
                    write.predecessor.begin_ts,
                    self.commit_ts,
                    NONE_TX,
                    write.predecessor_max_commit_ts,
                    write.predecessor.payload.clone(),
                );
                self.db.replace_whole_version_entry(
                    &write.table_id,
                    &write.key,
                    write.predecessor.version_key,
                    closed,
                )?;
            }
        }
        Ok(TxFinalStatus::Committed)
    }

    /// Abort post-processing: delete uploaded versions and reopen the
    /// predecessors this transaction had closed
    fn finish_abort(&mut self) -> Result<TxFinalStatus> {
        self.db
            .tx_table()
            .update_tx_status(self.tx_id, TxStatus::Aborted);
        self.aborted = true;

        for write in &self.write_set {
            if write.uploaded {
                // False means nothing to undo; ignored
                self.db
                    .delete_version_entry(&write.table_id, &write.key, write.version_key)?;
            }
            if write.predecessor_closed {
                self.db.replace_version_entry(
                    &write.table_id,
                    &write.key,
                    write.predecessor.version_key,
                    write.predecessor.begin_ts,
                    INF_TS,
                    NONE_TX,
                    self.tx_id,
                    self.tx_id,
                )?;
            }
        }
        Ok(TxFinalStatus::Aborted)
    }
}

/// Builds the shared VersionDb and binds per-worker execution handles
pub struct ExecutionBuilder {
    config: EngineConfig,
    physical: Option<Partitioner>,
    logical: Option<Partitioner>,
}

impl ExecutionBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            physical: None,
            logical: None,
        }
    }

    pub fn physical_partitioner(mut self, partitioner: Partitioner) -> Self {
        self.physical = Some(partitioner);
        self
    }

    pub fn logical_partitioner(mut self, partitioner: Partitioner) -> Self {
        self.logical = Some(partitioner);
        self
    }

    pub fn build(self) -> Arc<VersionDb> {
        VersionDb::with_partitioners(
            self.config,
            self.physical
                .unwrap_or_else(crate::txn::version_db::hash_partitioner),
            self.logical
                .unwrap_or_else(crate::txn::version_db::hash_partitioner),
        )
    }

    /// Bind one execution handle to a worker
    pub fn bind(db: &Arc<VersionDb>) -> Execution {
        Execution::new(db.clone())
    }
}
