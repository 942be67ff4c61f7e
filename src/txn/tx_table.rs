//! Transaction table
//!
//! Metadata for in-flight transactions: identifier, status, commit
//! timestamp, commit lower bound. Queried during validation and by
//! readers resolving provisional version entries, so entries are
//! retained for the lifetime of the engine run; the harness may drop
//! finalized transactions between runs with [`TxTable::remove`].

use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::types::{Ts, TxId, RETURN_ERROR_CODE, UNSET_TS};

/// Lifecycle of a transaction; the terminal states have no way back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Ongoing,
    Committed,
    Aborted,
}

/// Point-in-time snapshot of one transaction's metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxTableEntry {
    pub tx_id: TxId,
    pub status: TxStatus,
    pub commit_time: Ts,
    pub commit_lower_bound: Ts,
}

struct TxRecord {
    status: TxStatus,
    commit_time: Ts,
    commit_lower_bound: Ts,
}

/// State of every in-flight transaction
pub struct TxTable {
    entries: DashMap<TxId, Mutex<TxRecord>>,
    next_tx_id: AtomicI64,
}

impl TxTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_tx_id: AtomicI64::new(1),
        }
    }

    /// Allocate a fresh transaction: status ONGOING, commit time unset,
    /// lower bound zero
    pub fn insert_new_tx(&self) -> TxId {
        let tx_id = self.next_tx_id.fetch_add(1, Ordering::SeqCst);
        self.entries.insert(
            tx_id,
            Mutex::new(TxRecord {
                status: TxStatus::Ongoing,
                commit_time: UNSET_TS,
                commit_lower_bound: 0,
            }),
        );
        tx_id
    }

    /// Current snapshot; None if the id was never allocated
    pub fn get_tx_table_entry(&self, tx_id: TxId) -> Option<TxTableEntry> {
        self.entries.get(&tx_id).map(|entry| {
            let record = entry.lock();
            TxTableEntry {
                tx_id,
                status: record.status,
                commit_time: record.commit_time,
                commit_lower_bound: record.commit_lower_bound,
            }
        })
    }

    /// Only ONGOING -> COMMITTED and ONGOING -> ABORTED take effect;
    /// every other transition is a no-op
    pub fn update_tx_status(&self, tx_id: TxId, status: TxStatus) {
        if let Some(entry) = self.entries.get(&tx_id) {
            let mut record = entry.lock();
            if record.status == TxStatus::Ongoing && status != TxStatus::Ongoing {
                record.status = status;
            }
        }
    }

    /// Atomically claim a commit time
    ///
    /// If the commit time is still unset and the proposal clears the
    /// lower bound, stores `max(proposed, lower_bound)` and returns it;
    /// otherwise returns -1. Once set, every call returns the stored
    /// value unchanged.
    pub fn set_and_get_commit_time(&self, tx_id: TxId, proposed: Ts) -> Ts {
        let Some(entry) = self.entries.get(&tx_id) else {
            return UNSET_TS;
        };
        let mut record = entry.lock();
        if record.commit_time != UNSET_TS {
            return record.commit_time;
        }
        if proposed < record.commit_lower_bound {
            return UNSET_TS;
        }
        record.commit_time = proposed.max(record.commit_lower_bound);
        record.commit_time
    }

    /// Push a transaction's earliest permissible commit time
    ///
    /// Returns -2 on internal error (unknown tx id), -1 if the bound
    /// was accepted (the stored value becomes `max(current, bound)`),
    /// or the already-fixed commit time unchanged.
    pub fn update_commit_lower_bound(&self, tx_id: TxId, lower_bound: Ts) -> i64 {
        let Some(entry) = self.entries.get(&tx_id) else {
            return RETURN_ERROR_CODE;
        };
        let mut record = entry.lock();
        if record.commit_time != UNSET_TS {
            return record.commit_time;
        }
        record.commit_lower_bound = record.commit_lower_bound.max(lower_bound);
        UNSET_TS
    }

    /// Drop a finalized transaction once no version references it
    pub fn remove(&self, tx_id: TxId) -> bool {
        self.entries.remove(&tx_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TxTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_allocates_unique_positive_ids() {
        let table = TxTable::new();
        let a = table.insert_new_tx();
        let b = table.insert_new_tx();
        assert!(a > 0 && b > 0);
        assert_ne!(a, b);

        let entry = table.get_tx_table_entry(a).unwrap();
        assert_eq!(entry.status, TxStatus::Ongoing);
        assert_eq!(entry.commit_time, UNSET_TS);
        assert_eq!(entry.commit_lower_bound, 0);

        assert!(table.get_tx_table_entry(9999).is_none());
    }

    #[test]
    fn test_status_transitions_are_one_way() {
        let table = TxTable::new();
        let tx = table.insert_new_tx();

        table.update_tx_status(tx, TxStatus::Committed);
        assert_eq!(table.get_tx_table_entry(tx).unwrap().status, TxStatus::Committed);

        // Terminal states stay put
        table.update_tx_status(tx, TxStatus::Aborted);
        assert_eq!(table.get_tx_table_entry(tx).unwrap().status, TxStatus::Committed);
        table.update_tx_status(tx, TxStatus::Ongoing);
        assert_eq!(table.get_tx_table_entry(tx).unwrap().status, TxStatus::Committed);
    }

    #[test]
    fn test_commit_time_is_claimed_once() {
        let table = TxTable::new();
        let tx = table.insert_new_tx();

        assert_eq!(table.set_and_get_commit_time(tx, 7), 7);
        // Idempotent: any later proposal returns the first value
        assert_eq!(table.set_and_get_commit_time(tx, 3), 7);
        assert_eq!(table.set_and_get_commit_time(tx, 100), 7);
    }

    #[test]
    fn test_commit_time_respects_lower_bound() {
        let table = TxTable::new();
        let tx = table.insert_new_tx();

        assert_eq!(table.update_commit_lower_bound(tx, 8), UNSET_TS);
        // Proposal below the bound is rejected
        assert_eq!(table.set_and_get_commit_time(tx, 6), UNSET_TS);
        // Proposal at the bound succeeds
        assert_eq!(table.set_and_get_commit_time(tx, 8), 8);
    }

    #[test]
    fn test_lower_bound_is_monotone() {
        let table = TxTable::new();
        let tx = table.insert_new_tx();

        assert_eq!(table.update_commit_lower_bound(tx, 5), UNSET_TS);
        assert_eq!(table.update_commit_lower_bound(tx, 3), UNSET_TS);
        assert_eq!(table.get_tx_table_entry(tx).unwrap().commit_lower_bound, 5);

        // After the commit time is fixed, pushes return it unchanged
        assert_eq!(table.set_and_get_commit_time(tx, 10), 10);
        assert_eq!(table.update_commit_lower_bound(tx, 20), 10);
        assert_eq!(table.get_tx_table_entry(tx).unwrap().commit_lower_bound, 5);
    }

    #[test]
    fn test_lower_bound_unknown_tx_is_internal_error() {
        let table = TxTable::new();
        assert_eq!(table.update_commit_lower_bound(42, 1), RETURN_ERROR_CODE);
    }

    #[test]
    fn test_concurrent_allocation() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let table = Arc::new(TxTable::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = table.clone();
            handles.push(std::thread::spawn(move || {
                (0..100).map(|_| table.insert_new_tx()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for tx in handle.join().unwrap() {
                assert!(seen.insert(tx), "duplicate tx id {}", tx);
            }
        }
        assert_eq!(table.len(), 800);
    }
}
