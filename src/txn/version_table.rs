//! Partitioned version table
//!
//! Storage for the version chains of one relation, and the
//! serialization point for concurrent access to any given key. Every
//! operation is reified as a request and enqueued onto the partition
//! that owns the key; a single-threaded visitor drains each partition,
//! so entries need no per-entry locks.
//!
//! Visitor mode: cooperative draining. Any thread may visit a partition
//! between its own operations; a per-partition mutex admits one visitor
//! at a time, and a submitting thread spins on its request's completion
//! flag while competing to become the visitor. Within a partition,
//! requests are executed in submission order: enqueue under the queue
//! lock, swap the request and flush queues under the same lock, then
//! drain the flush queue sequentially.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::BackendKind;
use crate::txn::version_entry::VersionEntry;
use crate::types::{RecordKey, TableId, Ts, TxId, VersionKey};

/// Maps a record key to a partition slot; deterministic by contract
pub type Partitioner = Arc<dyn Fn(&RecordKey) -> usize + Send + Sync>;

/// One table operation, reified for the partition queues
pub enum VersionEntryRequest {
    GetVersionList {
        key: RecordKey,
    },
    InitAndGetVersionList {
        key: RecordKey,
    },
    Upload {
        key: RecordKey,
        version_key: VersionKey,
        entry: VersionEntry,
    },
    Replace {
        key: RecordKey,
        version_key: VersionKey,
        begin_ts: Ts,
        end_ts: Ts,
        tx_id: TxId,
        read_tx_id: TxId,
        expected_end_ts: Ts,
    },
    ReplaceWhole {
        key: RecordKey,
        version_key: VersionKey,
        entry: VersionEntry,
    },
    UpdateMaxCommitTs {
        key: RecordKey,
        version_key: VersionKey,
        ts: Ts,
    },
    GetEntry {
        key: RecordKey,
        version_key: VersionKey,
    },
    Delete {
        key: RecordKey,
        version_key: VersionKey,
    },
    Clear,
}

/// Result written into a request's slot by the visitor
pub enum RequestOutcome {
    Entries(Vec<VersionEntry>),
    Entry(Option<VersionEntry>),
    Uploaded(bool),
    Deleted(bool),
    Done,
}

impl RequestOutcome {
    fn into_entries(self) -> Vec<VersionEntry> {
        match self {
            RequestOutcome::Entries(entries) => entries,
            _ => Vec::new(),
        }
    }

    fn into_entry(self) -> Option<VersionEntry> {
        match self {
            RequestOutcome::Entry(entry) => entry,
            _ => None,
        }
    }

    fn into_uploaded(self) -> bool {
        matches!(self, RequestOutcome::Uploaded(true))
    }

    fn into_deleted(self) -> bool {
        matches!(self, RequestOutcome::Deleted(true))
    }
}

/// A request plus the slot its submitter spins on
struct PendingRequest {
    request: VersionEntryRequest,
    outcome: Mutex<Option<RequestOutcome>>,
    done: AtomicBool,
}

impl PendingRequest {
    fn new(request: VersionEntryRequest) -> Arc<Self> {
        Arc::new(Self {
            request,
            outcome: Mutex::new(None),
            done: AtomicBool::new(false),
        })
    }
}

/// Capability set a version back end must provide
///
/// The visitor is the only caller of the `&mut self` methods, so
/// implementations never see concurrent mutation of one partition. A
/// persistent back end must materialize the VersionEntry fields
/// verbatim and honor the same conditional-replace semantics.
pub trait VersionStore: Send {
    /// All versions of a key, ordered by version key (may be empty)
    fn version_list(&self, key: &RecordKey) -> Vec<VersionEntry>;

    /// Same, but installs the sentinel empty head first if the chain
    /// is empty
    fn init_version_list(&mut self, key: &RecordKey) -> Vec<VersionEntry>;

    /// Install an entry into an empty (key, version_key) slot; false if
    /// another writer won the slot
    fn upload(&mut self, key: &RecordKey, version_key: VersionKey, entry: VersionEntry) -> bool;

    /// Conditional replace: rewrites (begin, end, tx) only if the
    /// current entry's `tx_id == read_tx_id` and `end_ts ==
    /// expected_end_ts`. Returns the post-image when the condition
    /// held, the current image when it did not, None when the slot is
    /// missing.
    #[allow(clippy::too_many_arguments)]
    fn replace(
        &mut self,
        key: &RecordKey,
        version_key: VersionKey,
        begin_ts: Ts,
        end_ts: Ts,
        tx_id: TxId,
        read_tx_id: TxId,
        expected_end_ts: Ts,
    ) -> Option<VersionEntry>;

    /// Unconditional overwrite of an entry the caller already owns
    fn replace_whole(
        &mut self,
        key: &RecordKey,
        version_key: VersionKey,
        entry: VersionEntry,
    ) -> Option<VersionEntry>;

    /// `max_commit_ts := max(current, ts)`; returns the updated entry
    fn update_max_commit_ts(
        &mut self,
        key: &RecordKey,
        version_key: VersionKey,
        ts: Ts,
    ) -> Option<VersionEntry>;

    fn entry(&self, key: &RecordKey, version_key: VersionKey) -> Option<VersionEntry>;

    /// Roll back an insert; whether something was removed
    fn delete(&mut self, key: &RecordKey, version_key: VersionKey) -> bool;

    fn clear(&mut self);
}

/// In-memory back end: version chains ordered by version key
#[derive(Default)]
pub struct MemoryStore {
    chains: HashMap<RecordKey, BTreeMap<VersionKey, VersionEntry>>,
}

impl VersionStore for MemoryStore {
    fn version_list(&self, key: &RecordKey) -> Vec<VersionEntry> {
        self.chains
            .get(key)
            .map(|chain| chain.values().cloned().collect())
            .unwrap_or_default()
    }

    fn init_version_list(&mut self, key: &RecordKey) -> Vec<VersionEntry> {
        let chain = self.chains.entry(key.clone()).or_default();
        if chain.is_empty() {
            let sentinel = VersionEntry::sentinel(key.clone());
            chain.insert(sentinel.version_key, sentinel);
        }
        chain.values().cloned().collect()
    }

    fn upload(&mut self, key: &RecordKey, version_key: VersionKey, entry: VersionEntry) -> bool {
        let chain = self.chains.entry(key.clone()).or_default();
        if chain.contains_key(&version_key) {
            return false;
        }
        chain.insert(version_key, entry);
        true
    }

    fn replace(
        &mut self,
        key: &RecordKey,
        version_key: VersionKey,
        begin_ts: Ts,
        end_ts: Ts,
        tx_id: TxId,
        read_tx_id: TxId,
        expected_end_ts: Ts,
    ) -> Option<VersionEntry> {
        let entry = self.chains.get_mut(key)?.get_mut(&version_key)?;
        if entry.tx_id == read_tx_id && entry.end_ts == expected_end_ts {
            entry.begin_ts = begin_ts;
            entry.end_ts = end_ts;
            entry.tx_id = tx_id;
        }
        Some(entry.clone())
    }

    fn replace_whole(
        &mut self,
        key: &RecordKey,
        version_key: VersionKey,
        entry: VersionEntry,
    ) -> Option<VersionEntry> {
        let chain = self.chains.get_mut(key)?;
        let slot = chain.get_mut(&version_key)?;
        *slot = entry.clone();
        Some(entry)
    }

    fn update_max_commit_ts(
        &mut self,
        key: &RecordKey,
        version_key: VersionKey,
        ts: Ts,
    ) -> Option<VersionEntry> {
        let entry = self.chains.get_mut(key)?.get_mut(&version_key)?;
        entry.max_commit_ts = entry.max_commit_ts.max(ts);
        Some(entry.clone())
    }

    fn entry(&self, key: &RecordKey, version_key: VersionKey) -> Option<VersionEntry> {
        self.chains.get(key)?.get(&version_key).cloned()
    }

    fn delete(&mut self, key: &RecordKey, version_key: VersionKey) -> bool {
        match self.chains.get_mut(key) {
            Some(chain) => chain.remove(&version_key).is_some(),
            None => false,
        }
    }

    fn clear(&mut self) {
        self.chains.clear();
    }
}

/// Visitor-owned partition state: the flush queue and the store it
/// drains into
struct ShardInner {
    flush: Vec<Arc<PendingRequest>>,
    store: Box<dyn VersionStore>,
}

/// One partition: a request queue on the enqueue side and the
/// single-visitor state behind its own lock
struct Shard {
    /// Request queue; the guard doubles as the swap lock
    incoming: Mutex<Vec<Arc<PendingRequest>>>,

    /// Held for the duration of one drain; try_lock keeps the visitor
    /// single-threaded without blocking enqueuers
    inner: Mutex<ShardInner>,
}

impl Shard {
    fn new(backend: BackendKind) -> Self {
        let store: Box<dyn VersionStore> = match backend {
            BackendKind::Memory => Box::<MemoryStore>::default(),
        };
        Self {
            incoming: Mutex::new(Vec::new()),
            inner: Mutex::new(ShardInner {
                flush: Vec::new(),
                store,
            }),
        }
    }
}

/// Version chains of one relation, sharded into independent partitions
pub struct VersionTable {
    table_id: TableId,
    shards: Vec<Shard>,
    partitioner: Partitioner,
}

impl VersionTable {
    pub(crate) fn new(
        table_id: TableId,
        partitions: usize,
        backend: BackendKind,
        partitioner: Partitioner,
    ) -> Self {
        let shards = (0..partitions.max(1)).map(|_| Shard::new(backend)).collect();
        Self {
            table_id,
            shards,
            partitioner,
        }
    }

    pub fn table_id(&self) -> &str {
        &self.table_id
    }

    pub fn partition_count(&self) -> usize {
        self.shards.len()
    }

    /// Partition that serializes all operations on a key
    pub fn partition_of(&self, key: &RecordKey) -> usize {
        (self.partitioner)(key) % self.shards.len()
    }

    pub fn get_version_list(&self, key: &RecordKey) -> Vec<VersionEntry> {
        let partition = self.partition_of(key);
        self.submit(partition, VersionEntryRequest::GetVersionList { key: key.clone() })
            .into_entries()
    }

    pub fn init_and_get_version_list(&self, key: &RecordKey) -> Vec<VersionEntry> {
        let partition = self.partition_of(key);
        self.submit(
            partition,
            VersionEntryRequest::InitAndGetVersionList { key: key.clone() },
        )
        .into_entries()
    }

    /// True if the (key, version_key) slot was empty and the entry was
    /// installed; false if another writer won
    pub fn upload_new_version_entry(
        &self,
        key: &RecordKey,
        version_key: VersionKey,
        entry: VersionEntry,
    ) -> bool {
        let partition = self.partition_of(key);
        self.submit(
            partition,
            VersionEntryRequest::Upload {
                key: key.clone(),
                version_key,
                entry,
            },
        )
        .into_uploaded()
    }

    /// Conditional replace; see [`VersionStore::replace`]
    #[allow(clippy::too_many_arguments)]
    pub fn replace_version_entry(
        &self,
        key: &RecordKey,
        version_key: VersionKey,
        begin_ts: Ts,
        end_ts: Ts,
        tx_id: TxId,
        read_tx_id: TxId,
        expected_end_ts: Ts,
    ) -> Option<VersionEntry> {
        let partition = self.partition_of(key);
        self.submit(
            partition,
            VersionEntryRequest::Replace {
                key: key.clone(),
                version_key,
                begin_ts,
                end_ts,
                tx_id,
                read_tx_id,
                expected_end_ts,
            },
        )
        .into_entry()
    }

    /// Unconditional overwrite of an entry the caller already holds
    /// through its tx id
    pub fn replace_whole_version_entry(
        &self,
        key: &RecordKey,
        version_key: VersionKey,
        entry: VersionEntry,
    ) -> Option<VersionEntry> {
        let partition = self.partition_of(key);
        self.submit(
            partition,
            VersionEntryRequest::ReplaceWhole {
                key: key.clone(),
                version_key,
                entry,
            },
        )
        .into_entry()
    }

    /// Raise the floor on the commit time of future overwriters
    pub fn update_version_max_commit_ts(
        &self,
        key: &RecordKey,
        version_key: VersionKey,
        ts: Ts,
    ) -> Option<VersionEntry> {
        let partition = self.partition_of(key);
        self.submit(
            partition,
            VersionEntryRequest::UpdateMaxCommitTs {
                key: key.clone(),
                version_key,
                ts,
            },
        )
        .into_entry()
    }

    pub fn get_version_entry_by_key(
        &self,
        key: &RecordKey,
        version_key: VersionKey,
    ) -> Option<VersionEntry> {
        let partition = self.partition_of(key);
        self.submit(
            partition,
            VersionEntryRequest::GetEntry {
                key: key.clone(),
                version_key,
            },
        )
        .into_entry()
    }

    /// Batch lookup; the map holds every slot that was found
    pub fn get_version_entries(
        &self,
        batch: &[(RecordKey, VersionKey)],
    ) -> HashMap<(RecordKey, VersionKey), VersionEntry> {
        let mut found = HashMap::with_capacity(batch.len());
        for (key, version_key) in batch {
            if let Some(entry) = self.get_version_entry_by_key(key, *version_key) {
                found.insert((key.clone(), *version_key), entry);
            }
        }
        found
    }

    /// Roll back an insert; whether something was removed
    pub fn delete_version_entry(&self, key: &RecordKey, version_key: VersionKey) -> bool {
        let partition = self.partition_of(key);
        self.submit(
            partition,
            VersionEntryRequest::Delete {
                key: key.clone(),
                version_key,
            },
        )
        .into_deleted()
    }

    /// Empty every partition (test-only)
    pub fn clear(&self) {
        for partition in 0..self.shards.len() {
            self.submit(partition, VersionEntryRequest::Clear);
        }
    }

    /// Enqueue a request and wait for its result, volunteering as the
    /// partition visitor while waiting
    fn submit(&self, partition: usize, request: VersionEntryRequest) -> RequestOutcome {
        let pending = PendingRequest::new(request);
        self.shards[partition].incoming.lock().push(pending.clone());
        loop {
            if pending.done.load(Ordering::Acquire) {
                if let Some(outcome) = pending.outcome.lock().take() {
                    return outcome;
                }
            }
            self.visit(partition);
            std::hint::spin_loop();
        }
    }

    /// Drain one partition if no other thread is already its visitor
    pub fn visit(&self, partition: usize) {
        let shard = &self.shards[partition];
        let Some(mut inner) = shard.inner.try_lock() else {
            return;
        };
        loop {
            {
                let mut incoming = shard.incoming.lock();
                if incoming.is_empty() {
                    break;
                }
                std::mem::swap(&mut *incoming, &mut inner.flush);
            }
            let ShardInner { flush, store } = &mut *inner;
            for pending in flush.drain(..) {
                let outcome = execute(store.as_mut(), &pending.request);
                *pending.outcome.lock() = Some(outcome);
                pending.done.store(true, Ordering::Release);
            }
        }
    }
}

/// Apply one request against a partition store
fn execute(store: &mut dyn VersionStore, request: &VersionEntryRequest) -> RequestOutcome {
    match request {
        VersionEntryRequest::GetVersionList { key } => {
            RequestOutcome::Entries(store.version_list(key))
        }
        VersionEntryRequest::InitAndGetVersionList { key } => {
            RequestOutcome::Entries(store.init_version_list(key))
        }
        VersionEntryRequest::Upload {
            key,
            version_key,
            entry,
        } => RequestOutcome::Uploaded(store.upload(key, *version_key, entry.clone())),
        VersionEntryRequest::Replace {
            key,
            version_key,
            begin_ts,
            end_ts,
            tx_id,
            read_tx_id,
            expected_end_ts,
        } => RequestOutcome::Entry(store.replace(
            key,
            *version_key,
            *begin_ts,
            *end_ts,
            *tx_id,
            *read_tx_id,
            *expected_end_ts,
        )),
        VersionEntryRequest::ReplaceWhole {
            key,
            version_key,
            entry,
        } => RequestOutcome::Entry(store.replace_whole(key, *version_key, entry.clone())),
        VersionEntryRequest::UpdateMaxCommitTs {
            key,
            version_key,
            ts,
        } => RequestOutcome::Entry(store.update_max_commit_ts(key, *version_key, *ts)),
        VersionEntryRequest::GetEntry { key, version_key } => {
            RequestOutcome::Entry(store.entry(key, *version_key))
        }
        VersionEntryRequest::Delete { key, version_key } => {
            RequestOutcome::Deleted(store.delete(key, *version_key))
        }
        VersionEntryRequest::Clear => {
            store.clear();
            RequestOutcome::Done
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Payload, INF_TS, NONE_TX};
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_partitioner() -> Partitioner {
        Arc::new(|key: &RecordKey| {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            hasher.finish() as usize
        })
    }

    fn test_table() -> VersionTable {
        VersionTable::new(
            "t".to_string(),
            4,
            BackendKind::Memory,
            hash_partitioner(),
        )
    }

    fn value(bytes: &[u8]) -> Payload {
        Payload::Value(bytes.to_vec())
    }

    #[test]
    fn test_init_installs_sentinel_once() {
        let table = test_table();
        let key = b"a".to_vec();

        assert!(table.get_version_list(&key).is_empty());

        let list = table.init_and_get_version_list(&key);
        assert_eq!(list.len(), 1);
        assert!(list[0].is_sentinel());

        // Idempotent
        let list = table.init_and_get_version_list(&key);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_upload_slot_contention() {
        let table = test_table();
        let key = b"a".to_vec();

        let first = VersionEntry::uploaded(key.clone(), 0, 1, value(b"v1"));
        let second = VersionEntry::uploaded(key.clone(), 0, 2, value(b"v2"));

        assert!(table.upload_new_version_entry(&key, 0, first));
        assert!(!table.upload_new_version_entry(&key, 0, second));

        let list = table.get_version_list(&key);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].tx_id, 1);
    }

    #[test]
    fn test_replace_is_conditional() {
        let table = test_table();
        let key = b"a".to_vec();
        table.upload_new_version_entry(
            &key,
            0,
            VersionEntry::new(key.clone(), 0, 5, INF_TS, NONE_TX, 0, value(b"v")),
        );

        // Condition holds: close the version with tx 9 as placeholder
        let closed = table
            .replace_version_entry(&key, 0, 5, 9, 9, NONE_TX, INF_TS)
            .unwrap();
        assert_eq!(closed.end_ts, 9);
        assert_eq!(closed.tx_id, 9);

        // Condition no longer holds: current image comes back untouched
        let unchanged = table
            .replace_version_entry(&key, 0, 5, 11, 11, NONE_TX, INF_TS)
            .unwrap();
        assert_eq!(unchanged.end_ts, 9);
        assert_eq!(unchanged.tx_id, 9);

        // Missing slot
        assert!(table
            .replace_version_entry(&key, 7, 0, 0, NONE_TX, NONE_TX, INF_TS)
            .is_none());
    }

    #[test]
    fn test_max_commit_ts_only_rises() {
        let table = test_table();
        let key = b"a".to_vec();
        table.upload_new_version_entry(
            &key,
            0,
            VersionEntry::new(key.clone(), 0, 0, INF_TS, NONE_TX, 3, value(b"v")),
        );

        let raised = table.update_version_max_commit_ts(&key, 0, 7).unwrap();
        assert_eq!(raised.max_commit_ts, 7);

        // A lower floor is a no-op
        let kept = table.update_version_max_commit_ts(&key, 0, 5).unwrap();
        assert_eq!(kept.max_commit_ts, 7);
    }

    #[test]
    fn test_delete_and_batch_lookup() {
        let table = test_table();
        let key_a = b"a".to_vec();
        let key_b = b"b".to_vec();
        table.upload_new_version_entry(
            &key_a,
            0,
            VersionEntry::new(key_a.clone(), 0, 0, INF_TS, NONE_TX, 0, value(b"va")),
        );
        table.upload_new_version_entry(
            &key_b,
            0,
            VersionEntry::new(key_b.clone(), 0, 0, INF_TS, NONE_TX, 0, value(b"vb")),
        );

        let found = table.get_version_entries(&[
            (key_a.clone(), 0),
            (key_b.clone(), 0),
            (b"missing".to_vec(), 0),
        ]);
        assert_eq!(found.len(), 2);

        assert!(table.delete_version_entry(&key_a, 0));
        assert!(!table.delete_version_entry(&key_a, 0));
        assert!(table.get_version_list(&key_a).is_empty());
    }

    #[test]
    fn test_clear_empties_every_partition() {
        let table = test_table();
        for i in 0..32u8 {
            let key = vec![i];
            table.upload_new_version_entry(
                &key,
                0,
                VersionEntry::new(key.clone(), 0, 0, INF_TS, NONE_TX, 0, value(b"v")),
            );
        }
        table.clear();
        for i in 0..32u8 {
            assert!(table.get_version_list(&vec![i]).is_empty());
        }
    }

    #[test]
    fn test_partition_fifo_order() {
        // 1000 uploads for distinct version keys of one key, enqueued
        // without draining; a single visit must observe them in
        // submission order and assign results accordingly.
        let table = test_table();
        let key = b"fifo".to_vec();
        let partition = table.partition_of(&key);

        let mut pendings = Vec::new();
        for version_key in 0..1000i64 {
            // Every even slot is contended by the next odd request, so
            // outcomes reveal the drain order.
            let slot = version_key / 2;
            let pending = PendingRequest::new(VersionEntryRequest::Upload {
                key: key.clone(),
                version_key: slot,
                entry: VersionEntry::uploaded(key.clone(), slot, version_key + 1, value(b"v")),
            });
            table.shards[partition].incoming.lock().push(pending.clone());
            pendings.push(pending);
        }

        table.visit(partition);

        for (i, pending) in pendings.iter().enumerate() {
            assert!(pending.done.load(Ordering::Acquire));
            let won = matches!(
                *pending.outcome.lock(),
                Some(RequestOutcome::Uploaded(true))
            );
            // First submission for each slot wins, the second loses
            assert_eq!(won, i % 2 == 0, "request {} out of order", i);
        }

        // Winners are the even submissions, in order
        let list = table.get_version_list(&key);
        assert_eq!(list.len(), 500);
        for (slot, entry) in list.iter().enumerate() {
            assert_eq!(entry.tx_id, slot as i64 * 2 + 1);
        }
    }

    #[test]
    fn test_concurrent_uploads_one_winner_per_slot() {
        let table = Arc::new(test_table());
        let key = b"contended".to_vec();
        let mut handles = Vec::new();

        for tx in 1..=8i64 {
            let table = table.clone();
            let key = key.clone();
            handles.push(std::thread::spawn(move || {
                let entry = VersionEntry::uploaded(key.clone(), 0, tx, value(b"v"));
                table.upload_new_version_entry(&key, 0, entry)
            }));
        }

        let winners: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(table.get_version_list(&key).len(), 1);
    }
}
