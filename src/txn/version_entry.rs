//! Version entries
//!
//! One immutable version of one record, with its validity interval and
//! the identity of the writer. Updates are expressed as "replace entry
//! E with E'" at the containing table; the entry itself has no mutators.

use std::hash::{Hash, Hasher};

use crate::types::{
    Payload, RecordKey, Ts, TxId, VersionKey, INF_TS, NONE_TX, SENTINEL_VERSION_KEY,
};

/// One version of one record
///
/// Identity is `(record_key, version_key)`; the timestamp and writer
/// fields evolve through conditional replaces at the version table and
/// do not participate in equality.
#[derive(Debug, Clone)]
pub struct VersionEntry {
    /// Key of the record this version belongs to
    pub record_key: RecordKey,

    /// Position within the version chain (strictly increasing)
    pub version_key: VersionKey,

    /// When this version became valid
    pub begin_ts: Ts,

    /// When this version stopped being valid (INF_TS = still open)
    pub end_ts: Ts,

    /// Writer that currently holds this entry, or NONE_TX
    pub tx_id: TxId,

    /// Floor on the commit time of any transaction overwriting this version
    pub max_commit_ts: Ts,

    /// Record bytes or tombstone
    pub payload: Payload,
}

impl VersionEntry {
    pub fn new(
        record_key: RecordKey,
        version_key: VersionKey,
        begin_ts: Ts,
        end_ts: Ts,
        tx_id: TxId,
        max_commit_ts: Ts,
        payload: Payload,
    ) -> Self {
        Self {
            record_key,
            version_key,
            begin_ts,
            end_ts,
            tx_id,
            max_commit_ts,
            payload,
        }
    }

    /// Image uploaded by a writer before validation
    ///
    /// Both interval ends are provisional: post-processing stamps the
    /// real begin timestamp on commit, or removes the entry on abort.
    pub fn uploaded(
        record_key: RecordKey,
        version_key: VersionKey,
        tx_id: TxId,
        payload: Payload,
    ) -> Self {
        Self {
            record_key,
            version_key,
            begin_ts: INF_TS,
            end_ts: INF_TS,
            tx_id,
            max_commit_ts: 0,
            payload,
        }
    }

    /// Sentinel empty head installed by InitializeAndGetVersionList
    ///
    /// A tombstone covering `[-1, +inf)`, so the first insert closes it
    /// like any other predecessor and `new_version_key = largest + 1`
    /// holds uniformly (the first real version gets key 0).
    pub fn sentinel(record_key: RecordKey) -> Self {
        Self {
            record_key,
            version_key: SENTINEL_VERSION_KEY,
            begin_ts: -1,
            end_ts: INF_TS,
            tx_id: NONE_TX,
            max_commit_ts: 0,
            payload: Payload::Tombstone,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.version_key == SENTINEL_VERSION_KEY
    }

    /// Whether this entry is the open head of its chain
    pub fn is_open(&self) -> bool {
        self.end_ts == INF_TS
    }
}

impl PartialEq for VersionEntry {
    fn eq(&self, other: &Self) -> bool {
        self.record_key == other.record_key && self.version_key == other.version_key
    }
}

impl Eq for VersionEntry {}

impl Hash for VersionEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.record_key.hash(state);
        self.version_key.hash(state);
    }
}
