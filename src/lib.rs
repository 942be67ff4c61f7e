//! mvdb transaction engine
//!
//! Multi-version concurrency control over an in-memory, partitioned
//! record store. Updates create new versions instead of overwriting;
//! serializability comes from optimistic validation against per-version
//! commit-time floors rather than from locks held across a transaction.
//!
//! ## Architecture
//! - Version tables: per-key version chains, sharded into partitions;
//!   each partition is drained by a single-threaded visitor
//! - Transaction table: status, commit time, and commit lower bound of
//!   every in-flight transaction
//! - Version database: table registry, transaction table, and the
//!   physical/logical partition functions
//! - Executor: read, upload, validate, commit/abort, post-process
//! - Workload surface: per-worker execution handles with commit/abort
//!   counters for an external benchmark harness

pub mod config;
pub mod txn;
pub mod types;
pub mod workload;

mod error;

pub use config::{BackendKind, EngineConfig};
pub use error::{EngineError, Result};
pub use txn::{
    Execution, ExecutionBuilder, MemoryStore, Partitioner, TxFinalStatus, TxStatus, TxTable,
    TxTableEntry, VersionDb, VersionEntry, VersionStore, VersionTable,
};
pub use types::{Payload, RecordKey, TableId, Ts, TxId, VersionKey};
pub use workload::Worker;
