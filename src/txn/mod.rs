//! Transaction layer: MVCC version storage and the commit protocol

pub mod executor;
pub mod tx_table;
pub mod version_db;
pub mod version_entry;
pub mod version_table;

pub use executor::{Execution, ExecutionBuilder, TxFinalStatus};
pub use tx_table::{TxStatus, TxTable, TxTableEntry};
pub use version_db::VersionDb;
pub use version_entry::VersionEntry;
pub use version_table::{MemoryStore, Partitioner, VersionStore, VersionTable};
