//! Engine configuration
//!
//! Partition counts and the storage back end are fixed at engine
//! construction; rerouting keys once tables hold data would scatter
//! version chains across partitions.

use serde::{Deserialize, Serialize};

/// Storage variant backing the version chains of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BackendKind {
    /// Volatile in-memory version chains
    #[default]
    Memory,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Physical partitions per version table
    ///
    /// Each partition owns a request queue and a single-threaded
    /// visitor, so this bounds the write parallelism of one table.
    pub physical_partitions: usize,

    /// Process-wide logical partitions used to place transactions on
    /// workers with key affinity
    pub logical_partitions: usize,

    /// Version chain storage variant
    pub backend: BackendKind,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            physical_partitions: 16,
            logical_partitions: 4,
            backend: BackendKind::Memory,
        }
    }
}

impl EngineConfig {
    /// Small partition counts for unit tests
    pub fn for_testing() -> Self {
        Self {
            physical_partitions: 4,
            logical_partitions: 2,
            backend: BackendKind::Memory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_presets() {
        let config = EngineConfig::default();
        assert!(config.physical_partitions >= config.logical_partitions);
        assert_eq!(config.backend, BackendKind::Memory);

        let testing = EngineConfig::for_testing();
        assert_eq!(testing.physical_partitions, 4);
    }
}
