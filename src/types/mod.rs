//! Shared scalar types and sentinels for the transaction engine

use serde::{Deserialize, Serialize};

/// Opaque record key; the partition functions hash these bytes
pub type RecordKey = Vec<u8>;

/// Table identifier (unique within a VersionDb)
pub type TableId = String;

/// Transaction identifier (unique positive integer)
pub type TxId = i64;

/// Logical timestamp (64-bit signed, monotonically increasing)
pub type Ts = i64;

/// Position of a version within its chain (strictly increasing per key)
pub type VersionKey = i64;

/// Reserved tx id meaning "no writer holds this entry"
pub const NONE_TX: TxId = 0;

/// +infinity for version validity intervals
pub const INF_TS: Ts = i64::MAX;

/// Commit time of a transaction that has not committed yet
pub const UNSET_TS: Ts = -1;

/// Version key of the sentinel empty head; the first real version gets 0
pub const SENTINEL_VERSION_KEY: VersionKey = -1;

/// Reserved in numeric return paths to distinguish internal errors
/// from -1 ("not yet set")
pub const RETURN_ERROR_CODE: i64 = -2;

/// Record payload; a delete is a committed version carrying the tombstone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Opaque record bytes
    Value(Vec<u8>),

    /// Explicit deletion marker
    Tombstone,
}

impl Payload {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Payload::Tombstone)
    }

    /// Record bytes, or None for a tombstone
    pub fn as_value(&self) -> Option<&[u8]> {
        match self {
            Payload::Value(v) => Some(v),
            Payload::Tombstone => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_accessors() {
        let v = Payload::Value(b"row".to_vec());
        assert!(!v.is_tombstone());
        assert_eq!(v.as_value(), Some(&b"row"[..]));

        let t = Payload::Tombstone;
        assert!(t.is_tombstone());
        assert_eq!(t.as_value(), None);
    }
}
