//! Identifier types
//!
//! - StreamId: identifies one replicated object's sub-log
//! - TxId: identifies one transaction
//! - TRANSACTION_STREAM_ID: reserved stream mirroring committed transactions

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a stream (the totally ordered sub-log of one
/// replicated object).
///
/// A StreamId is a wrapper around a 128-bit UUID. Every replicated object
/// has exactly one stream, and every SMR entry on the log is tagged with
/// the streams it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(Uuid);

impl StreamId {
    /// Create a new random StreamId using UUID v4
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a StreamId from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Create a StreamId from a 128-bit integer
    pub const fn from_u128(v: u128) -> Self {
        Self(Uuid::from_u128(v))
    }

    /// Derive a StreamId deterministically from a human-readable name.
    ///
    /// Uses UUID v5 in a fixed namespace, so the same name always maps to
    /// the same stream across processes.
    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }

    /// Parse a StreamId from a string representation
    ///
    /// Accepts standard UUID format (with or without hyphens).
    /// Returns None if the string is not a valid UUID.
    pub fn from_string(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Get the raw bytes of this StreamId
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reserved stream that receives a mirror of every committing transaction
/// when transaction logging is enabled.
pub const TRANSACTION_STREAM_ID: StreamId =
    StreamId::from_u128(0x5452_414e_5341_4354_494f_4e5f_4c4f_4700);

/// Unique identifier for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(Uuid);

impl TxId {
    /// Create a new random TxId using UUID v4
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a TxId from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get the raw bytes of this TxId
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_from_name_is_stable() {
        let a = StreamId::from_name("orders");
        let b = StreamId::from_name("orders");
        let c = StreamId::from_name("inventory");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_stream_id_round_trips_through_string() {
        let id = StreamId::new();
        let parsed = StreamId::from_string(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_transaction_stream_id_is_fixed() {
        assert_eq!(TRANSACTION_STREAM_ID, TRANSACTION_STREAM_ID);
        assert_ne!(TRANSACTION_STREAM_ID, StreamId::new());
    }
}
