//! Sequencer wire shapes
//!
//! `TxResolutionInfo` is sent alongside a conditional append and tells the
//! sequencer how to decide the transaction: abort if any read fingerprint
//! on any stream was updated after `snapshot` (subject to the `verified`
//! floors established by precise conflict resolution).

use crate::fingerprint::Fingerprint;
use crate::types::{StreamId, TxId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Conflict-resolution information for one committing transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxResolutionInfo {
    /// The committing transaction
    pub tx_id: TxId,
    /// The snapshot the transaction read at
    pub snapshot: i64,
    /// Hashed read set: per stream, the fingerprints read
    pub reads: BTreeMap<StreamId, BTreeSet<Fingerprint>>,
    /// Hashed write set: per stream, the fingerprints written
    pub writes: BTreeMap<StreamId, BTreeSet<Fingerprint>>,
    /// Per-stream addresses already scanned and cleared by precise
    /// resolution; the sequencer must not re-flag updates at or below
    /// these addresses.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub verified: BTreeMap<StreamId, i64>,
}

impl TxResolutionInfo {
    /// Build resolution info with no verified floors.
    pub fn new(
        tx_id: TxId,
        snapshot: i64,
        reads: BTreeMap<StreamId, BTreeSet<Fingerprint>>,
        writes: BTreeMap<StreamId, BTreeSet<Fingerprint>>,
    ) -> Self {
        TxResolutionInfo {
            tx_id,
            snapshot,
            reads,
            writes,
            verified: BTreeMap::new(),
        }
    }

    /// Replace the verified floors (used on precise-commit retries).
    pub fn with_verified(mut self, verified: BTreeMap<StreamId, i64>) -> Self {
        self.verified = verified;
        self
    }
}

/// Sequencer response to a token request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    /// The issued address, or the current tail when zero tokens were
    /// requested.
    pub token: i64,
    /// For each requested stream, the previous address on that stream
    /// (`Address::NEVER_READ` if the stream was empty).
    pub backpointers: BTreeMap<StreamId, i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_resolution_round_trips_through_serde() {
        let stream = StreamId::new();
        let mut reads = BTreeMap::new();
        reads.insert(
            stream,
            [Fingerprint::of(&Value::from("k")), Fingerprint::all()]
                .into_iter()
                .collect::<BTreeSet<_>>(),
        );
        let info = TxResolutionInfo::new(TxId::new(), 41, reads, BTreeMap::new())
            .with_verified([(stream, 45i64)].into_iter().collect());

        let json = serde_json::to_string(&info).unwrap();
        let back: TxResolutionInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back.snapshot, 41);
        assert_eq!(back.verified.get(&stream), Some(&45));
        assert_eq!(back.reads[&stream].len(), 2);
    }
}
