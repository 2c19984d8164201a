//! State-machine replication entries
//!
//! An `SmrEntry` records one mutation `(method, args)` on one stream.
//! When the entry is executed against a materialized object it may pick up
//! an upcall result (the mutator's return value, for accessor-mutator
//! methods) and an undo record (an inverse used for rollback).
//!
//! A `MultiObjectSmrEntry` is the log payload of a committed transaction:
//! a mapping from stream to the ordered list of entries applied to it.

use crate::types::StreamId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single mutation applied deterministically to a materialized object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmrEntry {
    /// The mutation method name (e.g. `"put"`)
    pub method: String,
    /// The mutation arguments
    pub args: Vec<crate::value::Value>,
    /// Result of executing the mutation, filled in when the entry is
    /// applied. Lets accessor-mutators read their own return value.
    pub upcall_result: Option<crate::value::Value>,
    /// Inverse of the mutation, recorded against the pre-apply state.
    /// `None` means the entry cannot be undone.
    pub undo_record: Option<crate::value::Value>,
}

impl SmrEntry {
    /// Create a new entry with no upcall result and no undo record.
    pub fn new(method: impl Into<String>, args: Vec<crate::value::Value>) -> Self {
        SmrEntry {
            method: method.into(),
            args,
            upcall_result: None,
            undo_record: None,
        }
    }

    /// True if executing this entry produced a cached result.
    pub fn has_upcall_result(&self) -> bool {
        self.upcall_result.is_some()
    }

    /// True if this entry carries an inverse and can be rolled back.
    pub fn is_undoable(&self) -> bool {
        self.undo_record.is_some()
    }
}

/// The payload of one committed transaction: per-stream ordered updates.
///
/// Insertion preserves per-stream order; the per-stream index of an entry
/// is its "speculative address" while the transaction is in flight.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiObjectSmrEntry {
    entries: BTreeMap<StreamId, Vec<SmrEntry>>,
}

impl MultiObjectSmrEntry {
    /// Create an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `entry` to the list for `stream`, returning its per-stream
    /// index.
    pub fn add_to(&mut self, stream: StreamId, entry: SmrEntry) -> usize {
        let list = self.entries.entry(stream).or_default();
        list.push(entry);
        list.len() - 1
    }

    /// The ordered updates recorded for `stream` (empty if none).
    pub fn updates(&self, stream: StreamId) -> &[SmrEntry] {
        self.entries.get(&stream).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Mutable access to the updates recorded for `stream`.
    pub fn updates_mut(&mut self, stream: StreamId) -> &mut [SmrEntry] {
        self.entries
            .get_mut(&stream)
            .map(Vec::as_mut_slice)
            .unwrap_or(&mut [])
    }

    /// Number of updates recorded for `stream`.
    pub fn num_updates(&self, stream: StreamId) -> usize {
        self.entries.get(&stream).map(Vec::len).unwrap_or(0)
    }

    /// The set of streams with at least one update.
    pub fn affected_streams(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.entries.keys().copied()
    }

    /// True if no stream has any update.
    pub fn is_empty(&self) -> bool {
        self.entries.values().all(Vec::is_empty)
    }

    /// Append every entry of `other`, preserving per-stream order.
    ///
    /// Used when a nested transaction folds into its parent.
    pub fn merge(&mut self, other: MultiObjectSmrEntry) {
        for (stream, list) in other.entries {
            self.entries.entry(stream).or_default().extend(list);
        }
    }
}
