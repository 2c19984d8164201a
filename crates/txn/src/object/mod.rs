//! Replicated object layer
//!
//! - `SmrObject`: the contract a materialized object type implements so
//!   the engine can drive it from SMR entries
//! - `VersionLockedObject`: the shared replica — version pointer,
//!   read/write lock, optimistic overlay
//! - `SmrProxy`: binds an object type to a stream and routes accesses and
//!   mutations through the calling thread's transaction, if any

pub mod proxy;
pub mod versioned;

pub use proxy::SmrProxy;
pub use versioned::VersionLockedObject;

use crate::conflict_set::ConflictParams;
use weft_core::{LogData, Result, SmrEntry, StreamId, Value};

/// A materialized object driven by SMR entries.
///
/// Implementations must be deterministic: applying the same entries in
/// the same order to a fresh instance always yields the same state.
pub trait SmrObject: Send + Sync + 'static {
    /// The origin state, before any log entry.
    fn new_instance() -> Self
    where
        Self: Sized;

    /// Apply one mutation and return its upcall result.
    ///
    /// # Errors
    ///
    /// An unknown method or malformed arguments are invariant violations.
    fn apply_update(&mut self, entry: &SmrEntry) -> Result<Value>;

    /// Invert one mutation using its recorded undo record.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry carries no undo record or the record
    /// is malformed.
    fn apply_undo(&mut self, entry: &SmrEntry) -> Result<()>;

    /// Compute the undo record for `entry` against the current (pre-apply)
    /// state. `None` marks the mutation as not undoable.
    fn undo_record(&self, entry: &SmrEntry) -> Option<Value>;

    /// The conflict parameters a committed entry of this type carries,
    /// used by the precise conflict scanner.
    fn conflict_from_entry(method: &str, args: &[Value]) -> ConflictParams
    where
        Self: Sized;
}

/// Object-safe view of a proxy, used by transactional contexts which hold
/// proxies of heterogeneous object types.
pub trait ProxyInternal: Send + Sync {
    /// The stream the proxy is bound to.
    fn stream_id(&self) -> StreamId;

    /// Extract the conflict parameters of a committed entry.
    fn conflict_from_entry(&self, method: &str, args: &[Value]) -> ConflictParams;

    /// True if the replica's optimistic overlay belongs to the calling
    /// thread's active transaction stack.
    fn optimistically_owned_by_current_thread(&self) -> bool;

    /// Post-commit installation: turn the overlay into committed state,
    /// roll forward to just below `commit_address`, transfer undo records
    /// into the committed entry (best effort) and skip the entry itself.
    ///
    /// A proxy whose overlay ownership was taken by another thread is left
    /// untouched; its next access syncs from the log.
    ///
    /// # Errors
    ///
    /// Log failures during the roll-forward propagate.
    fn commit_optimistic_updates(&self, commit_address: i64, committed: &LogData) -> Result<()>;

    /// Undo the overlay if it is owned by the calling thread's stack
    /// (abort path).
    ///
    /// # Errors
    ///
    /// Log failures during a reset-and-replay propagate.
    fn rollback_optimistic_updates(&self) -> Result<()>;
}
