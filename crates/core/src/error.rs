//! Error types for the weft runtime
//!
//! We use `thiserror` for automatic `Display` and `Error` trait
//! implementations.
//!
//! ## Abort taxonomy
//!
//! Every transaction failure is classified into an `AbortCause`:
//!
//! | Cause | Meaning |
//! |-------|---------|
//! | Conflict | Sequencer rejected: a read fingerprint was updated after the snapshot |
//! | PreciseConflict | Conflict confirmed by scanning the log, not merely by fingerprint |
//! | Trim | A required log range has been garbage-collected |
//! | SequencerFail | Sequencer unreachable or internal error |
//! | Network | Lower-level I/O failure on log or sequencer |
//! | User | The caller requested the abort |
//! | Undefined | Catch-all, propagated with cause |
//!
//! Aborts are not retried by the engine; they are delivered to the caller,
//! which may rerun the transaction. Conflict aborts are retryable by
//! construction — the operation may succeed against fresh state.

use crate::types::{StreamId, TxId};
use thiserror::Error;

/// Classification of a transaction abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortCause {
    /// Sequencer rejected due to an overlapping fingerprint since snapshot.
    /// May be a false positive; precise resolution can upgrade or clear it.
    Conflict,
    /// A conflict witnessed by an actual committed SMR entry in the log.
    PreciseConflict,
    /// The log range needed for a sync or a precise scan was trimmed.
    Trim,
    /// The sequencer was unreachable or failed internally.
    SequencerFail,
    /// Lower-level I/O failure on the log or sequencer path.
    Network,
    /// The user requested the abort.
    User,
    /// Catch-all; the underlying cause is carried alongside.
    Undefined,
}

/// A transaction abort, carrying the classified cause and, for conflicts,
/// the offending stream and address.
#[derive(Debug, Clone)]
pub struct TransactionAbortedError {
    /// The aborted transaction
    pub tx_id: TxId,
    /// Why the transaction aborted
    pub cause: AbortCause,
    /// The stream the conflict was detected on, if any
    pub conflict_stream: Option<StreamId>,
    /// The log address of the conflicting update, if known
    pub conflict_address: Option<i64>,
    /// True if the conflict was confirmed by a log scan
    pub precise: bool,
}

impl std::error::Error for TransactionAbortedError {}

impl std::fmt::Display for TransactionAbortedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transaction {} aborted ({:?})", self.tx_id, self.cause)?;
        match (self.conflict_stream, self.conflict_address) {
            (Some(s), Some(a)) => write!(f, " on stream {} at {}", s, a),
            (Some(s), None) => write!(f, " on stream {}", s),
            _ => Ok(()),
        }
    }
}

impl TransactionAbortedError {
    /// An abort with a cause and no conflict location.
    pub fn new(tx_id: TxId, cause: AbortCause) -> Self {
        TransactionAbortedError {
            tx_id,
            cause,
            conflict_stream: None,
            conflict_address: None,
            precise: false,
        }
    }

    /// A conflict abort locating the offending stream and address.
    pub fn conflict(tx_id: TxId, stream: StreamId, address: i64) -> Self {
        TransactionAbortedError {
            tx_id,
            cause: AbortCause::Conflict,
            conflict_stream: Some(stream),
            conflict_address: Some(address),
            precise: false,
        }
    }

    /// Upgrade this abort to a log-verified conflict.
    pub fn into_precise(mut self) -> Self {
        self.cause = AbortCause::PreciseConflict;
        self.precise = true;
        self
    }

    /// Reclassify the cause, keeping the conflict location.
    pub fn with_cause(mut self, cause: AbortCause) -> Self {
        self.cause = cause;
        self
    }
}

/// Unified error type for all weft APIs.
#[derive(Debug, Error)]
pub enum WeftError {
    /// A transaction aborted; see the carried cause.
    #[error(transparent)]
    TransactionAborted(#[from] TransactionAbortedError),

    /// A second append was attempted at an already-written address.
    #[error("address {0} already written")]
    Overwrite(i64),

    /// The requested address lies below the log's trim mark.
    #[error("address {0} has been trimmed")]
    Trimmed(i64),

    /// No transaction is active on the calling thread.
    #[error("no active transaction on this thread")]
    NoTransaction,

    /// A transaction of one flavor was nested under a root of another.
    #[error("attempted to nest a {child} transaction under a {root} root")]
    NestedTypeMismatch {
        /// Flavor of the existing root context
        root: &'static str,
        /// Flavor of the context being pushed
        child: &'static str,
    },

    /// The sequencer failed internally.
    #[error("sequencer failure: {0}")]
    SequencerFail(String),

    /// Transport-level failure talking to the log or sequencer.
    #[error("network failure: {0}")]
    Network(String),

    /// Payload could not be encoded or decoded.
    #[error("serialization failure: {0}")]
    Serialization(String),

    /// Bug or invariant violation.
    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl WeftError {
    /// Shorthand for an internal invariant violation.
    pub fn internal(msg: impl Into<String>) -> Self {
        WeftError::Internal(msg.into())
    }

    /// True if rerunning the failed operation may succeed.
    ///
    /// Conflict aborts and address collisions are temporal failures; trims,
    /// serialization failures and invariant violations are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            WeftError::TransactionAborted(ae) => matches!(
                ae.cause,
                AbortCause::Conflict | AbortCause::PreciseConflict
            ),
            WeftError::Overwrite(_) => true,
            _ => false,
        }
    }

    /// Map this error into the abort taxonomy.
    ///
    /// This is the abort classifier: any failure escaping a commit or a
    /// sync is folded into a `TransactionAbortedError` with the cause the
    /// taxonomy assigns it.
    pub fn into_abort(self, tx_id: TxId) -> TransactionAbortedError {
        match self {
            WeftError::TransactionAborted(ae) => ae,
            WeftError::Trimmed(addr) => TransactionAbortedError {
                tx_id,
                cause: AbortCause::Trim,
                conflict_stream: None,
                conflict_address: Some(addr),
                precise: false,
            },
            WeftError::SequencerFail(_) => {
                TransactionAbortedError::new(tx_id, AbortCause::SequencerFail)
            }
            WeftError::Network(_) => TransactionAbortedError::new(tx_id, AbortCause::Network),
            _ => TransactionAbortedError::new(tx_id, AbortCause::Undefined),
        }
    }
}

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, WeftError>;
