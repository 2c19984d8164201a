//! Optimistic transactions over shared-log replicated objects
//!
//! This crate implements the client-side transaction engine:
//! - ConflictSetInfo / WriteSetInfo: per-transaction read and speculative
//!   write buffers, keyed by stream
//! - WriteSetSmrStream: the write set of a transaction stack presented as
//!   a positioned, replayable sub-log
//! - VersionLockedObject / SmrProxy: the materialized replica of one
//!   object, with roll-forward, undo and an optimistic overlay
//! - TransactionalContext: the OPTIMISTIC, WRITE-AFTER-WRITE and DEFERRED
//!   commit algorithms, nesting and precise conflict resolution
//! - TransactionRegistry: per-thread context stacks
//! - TxBuilder: transaction entry API
//!
//! ## Isolation guarantees
//!
//! (1) Read-your-own-writes: a read observes prior writes of the same
//! transaction.
//!
//! (2) Opacity: reads observe the state of the system as of the snapshot
//! fixed at the first read of the root transaction, except for (1).
//!
//! (3) Atomicity: writes commit atomically, and commit if and only if no
//! object in the read set was modified between the snapshot and the time
//! of commit.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builder;
pub mod conflict_set;
pub mod context;
pub mod object;
pub mod registry;
pub mod write_set_stream;

pub use builder::TxBuilder;
pub use conflict_set::{ConflictParams, ConflictSetInfo, WriteSetInfo};
pub use context::{TransactionalContext, TxType};
pub use object::{ProxyInternal, SmrObject, SmrProxy, VersionLockedObject};
pub use registry::TransactionRegistry;
pub use write_set_stream::WriteSetSmrStream;
