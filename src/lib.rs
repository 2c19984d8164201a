//! # Weft
//!
//! A client runtime for a distributed shared-log database. Clients
//! replicate in-memory objects by recording state-machine (SMR) updates
//! on a globally ordered log, and mutate them under serializable,
//! opacity-preserving optimistic transactions resolved by a central
//! sequencer.
//!
//! # Quick Start
//!
//! ```
//! use weft::{RuntimeConfig, SmrMap, StreamId, Value, WeftRuntime};
//!
//! fn main() -> weft::Result<()> {
//!     let runtime = WeftRuntime::in_process(RuntimeConfig::default());
//!     let map = SmrMap::open(&runtime, StreamId::from_name("accounts"))?;
//!
//!     // transactional read-modify-write
//!     runtime.tx_begin()?;
//!     let balance = map.get(&Value::from("alice"))?;
//!     assert!(balance.is_none());
//!     map.put(Value::from("alice"), Value::Int(100))?;
//!     let address = runtime.tx_end()?;
//!     assert!(address >= 0);
//!
//!     // non-transactional reads sync to the log tail
//!     assert_eq!(map.get(&Value::from("alice"))?, Some(Value::Int(100)));
//!     Ok(())
//! }
//! ```
//!
//! # Transaction flavors
//!
//! | Flavor | Conflicts on | Snapshot |
//! |--------|--------------|----------|
//! | `Optimistic` | reads | first read of the root |
//! | `WriteAfterWrite` | writes | fixed at begin |
//! | `Deferred` | reads (non-deferred ones) | commit time (`token - 1`) |
//!
//! A rejected commit surfaces as a `TransactionAbortedError` carrying the
//! classified cause; the engine never retries aborts on its own (precise
//! conflict resolution, when enabled, retries internally until the
//! sequencer stops reporting fresh conflicts).
//!
//! Internal crates (`weft-core`, `weft-log`, `weft-txn`, `weft-runtime`)
//! are re-exported here; only this surface is stable.

pub use weft_core::{
    AbortCause, Address, Fingerprint, MultiObjectSmrEntry, Result, SmrEntry, StreamId,
    TokenResponse, TransactionAbortedError, TxId, TxResolutionInfo, Value, WeftError,
    TRANSACTION_STREAM_ID,
};
pub use weft_log::{InMemoryAddressSpace, InMemorySequencer, StreamScanner, StreamsView};
pub use weft_runtime::{DeferredValue, MapState, RuntimeConfig, SmrMap, WeftRuntime};
pub use weft_txn::{
    ConflictParams, SmrObject, SmrProxy, TransactionRegistry, TransactionalContext, TxBuilder,
    TxType, VersionLockedObject, WriteSetSmrStream,
};
