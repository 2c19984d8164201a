//! Runtime assembly for weft
//!
//! `WeftRuntime` wires the pieces together: the sequencer and log unit,
//! the per-process object registry (one replica per stream), the
//! per-thread transaction registry and the transaction entry points
//! (`tx_build` / `tx_begin` / `tx_end` / `tx_abort`).
//!
//! `SmrMap` is the replicated collection shipped with the runtime: an
//! ordered map driven by `put` / `remove` / `clear` SMR entries, with
//! per-key conflict parameters and deferred reads.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collections;
pub mod config;
pub mod runtime;

pub use collections::{DeferredValue, MapState, SmrMap};
pub use config::RuntimeConfig;
pub use runtime::WeftRuntime;
