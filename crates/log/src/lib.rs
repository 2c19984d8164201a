//! In-process log services for weft
//!
//! This crate implements the service contracts of `weft-core` for a single
//! process:
//! - `InMemorySequencer`: token issue with fingerprint-window conflict
//!   resolution
//! - `InMemoryAddressSpace`: a write-once address space with holes and
//!   prefix trim
//! - `StreamsView` / `StreamScanner`: client-side plumbing over the two —
//!   conditional appends, token reservation, positioned per-stream scans

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address_space;
pub mod sequencer;
pub mod stream;

pub use address_space::InMemoryAddressSpace;
pub use sequencer::InMemorySequencer;
pub use stream::{StreamScanner, StreamSlice, StreamsView};
