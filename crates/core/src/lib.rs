//! Core types and service contracts for weft
//!
//! This crate defines the foundational types shared by every layer of the
//! runtime:
//! - StreamId / TxId: identifiers for replicated objects and transactions
//! - address: global log positions and their reserved sentinels
//! - Value: the argument/result currency of SMR entries
//! - SmrEntry / MultiObjectSmrEntry: state-machine update records
//! - Fingerprint: hashed conflict parameters for sequencer-side resolution
//! - TxResolutionInfo / TokenResponse: the sequencer wire contract
//! - Error: the abort taxonomy and crate-wide error type
//! - Traits: service contracts (SequencerService, AddressSpace)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod error;
pub mod fingerprint;
pub mod resolution;
pub mod smr;
pub mod traits;
pub mod types;
pub mod value;

pub use address::Address;
pub use error::{AbortCause, Result, TransactionAbortedError, WeftError};
pub use fingerprint::Fingerprint;
pub use resolution::{TokenResponse, TxResolutionInfo};
pub use smr::{MultiObjectSmrEntry, SmrEntry};
pub use traits::{AddressSpace, LogData, LogDataType, SequencerService};
pub use types::{StreamId, TxId, TRANSACTION_STREAM_ID};
pub use value::Value;
