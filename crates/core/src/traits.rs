//! Service contracts
//!
//! The engine talks to two external collaborators, specified here by
//! trait so implementations can be swapped without touching upper layers:
//!
//! - `SequencerService`: issues totally ordered, atomically resolved log
//!   tokens.
//! - `AddressSpace`: the log unit — a write-once address space with holes
//!   and prefix trim.
//!
//! Thread safety: all methods must be safe to call concurrently from
//! multiple threads (`Send + Sync` required).

use crate::error::Result;
use crate::resolution::{TokenResponse, TxResolutionInfo};
use crate::smr::MultiObjectSmrEntry;
use crate::types::StreamId;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// The sequencer: the single authority on global log order.
pub trait SequencerService: Send + Sync {
    /// Issue the next `count` address(es) for the given streams and report
    /// the previous address on each stream.
    ///
    /// With `count == 0` this is a tail query: the returned token is the
    /// last issued address (`Address::NEVER_READ` on an empty log) and no
    /// address is consumed.
    ///
    /// # Errors
    ///
    /// Returns an error if the sequencer is unreachable or fails
    /// internally.
    fn next_token(&self, streams: &BTreeSet<StreamId>, count: u32) -> Result<TokenResponse>;

    /// Conditionally issue one address: succeed only if no fingerprint in
    /// `resolution.reads` has been updated since `resolution.snapshot`
    /// (subject to `resolution.verified`).
    ///
    /// # Errors
    ///
    /// Rejection surfaces as `WeftError::TransactionAborted` carrying the
    /// conflicting stream and address.
    fn next_token_conditional(
        &self,
        streams: &BTreeSet<StreamId>,
        resolution: &TxResolutionInfo,
    ) -> Result<TokenResponse>;
}

/// Whether a log position holds data or was filled as a hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDataType {
    /// A committed payload
    Data,
    /// A hole: the address was issued but never written
    Hole,
}

/// One position of the log as seen by clients.
///
/// The payload is shared (`Arc`) between all readers of the same address,
/// which lets clients enrich cached entries in place — undo records and
/// upcall results computed by one replica become visible to the others in
/// the same process.
#[derive(Clone)]
pub struct LogData {
    /// The global address this record lives at
    pub addr: i64,
    /// Data or hole
    pub kind: LogDataType,
    /// The committed updates (`None` for holes)
    pub payload: Option<Arc<RwLock<MultiObjectSmrEntry>>>,
    /// The streams this record belongs to
    pub streams: BTreeSet<StreamId>,
    /// Per-stream backpointers recorded at append time
    pub backpointers: BTreeMap<StreamId, i64>,
}

impl LogData {
    /// A hole record at `addr`.
    pub fn hole(addr: i64) -> Self {
        LogData {
            addr,
            kind: LogDataType::Hole,
            payload: None,
            streams: BTreeSet::new(),
            backpointers: BTreeMap::new(),
        }
    }

    /// True if this record is a hole.
    pub fn is_hole(&self) -> bool {
        self.kind == LogDataType::Hole
    }
}

impl std::fmt::Debug for LogData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogData")
            .field("addr", &self.addr)
            .field("kind", &self.kind)
            .field("streams", &self.streams.len())
            .finish()
    }
}

/// The log unit: a write-once address space.
pub trait AddressSpace: Send + Sync {
    /// Read the record at `addr`. An issued-but-unwritten address reads as
    /// a hole.
    ///
    /// # Errors
    ///
    /// Returns `WeftError::Trimmed` if `addr` lies below the trim mark.
    fn read(&self, addr: i64) -> Result<LogData>;

    /// Write `payload` at `addr`, exactly once.
    ///
    /// # Errors
    ///
    /// Returns `WeftError::Overwrite` if the address already holds data or
    /// was filled as a hole, `WeftError::Trimmed` below the trim mark.
    fn append(
        &self,
        addr: i64,
        streams: &BTreeSet<StreamId>,
        payload: MultiObjectSmrEntry,
        backpointers: &BTreeMap<StreamId, i64>,
    ) -> Result<()>;

    /// Permanently mark `addr` as a hole. Subsequent appends at `addr`
    /// fail with `WeftError::Overwrite`; reads return a hole record.
    ///
    /// # Errors
    ///
    /// Returns `WeftError::Overwrite` if the address already holds data.
    fn fill_hole(&self, addr: i64) -> Result<()>;

    /// Garbage-collect every address at or below `addr`.
    ///
    /// # Errors
    ///
    /// Implementations may refuse trims that regress the trim mark.
    fn trim(&self, addr: i64) -> Result<()>;

    /// The lowest readable address (0 if nothing was trimmed).
    fn trim_mark(&self) -> i64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hole_record_shape() {
        let h = LogData::hole(17);
        assert!(h.is_hole());
        assert_eq!(h.addr, 17);
        assert!(h.payload.is_none());
    }
}
