//! In-process sequencer
//!
//! The sequencer is the single authority on global order. It issues
//! addresses and, for transactional appends, decides commit/abort by
//! comparing the transaction's hashed read set against the addresses at
//! which each fingerprint was last updated.
//!
//! ## Conflict windows
//!
//! For every committed transactional write the sequencer remembers, per
//! stream, the address of the last update to each write fingerprint. A
//! conditional request with snapshot `s` conflicts if any of its read
//! fingerprints was updated at an address above `max(s, verified[stream])`.
//!
//! Direct (non-transactional) appends carry no fingerprint information, so
//! they mark the whole stream: any subsequent read fingerprint on that
//! stream conflicts with them. The ALL fingerprint behaves the same way on
//! the write side, and on the read side conflicts with any update on the
//! stream.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::trace;
use weft_core::{
    Address, Fingerprint, Result, StreamId, TokenResponse, TransactionAbortedError,
    TxResolutionInfo, WeftError,
};

#[derive(Default)]
struct SequencerInner {
    /// Next unissued address; the tail query answers `next_address - 1`.
    next_address: i64,
    /// Last issued address per stream (backpointer source).
    stream_tails: BTreeMap<StreamId, i64>,
    /// Last committed update address per (stream, fingerprint).
    fingerprint_marks: HashMap<(StreamId, Fingerprint), i64>,
    /// Last committed update address per stream, any fingerprint.
    stream_marks: HashMap<StreamId, i64>,
    /// Last whole-stream update (ALL write or direct append) per stream.
    wildcard_marks: HashMap<StreamId, i64>,
}

impl SequencerInner {
    fn issue(&mut self, streams: &BTreeSet<StreamId>) -> TokenResponse {
        let token = self.next_address;
        self.next_address += 1;
        let mut backpointers = BTreeMap::new();
        for &s in streams {
            let prev = self.stream_tails.insert(s, token);
            backpointers.insert(s, prev.unwrap_or(Address::NEVER_READ));
        }
        TokenResponse {
            token,
            backpointers,
        }
    }

    /// The highest committed address that conflicts with reading
    /// fingerprint `fp` on `stream`, if any.
    fn conflict_mark(&self, stream: StreamId, fp: &Fingerprint) -> Option<i64> {
        if fp.is_all() {
            return self.stream_marks.get(&stream).copied();
        }
        let exact = self
            .fingerprint_marks
            .get(&(stream, fp.clone()))
            .copied();
        let wildcard = self.wildcard_marks.get(&stream).copied();
        exact.max(wildcard)
    }

    fn record_writes(&mut self, token: i64, resolution: &TxResolutionInfo) {
        for (&stream, fps) in &resolution.writes {
            for fp in fps {
                if fp.is_all() {
                    self.wildcard_marks.insert(stream, token);
                } else {
                    self.fingerprint_marks.insert((stream, fp.clone()), token);
                }
            }
            self.stream_marks.insert(stream, token);
        }
    }
}

/// A single-process sequencer implementing `SequencerService`.
pub struct InMemorySequencer {
    inner: Mutex<SequencerInner>,
}

impl InMemorySequencer {
    /// Create a sequencer with an empty log.
    pub fn new() -> Self {
        InMemorySequencer {
            inner: Mutex::new(SequencerInner::default()),
        }
    }
}

impl Default for InMemorySequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl weft_core::SequencerService for InMemorySequencer {
    fn next_token(&self, streams: &BTreeSet<StreamId>, count: u32) -> Result<TokenResponse> {
        let mut inner = self.inner.lock();
        if count == 0 {
            // Tail query: report the last issued address without consuming one.
            let mut backpointers = BTreeMap::new();
            for &s in streams {
                backpointers.insert(
                    s,
                    inner
                        .stream_tails
                        .get(&s)
                        .copied()
                        .unwrap_or(Address::NEVER_READ),
                );
            }
            return Ok(TokenResponse {
                token: inner.next_address - 1,
                backpointers,
            });
        }
        if count != 1 {
            return Err(WeftError::SequencerFail(format!(
                "unsupported token batch size {}",
                count
            )));
        }
        Ok(inner.issue(streams))
    }

    fn next_token_conditional(
        &self,
        streams: &BTreeSet<StreamId>,
        resolution: &TxResolutionInfo,
    ) -> Result<TokenResponse> {
        let mut inner = self.inner.lock();

        for (&stream, fps) in &resolution.reads {
            let floor = resolution
                .verified
                .get(&stream)
                .copied()
                .unwrap_or(Address::NEVER_READ)
                .max(resolution.snapshot);
            for fp in fps {
                if let Some(mark) = inner.conflict_mark(stream, fp) {
                    if mark > floor {
                        trace!(
                            tx = %resolution.tx_id,
                            %stream,
                            mark,
                            floor,
                            "conditional token rejected"
                        );
                        return Err(TransactionAbortedError::conflict(
                            resolution.tx_id,
                            stream,
                            mark,
                        )
                        .into());
                    }
                }
            }
        }

        let response = inner.issue(streams);
        inner.record_writes(response.token, resolution);
        trace!(tx = %resolution.tx_id, token = response.token, "conditional token issued");
        Ok(response)
    }
}
