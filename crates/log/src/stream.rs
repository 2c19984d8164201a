//! Stream views over the sequencer and the log unit
//!
//! `StreamsView` is the client-side entry point to the shared log:
//!
//! - `write`: direct (non-transactional) append — token, then log write,
//!   retrying on address collision
//! - `append`: conditional transactional append — the sequencer decides
//!   commit/abort against the supplied resolution info
//! - `acquire_token` / `append_at`: the two-phase path used by deferred
//!   commits (reserve the address first, write the payload later)
//! - `get`: a positioned `StreamScanner` over one stream
//!
//! `StreamScanner` walks the address space in global order, surfacing the
//! entries belonging to its stream. Holes are skipped; trimmed ranges
//! surface as `WeftError::Trimmed`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, trace};
use weft_core::{
    Address, AddressSpace, Fingerprint, LogData, MultiObjectSmrEntry, Result, SequencerService,
    SmrEntry, StreamId, TokenResponse, TxId, TxResolutionInfo, WeftError,
};

/// One log position carrying entries for a scanned stream.
///
/// The payload is the shared record of the whole address; callers that
/// apply entries may enrich them (undo records, upcall results) through
/// the payload lock, and the enrichment is visible to every other reader
/// of the same address in this process.
#[derive(Clone)]
pub struct StreamSlice {
    /// The global address of the record
    pub addr: i64,
    /// The shared payload of the record
    pub payload: Arc<parking_lot::RwLock<MultiObjectSmrEntry>>,
}

/// Client-side view over the sequencer and log unit.
pub struct StreamsView {
    sequencer: Arc<dyn SequencerService>,
    address_space: Arc<dyn AddressSpace>,
}

impl StreamsView {
    /// Build a view over the given services.
    pub fn new(sequencer: Arc<dyn SequencerService>, address_space: Arc<dyn AddressSpace>) -> Self {
        StreamsView {
            sequencer,
            address_space,
        }
    }

    /// A positioned scanner over `stream`, starting before the beginning
    /// of the log.
    pub fn get(&self, stream: StreamId) -> StreamScanner {
        StreamScanner {
            stream,
            address_space: Arc::clone(&self.address_space),
            pos: Address::NEVER_READ,
        }
    }

    /// Read one log position.
    pub fn read(&self, addr: i64) -> Result<LogData> {
        self.address_space.read(addr)
    }

    /// The last issued global address (`Address::NEVER_READ` on an empty
    /// log).
    pub fn current_tail(&self) -> Result<i64> {
        Ok(self.sequencer.next_token(&BTreeSet::new(), 0)?.token)
    }

    /// Direct append: acquire a token for `streams` and write `payload`
    /// at it, retrying with a fresh token if the address was taken.
    ///
    /// Carries no fingerprint information, so the sequencer marks the
    /// whole of each stream as updated.
    pub fn write(&self, streams: &BTreeSet<StreamId>, payload: MultiObjectSmrEntry) -> Result<i64> {
        // A direct write resolves as "no reads, whole-stream writes":
        // it can never abort, and it conflicts with every later reader.
        let mut writes: BTreeMap<StreamId, BTreeSet<Fingerprint>> = BTreeMap::new();
        for &s in streams {
            writes.entry(s).or_default().insert(Fingerprint::all());
        }
        loop {
            let resolution =
                TxResolutionInfo::new(TxId::new(), Address::NEVER_READ, BTreeMap::new(), writes.clone());
            let token = self.sequencer.next_token_conditional(streams, &resolution)?;
            trace!(token = token.token, "direct write acquired token");
            match self.address_space.append(
                token.token,
                streams,
                payload.clone(),
                &token.backpointers,
            ) {
                Ok(()) => return Ok(token.token),
                Err(WeftError::Overwrite(addr)) => {
                    debug!(addr, "overwrite on direct write, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Conditional transactional append: the sequencer assigns an address
    /// only if `resolution` passes conflict resolution, and the payload is
    /// written there.
    ///
    /// # Errors
    ///
    /// `WeftError::TransactionAborted` with the conflicting stream and
    /// address on rejection.
    pub fn append(
        &self,
        streams: &BTreeSet<StreamId>,
        payload: MultiObjectSmrEntry,
        resolution: &TxResolutionInfo,
    ) -> Result<i64> {
        loop {
            let token = self
                .sequencer
                .next_token_conditional(streams, resolution)?;
            match self.address_space.append(
                token.token,
                streams,
                payload.clone(),
                &token.backpointers,
            ) {
                Ok(()) => return Ok(token.token),
                Err(WeftError::Overwrite(addr)) => {
                    debug!(addr, "overwrite on transactional append, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reserve the next address for `streams` without writing anything.
    ///
    /// The reservation records the transaction's write fingerprints with
    /// the sequencer, so transactions snapshotted below the reserved
    /// address resolve against this commit even before its payload lands.
    /// The read side of `resolution` is ignored: the caller's conflict
    /// window `(token - 1, token)` is empty by construction.
    pub fn acquire_token(
        &self,
        streams: &BTreeSet<StreamId>,
        resolution: &TxResolutionInfo,
    ) -> Result<TokenResponse> {
        let writes_only = TxResolutionInfo::new(
            resolution.tx_id,
            resolution.snapshot,
            BTreeMap::new(),
            resolution.writes.clone(),
        );
        self.sequencer.next_token_conditional(streams, &writes_only)
    }

    /// Write `payload` at a previously reserved token.
    pub fn append_at(
        &self,
        token: &TokenResponse,
        streams: &BTreeSet<StreamId>,
        payload: MultiObjectSmrEntry,
    ) -> Result<i64> {
        match self
            .address_space
            .append(token.token, streams, payload, &token.backpointers)
        {
            Ok(()) => Ok(token.token),
            // Our reserved slot was hole-filled out from under us.
            Err(WeftError::Overwrite(addr)) => Err(WeftError::internal(format!(
                "reserved address {} was overwritten before commit",
                addr
            ))),
            Err(e) => Err(e),
        }
    }

    /// Permanently release a reserved address as a hole.
    pub fn release_token(&self, token: &TokenResponse) -> Result<()> {
        self.address_space.fill_hole(token.token)
    }
}

/// A positioned scanner over one stream.
pub struct StreamScanner {
    stream: StreamId,
    address_space: Arc<dyn AddressSpace>,
    /// Global address of the last consumed position.
    pos: i64,
}

impl StreamScanner {
    /// The stream this scanner walks.
    pub fn stream_id(&self) -> StreamId {
        self.stream
    }

    /// The global address of the last consumed position.
    pub fn pos(&self) -> i64 {
        self.pos
    }

    /// Position the scanner so the next consumed address is `global`.
    pub fn seek(&mut self, global: i64) {
        self.pos = global - 1;
    }

    /// Consume log positions up to and including `limit`, returning the
    /// slices that carry entries for this stream.
    ///
    /// # Errors
    ///
    /// `WeftError::Trimmed` if any position in the range was reclaimed.
    pub fn slices_up_to(&mut self, limit: i64) -> Result<Vec<StreamSlice>> {
        let mut out = Vec::new();
        if limit <= self.pos {
            return Ok(out);
        }
        let first = self.pos + 1;
        let trim_mark = self.address_space.trim_mark();
        if first < trim_mark {
            return Err(WeftError::Trimmed(first));
        }
        for addr in first..=limit {
            let data = self.address_space.read(addr)?;
            if data.is_hole() {
                continue;
            }
            if !data.streams.contains(&self.stream) {
                continue;
            }
            if let Some(payload) = data.payload {
                if payload.read().num_updates(self.stream) > 0 {
                    out.push(StreamSlice { addr, payload });
                }
            }
        }
        self.pos = limit;
        Ok(out)
    }

    /// Consume up to `limit` and return cloned entries with their global
    /// addresses. Convenience for scans that never write back (the precise
    /// conflict check).
    pub fn entries_up_to(&mut self, limit: i64) -> Result<Vec<(i64, SmrEntry)>> {
        let stream = self.stream;
        let slices = self.slices_up_to(limit)?;
        let mut out = Vec::new();
        for slice in slices {
            let payload = slice.payload.read();
            for entry in payload.updates(stream) {
                out.push((slice.addr, entry.clone()));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::InMemoryAddressSpace;
    use crate::sequencer::InMemorySequencer;
    use weft_core::Value;

    fn view() -> StreamsView {
        StreamsView::new(
            Arc::new(InMemorySequencer::new()),
            Arc::new(InMemoryAddressSpace::new()),
        )
    }

    fn put_payload(stream: StreamId, key: &str) -> MultiObjectSmrEntry {
        let mut p = MultiObjectSmrEntry::new();
        p.add_to(stream, SmrEntry::new("put", vec![Value::from(key)]));
        p
    }

    fn one(s: StreamId) -> BTreeSet<StreamId> {
        [s].into_iter().collect()
    }

    #[test]
    fn test_direct_writes_are_sequential() {
        let v = view();
        let s = StreamId::new();
        assert_eq!(v.write(&one(s), put_payload(s, "a")).unwrap(), 0);
        assert_eq!(v.write(&one(s), put_payload(s, "b")).unwrap(), 1);
        assert_eq!(v.current_tail().unwrap(), 1);
    }

    #[test]
    fn test_scanner_surfaces_only_its_stream() {
        let v = view();
        let s1 = StreamId::new();
        let s2 = StreamId::new();
        v.write(&one(s1), put_payload(s1, "a")).unwrap();
        v.write(&one(s2), put_payload(s2, "b")).unwrap();
        v.write(&one(s1), put_payload(s1, "c")).unwrap();

        let mut scanner = v.get(s1);
        scanner.seek(0);
        let entries = scanner.entries_up_to(2).unwrap();
        let keys: Vec<_> = entries
            .iter()
            .map(|(_, e)| e.args[0].as_str().unwrap().to_string())
            .collect();
        assert_eq!(keys, ["a", "c"]);
        assert_eq!(scanner.pos(), 2);
    }

    #[test]
    fn test_scanner_skips_holes() {
        let v = view();
        let s = StreamId::new();
        v.write(&one(s), put_payload(s, "a")).unwrap();
        let resolution =
            TxResolutionInfo::new(TxId::new(), 0, BTreeMap::new(), BTreeMap::new());
        let reserved = v.acquire_token(&one(s), &resolution).unwrap();
        v.release_token(&reserved).unwrap();
        v.write(&one(s), put_payload(s, "b")).unwrap();

        let mut scanner = v.get(s);
        scanner.seek(0);
        let entries = scanner.entries_up_to(2).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].0, 2);
    }

    #[test]
    fn test_scanner_detects_trim() {
        let v = view();
        let s = StreamId::new();
        for k in ["a", "b", "c"] {
            v.write(&one(s), put_payload(s, k)).unwrap();
        }
        v.address_space.trim(1).unwrap();

        let mut scanner = v.get(s);
        scanner.seek(0);
        assert!(matches!(
            scanner.entries_up_to(2),
            Err(WeftError::Trimmed(_))
        ));
    }

    #[test]
    fn test_two_phase_append_lands_at_reserved_token() {
        let v = view();
        let s = StreamId::new();
        v.write(&one(s), put_payload(s, "a")).unwrap();

        let resolution =
            TxResolutionInfo::new(TxId::new(), 0, BTreeMap::new(), BTreeMap::new());
        let token = v.acquire_token(&one(s), &resolution).unwrap();
        assert_eq!(token.token, 1);
        let addr = v
            .append_at(&token, &one(s), put_payload(s, "b"))
            .unwrap();
        assert_eq!(addr, 1);
        assert!(!v.read(1).unwrap().is_hole());
    }

    #[test]
    fn test_reservation_is_visible_to_conflict_resolution() {
        let v = view();
        let s = StreamId::new();
        let k = Value::from("k");

        let mut writes: BTreeMap<StreamId, BTreeSet<Fingerprint>> = BTreeMap::new();
        writes.entry(s).or_default().insert(Fingerprint::of(&k));
        let resolution =
            TxResolutionInfo::new(TxId::new(), Address::NEVER_READ, BTreeMap::new(), writes);
        let token = v.acquire_token(&one(s), &resolution).unwrap();

        // A transaction snapshotted below the reservation that read the
        // same key must abort, even before the payload lands.
        let mut reads: BTreeMap<StreamId, BTreeSet<Fingerprint>> = BTreeMap::new();
        reads.entry(s).or_default().insert(Fingerprint::of(&k));
        let reader = TxResolutionInfo::new(
            TxId::new(),
            token.token - 1 - 1,
            reads,
            BTreeMap::new(),
        );
        assert!(v.append(&one(s), put_payload(s, "x"), &reader).is_err());
    }
}
