//! Conflict and write sets
//!
//! A transaction buffers its footprint in two structures:
//!
//! - the **conflict set** records, per stream, which conflict parameters
//!   were touched; its hashed view is what the sequencer resolves against
//! - the **write set** extends the conflict set with the speculative SMR
//!   updates themselves
//!
//! Adding an update returns the per-stream index of the new entry — the
//! "speculative address" an accessor-mutator later uses to fetch its
//! upcall result.

use crate::object::ProxyInternal;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use weft_core::{Fingerprint, MultiObjectSmrEntry, SmrEntry, StreamId, Value};

/// Conflict information supplied with a read or a write.
#[derive(Debug, Clone)]
pub enum ConflictParams {
    /// The operation conflicts with any update on the stream
    /// (e.g. a whole-object read, or a `clear`).
    All,
    /// The operation conflicts only with updates touching one of these
    /// parameters.
    Fine(Vec<Value>),
    /// The access requires no conflict tracking; only meaningful for
    /// deferred reads, which resolve at commit time. Other flavors treat
    /// it as `All`.
    NoConflict,
}

/// One recorded conflict parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ConflictKey {
    All,
    Param(Value),
}

impl ConflictParams {
    pub(crate) fn keys(&self) -> Vec<ConflictKey> {
        match self {
            ConflictParams::All | ConflictParams::NoConflict => vec![ConflictKey::All],
            ConflictParams::Fine(vs) => {
                vs.iter().cloned().map(ConflictKey::Param).collect()
            }
        }
    }
}

struct StreamConflicts {
    proxy: Arc<dyn ProxyInternal>,
    params: HashSet<ConflictKey>,
}

/// Per-transaction record of which proxies were touched and with which
/// conflict parameters.
#[derive(Default)]
pub struct ConflictSetInfo {
    conflicts: HashMap<StreamId, StreamConflicts>,
}

impl ConflictSetInfo {
    /// An empty conflict set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an access to `proxy` under the given parameters.
    pub fn add(&mut self, proxy: &Arc<dyn ProxyInternal>, params: &ConflictParams) {
        let entry = self
            .conflicts
            .entry(proxy.stream_id())
            .or_insert_with(|| StreamConflicts {
                proxy: Arc::clone(proxy),
                params: HashSet::new(),
            });
        entry.params.extend(params.keys());
    }

    /// The hashed view: per stream, the fingerprints of every recorded
    /// parameter. The ALL key maps to the zero-length fingerprint the
    /// sequencer interprets as a whole-stream conflict.
    pub fn hashed(&self) -> BTreeMap<StreamId, BTreeSet<Fingerprint>> {
        let mut out = BTreeMap::new();
        for (&stream, sc) in &self.conflicts {
            let fps: BTreeSet<Fingerprint> = sc
                .params
                .iter()
                .map(|k| match k {
                    ConflictKey::All => Fingerprint::all(),
                    ConflictKey::Param(v) => Fingerprint::of(v),
                })
                .collect();
            out.insert(stream, fps);
        }
        out
    }

    /// Union `other` into this set (nested fold).
    pub fn merge(&mut self, other: ConflictSetInfo) {
        for (stream, sc) in other.conflicts {
            match self.conflicts.get_mut(&stream) {
                Some(mine) => mine.params.extend(sc.params),
                None => {
                    self.conflicts.insert(stream, sc);
                }
            }
        }
    }

    /// Look up the proxy recorded for `stream`.
    pub fn proxy_for(&self, stream: StreamId) -> Option<Arc<dyn ProxyInternal>> {
        self.conflicts.get(&stream).map(|sc| Arc::clone(&sc.proxy))
    }

    /// The raw parameters recorded for `stream` (empty if none).
    pub(crate) fn keys_for(&self, stream: StreamId) -> HashSet<ConflictKey> {
        self.conflicts
            .get(&stream)
            .map(|sc| sc.params.clone())
            .unwrap_or_default()
    }

    /// True if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// The write set: conflict information plus the speculative updates.
#[derive(Default)]
pub struct WriteSetInfo {
    conflicts: ConflictSetInfo,
    affected_streams: BTreeSet<StreamId>,
    write_set: MultiObjectSmrEntry,
}

impl WriteSetInfo {
    /// An empty write set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer `entry` against `proxy`, recording its conflict parameters,
    /// and return the per-stream index of the new entry.
    pub fn add(
        &mut self,
        proxy: &Arc<dyn ProxyInternal>,
        entry: SmrEntry,
        params: &ConflictParams,
    ) -> usize {
        self.conflicts.add(proxy, params);
        let stream = proxy.stream_id();
        self.affected_streams.insert(stream);
        self.write_set.add_to(stream, entry)
    }

    /// The streams this transaction mutated.
    pub fn affected_streams(&self) -> &BTreeSet<StreamId> {
        &self.affected_streams
    }

    /// The buffered updates for `stream`, in order.
    pub fn updates(&self, stream: StreamId) -> &[SmrEntry] {
        self.write_set.updates(stream)
    }

    /// Number of buffered updates for `stream`.
    pub fn num_updates(&self, stream: StreamId) -> usize {
        self.write_set.num_updates(stream)
    }

    /// Clone of the buffered entry at `index` for `stream`.
    pub fn entry_at(&self, stream: StreamId, index: usize) -> Option<SmrEntry> {
        self.write_set.updates(stream).get(index).cloned()
    }

    /// Mutable access to the buffered entry at `index` for `stream`.
    pub(crate) fn entry_mut(&mut self, stream: StreamId, index: usize) -> Option<&mut SmrEntry> {
        self.write_set.updates_mut(stream).get_mut(index)
    }

    /// The hashed write conflict view.
    pub fn hashed(&self) -> BTreeMap<StreamId, BTreeSet<Fingerprint>> {
        self.conflicts.hashed()
    }

    /// The conflict information recorded alongside the writes.
    pub fn conflict_info(&self) -> &ConflictSetInfo {
        &self.conflicts
    }

    /// Clone of the whole speculative payload, for the log append.
    pub fn payload_clone(&self) -> MultiObjectSmrEntry {
        self.write_set.clone()
    }

    /// True if no update has been buffered.
    pub fn is_empty(&self) -> bool {
        self.write_set.is_empty()
    }

    /// Fold `other` into this write set: union the conflict parameters,
    /// append the speculative entries in their original order.
    pub fn merge(&mut self, other: WriteSetInfo) {
        self.conflicts.merge(other.conflicts);
        self.affected_streams.extend(other.affected_streams);
        self.write_set.merge(other.write_set);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::testing::FakeProxy;

    fn fine(v: &str) -> ConflictParams {
        ConflictParams::Fine(vec![Value::from(v)])
    }

    #[test]
    fn test_add_records_proxy_and_params() {
        let proxy = FakeProxy::arc(StreamId::new());
        let mut cs = ConflictSetInfo::new();
        cs.add(&proxy, &fine("k1"));
        cs.add(&proxy, &fine("k2"));

        let hashed = cs.hashed();
        assert_eq!(hashed[&proxy.stream_id()].len(), 2);
        assert!(cs.proxy_for(proxy.stream_id()).is_some());
    }

    #[test]
    fn test_all_param_hashes_to_sentinel() {
        let proxy = FakeProxy::arc(StreamId::new());
        let mut cs = ConflictSetInfo::new();
        cs.add(&proxy, &ConflictParams::All);
        let hashed = cs.hashed();
        assert!(hashed[&proxy.stream_id()].iter().any(|f| f.is_all()));
    }

    #[test]
    fn test_write_set_indexes_per_stream() {
        let p1 = FakeProxy::arc(StreamId::new());
        let p2 = FakeProxy::arc(StreamId::new());
        let mut ws = WriteSetInfo::new();
        assert_eq!(ws.add(&p1, SmrEntry::new("put", vec![]), &fine("a")), 0);
        assert_eq!(ws.add(&p1, SmrEntry::new("put", vec![]), &fine("b")), 1);
        assert_eq!(ws.add(&p2, SmrEntry::new("put", vec![]), &fine("c")), 0);
        assert_eq!(ws.affected_streams().len(), 2);
    }

    #[test]
    fn test_merge_unions_params_and_appends_entries() {
        let proxy = FakeProxy::arc(StreamId::new());
        let stream = proxy.stream_id();

        let mut parent = WriteSetInfo::new();
        parent.add(&proxy, SmrEntry::new("a", vec![]), &fine("x"));

        let mut child = WriteSetInfo::new();
        child.add(&proxy, SmrEntry::new("b", vec![]), &fine("y"));

        parent.merge(child);
        let methods: Vec<_> = parent
            .updates(stream)
            .iter()
            .map(|e| e.method.clone())
            .collect();
        assert_eq!(methods, ["a", "b"]);
        assert_eq!(parent.hashed()[&stream].len(), 2);
    }
}
