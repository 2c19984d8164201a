//! Transactional contexts
//!
//! One `TransactionalContext` carries the full per-transaction state: the
//! conflict set, the write set, the lazily fetched snapshot, the proxies
//! modified so far and, for DEFERRED transactions, the captured read
//! closures. The three flavors share one type and dispatch on `TxType`:
//!
//! - **Optimistic**: reads populate the conflict set; commit succeeds iff
//!   no read fingerprint was updated between the snapshot (fixed at the
//!   root's first read) and the commit.
//! - **WriteAfterWrite**: identical, except reads do not populate the
//!   conflict set — only writes do, so commit aborts only on write-write
//!   conflicts.
//! - **Deferred**: accessors may be captured as closures and executed at
//!   commit time against a commit-time snapshot (`token - 1`).
//!
//! Nested contexts inherit the root's snapshot and fold into their parent
//! on commit, returning `Address::FOLDED`. A read-only commit returns
//! `Address::NOWRITE` without touching the log.

use crate::conflict_set::{ConflictKey, ConflictParams, ConflictSetInfo, WriteSetInfo};
use crate::object::{ProxyInternal, SmrObject, SmrProxy};
use crate::registry::TransactionRegistry;
use crate::write_set_stream::WriteSetSmrStream;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use weft_core::{
    AbortCause, Address, Result, SmrEntry, StreamId, TransactionAbortedError, TxId,
    TxResolutionInfo, Value, WeftError, TRANSACTION_STREAM_ID,
};
use weft_log::StreamsView;
use crate::object::versioned::VloInner;

/// Transaction flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxType {
    /// Conflict on reads since the first-read snapshot
    Optimistic,
    /// Conflict on writes only
    WriteAfterWrite,
    /// Commit-time snapshot with deferred read closures
    Deferred,
}

impl TxType {
    /// Human-readable flavor name.
    pub fn name(&self) -> &'static str {
        match self {
            TxType::Optimistic => "optimistic",
            TxType::WriteAfterWrite => "write-after-write",
            TxType::Deferred => "deferred",
        }
    }
}

/// A read closure captured by a DEFERRED transaction, re-executed at
/// commit time. Must not hold transaction-local locks.
pub type DeferredRead = Box<dyn Fn() -> Result<()> + Send>;

/// Per-transaction state and the flavor-specific algorithms over it.
pub struct TransactionalContext {
    tx_id: TxId,
    tx_type: TxType,
    snapshot: Mutex<Option<i64>>,
    conflict_set: Mutex<ConflictSetInfo>,
    write_set: Mutex<WriteSetInfo>,
    commit_address: AtomicI64,
    modified_proxies: Mutex<Vec<Arc<dyn ProxyInternal>>>,
    deferred_reads: Mutex<Vec<(StreamId, DeferredRead)>>,
    precise_conflicts: bool,
    transaction_logging: bool,
    streams: Arc<StreamsView>,
    registry: Arc<TransactionRegistry>,
}

impl TransactionalContext {
    pub(crate) fn new(
        tx_type: TxType,
        snapshot_override: Option<i64>,
        precise_conflicts: bool,
        transaction_logging: bool,
        streams: Arc<StreamsView>,
        registry: Arc<TransactionRegistry>,
    ) -> Arc<Self> {
        Arc::new(TransactionalContext {
            tx_id: TxId::new(),
            tx_type,
            snapshot: Mutex::new(snapshot_override),
            conflict_set: Mutex::new(ConflictSetInfo::new()),
            write_set: Mutex::new(WriteSetInfo::new()),
            commit_address: AtomicI64::new(Address::NEVER_READ),
            modified_proxies: Mutex::new(Vec::new()),
            deferred_reads: Mutex::new(Vec::new()),
            precise_conflicts,
            transaction_logging,
            streams,
            registry,
        })
    }

    /// This transaction's id.
    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    /// This transaction's flavor.
    pub fn tx_type(&self) -> TxType {
        self.tx_type
    }

    /// The snapshot, if it has been fixed already.
    pub fn snapshot(&self) -> Option<i64> {
        *self.snapshot.lock()
    }

    /// The commit address (`Address::NEVER_READ` until committed,
    /// `Address::FOLDED` for a folded nested commit).
    pub fn commit_address(&self) -> i64 {
        self.commit_address.load(Ordering::SeqCst)
    }

    pub(crate) fn write_set(&self) -> &Mutex<WriteSetInfo> {
        &self.write_set
    }

    pub(crate) fn is_deferred(&self) -> bool {
        self.tx_type == TxType::Deferred
    }

    /// Capture a deferred read closure against `stream`.
    pub(crate) fn add_deferred(&self, stream: StreamId, read: DeferredRead) {
        self.deferred_reads.lock().push((stream, read));
    }

    /// The snapshot this transaction reads at, fetched on first use.
    ///
    /// Nested contexts inherit the root's snapshot. The root fixes it by
    /// asking the sequencer for the current tail (a token request over
    /// zero streams).
    pub fn snapshot_timestamp(&self) -> Result<i64> {
        if let Some(root) = self.registry.root() {
            if root.tx_id() != self.tx_id {
                return root.snapshot_timestamp();
            }
        }
        let mut snapshot = self.snapshot.lock();
        if let Some(v) = *snapshot {
            return Ok(v);
        }
        let tail = self.streams.current_tail()?;
        trace!(tx = %self.tx_id, snapshot = tail, "snapshot timestamp fixed");
        *snapshot = Some(tail);
        Ok(tail)
    }

    fn set_snapshot(&self, v: i64) {
        *self.snapshot.lock() = Some(v);
    }

    // ------------------------------------------------------------------
    // read / write / upcall
    // ------------------------------------------------------------------

    /// Transactional read of `proxy` through `f`.
    ///
    /// Fast path: the replica is already at the snapshot with the right
    /// overlay, so `f` runs under the read lock. Otherwise the write lock
    /// is taken, this context's overlay is installed (undoing any other
    /// owner's overlay first), the replica is synced to the snapshot, and
    /// `f` runs.
    pub fn access<T: SmrObject, R>(
        &self,
        proxy: &SmrProxy<T>,
        params: ConflictParams,
        f: impl Fn(&T) -> R,
    ) -> Result<R> {
        let stream_id = proxy.stream_id();
        debug!(tx = %self.tx_id, stream = %stream_id, "transactional access");
        self.add_to_read_set(&proxy.as_internal()?, &params);
        let snapshot = self.snapshot_timestamp()?;

        proxy
            .vlo()
            .access(
                |o| {
                    self.write_set.lock().num_updates(stream_id) == 0
                        && o.version() == snapshot
                        && o.optimistic()
                            .map_or(true, |s| s.is_stream_current_context_thread_current_context())
                },
                |o| self.sync_unsafe(o, stream_id, snapshot, proxy.streams_view()),
                f,
            )
            .map_err(|e| self.abort_on_trim(e))
    }

    /// Buffer a speculative update; returns its per-stream index in this
    /// context's write set.
    pub fn log_update<T: SmrObject>(
        &self,
        proxy: &SmrProxy<T>,
        entry: SmrEntry,
        params: ConflictParams,
    ) -> Result<usize> {
        trace!(
            tx = %self.tx_id,
            stream = %proxy.stream_id(),
            method = %entry.method,
            "buffering update"
        );
        Ok(self.add_to_write_set(&proxy.as_internal()?, entry, &params))
    }

    /// Fetch the upcall result of the buffered update at `index`.
    ///
    /// If the entry has not been executed yet, the replica is synced under
    /// the write lock (which applies every overlay entry, filling in
    /// upcall results) and the entry re-read. Missing a result after a
    /// full sync is an invariant violation.
    pub fn get_upcall_result<T: SmrObject>(
        &self,
        proxy: &SmrProxy<T>,
        index: usize,
        params: ConflictParams,
    ) -> Result<Value> {
        let stream_id = proxy.stream_id();
        self.add_to_read_set(&proxy.as_internal()?, &params);

        if let Some(entry) = self.write_set.lock().entry_at(stream_id, index) {
            if let Some(result) = entry.upcall_result {
                return Ok(result);
            }
        }

        let snapshot = self.snapshot_timestamp()?;
        let streams = Arc::clone(proxy.streams_view());
        proxy
            .vlo()
            .update(|o| {
                trace!(tx = %self.tx_id, index, "syncing for upcall result");
                self.sync_unsafe(o, stream_id, snapshot, &streams)?;
                match self.write_set.lock().entry_at(stream_id, index) {
                    Some(SmrEntry {
                        upcall_result: Some(result),
                        ..
                    }) => Ok(result),
                    _ => Err(WeftError::internal(format!(
                        "no upcall result at index {} after optimistic sync",
                        index
                    ))),
                }
            })
            .map_err(|e| self.abort_on_trim(e))
    }

    /// Bring `o` to this transaction's snapshot with this context's
    /// overlay installed and fully applied.
    fn sync_unsafe<T: SmrObject>(
        &self,
        o: &mut VloInner<T>,
        stream_id: StreamId,
        snapshot: i64,
        streams: &StreamsView,
    ) -> Result<()> {
        let needs_install = o
            .optimistic()
            .map_or(true, |s| !s.is_stream_current_context_thread_current_context());
        if needs_install {
            let overlay = WriteSetSmrStream::new(
                self.registry.stack(),
                stream_id,
                Arc::clone(&self.registry),
            );
            o.set_optimistic_stream_unsafe(stream_id, streams, overlay)?;
        }
        o.sync_object_unsafe(stream_id, streams, snapshot)?;
        o.sync_optimistic_stream_unsafe(Address::MAX)
    }

    fn add_to_read_set(&self, proxy: &Arc<dyn ProxyInternal>, params: &ConflictParams) {
        match self.tx_type {
            // write-after-write transactions track no read conflicts
            TxType::WriteAfterWrite => {}
            TxType::Optimistic | TxType::Deferred => {
                self.conflict_set.lock().add(proxy, params);
            }
        }
    }

    fn add_to_write_set(
        &self,
        proxy: &Arc<dyn ProxyInternal>,
        entry: SmrEntry,
        params: &ConflictParams,
    ) -> usize {
        if self.tx_type == TxType::WriteAfterWrite {
            // writes are the conflict footprint of this flavor
            self.conflict_set.lock().add(proxy, params);
        }
        let index = self.write_set.lock().add(proxy, entry, params);
        let mut modified = self.modified_proxies.lock();
        if !modified.iter().any(|p| p.stream_id() == proxy.stream_id()) {
            modified.push(Arc::clone(proxy));
        }
        index
    }

    // ------------------------------------------------------------------
    // commit / abort
    // ------------------------------------------------------------------

    /// Commit this transaction.
    ///
    /// Nested contexts fold into their parent and return
    /// `Address::FOLDED`; a transaction with an empty write set returns
    /// `Address::NOWRITE` without touching the log. Otherwise the commit
    /// address is returned.
    ///
    /// # Errors
    ///
    /// `WeftError::TransactionAborted` carrying the classified cause.
    pub fn commit(&self) -> Result<i64> {
        match self.tx_type {
            TxType::Optimistic | TxType::WriteAfterWrite => self.commit_optimistic(),
            TxType::Deferred => self.commit_deferred(),
        }
    }

    fn commit_optimistic(&self) -> Result<i64> {
        debug!(tx = %self.tx_id, "requesting optimistic commit");
        if let Some(parent) = self.registry.parent_of(self) {
            parent.merge_from(self);
            self.commit_address.store(Address::FOLDED, Ordering::SeqCst);
            trace!(tx = %self.tx_id, parent = %parent.tx_id, "folded into parent");
            return Ok(Address::FOLDED);
        }

        let (payload, mut affected) = {
            let ws = self.write_set.lock();
            if ws.is_empty() {
                trace!(tx = %self.tx_id, "read-only commit (no write)");
                self.commit_address.store(Address::NOWRITE, Ordering::SeqCst);
                return Ok(Address::NOWRITE);
            }
            (ws.payload_clone(), ws.affected_streams().clone())
        };
        if self.transaction_logging {
            affected.insert(TRANSACTION_STREAM_ID);
        }

        let snapshot = self.snapshot_timestamp()?;
        let hashed_reads = self.conflict_set.lock().hashed();
        let hashed_writes = self.write_set.lock().hashed();
        let resolution = TxResolutionInfo::new(
            self.tx_id,
            snapshot,
            hashed_reads.clone(),
            hashed_writes.clone(),
        );

        let address = match self.streams.append(&affected, payload.clone(), &resolution) {
            Ok(addr) => addr,
            Err(WeftError::TransactionAborted(ae))
                if ae.cause == AbortCause::Conflict && self.precise_conflicts =>
            {
                self.do_precise_commit(ae, snapshot, &affected, &payload, hashed_reads, hashed_writes)?
            }
            Err(e) => return Err(self.classify_commit_error(e)),
        };

        trace!(tx = %self.tx_id, address, "commit address acquired");
        self.commit_address.store(address, Ordering::SeqCst);
        self.try_commit_all_proxies(address)?;
        debug!(tx = %self.tx_id, address, "committed");
        Ok(address)
    }

    /// Commit path of the DEFERRED flavor.
    ///
    /// Reserves the commit address first, fixes the snapshot to
    /// `token - 1`, executes every captured read closure, and finally
    /// writes the payload at the reserved address.
    fn commit_deferred(&self) -> Result<i64> {
        debug!(tx = %self.tx_id, "requesting deferred commit");
        if let Some(parent) = self.registry.parent_of(self) {
            parent.merge_from(self);
            self.commit_address.store(Address::FOLDED, Ordering::SeqCst);
            return Ok(Address::FOLDED);
        }

        let (payload, mut affected) = {
            let ws = self.write_set.lock();
            if ws.is_empty() {
                trace!(tx = %self.tx_id, "read-only commit (no write)");
                self.commit_address.store(Address::NOWRITE, Ordering::SeqCst);
                return Ok(Address::NOWRITE);
            }
            (ws.payload_clone(), ws.affected_streams().clone())
        };
        let deferred = std::mem::take(&mut *self.deferred_reads.lock());
        for (stream, _) in &deferred {
            affected.insert(*stream);
        }
        if self.transaction_logging {
            affected.insert(TRANSACTION_STREAM_ID);
        }

        let hashed_writes = self.write_set.lock().hashed();
        let reservation = TxResolutionInfo::new(
            self.tx_id,
            Address::NEVER_READ,
            BTreeMap::new(),
            hashed_writes,
        );
        let token = self
            .streams
            .acquire_token(&affected, &reservation)
            .map_err(|e| self.classify_commit_error(e))?;
        self.set_snapshot(token.token - 1);
        trace!(tx = %self.tx_id, token = token.token, "deferred snapshot fixed");

        for (stream, read) in &deferred {
            if let Err(e) = read() {
                warn!(tx = %self.tx_id, %stream, error = %e, "deferred read failed, aborting");
                // release the reserved slot so the log can make progress
                let _ = self.streams.release_token(&token);
                return Err(TransactionAbortedError::new(self.tx_id, AbortCause::User).into());
            }
        }

        let address = self
            .streams
            .append_at(&token, &affected, payload)
            .map_err(|e| self.classify_commit_error(e))?;
        self.commit_address.store(address, Ordering::SeqCst);
        self.try_commit_all_proxies(address)?;
        debug!(tx = %self.tx_id, address, "deferred commit written");
        Ok(address)
    }

    /// Precise conflict resolution.
    ///
    /// The sequencer's rejection is imprecise (by fingerprint). Scan the
    /// conflict window of the flagged stream and inspect each committed
    /// entry's conflict parameters: a real overlap aborts with a precise
    /// conflict; otherwise the range is marked verified and the commit is
    /// retried. The loop terminates because the sequencer never re-flags a
    /// verified range, so the conflict address strictly increases.
    fn do_precise_commit(
        &self,
        original: TransactionAbortedError,
        snapshot: i64,
        affected: &BTreeSet<StreamId>,
        payload: &weft_core::MultiObjectSmrEntry,
        hashed_reads: BTreeMap<StreamId, BTreeSet<weft_core::Fingerprint>>,
        hashed_writes: BTreeMap<StreamId, BTreeSet<weft_core::Fingerprint>>,
    ) -> Result<i64> {
        debug!(tx = %self.tx_id, "imprecise conflict detected, resolving");
        let mut current = original;
        let mut verified: BTreeMap<StreamId, i64> = BTreeMap::new();

        loop {
            if current.cause != AbortCause::Conflict {
                return Err(current.into());
            }
            let (conflict_stream, conflict_address) =
                match (current.conflict_stream, current.conflict_address) {
                    (Some(s), Some(a)) => (s, a),
                    // no conflict location: nothing to scan, re-throw
                    _ => return Err(current.into()),
                };

            let proxy = match self.find_proxy(conflict_stream) {
                Some(p) => p,
                None => {
                    warn!(
                        tx = %self.tx_id,
                        stream = %conflict_stream,
                        "precise resolution requested but proxy not found, aborting"
                    );
                    return Err(current.into());
                }
            };
            let my_params = self.conflict_set.lock().keys_for(conflict_stream);

            debug!(
                tx = %self.tx_id,
                stream = %conflict_stream,
                from = snapshot + 1,
                to = conflict_address,
                "scanning conflict window"
            );
            let mut scanner = self.streams.get(conflict_stream);
            scanner.seek(snapshot + 1);
            let entries = match scanner.entries_up_to(conflict_address) {
                Ok(entries) => entries,
                Err(WeftError::Trimmed(_)) => {
                    warn!(tx = %self.tx_id, "aborting due to trim during scan");
                    return Err(current.with_cause(AbortCause::Trim).into());
                }
                Err(e) => return Err(e),
            };

            for (addr, entry) in entries {
                match proxy.conflict_from_entry(&entry.method, &entry.args) {
                    ConflictParams::All => {
                        // the entry conflicts with any update (e.g. clear)
                        debug!(tx = %self.tx_id, addr, "true conflict due to conflict-all");
                        return Err(current.into_precise().into());
                    }
                    ConflictParams::Fine(values) => {
                        let overlap = my_params.contains(&ConflictKey::All)
                            || values
                                .iter()
                                .any(|v| my_params.contains(&ConflictKey::Param(v.clone())));
                        if overlap {
                            debug!(tx = %self.tx_id, addr, "true conflict, aborting");
                            return Err(current.into_precise().into());
                        }
                    }
                    ConflictParams::NoConflict => {}
                }
            }

            warn!(
                tx = %self.tx_id,
                stream = %conflict_stream,
                from = snapshot + 1,
                to = conflict_address,
                "false conflict, range verified"
            );
            verified.insert(conflict_stream, conflict_address);
            let resolution = TxResolutionInfo::new(
                self.tx_id,
                snapshot,
                hashed_reads.clone(),
                hashed_writes.clone(),
            )
            .with_verified(verified.clone());

            match self.streams.append(affected, payload.clone(), &resolution) {
                Ok(addr) => return Ok(addr),
                Err(WeftError::TransactionAborted(retry)) => {
                    warn!(tx = %self.tx_id, "sequencer rejected again, retrying");
                    current = retry;
                }
                Err(WeftError::Trimmed(_)) => {
                    return Err(current.with_cause(AbortCause::Trim).into());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Install the committed updates onto every proxy this transaction
    /// modified.
    fn try_commit_all_proxies(&self, commit_address: i64) -> Result<()> {
        let committed = self.streams.read(commit_address).map_err(|e| {
            WeftError::internal(format!(
                "committed entry unreadable at {}: {}",
                commit_address, e
            ))
        })?;
        for proxy in self.modified_proxies.lock().iter() {
            if proxy.optimistically_owned_by_current_thread() {
                proxy.commit_optimistic_updates(commit_address, &committed)?;
            } else {
                debug!(
                    tx = %self.tx_id,
                    stream = %proxy.stream_id(),
                    "skipping installation, overlay ownership was taken"
                );
            }
        }
        Ok(())
    }

    /// Fold `child` into this context (nested commit).
    pub(crate) fn merge_from(&self, child: &TransactionalContext) {
        trace!(parent = %self.tx_id, child = %child.tx_id, "merging nested transaction");
        let child_conflicts =
            std::mem::replace(&mut *child.conflict_set.lock(), ConflictSetInfo::new());
        self.conflict_set.lock().merge(child_conflicts);

        let child_writes = std::mem::replace(&mut *child.write_set.lock(), WriteSetInfo::new());
        self.write_set.lock().merge(child_writes);

        let child_modified = std::mem::take(&mut *child.modified_proxies.lock());
        {
            let mut modified = self.modified_proxies.lock();
            for proxy in child_modified {
                if !modified.iter().any(|p| p.stream_id() == proxy.stream_id()) {
                    modified.push(proxy);
                }
            }
        }

        let child_deferred = std::mem::take(&mut *child.deferred_reads.lock());
        self.deferred_reads.lock().extend(child_deferred);
    }

    /// Release everything this context holds: roll back owned overlays
    /// and clear the buffered state. Runs on every abort path, before the
    /// context is popped.
    pub fn abort_cleanup(&self) {
        debug!(tx = %self.tx_id, "aborting, releasing transaction state");
        for proxy in self.modified_proxies.lock().iter() {
            if let Err(e) = proxy.rollback_optimistic_updates() {
                warn!(tx = %self.tx_id, stream = %proxy.stream_id(), error = %e,
                    "overlay rollback failed during abort");
            }
        }
        *self.write_set.lock() = WriteSetInfo::new();
        *self.conflict_set.lock() = ConflictSetInfo::new();
        self.modified_proxies.lock().clear();
        self.deferred_reads.lock().clear();
    }

    fn find_proxy(&self, stream: StreamId) -> Option<Arc<dyn ProxyInternal>> {
        if let Some(p) = self
            .modified_proxies
            .lock()
            .iter()
            .find(|p| p.stream_id() == stream)
        {
            return Some(Arc::clone(p));
        }
        if let Some(p) = self.conflict_set.lock().proxy_for(stream) {
            return Some(p);
        }
        self.write_set.lock().conflict_info().proxy_for(stream)
    }

    /// Trims observed while reading the log on behalf of a transaction
    /// surface as TRIM aborts; everything else passes through.
    fn abort_on_trim(&self, e: WeftError) -> WeftError {
        match e {
            WeftError::Trimmed(addr) => TransactionAbortedError {
                tx_id: self.tx_id,
                cause: AbortCause::Trim,
                conflict_stream: None,
                conflict_address: Some(addr),
                precise: false,
            }
            .into(),
            other => other,
        }
    }

    fn classify_commit_error(&self, e: WeftError) -> WeftError {
        match e {
            WeftError::TransactionAborted(ae) => ae.into(),
            WeftError::Internal(msg) => WeftError::Internal(msg),
            other => other.into_abort(self.tx_id).into(),
        }
    }
}

impl std::fmt::Debug for TransactionalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalContext")
            .field("tx_id", &self.tx_id)
            .field("flavor", &self.tx_type)
            .field("snapshot", &*self.snapshot.lock())
            .field("commit_address", &self.commit_address())
            .finish()
    }
}

