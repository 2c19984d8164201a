//! The object proxy
//!
//! An `SmrProxy<T>` binds an object type to a stream and its
//! version-locked replica, and routes every access and mutation through
//! the calling thread's current transactional context. Outside a
//! transaction, reads sync the replica to the log tail and mutations
//! append directly to the log.

use crate::conflict_set::ConflictParams;
use crate::context::DeferredRead;
use crate::object::{ProxyInternal, SmrObject, VersionLockedObject};
use crate::registry::TransactionRegistry;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};
use weft_core::{LogData, MultiObjectSmrEntry, Result, SmrEntry, StreamId, Value, WeftError};
use weft_log::StreamsView;

/// Binds a replicated object type to a stream and its replica.
pub struct SmrProxy<T: SmrObject> {
    stream_id: StreamId,
    vlo: VersionLockedObject<T>,
    streams: Arc<StreamsView>,
    registry: Arc<TransactionRegistry>,
    /// Back-reference to the owning `Arc`, for handing the proxy to
    /// contexts and deferred closures.
    me: Weak<SmrProxy<T>>,
}

impl<T: SmrObject> SmrProxy<T> {
    /// Create the proxy (and its replica) for `stream_id`.
    pub fn new(
        stream_id: StreamId,
        streams: Arc<StreamsView>,
        registry: Arc<TransactionRegistry>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| SmrProxy {
            stream_id,
            vlo: VersionLockedObject::new(stream_id, Arc::clone(&streams)),
            streams,
            registry,
            me: me.clone(),
        })
    }

    /// The stream this proxy is bound to.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub(crate) fn vlo(&self) -> &VersionLockedObject<T> {
        &self.vlo
    }

    pub(crate) fn streams_view(&self) -> &Arc<StreamsView> {
        &self.streams
    }

    fn strong(&self) -> Result<Arc<SmrProxy<T>>> {
        self.me
            .upgrade()
            .ok_or_else(|| WeftError::internal("proxy used after its runtime dropped it"))
    }

    /// The object-safe handle contexts store for this proxy.
    pub(crate) fn as_internal(&self) -> Result<Arc<dyn ProxyInternal>> {
        Ok(self.strong()? as Arc<dyn ProxyInternal>)
    }

    /// Read the object through `f`.
    ///
    /// Inside a transaction this populates the conflict set and observes
    /// the transaction's snapshot (plus its own prior writes). Outside, it
    /// syncs the replica to the current log tail.
    pub fn access<R>(&self, params: ConflictParams, f: impl Fn(&T) -> R) -> Result<R> {
        match self.registry.current() {
            Some(ctx) => ctx.access(self, params, f),
            None => self.non_transactional_access(f),
        }
    }

    /// Buffer (or directly append) a mutation. Returns the speculative
    /// per-stream index inside a transaction, or the global log address
    /// outside one.
    pub fn mutate(&self, method: &str, args: Vec<Value>, params: ConflictParams) -> Result<i64> {
        match self.registry.current() {
            Some(ctx) => ctx
                .log_update(self, SmrEntry::new(method, args), params)
                .map(|idx| idx as i64),
            None => self.direct_append(method, args),
        }
    }

    /// Accessor-mutator: buffer (or append) the mutation and return its
    /// upcall result.
    pub fn mutate_with_result(
        &self,
        method: &str,
        args: Vec<Value>,
        params: ConflictParams,
    ) -> Result<Value> {
        match self.registry.current() {
            Some(ctx) => {
                let index = ctx.log_update(self, SmrEntry::new(method, args), params.clone())?;
                ctx.get_upcall_result(self, index, params)
            }
            None => {
                let addr = self.direct_append(method, args)?;
                // Sync the replica through our append; applying the entry
                // caches the upcall result into the shared log record.
                self.vlo.update(|o| {
                    o.rollback_optimistic_unsafe(self.stream_id, &self.streams)?;
                    o.sync_object_unsafe(self.stream_id, &self.streams, addr)
                })?;
                let data = self.streams.read(addr)?;
                let payload = data
                    .payload
                    .ok_or_else(|| WeftError::internal("committed address has no payload"))?;
                let guard = payload.read();
                guard
                    .updates(self.stream_id)
                    .last()
                    .and_then(|e| e.upcall_result.clone())
                    .ok_or_else(|| {
                        WeftError::internal("upcall result missing after direct append sync")
                    })
            }
        }
    }

    /// Register a deferred read: capture `accessor` to run at commit time
    /// against the commit snapshot. Requires an active DEFERRED
    /// transaction; under any other flavor this falls through to a plain
    /// `access`.
    ///
    /// The object is touched once through `no_access` (no sync) at
    /// registration, and `params` protect the re-executed access at
    /// commit.
    pub fn access_deferred(
        &self,
        params: ConflictParams,
        accessor: Arc<dyn Fn(&T) + Send + Sync>,
    ) -> Result<()> {
        let ctx = self.registry.current().ok_or(WeftError::NoTransaction)?;
        if !ctx.is_deferred() {
            return ctx.access(self, params, |state| accessor(state));
        }
        debug!(stream = %self.stream_id, "capturing deferred read");
        let proxy = self.strong()?;
        let acc = Arc::clone(&accessor);
        let deferred: DeferredRead = Box::new(move || {
            proxy
                .access(params.clone(), |state| acc(state))
                .map(|_| ())
        });
        ctx.add_deferred(self.stream_id, deferred);
        self.vlo.no_access(|state| accessor(state));
        Ok(())
    }

    fn non_transactional_access<R>(&self, f: impl Fn(&T) -> R) -> Result<R> {
        let tail = self.streams.current_tail()?;
        self.vlo.access(
            |o| o.optimistic().is_none() && o.version() == tail,
            |o| {
                // a stale overlay from a finished transaction is rolled
                // back; a live one will be reinstalled by its owner
                o.rollback_optimistic_unsafe(self.stream_id, &self.streams)?;
                o.sync_object_unsafe(self.stream_id, &self.streams, tail)
            },
            f,
        )
    }

    fn direct_append(&self, method: &str, args: Vec<Value>) -> Result<i64> {
        trace!(stream = %self.stream_id, method, "direct append");
        let mut payload = MultiObjectSmrEntry::new();
        payload.add_to(self.stream_id, SmrEntry::new(method, args));
        let streams: BTreeSet<StreamId> = [self.stream_id].into_iter().collect();
        self.streams.write(&streams, payload)
    }
}

impl<T: SmrObject> ProxyInternal for SmrProxy<T> {
    fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    fn conflict_from_entry(&self, method: &str, args: &[Value]) -> ConflictParams {
        T::conflict_from_entry(method, args)
    }

    fn optimistically_owned_by_current_thread(&self) -> bool {
        self.vlo.optimistically_owned_by_current_thread()
    }

    fn commit_optimistic_updates(&self, commit_address: i64, committed: &LogData) -> Result<()> {
        self.vlo.update(|o| {
            // re-check ownership now that we hold the lock
            let owned = o
                .optimistic()
                .map(|s| s.is_stream_for_this_thread())
                .unwrap_or(false);
            if !owned {
                debug!(stream = %self.stream_id, "overlay ownership lost before installation");
                return Ok(());
            }
            let overlay = match o.optimistic_commit_unsafe() {
                Some(overlay) => overlay,
                None => return Ok(()),
            };

            // grab committed updates by other clients in (version, commit)
            o.sync_object_unsafe(self.stream_id, &self.streams, commit_address - 1)?;

            // transfer the undo log onto the committed entry; only safe
            // when the write sets line up exactly
            if let Some(payload) = &committed.payload {
                let overlay_entries = overlay.entries_all();
                let mut guard = payload.write();
                let committed_entries = guard.updates_mut(self.stream_id);
                if committed_entries.len() == overlay_entries.len() {
                    for (committed_entry, overlay_entry) in
                        committed_entries.iter_mut().zip(overlay_entries.iter())
                    {
                        if overlay_entry.is_undoable() {
                            committed_entry.undo_record = overlay_entry.undo_record.clone();
                        }
                    }
                }
            }

            // the state already reflects our own writes; skip the entry
            o.seek_unsafe(commit_address + 1);
            trace!(stream = %self.stream_id, commit_address, "optimistic updates installed");
            Ok(())
        })
    }

    fn rollback_optimistic_updates(&self) -> Result<()> {
        self.vlo.update(|o| {
            let owned = o
                .optimistic()
                .map(|s| s.is_stream_for_this_thread())
                .unwrap_or(false);
            if owned {
                o.rollback_optimistic_unsafe(self.stream_id, &self.streams)
            } else {
                Ok(())
            }
        })
    }
}
