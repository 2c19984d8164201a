//! The version-locked object
//!
//! One `VersionLockedObject` owns the materialized replica of one stream:
//! the state itself, the version pointer (the highest log position
//! reflected in the state), and the optimistic overlay of an in-flight
//! transaction. All mutation happens under the object's write lock;
//! readers proceed concurrently only when the fast-path guard holds.
//!
//! Invariants:
//! - overlay absent: the state reflects the log exactly up to `version`
//! - overlay present: the state is log-up-to-`version` plus the overlay
//!   entries applied in order, and only the owning thread mutates through
//!   the overlay

use crate::object::SmrObject;
use crate::write_set_stream::WriteSetSmrStream;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::trace;
use weft_core::{Address, Result, StreamId};
use weft_log::{StreamSlice, StreamsView};

/// The lock-protected replica state. Exposed to the engine (`pub` fields
/// within the crate) so guards and sync closures can inspect it.
pub struct VloInner<T> {
    /// The materialized state
    pub(crate) state: T,
    /// Highest log position reflected in `state`
    /// (`Address::NEVER_READ` before the first sync)
    pub(crate) version: i64,
    /// The optimistic overlay, if a transaction is working on this object
    pub(crate) optimistic: Option<WriteSetSmrStream>,
}

/// The shared replica of one stream's object.
pub struct VersionLockedObject<T: SmrObject> {
    stream_id: StreamId,
    streams: Arc<StreamsView>,
    inner: RwLock<VloInner<T>>,
}

impl<T: SmrObject> VersionLockedObject<T> {
    /// A fresh replica at the origin state.
    pub fn new(stream_id: StreamId, streams: Arc<StreamsView>) -> Self {
        VersionLockedObject {
            stream_id,
            streams,
            inner: RwLock::new(VloInner {
                state: T::new_instance(),
                version: Address::NEVER_READ,
                optimistic: None,
            }),
        }
    }

    /// The stream this replica materializes.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// The log view this replica syncs against.
    pub(crate) fn streams_view(&self) -> &Arc<StreamsView> {
        &self.streams
    }

    /// Guarded access.
    ///
    /// Runs `read` under the read lock if `guard` already holds (the fast
    /// path: correct version, correct overlay). Otherwise upgrades to the
    /// write lock, re-checks, runs `sync` to bring the replica to the
    /// required version and overlay, then runs `read`. Either way `read`
    /// observes a consistent state.
    pub fn access<R>(
        &self,
        guard: impl Fn(&VloInner<T>) -> bool,
        sync: impl FnOnce(&mut VloInner<T>) -> Result<()>,
        read: impl FnOnce(&T) -> R,
    ) -> Result<R> {
        {
            let inner = self.inner.read();
            if guard(&inner) {
                return Ok(read(&inner.state));
            }
        }
        let mut inner = self.inner.write();
        // the world may have changed while we waited for the write lock
        if !guard(&inner) {
            sync(&mut inner)?;
        }
        Ok(read(&inner.state))
    }

    /// Run `f` under the write lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut VloInner<T>) -> Result<R>) -> Result<R> {
        let mut inner = self.inner.write();
        f(&mut inner)
    }

    /// Run `read` against the current state without any synchronization.
    /// Used by deferred transactions to capture accessors for later
    /// execution.
    pub fn no_access<R>(&self, read: impl FnOnce(&T) -> R) -> R {
        let inner = self.inner.read();
        read(&inner.state)
    }

    /// True if the overlay belongs to the calling thread's transaction
    /// stack.
    pub fn optimistically_owned_by_current_thread(&self) -> bool {
        self.inner
            .read()
            .optimistic
            .as_ref()
            .map(|s| s.is_stream_for_this_thread())
            .unwrap_or(false)
    }
}

impl<T: SmrObject> VloInner<T> {
    /// The version pointer.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// The overlay, if any.
    pub fn optimistic(&self) -> Option<&WriteSetSmrStream> {
        self.optimistic.as_ref()
    }

    /// Apply committed slices in log order, enriching the shared entries
    /// with undo records (computed against the pre-apply state) and
    /// upcall results as we go.
    fn apply_slices_unsafe(&mut self, stream_id: StreamId, slices: &[StreamSlice]) -> Result<()> {
        for slice in slices {
            let mut payload = slice.payload.write();
            for entry in payload.updates_mut(stream_id) {
                if entry.undo_record.is_none() {
                    entry.undo_record = self.state.undo_record(entry);
                }
                let result = self.state.apply_update(entry)?;
                entry.upcall_result = Some(result);
            }
            self.version = slice.addr;
        }
        Ok(())
    }

    /// Move the version pointer to `target` against the physical log.
    ///
    /// Forward motion applies committed entries; backward motion undoes
    /// them if every intervening entry is undoable, and otherwise resets
    /// the state and replays from the origin.
    pub(crate) fn sync_object_unsafe(
        &mut self,
        stream_id: StreamId,
        streams: &StreamsView,
        target: i64,
    ) -> Result<()> {
        if target == self.version {
            return Ok(());
        }
        if target > self.version {
            trace!(%stream_id, from = self.version, to = target, "rolling object forward");
            let mut scanner = streams.get(stream_id);
            scanner.seek(self.version + 1);
            let slices = scanner.slices_up_to(target)?;
            self.apply_slices_unsafe(stream_id, &slices)?;
            self.version = target;
            Ok(())
        } else {
            trace!(%stream_id, from = self.version, to = target, "rolling object backward");
            self.roll_back_unsafe(stream_id, streams, target)
        }
    }

    fn roll_back_unsafe(
        &mut self,
        stream_id: StreamId,
        streams: &StreamsView,
        target: i64,
    ) -> Result<()> {
        let mut scanner = streams.get(stream_id);
        scanner.seek(target + 1);
        let entries: Vec<_> = scanner
            .entries_up_to(self.version)?
            .into_iter()
            .map(|(_, e)| e)
            .collect();

        if entries.iter().all(|e| e.is_undoable()) {
            for entry in entries.iter().rev() {
                self.state.apply_undo(entry)?;
            }
            self.version = target;
            Ok(())
        } else {
            self.replay_from_origin_unsafe(stream_id, streams, target)
        }
    }

    /// Reset the state and replay the log from the beginning up to
    /// `target`.
    fn replay_from_origin_unsafe(
        &mut self,
        stream_id: StreamId,
        streams: &StreamsView,
        target: i64,
    ) -> Result<()> {
        trace!(%stream_id, to = target, "resetting and replaying from origin");
        self.state = T::new_instance();
        self.version = Address::NEVER_READ;
        if Address::is_address(target) {
            let mut scanner = streams.get(stream_id);
            let slices = scanner.slices_up_to(target)?;
            self.apply_slices_unsafe(stream_id, &slices)?;
        }
        self.version = target.max(Address::NEVER_READ);
        Ok(())
    }

    /// Undo the overlay's applied entries and drop the overlay. Falls back
    /// to reset-and-replay when an applied entry is not undoable.
    pub(crate) fn rollback_optimistic_unsafe(
        &mut self,
        stream_id: StreamId,
        streams: &StreamsView,
    ) -> Result<()> {
        let Some(overlay) = self.optimistic.take() else {
            return Ok(());
        };
        let applied = overlay.entries_applied();
        if applied.is_empty() {
            return Ok(());
        }
        trace!(%stream_id, entries = applied.len(), "rolling back optimistic overlay");
        if applied.iter().all(|e| e.is_undoable()) {
            for entry in applied.iter().rev() {
                self.state.apply_undo(entry)?;
            }
            Ok(())
        } else {
            let target = self.version;
            self.replay_from_origin_unsafe(stream_id, streams, target)
        }
    }

    /// Install `overlay` as the object's optimistic stream, rolling back
    /// any existing overlay first.
    pub(crate) fn set_optimistic_stream_unsafe(
        &mut self,
        stream_id: StreamId,
        streams: &StreamsView,
        overlay: WriteSetSmrStream,
    ) -> Result<()> {
        self.rollback_optimistic_unsafe(stream_id, streams)?;
        self.optimistic = Some(overlay);
        Ok(())
    }

    /// Apply the overlay's unconsumed entries to the state, caching undo
    /// records and upcall results back into the write set so
    /// accessor-mutators can read their own returns.
    pub(crate) fn sync_optimistic_stream_unsafe(&mut self, limit: i64) -> Result<()> {
        let Some(mut overlay) = self.optimistic.take() else {
            return Ok(());
        };
        let state = &mut self.state;
        let result = overlay.apply_remaining(limit, |entry| {
            if entry.undo_record.is_none() {
                entry.undo_record = state.undo_record(entry);
            }
            let upcall = state.apply_update(entry)?;
            entry.upcall_result = Some(upcall);
            Ok(())
        });
        self.optimistic = Some(overlay);
        result
    }

    /// Drop the overlay, keeping its effects in the state (the commit
    /// path: the entries just became committed). Returns the overlay.
    pub(crate) fn optimistic_commit_unsafe(&mut self) -> Option<WriteSetSmrStream> {
        self.optimistic.take()
    }

    /// Position the replica so the next log entry to consume is `addr`.
    pub(crate) fn seek_unsafe(&mut self, addr: i64) {
        self.version = addr - 1;
    }
}
