//! The write set presented as a positioned sub-log
//!
//! A `WriteSetSmrStream` wraps the speculative updates of one stream, for
//! one transaction stack, with a stream API: a position that advances
//! linearly, `current`, `previous` and `remaining_up_to`. It is the
//! *optimistic overlay* installed on a version-locked object while a
//! transaction is in flight.
//!
//! Across nested transactions the view concatenates the per-stream lists
//! of every context on the stack, root first; the position indexes into
//! that concatenation. Neither `append` nor `seek` is supported — the
//! commit path takes a different route entirely.

use crate::context::TransactionalContext;
use crate::registry::TransactionRegistry;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use weft_core::{Address, Result, SmrEntry, StreamId, WeftError};

/// A positioned, replayable view over the write sets of a transaction
/// stack, for one stream.
pub struct WriteSetSmrStream {
    /// The stack this view was installed for, root first.
    contexts: Vec<Arc<TransactionalContext>>,
    stream_id: StreamId,
    /// The thread that installed the view.
    thread_id: ThreadId,
    registry: Arc<TransactionRegistry>,
    /// Index of the last consumed entry in the concatenation
    /// (`Address::NEVER_READ` before the first).
    pointer: i64,
}

impl WriteSetSmrStream {
    /// Build a view over `contexts` (the thread's stack at install time)
    /// for `stream_id`.
    pub fn new(
        contexts: Vec<Arc<TransactionalContext>>,
        stream_id: StreamId,
        registry: Arc<TransactionRegistry>,
    ) -> Self {
        WriteSetSmrStream {
            contexts,
            stream_id,
            thread_id: thread::current().id(),
            registry,
            pointer: Address::NEVER_READ,
        }
    }

    /// The stream this view covers.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Total number of buffered entries across the stack.
    pub fn len(&self) -> usize {
        self.contexts
            .iter()
            .map(|c| c.write_set().lock().num_updates(self.stream_id))
            .sum()
    }

    /// True if no context on the stack buffered an entry for this stream.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if the view's backing write set is the write set of the
    /// thread's *current* context — i.e. the overlay belongs to the
    /// innermost transaction running right now.
    pub fn is_stream_current_context_thread_current_context(&self) -> bool {
        if thread::current().id() != self.thread_id {
            return false;
        }
        match (self.contexts.last(), self.registry.current()) {
            (Some(mine), Some(current)) => Arc::ptr_eq(mine, &current),
            _ => false,
        }
    }

    /// True if the view belongs to the thread's active transaction stack —
    /// i.e. its root context is the thread's root. Distinct from the
    /// current-context predicate: this stays true inside any nesting depth
    /// of the same transaction.
    pub fn is_stream_for_this_thread(&self) -> bool {
        if thread::current().id() != self.thread_id {
            return false;
        }
        match (self.contexts.first(), self.registry.root()) {
            (Some(mine), Some(root)) => Arc::ptr_eq(mine, &root),
            _ => false,
        }
    }

    /// Locate global index `idx` in the concatenation.
    fn locate(&self, idx: usize) -> Option<(usize, usize)> {
        let mut remaining = idx;
        for (ci, ctx) in self.contexts.iter().enumerate() {
            let n = ctx.write_set().lock().num_updates(self.stream_id);
            if remaining < n {
                return Some((ci, remaining));
            }
            remaining -= n;
        }
        None
    }

    fn entry_at(&self, idx: usize) -> Option<SmrEntry> {
        let (ci, li) = self.locate(idx)?;
        self.contexts[ci].write_set().lock().entry_at(self.stream_id, li)
    }

    /// The entry at the current position, if positioned on one.
    pub fn current(&self) -> Option<SmrEntry> {
        if Address::non_address(self.pointer) {
            return None;
        }
        self.entry_at(self.pointer as usize)
    }

    /// Step the position back one entry and return the new current entry.
    ///
    /// # Errors
    ///
    /// Rewinding past the beginning is an invariant violation.
    pub fn previous(&mut self) -> Result<Option<SmrEntry>> {
        if Address::non_address(self.pointer) {
            return Err(WeftError::internal(
                "attempt to rewind write-set stream past its beginning",
            ));
        }
        self.pointer -= 1;
        Ok(self.current())
    }

    /// Consume and return the entries between the position and
    /// `limit` (inclusive index bound), advancing the position.
    pub fn remaining_up_to(&mut self, limit: i64) -> Vec<SmrEntry> {
        if Address::non_address(limit) {
            return Vec::new();
        }
        let upper = limit.min(self.len() as i64 - 1);
        let mut out = Vec::new();
        let mut idx = self.pointer + 1;
        while idx <= upper {
            if let Some(e) = self.entry_at(idx as usize) {
                out.push(e);
            }
            self.pointer = idx;
            idx += 1;
        }
        out
    }

    /// The current position (`Address::NEVER_READ` before the first
    /// entry).
    pub fn pos(&self) -> i64 {
        self.pointer
    }

    /// Rewind to before the first entry.
    pub fn reset(&mut self) {
        self.pointer = Address::NEVER_READ;
    }

    /// Clones of the entries already consumed (positions `0..=pos`), in
    /// order. Used to roll the overlay back.
    pub(crate) fn entries_applied(&self) -> Vec<SmrEntry> {
        if Address::non_address(self.pointer) {
            return Vec::new();
        }
        (0..=self.pointer as usize)
            .filter_map(|i| self.entry_at(i))
            .collect()
    }

    /// Clones of every entry in the concatenation, in order.
    pub(crate) fn entries_all(&self) -> Vec<SmrEntry> {
        (0..self.len()).filter_map(|i| self.entry_at(i)).collect()
    }

    /// Apply each unconsumed entry up to `limit` through `f`, advancing
    /// the position. `f` receives the buffered entry mutably so it can
    /// fill in undo records and upcall results in place.
    pub(crate) fn apply_remaining(
        &mut self,
        limit: i64,
        mut f: impl FnMut(&mut SmrEntry) -> Result<()>,
    ) -> Result<()> {
        let upper = limit.min(self.len() as i64 - 1);
        let mut idx = self.pointer + 1;
        while idx <= upper {
            let (ci, li) = self.locate(idx as usize).ok_or_else(|| {
                WeftError::internal("write-set stream position out of bounds")
            })?;
            {
                let mut ws = self.contexts[ci].write_set().lock();
                let entry = ws.entry_mut(self.stream_id, li).ok_or_else(|| {
                    WeftError::internal("write-set entry vanished during overlay sync")
                })?;
                f(entry)?;
            }
            self.pointer = idx;
            idx += 1;
        }
        Ok(())
    }
}

impl std::fmt::Debug for WriteSetSmrStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteSetSmrStream")
            .field("stream", &self.stream_id)
            .field("pos", &self.pointer)
            .field("contexts", &self.contexts.len())
            .finish()
    }
}
