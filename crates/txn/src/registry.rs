//! Per-thread transaction stacks
//!
//! Every thread runs at most one transaction at a time, possibly nested.
//! The registry keeps, per thread, the stack of active contexts: the top
//! is the *current* context, the bottom the *root*. There is no hidden
//! global state — the registry is an explicit value owned by the runtime.

use crate::context::TransactionalContext;
use dashmap::DashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use weft_core::{Result, WeftError};

/// Process-wide mapping from thread to its stack of active contexts.
#[derive(Default)]
pub struct TransactionRegistry {
    stacks: DashMap<ThreadId, Vec<Arc<TransactionalContext>>>,
}

impl TransactionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The calling thread's current (innermost) context.
    pub fn current(&self) -> Option<Arc<TransactionalContext>> {
        self.stacks
            .get(&thread::current().id())
            .and_then(|s| s.last().cloned())
    }

    /// The calling thread's root (outermost) context.
    pub fn root(&self) -> Option<Arc<TransactionalContext>> {
        self.stacks
            .get(&thread::current().id())
            .and_then(|s| s.first().cloned())
    }

    /// Clone of the calling thread's whole stack, root first.
    pub fn stack(&self) -> Vec<Arc<TransactionalContext>> {
        self.stacks
            .get(&thread::current().id())
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Number of active contexts on the calling thread.
    pub fn depth(&self) -> usize {
        self.stacks
            .get(&thread::current().id())
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Push a context, making it current.
    ///
    /// # Errors
    ///
    /// `WeftError::NestedTypeMismatch` if a root of another flavor is
    /// already active on this thread.
    pub fn push(&self, ctx: Arc<TransactionalContext>) -> Result<()> {
        let mut stack = self.stacks.entry(thread::current().id()).or_default();
        if let Some(root) = stack.first() {
            if root.tx_type() != ctx.tx_type() {
                return Err(WeftError::NestedTypeMismatch {
                    root: root.tx_type().name(),
                    child: ctx.tx_type().name(),
                });
            }
        }
        stack.push(ctx);
        Ok(())
    }

    /// Pop the calling thread's current context.
    pub fn pop(&self) -> Option<Arc<TransactionalContext>> {
        let tid = thread::current().id();
        let popped = self.stacks.get_mut(&tid).and_then(|mut s| s.pop());
        // drop empty stacks so the map does not grow with thread churn
        if let Some(stack) = self.stacks.get(&tid) {
            if stack.is_empty() {
                drop(stack);
                self.stacks.remove_if(&tid, |_, s| s.is_empty());
            }
        }
        popped
    }

    /// The context directly below `ctx` on the calling thread's stack,
    /// if `ctx` is nested.
    pub fn parent_of(&self, ctx: &TransactionalContext) -> Option<Arc<TransactionalContext>> {
        let stack = self.stacks.get(&thread::current().id())?;
        let pos = stack.iter().position(|c| c.tx_id() == ctx.tx_id())?;
        if pos == 0 {
            None
        } else {
            Some(Arc::clone(&stack[pos - 1]))
        }
    }
}
