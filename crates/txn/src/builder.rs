//! Transaction entry API
//!
//! `TxBuilder` configures and begins one transaction:
//!
//! ```ignore
//! let ctx = runtime
//!     .tx_build()
//!     .tx_type(TxType::WriteAfterWrite)
//!     .snapshot(42)
//!     .begin()?;
//! ```
//!
//! `begin` pushes the context on the calling thread's stack; the runtime's
//! `tx_end`/`tx_abort` commit or discard the current context and pop it.

use crate::context::{TransactionalContext, TxType};
use crate::registry::TransactionRegistry;
use std::sync::Arc;
use weft_core::Result;
use weft_log::StreamsView;

/// Fluent configuration for one transaction.
pub struct TxBuilder {
    tx_type: TxType,
    snapshot: Option<i64>,
    precise_conflicts: bool,
    transaction_logging: bool,
    streams: Arc<StreamsView>,
    registry: Arc<TransactionRegistry>,
}

impl TxBuilder {
    /// A builder with the runtime's defaults (OPTIMISTIC flavor).
    pub fn new(
        streams: Arc<StreamsView>,
        registry: Arc<TransactionRegistry>,
        precise_conflicts: bool,
        transaction_logging: bool,
    ) -> Self {
        TxBuilder {
            tx_type: TxType::Optimistic,
            snapshot: None,
            precise_conflicts,
            transaction_logging,
            streams,
            registry,
        }
    }

    /// Select the transaction flavor.
    pub fn tx_type(mut self, tx_type: TxType) -> Self {
        self.tx_type = tx_type;
        self
    }

    /// Pin the snapshot instead of fetching it at first read.
    pub fn snapshot(mut self, snapshot: i64) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Enable or disable precise conflict resolution for this transaction.
    pub fn precise_conflicts(mut self, enabled: bool) -> Self {
        self.precise_conflicts = enabled;
        self
    }

    /// Create the context and push it on the calling thread's stack.
    ///
    /// # Errors
    ///
    /// `WeftError::NestedTypeMismatch` when nesting under a root of a
    /// different flavor; sequencer failures if the flavor fixes its
    /// snapshot eagerly.
    pub fn begin(self) -> Result<Arc<TransactionalContext>> {
        let ctx = TransactionalContext::new(
            self.tx_type,
            self.snapshot,
            self.precise_conflicts,
            self.transaction_logging,
            Arc::clone(&self.streams),
            Arc::clone(&self.registry),
        );
        self.registry.push(Arc::clone(&ctx))?;
        // write-after-write fixes its snapshot at begin, not first read
        if self.tx_type == TxType::WriteAfterWrite {
            if let Err(e) = ctx.snapshot_timestamp() {
                self.registry.pop();
                return Err(e);
            }
        }
        Ok(ctx)
    }
}
