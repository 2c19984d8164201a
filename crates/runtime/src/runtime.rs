//! The runtime
//!
//! One `WeftRuntime` per client process: it owns the service handles, the
//! object registry (exactly one replica per stream per runtime) and the
//! per-thread transaction registry, and exposes the transaction entry
//! API.

use crate::config::RuntimeConfig;
use dashmap::DashMap;
use std::any::Any;
use std::sync::Arc;
use tracing::debug;
use weft_core::{AddressSpace, Result, SequencerService, StreamId, WeftError};
use weft_log::{InMemoryAddressSpace, InMemorySequencer, StreamsView};
use weft_txn::{SmrObject, SmrProxy, TransactionRegistry, TransactionalContext, TxBuilder};

/// A connected client runtime.
pub struct WeftRuntime {
    config: RuntimeConfig,
    streams: Arc<StreamsView>,
    address_space: Arc<dyn AddressSpace>,
    registry: Arc<TransactionRegistry>,
    objects: DashMap<StreamId, Arc<dyn Any + Send + Sync>>,
}

impl WeftRuntime {
    /// A runtime backed by in-process services. Every runtime built over
    /// the same service handles shares one log; a runtime built with this
    /// constructor has its own.
    pub fn in_process(config: RuntimeConfig) -> Arc<Self> {
        Self::with_services(
            config,
            Arc::new(InMemorySequencer::new()),
            Arc::new(InMemoryAddressSpace::new()),
        )
    }

    /// A runtime over externally supplied services. Two runtimes sharing
    /// the same sequencer and address space behave as two clients of one
    /// shared log.
    pub fn with_services(
        config: RuntimeConfig,
        sequencer: Arc<dyn SequencerService>,
        address_space: Arc<dyn AddressSpace>,
    ) -> Arc<Self> {
        let streams = Arc::new(StreamsView::new(sequencer, Arc::clone(&address_space)));
        Arc::new(WeftRuntime {
            config,
            streams,
            address_space,
            registry: Arc::new(TransactionRegistry::new()),
            objects: DashMap::new(),
        })
    }

    /// This runtime's configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The client-side log view.
    pub fn streams_view(&self) -> &Arc<StreamsView> {
        &self.streams
    }

    /// The log unit handle (trim control, direct reads).
    pub fn address_space(&self) -> &Arc<dyn AddressSpace> {
        &self.address_space
    }

    /// The per-thread transaction registry.
    pub fn registry(&self) -> &Arc<TransactionRegistry> {
        &self.registry
    }

    /// The proxy materializing `stream` as an object of type `T`.
    ///
    /// One replica exists per stream per runtime; repeated calls return
    /// the same proxy.
    ///
    /// # Errors
    ///
    /// `WeftError::Internal` if the stream is already bound to a
    /// different object type.
    pub fn proxy_for<T: SmrObject>(&self, stream: StreamId) -> Result<Arc<SmrProxy<T>>> {
        let entry = self
            .objects
            .entry(stream)
            .or_insert_with(|| {
                debug!(%stream, "materializing replica");
                let proxy: Arc<SmrProxy<T>> =
                    SmrProxy::new(stream, Arc::clone(&self.streams), Arc::clone(&self.registry));
                proxy as Arc<dyn Any + Send + Sync>
            })
            .value()
            .clone();
        entry.downcast::<SmrProxy<T>>().map_err(|_| {
            WeftError::internal(format!(
                "stream {} is already bound to a different object type",
                stream
            ))
        })
    }

    // ------------------------------------------------------------------
    // transaction entry points
    // ------------------------------------------------------------------

    /// A builder for one transaction, seeded with this runtime's
    /// defaults.
    pub fn tx_build(&self) -> TxBuilder {
        TxBuilder::new(
            Arc::clone(&self.streams),
            Arc::clone(&self.registry),
            self.config.precise_conflicts,
            self.config.transaction_logging,
        )
    }

    /// Begin an OPTIMISTIC transaction on the calling thread.
    pub fn tx_begin(&self) -> Result<Arc<TransactionalContext>> {
        self.tx_build().begin()
    }

    /// Commit the calling thread's current transaction and pop it.
    ///
    /// Returns the commit address; `Address::NOWRITE` for a read-only
    /// transaction, `Address::FOLDED` for a nested one.
    ///
    /// # Errors
    ///
    /// `WeftError::NoTransaction` if no transaction is active;
    /// `WeftError::TransactionAborted` if the commit was rejected. The
    /// context is released and popped on every path.
    pub fn tx_end(&self) -> Result<i64> {
        let ctx = self.registry.current().ok_or(WeftError::NoTransaction)?;
        let result = ctx.commit();
        if result.is_err() {
            ctx.abort_cleanup();
        }
        self.registry.pop();
        result
    }

    /// Discard the calling thread's current transaction: roll back its
    /// overlays, clear its buffers and pop it.
    ///
    /// # Errors
    ///
    /// `WeftError::NoTransaction` if no transaction is active.
    pub fn tx_abort(&self) -> Result<()> {
        let ctx = self.registry.current().ok_or(WeftError::NoTransaction)?;
        ctx.abort_cleanup();
        self.registry.pop();
        Ok(())
    }

    /// True if the calling thread has an active transaction.
    pub fn tx_active(&self) -> bool {
        self.registry.current().is_some()
    }
}
