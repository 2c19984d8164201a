//! In-process log unit
//!
//! A write-once address space. Each address is written at most once;
//! issued-but-unwritten addresses read as holes, and an address can be
//! permanently filled as a hole to fence out a slow writer. A prefix of
//! the log can be trimmed away; reads and writes below the trim mark fail
//! with `WeftError::Trimmed`.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use weft_core::{
    AddressSpace, LogData, LogDataType, MultiObjectSmrEntry, Result, StreamId, WeftError,
};
use std::sync::Arc;

struct LogUnitInner {
    entries: BTreeMap<i64, LogData>,
    /// Lowest readable address. Everything below has been reclaimed.
    trim_mark: i64,
}

/// A single-process log unit implementing `AddressSpace`.
pub struct InMemoryAddressSpace {
    inner: RwLock<LogUnitInner>,
}

impl InMemoryAddressSpace {
    /// Create an empty log unit.
    pub fn new() -> Self {
        InMemoryAddressSpace {
            inner: RwLock::new(LogUnitInner {
                entries: BTreeMap::new(),
                trim_mark: 0,
            }),
        }
    }
}

impl Default for InMemoryAddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace for InMemoryAddressSpace {
    fn read(&self, addr: i64) -> Result<LogData> {
        let inner = self.inner.read();
        if addr < inner.trim_mark {
            return Err(WeftError::Trimmed(addr));
        }
        Ok(inner
            .entries
            .get(&addr)
            .cloned()
            .unwrap_or_else(|| LogData::hole(addr)))
    }

    fn append(
        &self,
        addr: i64,
        streams: &BTreeSet<StreamId>,
        payload: MultiObjectSmrEntry,
        backpointers: &BTreeMap<StreamId, i64>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        if addr < inner.trim_mark {
            return Err(WeftError::Trimmed(addr));
        }
        if inner.entries.contains_key(&addr) {
            return Err(WeftError::Overwrite(addr));
        }
        inner.entries.insert(
            addr,
            LogData {
                addr,
                kind: LogDataType::Data,
                payload: Some(Arc::new(RwLock::new(payload))),
                streams: streams.clone(),
                backpointers: backpointers.clone(),
            },
        );
        Ok(())
    }

    fn fill_hole(&self, addr: i64) -> Result<()> {
        let mut inner = self.inner.write();
        if addr < inner.trim_mark {
            return Err(WeftError::Trimmed(addr));
        }
        match inner.entries.get(&addr) {
            Some(existing) if existing.kind == LogDataType::Data => {
                Err(WeftError::Overwrite(addr))
            }
            // Filling an already-filled hole is a no-op.
            Some(_) => Ok(()),
            None => {
                inner.entries.insert(addr, LogData::hole(addr));
                Ok(())
            }
        }
    }

    fn trim(&self, addr: i64) -> Result<()> {
        let mut inner = self.inner.write();
        let new_mark = addr + 1;
        if new_mark <= inner.trim_mark {
            return Ok(());
        }
        inner.trim_mark = new_mark;
        inner.entries = inner.entries.split_off(&new_mark);
        debug!(trim_mark = new_mark, "log prefix trimmed");
        Ok(())
    }

    fn trim_mark(&self) -> i64 {
        self.inner.read().trim_mark
    }
}
