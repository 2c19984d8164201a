//! Replicated collections
//!
//! `SmrMap` is an ordered map replicated through the shared log. Mutators
//! are recorded as SMR entries (`put`, `remove`, `clear`); accessors read
//! the materialized replica. Inside a transaction both route through the
//! thread's transactional context; outside, reads sync to the log tail
//! and mutations append directly.
//!
//! Conflict granularity is per key: `put`/`remove`/`get` conflict only on
//! their key, `clear` and `size` conflict with any update on the stream.

use crate::runtime::WeftRuntime;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use weft_core::{Result, SmrEntry, StreamId, Value, WeftError};
use weft_txn::{ConflictParams, SmrObject, SmrProxy};

/// Undo records encode the displaced value (or its absence) so a
/// mutation can be inverted exactly.
fn encode_prior(prior: Option<&Value>) -> Value {
    let bytes = serde_json::to_vec(&prior).expect("Value serialization is infallible");
    Value::Bytes(bytes)
}

fn decode_prior(record: &Value) -> Result<Option<Value>> {
    match record {
        Value::Bytes(bytes) => serde_json::from_slice(bytes)
            .map_err(|e| WeftError::Serialization(format!("bad undo record: {}", e))),
        other => Err(WeftError::Serialization(format!(
            "undo record must be bytes, got {}",
            other
        ))),
    }
}

/// The materialized state of a replicated map.
#[derive(Debug, Default)]
pub struct MapState {
    entries: BTreeMap<Value, Value>,
}

impl MapState {
    /// Read a key.
    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn key_of(entry: &SmrEntry) -> Result<&Value> {
        entry
            .args
            .first()
            .ok_or_else(|| WeftError::internal("map entry missing key argument"))
    }
}

impl SmrObject for MapState {
    fn new_instance() -> Self {
        MapState::default()
    }

    fn apply_update(&mut self, entry: &SmrEntry) -> Result<Value> {
        match entry.method.as_str() {
            "put" => {
                let key = Self::key_of(entry)?.clone();
                let value = entry
                    .args
                    .get(1)
                    .ok_or_else(|| WeftError::internal("put missing value argument"))?
                    .clone();
                let prior = self.entries.insert(key, value);
                Ok(prior.unwrap_or(Value::Null))
            }
            "remove" => {
                let key = Self::key_of(entry)?;
                let prior = self.entries.remove(key);
                Ok(prior.unwrap_or(Value::Null))
            }
            "clear" => {
                self.entries.clear();
                Ok(Value::Null)
            }
            other => Err(WeftError::internal(format!(
                "unknown map mutation {:?}",
                other
            ))),
        }
    }

    fn apply_undo(&mut self, entry: &SmrEntry) -> Result<()> {
        let record = entry
            .undo_record
            .as_ref()
            .ok_or_else(|| WeftError::internal("undo of a non-undoable map entry"))?;
        match entry.method.as_str() {
            "put" | "remove" => {
                let key = Self::key_of(entry)?.clone();
                match decode_prior(record)? {
                    Some(prior) => self.entries.insert(key, prior),
                    None => self.entries.remove(&key),
                };
                Ok(())
            }
            other => Err(WeftError::internal(format!(
                "unknown map mutation {:?} in undo",
                other
            ))),
        }
    }

    fn undo_record(&self, entry: &SmrEntry) -> Option<Value> {
        match entry.method.as_str() {
            "put" | "remove" => {
                let key = entry.args.first()?;
                Some(encode_prior(self.entries.get(key)))
            }
            // clearing forgets the whole map; rollback is a full replay
            _ => None,
        }
    }

    fn conflict_from_entry(method: &str, args: &[Value]) -> ConflictParams {
        match (method, args.first()) {
            ("put" | "remove", Some(key)) => ConflictParams::Fine(vec![key.clone()]),
            _ => ConflictParams::All,
        }
    }
}

/// The cell a deferred read delivers its observation into.
///
/// The accessor runs once at registration (against the unsynced replica)
/// and once more at commit time against the commit snapshot; the cell
/// always holds the latest observation.
#[derive(Clone)]
pub struct DeferredValue {
    cell: Arc<Mutex<Option<Value>>>,
}

impl DeferredValue {
    fn new() -> Self {
        DeferredValue {
            cell: Arc::new(Mutex::new(None)),
        }
    }

    /// The observed value (`None` when the key was absent).
    pub fn value(&self) -> Option<Value> {
        self.cell.lock().clone()
    }
}

/// A map replicated over one stream.
#[derive(Clone)]
pub struct SmrMap {
    proxy: Arc<SmrProxy<MapState>>,
}

impl SmrMap {
    /// Open the map on `stream`, materializing the replica on first use.
    ///
    /// # Errors
    ///
    /// Fails if the stream is bound to a different object type.
    pub fn open(runtime: &WeftRuntime, stream: StreamId) -> Result<Self> {
        Ok(SmrMap {
            proxy: runtime.proxy_for::<MapState>(stream)?,
        })
    }

    /// The stream backing this map.
    pub fn stream_id(&self) -> StreamId {
        self.proxy.stream_id()
    }

    /// Read `key`, conflicting only on it.
    pub fn get(&self, key: &Value) -> Result<Option<Value>> {
        let wanted = key.clone();
        self.proxy.access(
            ConflictParams::Fine(vec![key.clone()]),
            move |state| state.get(&wanted).cloned(),
        )
    }

    /// True if `key` is present.
    pub fn contains_key(&self, key: &Value) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Number of entries. Conflicts with any update on the stream.
    pub fn size(&self) -> Result<usize> {
        self.proxy.access(ConflictParams::All, |state| state.len())
    }

    /// Map `key` to `value`, returning the displaced value.
    pub fn put(&self, key: Value, value: Value) -> Result<Option<Value>> {
        let params = ConflictParams::Fine(vec![key.clone()]);
        let prior = self
            .proxy
            .mutate_with_result("put", vec![key, value], params)?;
        Ok(match prior {
            Value::Null => None,
            v => Some(v),
        })
    }

    /// Remove `key`, returning the removed value.
    pub fn remove(&self, key: Value) -> Result<Option<Value>> {
        let params = ConflictParams::Fine(vec![key.clone()]);
        let prior = self.proxy.mutate_with_result("remove", vec![key], params)?;
        Ok(match prior {
            Value::Null => None,
            v => Some(v),
        })
    }

    /// Drop every entry. Not undoable: rolling this back replays the
    /// object from the log origin.
    pub fn clear(&self) -> Result<()> {
        self.proxy
            .mutate("clear", Vec::new(), ConflictParams::All)
            .map(|_| ())
    }

    /// Register a deferred read of `key`.
    ///
    /// Inside a DEFERRED transaction the read executes at commit time
    /// against the commit snapshot and the result lands in the returned
    /// cell. Under any other flavor the read executes immediately.
    pub fn deferred_get(&self, key: Value) -> Result<DeferredValue> {
        let result = DeferredValue::new();
        let cell = Arc::clone(&result.cell);
        let params = ConflictParams::Fine(vec![key.clone()]);
        self.proxy.access_deferred(
            params,
            Arc::new(move |state: &MapState| {
                *cell.lock() = state.get(&key).cloned();
            }),
        )?;
        Ok(result)
    }
}
