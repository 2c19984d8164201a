//! End-to-end transaction tests against in-process services.
//!
//! Each test drives the public runtime API: open a replicated map, run
//! transactions, and check the committed log and replica states. Tests
//! that need a concurrent writer use a second runtime sharing the same
//! sequencer and address space — two clients of one shared log.

use std::sync::Arc;
use weft_core::{
    AbortCause, Address, AddressSpace, SequencerService, Value, WeftError, TRANSACTION_STREAM_ID,
};
use weft_log::{InMemoryAddressSpace, InMemorySequencer};
use weft_runtime::{RuntimeConfig, SmrMap, WeftRuntime};
use weft_txn::TxType;
use weft_core::StreamId;

fn k(s: &str) -> Value {
    Value::from(s)
}

fn shared_services() -> (Arc<dyn SequencerService>, Arc<dyn AddressSpace>) {
    (
        Arc::new(InMemorySequencer::new()),
        Arc::new(InMemoryAddressSpace::new()),
    )
}

/// Two runtimes over one shared log.
fn two_clients(config: RuntimeConfig) -> (Arc<WeftRuntime>, Arc<WeftRuntime>) {
    let (seq, log) = shared_services();
    (
        WeftRuntime::with_services(config.clone(), Arc::clone(&seq), Arc::clone(&log)),
        WeftRuntime::with_services(config, seq, log),
    )
}

fn expect_abort(err: WeftError) -> weft_core::TransactionAbortedError {
    match err {
        WeftError::TransactionAborted(ae) => ae,
        other => panic!("expected a transaction abort, got {:?}", other),
    }
}

// ----------------------------------------------------------------------
// scenarios
// ----------------------------------------------------------------------

#[test]
fn test_single_client_counter() {
    let runtime = WeftRuntime::in_process(RuntimeConfig::default());
    let map = SmrMap::open(&runtime, StreamId::from_name("A")).unwrap();

    runtime.tx_begin().unwrap();
    assert_eq!(map.get(&k("k")).unwrap(), None);
    map.put(k("k"), Value::Int(1)).unwrap();
    let c1 = runtime.tx_end().unwrap();

    runtime.tx_begin().unwrap();
    assert_eq!(map.get(&k("k")).unwrap(), Some(Value::Int(1)));
    map.put(k("k"), Value::Int(2)).unwrap();
    let c2 = runtime.tx_end().unwrap();

    assert!(c1 < c2, "commits must be totally ordered");
    assert_eq!(map.get(&k("k")).unwrap(), Some(Value::Int(2)));
}

#[test]
fn test_write_write_conflict_first_committer_wins() {
    let runtime = WeftRuntime::in_process(RuntimeConfig::default());
    let stream = StreamId::from_name("A");
    let map = SmrMap::open(&runtime, stream).unwrap();

    map.put(k("k"), Value::Int(0)).unwrap();
    let snapshot = runtime.streams_view().current_tail().unwrap();

    // TX-A: read-then-write at the pinned snapshot, commits first.
    runtime.tx_build().snapshot(snapshot).begin().unwrap();
    assert_eq!(map.get(&k("k")).unwrap(), Some(Value::Int(0)));
    map.put(k("k"), Value::Int(1)).unwrap();
    let c_a = runtime.tx_end().unwrap();

    // TX-B: same snapshot, same key; must lose.
    runtime.tx_build().snapshot(snapshot).begin().unwrap();
    assert_eq!(
        map.get(&k("k")).unwrap(),
        Some(Value::Int(0)),
        "opacity: reads at the snapshot must not see TX-A"
    );
    map.put(k("k"), Value::Int(2)).unwrap();
    let abort = expect_abort(runtime.tx_end().unwrap_err());
    assert_eq!(abort.cause, AbortCause::Conflict);
    assert_eq!(abort.conflict_stream, Some(stream));
    assert_eq!(abort.conflict_address, Some(c_a));

    assert_eq!(map.get(&k("k")).unwrap(), Some(Value::Int(1)));
}

#[test]
fn test_false_conflict_aborts_without_precise_resolution() {
    let (client1, client2) = two_clients(RuntimeConfig::default());
    let stream = StreamId::from_name("A");
    let map1 = SmrMap::open(&client1, stream).unwrap();
    let map2 = SmrMap::open(&client2, stream).unwrap();

    client1.tx_begin().unwrap();
    assert_eq!(map1.get(&k("k1")).unwrap(), None); // fixes the snapshot

    // a direct append carries no fingerprints, so it flags every reader
    // of the stream
    let c_other = {
        map2.put(k("k2"), Value::Int(7)).unwrap();
        client2.streams_view().current_tail().unwrap()
    };

    map1.put(k("k1"), Value::Int(1)).unwrap();
    let abort = expect_abort(client1.tx_end().unwrap_err());
    assert_eq!(abort.cause, AbortCause::Conflict);
    assert_eq!(abort.conflict_address, Some(c_other));
    assert!(!abort.precise);
}

#[test]
fn test_false_conflict_resolved_by_precise_scan() {
    let (client1, client2) = two_clients(RuntimeConfig::default().with_precise_conflicts(true));
    let stream = StreamId::from_name("A");
    let map1 = SmrMap::open(&client1, stream).unwrap();
    let map2 = SmrMap::open(&client2, stream).unwrap();

    client1.tx_begin().unwrap();
    assert_eq!(map1.get(&k("k1")).unwrap(), None);

    let c_other = {
        map2.put(k("k2"), Value::Int(7)).unwrap();
        client2.streams_view().current_tail().unwrap()
    };

    map1.put(k("k1"), Value::Int(1)).unwrap();
    // the scan finds only the k2 update: a false conflict, so the commit
    // retries with the range verified and succeeds
    let address = client1.tx_end().unwrap();
    assert!(address > c_other);

    assert_eq!(map1.get(&k("k1")).unwrap(), Some(Value::Int(1)));
    assert_eq!(map1.get(&k("k2")).unwrap(), Some(Value::Int(7)));
}

#[test]
fn test_true_conflict_survives_precise_scan() {
    let (client1, client2) = two_clients(RuntimeConfig::default().with_precise_conflicts(true));
    let stream = StreamId::from_name("A");
    let map1 = SmrMap::open(&client1, stream).unwrap();
    let map2 = SmrMap::open(&client2, stream).unwrap();

    client1.tx_begin().unwrap();
    assert_eq!(map1.get(&k("k1")).unwrap(), None);

    // the same key this time: a real overlap
    map2.put(k("k1"), Value::Int(7)).unwrap();

    map1.put(k("k1"), Value::Int(1)).unwrap();
    let abort = expect_abort(client1.tx_end().unwrap_err());
    assert_eq!(abort.cause, AbortCause::PreciseConflict);
    assert!(abort.precise);
}

#[test]
fn test_nested_fold() {
    let runtime = WeftRuntime::in_process(RuntimeConfig::default());
    let stream = StreamId::from_name("A");
    let map = SmrMap::open(&runtime, stream).unwrap();

    runtime.tx_begin().unwrap();
    map.put(k("x"), Value::Int(1)).unwrap();

    runtime.tx_begin().unwrap(); // nested
    map.put(k("y"), Value::Int(1)).unwrap();
    assert_eq!(runtime.tx_end().unwrap(), Address::FOLDED);

    let address = runtime.tx_end().unwrap();
    assert!(address >= 0);

    // one log entry carrying both updates, parent's first
    let data = runtime.streams_view().read(address).unwrap();
    let payload = data.payload.expect("committed entry has a payload");
    let guard = payload.read();
    let updates = guard.updates(stream);
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].args[0], k("x"));
    assert_eq!(updates[1].args[0], k("y"));

    assert_eq!(map.get(&k("x")).unwrap(), Some(Value::Int(1)));
    assert_eq!(map.get(&k("y")).unwrap(), Some(Value::Int(1)));
}

#[test]
fn test_nested_abort_discards_only_child_writes() {
    let runtime = WeftRuntime::in_process(RuntimeConfig::default());
    let map = SmrMap::open(&runtime, StreamId::from_name("A")).unwrap();

    runtime.tx_begin().unwrap();
    map.put(k("x"), Value::Int(1)).unwrap();

    runtime.tx_begin().unwrap();
    map.put(k("y"), Value::Int(1)).unwrap();
    runtime.tx_abort().unwrap();

    let address = runtime.tx_end().unwrap();
    assert!(address >= 0);
    assert_eq!(map.get(&k("x")).unwrap(), Some(Value::Int(1)));
    assert_eq!(map.get(&k("y")).unwrap(), None);
}

#[test]
fn test_read_only_commit_touches_no_log() {
    let runtime = WeftRuntime::in_process(RuntimeConfig::default());
    let map = SmrMap::open(&runtime, StreamId::from_name("A")).unwrap();
    map.put(k("k"), Value::Int(1)).unwrap();
    let tail_before = runtime.streams_view().current_tail().unwrap();

    runtime.tx_begin().unwrap();
    assert_eq!(map.get(&k("k")).unwrap(), Some(Value::Int(1)));
    assert_eq!(map.size().unwrap(), 1);
    assert_eq!(runtime.tx_end().unwrap(), Address::NOWRITE);

    assert_eq!(
        runtime.streams_view().current_tail().unwrap(),
        tail_before,
        "a read-only commit must not append"
    );
}

#[test]
fn test_deferred_read_observes_commit_time_snapshot() {
    let (client1, client2) = two_clients(RuntimeConfig::default());
    let stream_a = StreamId::from_name("A");
    let stream_b = StreamId::from_name("B");
    let map_a1 = SmrMap::open(&client1, stream_a).unwrap();
    let map_a2 = SmrMap::open(&client2, stream_a).unwrap();
    let map_b1 = SmrMap::open(&client1, stream_b).unwrap();

    let ctx = client1
        .tx_build()
        .tx_type(TxType::Deferred)
        .begin()
        .unwrap();
    let deferred = map_a1.deferred_get(k("k")).unwrap();
    map_b1.put(k("k'"), Value::Int(1)).unwrap();
    assert_eq!(deferred.value(), None, "nothing observed before commit");

    // a concurrent client commits k=42 before our commit
    map_a2.put(k("k"), Value::Int(42)).unwrap();

    let address = client1.tx_end().unwrap();
    assert!(address >= 0);

    // the closure ran at commit time against the fresh snapshot
    assert_eq!(deferred.value(), Some(Value::Int(42)));

    // deferred snapshot is the address directly below the token
    assert_eq!(ctx.snapshot(), Some(address - 1));
    assert_eq!(ctx.commit_address(), address);

    // the committed entry affects both streams
    let data = client1.streams_view().read(address).unwrap();
    assert!(data.streams.contains(&stream_a));
    assert!(data.streams.contains(&stream_b));
}

// ----------------------------------------------------------------------
// isolation and lifecycle
// ----------------------------------------------------------------------

#[test]
fn test_read_your_own_writes() {
    let runtime = WeftRuntime::in_process(RuntimeConfig::default());
    let map = SmrMap::open(&runtime, StreamId::from_name("A")).unwrap();

    runtime.tx_begin().unwrap();
    map.put(k("k"), Value::Int(5)).unwrap();
    assert_eq!(map.get(&k("k")).unwrap(), Some(Value::Int(5)));
    map.put(k("k"), Value::Int(6)).unwrap();
    assert_eq!(map.get(&k("k")).unwrap(), Some(Value::Int(6)));
    runtime.tx_end().unwrap();
}

#[test]
fn test_upcall_results_inside_transaction() {
    let runtime = WeftRuntime::in_process(RuntimeConfig::default());
    let map = SmrMap::open(&runtime, StreamId::from_name("A")).unwrap();

    runtime.tx_begin().unwrap();
    assert_eq!(map.put(k("k"), Value::Int(1)).unwrap(), None);
    // the second put's upcall observes the first speculative write
    assert_eq!(map.put(k("k"), Value::Int(2)).unwrap(), Some(Value::Int(1)));
    assert_eq!(map.remove(k("k")).unwrap(), Some(Value::Int(2)));
    runtime.tx_end().unwrap();

    assert_eq!(map.get(&k("k")).unwrap(), None);
}

#[test]
fn test_opacity_second_read_ignores_concurrent_commit() {
    let (client1, client2) = two_clients(RuntimeConfig::default());
    let stream = StreamId::from_name("A");
    let map1 = SmrMap::open(&client1, stream).unwrap();
    let map2 = SmrMap::open(&client2, stream).unwrap();

    map1.put(k("k"), Value::Int(1)).unwrap();

    client1.tx_begin().unwrap();
    assert_eq!(map1.get(&k("k")).unwrap(), Some(Value::Int(1)));

    map2.put(k("k"), Value::Int(99)).unwrap();

    // still the snapshot value
    assert_eq!(map1.get(&k("k")).unwrap(), Some(Value::Int(1)));
    map1.put(k("other"), Value::Int(1)).unwrap();
    // ...and the read conflict aborts the commit
    let abort = expect_abort(client1.tx_end().unwrap_err());
    assert_eq!(abort.cause, AbortCause::Conflict);
}

#[test]
fn test_write_after_write_ignores_read_conflicts() {
    let (client1, client2) = two_clients(RuntimeConfig::default());
    let stream = StreamId::from_name("A");
    let map1 = SmrMap::open(&client1, stream).unwrap();
    let map2 = SmrMap::open(&client2, stream).unwrap();

    map1.put(k("k"), Value::Int(1)).unwrap();

    client1
        .tx_build()
        .tx_type(TxType::WriteAfterWrite)
        .begin()
        .unwrap();
    assert_eq!(map1.get(&k("k")).unwrap(), Some(Value::Int(1)));

    // a transactional update of k by another client, after our snapshot
    client2.tx_begin().unwrap();
    map2.put(k("k"), Value::Int(99)).unwrap();
    client2.tx_end().unwrap();

    // the read of k is not part of the conflict footprint
    map1.put(k("unrelated"), Value::Int(2)).unwrap();
    let address = client1.tx_end().unwrap();
    assert!(address >= 0);
}

#[test]
fn test_write_after_write_conflicts_on_writes() {
    let runtime = WeftRuntime::in_process(RuntimeConfig::default());
    let map = SmrMap::open(&runtime, StreamId::from_name("A")).unwrap();

    map.put(k("k"), Value::Int(0)).unwrap();
    let snapshot = runtime.streams_view().current_tail().unwrap();

    runtime
        .tx_build()
        .tx_type(TxType::WriteAfterWrite)
        .snapshot(snapshot)
        .begin()
        .unwrap();
    map.put(k("k"), Value::Int(1)).unwrap();
    runtime.tx_end().unwrap();

    runtime
        .tx_build()
        .tx_type(TxType::WriteAfterWrite)
        .snapshot(snapshot)
        .begin()
        .unwrap();
    map.put(k("k"), Value::Int(2)).unwrap();
    let abort = expect_abort(runtime.tx_end().unwrap_err());
    assert_eq!(abort.cause, AbortCause::Conflict);
}

#[test]
fn test_abort_discards_speculative_state() {
    let runtime = WeftRuntime::in_process(RuntimeConfig::default());
    let map = SmrMap::open(&runtime, StreamId::from_name("A")).unwrap();

    runtime.tx_begin().unwrap();
    map.put(k("k"), Value::Int(1)).unwrap();
    assert_eq!(map.get(&k("k")).unwrap(), Some(Value::Int(1)));
    runtime.tx_abort().unwrap();

    assert!(!runtime.tx_active());
    assert_eq!(map.get(&k("k")).unwrap(), None);

    // the thread is reusable afterwards
    runtime.tx_begin().unwrap();
    map.put(k("k"), Value::Int(2)).unwrap();
    runtime.tx_end().unwrap();
    assert_eq!(map.get(&k("k")).unwrap(), Some(Value::Int(2)));
}

#[test]
fn test_failed_commit_rolls_back_replica() {
    let runtime = WeftRuntime::in_process(RuntimeConfig::default());
    let map = SmrMap::open(&runtime, StreamId::from_name("A")).unwrap();

    map.put(k("k"), Value::Int(0)).unwrap();
    let snapshot = runtime.streams_view().current_tail().unwrap();

    runtime.tx_build().snapshot(snapshot).begin().unwrap();
    map.get(&k("k")).unwrap();
    map.put(k("k"), Value::Int(1)).unwrap();
    runtime.tx_end().unwrap();

    runtime.tx_build().snapshot(snapshot).begin().unwrap();
    map.get(&k("k")).unwrap();
    map.put(k("k"), Value::Int(2)).unwrap();
    assert!(runtime.tx_end().is_err());

    // the loser's speculative update must not be visible anywhere
    assert_eq!(map.get(&k("k")).unwrap(), Some(Value::Int(1)));
}

#[test]
fn test_non_undoable_clear_forces_replay() {
    let runtime = WeftRuntime::in_process(RuntimeConfig::default());
    let map = SmrMap::open(&runtime, StreamId::from_name("A")).unwrap();

    map.put(k("a"), Value::Int(1)).unwrap();
    map.put(k("b"), Value::Int(2)).unwrap();

    runtime.tx_begin().unwrap();
    map.clear().unwrap();
    assert_eq!(map.size().unwrap(), 0);
    runtime.tx_abort().unwrap();

    // rolling back the clear replays the object from the log origin
    assert_eq!(map.size().unwrap(), 2);
    assert_eq!(map.get(&k("a")).unwrap(), Some(Value::Int(1)));
}

#[test]
fn test_trim_during_sync_aborts_with_trim_cause() {
    let (client1, client2) = two_clients(RuntimeConfig::default());
    let stream = StreamId::from_name("A");
    let map1 = SmrMap::open(&client1, stream).unwrap();

    for i in 0..4 {
        map1.put(k(&format!("k{}", i)), Value::Int(i)).unwrap();
    }
    client1.address_space().trim(1).unwrap();

    // a fresh client must replay from the origin, which is gone
    let map2 = SmrMap::open(&client2, stream).unwrap();
    client2.tx_begin().unwrap();
    let err = map2.get(&k("k0")).unwrap_err();
    let abort = expect_abort(err);
    assert_eq!(abort.cause, AbortCause::Trim);
    client2.tx_abort().unwrap();
}

#[test]
fn test_transaction_logging_mirrors_commit() {
    let runtime = WeftRuntime::in_process(RuntimeConfig::default().with_transaction_logging(true));
    let map = SmrMap::open(&runtime, StreamId::from_name("A")).unwrap();

    runtime.tx_begin().unwrap();
    map.put(k("k"), Value::Int(1)).unwrap();
    let address = runtime.tx_end().unwrap();

    let data = runtime.streams_view().read(address).unwrap();
    assert!(data.streams.contains(&TRANSACTION_STREAM_ID));
}

#[test]
fn test_entry_api_errors() {
    let runtime = WeftRuntime::in_process(RuntimeConfig::default());
    assert!(matches!(
        runtime.tx_end().unwrap_err(),
        WeftError::NoTransaction
    ));
    assert!(matches!(
        runtime.tx_abort().unwrap_err(),
        WeftError::NoTransaction
    ));
}

#[test]
fn test_non_transactional_accessor_mutator() {
    let runtime = WeftRuntime::in_process(RuntimeConfig::default());
    let map = SmrMap::open(&runtime, StreamId::from_name("A")).unwrap();

    assert_eq!(map.put(k("k"), Value::Int(1)).unwrap(), None);
    assert_eq!(map.put(k("k"), Value::Int(2)).unwrap(), Some(Value::Int(1)));
    assert_eq!(map.remove(k("k")).unwrap(), Some(Value::Int(2)));
    assert_eq!(map.remove(k("k")).unwrap(), None);
}

#[test]
fn test_snapshot_is_fixed_at_first_read_of_root() {
    let runtime = WeftRuntime::in_process(RuntimeConfig::default());
    let map = SmrMap::open(&runtime, StreamId::from_name("A")).unwrap();
    map.put(k("k"), Value::Int(1)).unwrap();
    let tail = runtime.streams_view().current_tail().unwrap();

    let ctx = runtime.tx_begin().unwrap();
    assert_eq!(ctx.snapshot(), None, "snapshot is lazy");
    map.get(&k("k")).unwrap();
    assert_eq!(ctx.snapshot(), Some(tail));

    // nested contexts inherit it
    let child = runtime.tx_begin().unwrap();
    assert_eq!(child.snapshot_timestamp().unwrap(), tail);
    runtime.tx_end().unwrap();
    runtime.tx_end().unwrap();
}
