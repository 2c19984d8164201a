//! Concurrent tests for the transaction engine.
//!
//! These exercise the engine under real parallelism:
//!
//! 1. **First-committer-wins** — racing transactions on one key produce
//!    exactly one winner
//! 2. **Parallel commits** — disjoint streams commit in parallel with
//!    unique, gap-tracked addresses
//! 3. **Overlay ownership handoff** — a reader steals a writer's overlay
//!    and both still converge on the committed state

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use weft_core::{StreamId, Value, WeftError};
use weft_runtime::{RuntimeConfig, SmrMap, WeftRuntime};

fn k(s: &str) -> Value {
    Value::from(s)
}

#[test]
fn test_racing_transactions_have_exactly_one_winner() {
    let runtime = WeftRuntime::in_process(RuntimeConfig::default());
    let stream = StreamId::from_name("contended");
    let map = SmrMap::open(&runtime, stream).unwrap();
    map.put(k("k"), Value::Int(0)).unwrap();
    let snapshot = runtime.streams_view().current_tail().unwrap();

    let num_threads = 8;
    let barrier = Arc::new(Barrier::new(num_threads));
    let mut handles = Vec::new();

    for i in 0..num_threads {
        let runtime = Arc::clone(&runtime);
        let map = map.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            runtime.tx_build().snapshot(snapshot).begin().unwrap();
            let _ = map.get(&k("k")).unwrap();
            map.put(k("k"), Value::Int(i as i64 + 1)).unwrap();
            barrier.wait();
            runtime.tx_end()
        }));
    }

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
    assert_eq!(
        winners.len(),
        1,
        "exactly one transaction at the shared snapshot may commit"
    );
    for r in &results {
        if let Err(e) = r {
            assert!(
                matches!(e, WeftError::TransactionAborted(_)),
                "losers must abort with a classified cause, got {:?}",
                e
            );
        }
    }

    // the surviving value belongs to the winner
    let final_value = map.get(&k("k")).unwrap().unwrap();
    assert_ne!(final_value, Value::Int(0));
}

#[test]
fn test_parallel_commits_on_disjoint_streams() {
    let runtime = WeftRuntime::in_process(RuntimeConfig::default());
    let num_threads = 10;
    let barrier = Arc::new(Barrier::new(num_threads));
    let mut handles = Vec::new();

    for i in 0..num_threads {
        let runtime = Arc::clone(&runtime);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let map =
                SmrMap::open(&runtime, StreamId::from_name(&format!("stream-{}", i))).unwrap();
            barrier.wait();
            runtime.tx_begin().unwrap();
            map.put(k("key"), Value::Int(i as i64)).unwrap();
            runtime.tx_end().unwrap()
        }));
    }

    let addresses: Vec<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // all commits succeed at unique addresses
    let unique: HashSet<i64> = addresses.iter().copied().collect();
    assert_eq!(unique.len(), num_threads);
    assert!(addresses.iter().all(|&a| a >= 0));

    // every replica converges
    for i in 0..num_threads {
        let map = SmrMap::open(&runtime, StreamId::from_name(&format!("stream-{}", i))).unwrap();
        assert_eq!(map.get(&k("key")).unwrap(), Some(Value::Int(i as i64)));
    }
}

#[test]
fn test_overlay_ownership_handoff() {
    let runtime = WeftRuntime::in_process(RuntimeConfig::default());
    let stream = StreamId::from_name("handoff");
    let map = SmrMap::open(&runtime, stream).unwrap();

    let installed = Arc::new(Barrier::new(2));
    let stolen = Arc::new(Barrier::new(2));

    let writer = {
        let runtime = Arc::clone(&runtime);
        let map = map.clone();
        let installed = Arc::clone(&installed);
        let stolen = Arc::clone(&stolen);
        thread::spawn(move || {
            runtime.tx_begin().unwrap();
            // the upcall fetch installs this transaction's overlay
            map.put(k("k"), Value::Int(7)).unwrap();
            installed.wait();
            stolen.wait();
            // ownership was taken; commit still succeeds, installation
            // is skipped for the stolen proxy
            runtime.tx_end().unwrap()
        })
    };

    let reader = {
        let map = map.clone();
        let installed = Arc::clone(&installed);
        let stolen = Arc::clone(&stolen);
        thread::spawn(move || {
            installed.wait();
            // a non-transactional read rolls the foreign overlay back
            let seen = map.get(&k("k")).unwrap();
            stolen.wait();
            seen
        })
    };

    let address = writer.join().unwrap();
    assert!(address >= 0);
    assert_eq!(
        reader.join().unwrap(),
        None,
        "speculative state must never leak to other threads"
    );

    // both threads converge on the committed value afterwards
    assert_eq!(map.get(&k("k")).unwrap(), Some(Value::Int(7)));
}

#[test]
fn test_interleaved_commits_converge() {
    let runtime = WeftRuntime::in_process(RuntimeConfig::default());
    let stream = StreamId::from_name("counter");
    let map = SmrMap::open(&runtime, stream).unwrap();
    map.put(k("n"), Value::Int(0)).unwrap();

    let num_threads = 4;
    let increments_per_thread = 10;
    let barrier = Arc::new(Barrier::new(num_threads));
    let mut handles = Vec::new();

    for _ in 0..num_threads {
        let runtime = Arc::clone(&runtime);
        let map = map.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            let mut committed = 0u64;
            for _ in 0..increments_per_thread {
                // retry loop around the optimistic increment
                loop {
                    runtime.tx_begin().unwrap();
                    let current = match map.get(&k("n")) {
                        Ok(v) => v.and_then(|v| v.as_int()).unwrap_or(0),
                        Err(_) => {
                            let _ = runtime.tx_abort();
                            continue;
                        }
                    };
                    if map.put(k("n"), Value::Int(current + 1)).is_err() {
                        let _ = runtime.tx_abort();
                        continue;
                    }
                    match runtime.tx_end() {
                        Ok(_) => break,
                        Err(e) => assert!(
                            e.is_retryable(),
                            "increments may only fail with retryable aborts: {:?}",
                            e
                        ),
                    }
                }
                committed += 1;
            }
            committed
        }));
    }

    let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, (num_threads * increments_per_thread) as u64);

    // every committed increment is reflected exactly once
    assert_eq!(
        map.get(&k("n")).unwrap(),
        Some(Value::Int(total as i64)),
        "lost or duplicated increments under contention"
    );
}
