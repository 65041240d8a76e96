//! Ledger tests against the simulated VM

use super::*;
use crate::foreign::sim::SimVm;
use crate::foreign::{EnvRef, ForeignVm};
use proptest::prelude::*;
use std::sync::{Arc, Barrier};
use std::thread;

fn setup() -> (SimVm, EnvRef, RefLedger) {
    let vm = SimVm::new();
    let env = vm.attach_current_thread(Some("ledger-test"), false).unwrap();
    (vm, env, RefLedger::new())
}

#[test]
fn test_acquire_twice_shares_one_global() {
    let (vm, env, ledger) = setup();
    let key = IdentityKey(42);
    let h1 = env.new_string("payload").unwrap();
    let h1_again = env.new_local_ref(h1).unwrap();

    let first = ledger.acquire(env.as_ref(), Handle::local(h1), key).unwrap();
    let second = ledger.acquire(env.as_ref(), Handle::local(h1_again), key).unwrap();

    assert_eq!(first.raw(), second.raw());
    assert_eq!(first.kind(), RefKind::Counted);
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger.count_for(env.as_ref(), first.raw(), key), 2);

    let stats = vm.stats();
    assert_eq!(stats.globals_created, 1);
    // Both incoming locals were consumed
    assert_eq!(vm.live_locals(), 0);
}

#[test]
fn test_release_deletes_on_last_owner() {
    let (vm, env, ledger) = setup();
    let key = IdentityKey(42);
    let s = env.new_string("payload").unwrap();
    let s2 = env.new_local_ref(s).unwrap();
    let h = ledger.acquire(env.as_ref(), Handle::local(s), key).unwrap();
    ledger.acquire(env.as_ref(), Handle::local(s2), key).unwrap();

    assert_eq!(
        ledger.release(env.as_ref(), h.raw(), key),
        Ok(ReleaseOutcome::Decremented { remaining: 1 })
    );
    assert_eq!(vm.live_globals(), 1);

    assert_eq!(
        ledger.release(env.as_ref(), h.raw(), key),
        Ok(ReleaseOutcome::Deleted)
    );
    assert_eq!(vm.live_globals(), 0);
    assert!(ledger.is_empty());
    assert_eq!(vm.stats().globals_deleted, 1);
}

#[test]
fn test_release_unknown_key_is_reported() {
    let (vm, env, ledger) = setup();
    let s = env.new_string("payload").unwrap();
    let h = ledger.acquire(env.as_ref(), Handle::local(s), IdentityKey(1)).unwrap();

    let err = ledger.release(env.as_ref(), h.raw(), IdentityKey(2)).unwrap_err();
    assert_eq!(err.key, IdentityKey(2));
    assert!(err.to_string().starts_with("deleting non-existent ref"));

    // Nothing touched
    assert_eq!(ledger.len(), 1);
    assert_eq!(vm.stats().globals_deleted, 0);
}

#[test]
fn test_colliding_keys_keep_separate_entries() {
    let (vm, env, ledger) = setup();
    let key = IdentityKey(7);
    let a = env.new_string("a").unwrap();
    let b = env.new_string("b").unwrap();

    let ha = ledger.acquire(env.as_ref(), Handle::local(a), key).unwrap();
    let hb = ledger.acquire(env.as_ref(), Handle::local(b), key).unwrap();

    assert_ne!(ha.raw(), hb.raw());
    assert_eq!(ledger.len(), 2);

    ledger.release(env.as_ref(), ha.raw(), key).unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger.count_for(env.as_ref(), hb.raw(), key), 1);
    ledger.release(env.as_ref(), hb.raw(), key).unwrap();
    assert!(ledger.is_empty());
    assert_eq!(vm.live_globals(), 0);
}

#[test]
fn test_acquire_of_stored_handle_keeps_it() {
    let (vm, env, ledger) = setup();
    let key = IdentityKey(3);
    let s = env.new_string("x").unwrap();
    let h = ledger.acquire(env.as_ref(), Handle::local(s), key).unwrap();

    // Re-acquiring through the counted handle itself must not delete it
    let again = ledger.acquire(env.as_ref(), h, key).unwrap();
    assert_eq!(again.raw(), h.raw());
    assert_eq!(vm.stats().invalid_deletes, 0);
    assert_eq!(vm.live_globals(), 1);
}

#[test]
fn test_weak_refs_bypass_ledger() {
    let (vm, env, ledger) = setup();
    let s = env.new_string("x").unwrap();

    let weak = ledger.acquire_weak(env.as_ref(), s).unwrap();
    assert_eq!(weak.kind(), RefKind::Weak);
    assert!(ledger.is_empty());

    ledger.release_weak(env.as_ref(), weak.raw());
    assert_eq!(vm.live_weaks(), 0);
}

#[test]
fn test_snapshot_and_drain() {
    let (vm, env, ledger) = setup();
    for (i, text) in ["a", "b", "c"].iter().enumerate() {
        let s = env.new_string(text).unwrap();
        ledger.acquire(env.as_ref(), Handle::local(s), IdentityKey(i as i32)).unwrap();
    }

    let snapshot = ledger.snapshot();
    assert_eq!(snapshot.len(), 3);
    assert!(snapshot.windows(2).all(|w| w[0].key <= w[1].key));
    assert!(snapshot.iter().all(|e| e.count == 1));

    assert_eq!(ledger.drain(env.as_ref()), 3);
    assert!(ledger.is_empty());
    assert_eq!(vm.live_globals(), 0);
}

#[test]
fn test_concurrent_acquire_creates_one_global() {
    const THREADS: usize = 8;

    let vm = SimVm::new();
    let main_env = vm.attach_current_thread(Some("main"), false).unwrap();
    let shared = main_env.new_string("shared").unwrap();
    let pinned = main_env.new_global_ref(shared).unwrap();
    let key = IdentityKey(99);

    let ledger = Arc::new(RefLedger::new());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let vm = vm.clone();
            let ledger = ledger.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let env = vm.attach_current_thread(Some(&format!("worker-{i}")), false).unwrap();
                let local = env.new_local_ref(pinned).unwrap();
                barrier.wait();
                let counted = ledger.acquire(env.as_ref(), Handle::local(local), key).unwrap();
                vm.detach_current_thread();
                counted.raw()
            })
        })
        .collect();

    let results: Vec<RawRef> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(results.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger.count_for(main_env.as_ref(), results[0], key), THREADS);

    // One global for `pinned`, one for the ledger entry
    assert_eq!(vm.stats().globals_created, 2);
    assert_eq!(vm.stats().unattached_calls, 0);
}

#[derive(Debug, Clone)]
enum Op {
    Acquire(usize),
    Release(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..4).prop_map(Op::Acquire),
        (0usize..4).prop_map(Op::Release),
    ]
}

proptest! {
    #[test]
    fn prop_balanced_sequences_delete_each_global_once(ops in prop::collection::vec(op_strategy(), 0..64)) {
        let (vm, env, ledger) = setup();
        // Four objects, two of which collide on one key
        let objects: Vec<RawRef> = (0..4)
            .map(|i| {
                let s = env.new_string(&format!("obj-{i}")).unwrap();
                env.new_global_ref(s).unwrap()
            })
            .collect();
        let keys = [IdentityKey(10), IdentityKey(10), IdentityKey(11), IdentityKey(12)];
        let mut counts = [0usize; 4];
        let mut counted: [Option<RawRef>; 4] = [None; 4];

        for op in ops {
            match op {
                Op::Acquire(i) => {
                    let local = env.new_local_ref(objects[i]).unwrap();
                    let h = ledger.acquire(env.as_ref(), Handle::local(local), keys[i]).unwrap();
                    if let Some(prev) = counted[i] {
                        prop_assert_eq!(prev, h.raw());
                    }
                    counted[i] = Some(h.raw());
                    counts[i] += 1;
                }
                Op::Release(i) if counts[i] > 0 => {
                    let raw = counted[i].unwrap();
                    ledger.release(env.as_ref(), raw, keys[i]).unwrap();
                    counts[i] -= 1;
                    if counts[i] == 0 {
                        counted[i] = None;
                    }
                }
                Op::Release(_) => {}
            }
            for i in 0..4 {
                let live = counted[i].map_or(0, |raw| ledger.count_for(env.as_ref(), raw, keys[i]));
                prop_assert_eq!(live, counts[i]);
            }
        }

        for i in 0..4 {
            while counts[i] > 0 {
                ledger.release(env.as_ref(), counted[i].unwrap(), keys[i]).unwrap();
                counts[i] -= 1;
            }
        }

        prop_assert!(ledger.is_empty());
        let stats = vm.stats();
        // The four pinning globals stay; every ledger global is deleted once
        prop_assert_eq!(stats.globals_created - 4, stats.globals_deleted);
        prop_assert_eq!(stats.invalid_deletes, 0);
        prop_assert_eq!(vm.live_globals(), 4);
    }
}
