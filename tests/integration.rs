// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use threadpool::ThreadPool;
use tm_core::merge::{MergeContext, MergeVerdict};
use tm_core::opcode::MergePolicy;
use tm_core::{atomically, shutdown, startup, TmValue, TxAttributes};

#[ctor::ctor]
fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

struct SharedArray(Vec<AtomicUsize>);

impl SharedArray {
    fn new(len: usize) -> Self {
        Self((0..len).map(|_| AtomicUsize::new(0)).collect())
    }

    fn addr_of(&self, i: usize) -> usize {
        &self.0[i] as *const AtomicUsize as usize
    }

    fn sum(&self) -> usize {
        self.0.iter().map(|c| c.load(Ordering::SeqCst)).sum()
    }
}

// SAFETY: every access to these cells goes through the runtime's raw-pointer
// load/store primitives gated by the lock table, never through the atomic
// API directly, so sharing them across threads carries no extra race beyond
// what the STM protocol itself already arbitrates.
unsafe impl Send for SharedArray {}
unsafe impl Sync for SharedArray {}

/// Scenario 1 (spec.md 8), scaled down: several threads each run many
/// transactions, each incrementing a uniformly random slot of a shared
/// array by one. The summed total must equal the exact number of
/// increments performed, regardless of how much contention forced retries.
#[test]
fn counter_race_sums_exactly() {
    let runtime = startup(8, |_| {});
    let array = Arc::new(SharedArray::new(64));

    let threads = 4;
    let txns_per_thread = 200;
    let ops_per_txn = 8;
    let pool = ThreadPool::new(threads);

    for _ in 0..threads {
        let runtime = runtime.clone();
        let array = array.clone();
        pool.execute(move || {
            let mut rng = rand::thread_rng();
            for _ in 0..txns_per_thread {
                let indices: Vec<usize> = (0..ops_per_txn).map(|_| rng.gen_range(0..64)).collect();
                atomically(&runtime, TxAttributes::default(), |tx| {
                    for &i in &indices {
                        let addr = array.addr_of(i);
                        let v = tx.load_word(addr)?;
                        tx.store_word(addr, v + 1);
                    }
                    Ok(())
                });
            }
        });
    }
    pool.join();

    assert_eq!(array.sum(), threads * txns_per_thread * ops_per_txn);
    shutdown(&runtime);
}

/// Scenario 2 (spec.md 8): a merge callback registered for the increment
/// opcode repairs a stale read in place (re-samples the current value)
/// instead of forcing a restart. The final sum must still be exact, and
/// since every conflict now resolves without a restart, the commit rate
/// for a fixed number of attempts is at least as high as the unmerged case.
fn increment_merge(ctx: &mut MergeContext) -> MergeVerdict {
    let fresh = unsafe { *(ctx.addr as *const usize) };
    ctx.descriptor.read_update(ctx.read, TmValue::from_word(fresh));
    MergeVerdict::Ok
}

#[test]
fn merge_on_increment_still_sums_exactly() {
    let add_opcode = std::cell::Cell::new(tm_core::ROOT_OPCODE);
    let runtime = startup(8, |opcodes| {
        let op = opcodes
            .register(
                "array_add",
                MergePolicy {
                    just_in_time: Some(increment_merge),
                    delayed: None,
                },
            )
            .unwrap();
        add_opcode.set(op);
    });
    let add_opcode = add_opcode.get();
    let array = Arc::new(SharedArray::new(8));

    let threads = 4;
    let txns_per_thread = 300;
    let pool = ThreadPool::new(threads);

    for t in 0..threads {
        let runtime = runtime.clone();
        let array = array.clone();
        pool.execute(move || {
            // All threads hammer the same small set of slots so merges are
            // actually exercised under real contention.
            let addr = array.addr_of(t % 2);
            for _ in 0..txns_per_thread {
                atomically(&runtime, TxAttributes::default(), |tx| {
                    // Scoping the access under the registered opcode is what
                    // makes the conflicting read attributable to
                    // `increment_merge` rather than falling through to the
                    // unhandled root operation.
                    let op = tx.begin_op(add_opcode, vec![addr]);
                    let v = tx.load_word(addr)?;
                    tx.store_word(addr, v + 1);
                    tx.end_op(op, Some(v + 1));
                    Ok(())
                });
            }
        });
    }
    pool.join();

    assert_eq!(array.sum(), threads * txns_per_thread);
    shutdown(&runtime);
}

/// Scenario 5 (spec.md 8), smoke form: a transaction forced to restart
/// partway through must never let a concurrent reader observe a
/// half-applied write. `addr_c` is read but never written by the
/// transaction under test, so perturbing its version between the read and
/// the commit trips commit's step-4 revalidation (the address isn't one of
/// our own locked slots, so the staleness is real, not masked by our own
/// lock ownership) without the merge engine having anything registered to
/// repair it — per spec.md 7 that escalates to a transparent restart, never
/// a process abort. Only the retried attempt ever reaches step 5, so `a`
/// and `b` are always published together.
#[test]
fn abort_never_exposes_partial_writes() {
    let runtime = startup(4, |_| {});
    let mut a: usize = 0;
    let mut b: usize = 0;
    let mut c: usize = 0;
    let addr_a = &mut a as *mut usize as usize;
    let addr_b = &mut b as *mut usize as usize;
    let addr_c = &mut c as *mut usize as usize;

    let attempt = AtomicUsize::new(0);
    atomically(&runtime, TxAttributes::default(), |tx| {
        let n = attempt.fetch_add(1, Ordering::SeqCst);
        let watched = tx.load_word(addr_c)?;
        if n == 0 {
            // Simulate a concurrent committer publishing a change to
            // addr_c between our read and our commit.
            let slot = runtime.locks.slot_for(addr_c);
            let prev = runtime.locks.try_lock(slot, 0xBEEF).expect("uncontended in this test");
            let bumped = runtime.clock.advance();
            runtime.locks.unlock_with_version(slot, bumped.max(prev + 2));
        }
        tx.store_word(addr_a, watched + 1);
        tx.store_word(addr_b, watched + 1);
        Ok(())
    });

    assert_eq!(attempt.load(Ordering::SeqCst), 2, "the first attempt must have been forced to restart");
    assert_eq!(a, b, "a transaction must never commit only one of its writes");
    shutdown(&runtime);
}

/// Scenario 6 (spec.md 8), adapted to this port's software-only `NoHtm`
/// backend: `atomically` itself offers every attempt to the hybrid
/// dispatcher first (spec.md 4.8) before ever reaching the software path.
/// With no hardware available every single attempt must fall through, and
/// the software path alone must still produce the exact sum — i.e. the
/// hybrid dispatcher never silently drops work, and it is the real
/// transaction body running through it, not a disconnected stand-in.
#[test]
fn htm_unavailable_falls_through_to_software_and_stays_exact() {
    let runtime = startup(4, |_| {});
    let mut cell: usize = 0;
    let addr = &mut cell as *mut usize as usize;
    let pool = ThreadPool::new(4);
    for _ in 0..4 {
        let runtime = runtime.clone();
        pool.execute(move || {
            for _ in 0..100 {
                atomically(&runtime, TxAttributes::default(), |tx| {
                    let v = tx.load_word(addr)?;
                    tx.store_word(addr, v + 1);
                    Ok(())
                });
            }
        });
    }
    pool.join();
    assert_eq!(cell, 400);

    // Every one of those 400 attempts went through
    // `HybridDispatcher::try_hardware` inside `atomically` before falling
    // through to software; with `NoHtm` reporting unavailable every time,
    // the capacity bucket must have recorded exactly that many abort events.
    let capacity_aborts = runtime
        .stats
        .htm
        .snapshot()
        .into_iter()
        .find(|(name, _)| *name == "capacity")
        .map(|(_, n)| n)
        .unwrap_or(0);
    assert_eq!(
        capacity_aborts, 400,
        "every attempt must have gone through the real hybrid dispatch path"
    );
    shutdown(&runtime);
}
