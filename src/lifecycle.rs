// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Process- and thread-level lifecycle (spec.md 4.3, 6).
//!
//! [`RuntimeShared`] is the process-wide state: the clock, the lock table,
//! the opcode registry, and statistics. [`startup`]/[`shutdown`] bracket
//! the process; [`thread_enter`]/[`thread_exit`] bracket one worker thread
//! registering/unregistering its descriptor.

use crate::clock::GlobalClock;
use crate::htm::{ActiveSoftwareCounter, DispatchMode, HybridDispatcher, NoHtm};
use crate::lock_table::LockTable;
use crate::opcode::OpcodeRegistry;
use crate::stats::Stats;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

pub struct RuntimeShared {
    pub clock: GlobalClock,
    pub locks: LockTable,
    pub opcodes: OpcodeRegistry,
    pub stats: Stats,
    pub dispatcher: HybridDispatcher<NoHtm>,
    pub active_sw: ActiveSoftwareCounter,
    registered_threads: AtomicUsize,
    max_threads: usize,
    barrier: Barrier,
}

impl RuntimeShared {
    pub fn new(max_threads: usize) -> Self {
        Self {
            clock: GlobalClock::new(),
            locks: LockTable::new(),
            opcodes: OpcodeRegistry::new(),
            stats: Stats::new(),
            dispatcher: HybridDispatcher::new(NoHtm, DispatchMode::from_feature_flags()),
            active_sw: ActiveSoftwareCounter::new(),
            registered_threads: AtomicUsize::new(0),
            max_threads,
            barrier: Barrier::new(max_threads.max(1)),
        }
    }

    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self::new(64)
    }

    /// `thread_enter()`: registers one more thread against the
    /// startup-time budget; fatal if the host exceeds it (spec.md 7,
    /// "thread count exceeded" is a Fatal condition).
    pub fn thread_enter(&self) -> crate::error::Result<usize> {
        let id = self.registered_threads.fetch_add(1, Ordering::AcqRel);
        if id >= self.max_threads {
            return Err(crate::error::TmError::fatal(format!(
                "thread_enter: exceeded configured thread count ({})",
                self.max_threads
            )));
        }
        log::debug!("tm-core: thread {id} entered");
        Ok(id)
    }

    pub fn thread_exit(&self, id: usize) {
        log::debug!("tm-core: thread {id} exited");
    }

    /// `thread_barrier_wait()`: blocks the calling thread until every
    /// registered thread reaches the same point (spec.md 2/6, "light
    /// barriers"). A plain rendezvous over the `startup`-time thread count,
    /// the same shape as `thread_barrier_wait()`'s `#pragma omp barrier` in
    /// the runtime this crate generalizes.
    pub fn thread_barrier_wait(&self) {
        self.barrier.wait();
    }
}

/// `startup(num_threads)`: seals the opcode registry (no opcode may be
/// registered after this, spec.md 3) and constructs the shared runtime
/// state. The caller registers all opcodes with [`RuntimeShared::opcodes`]
/// before calling this.
pub fn startup(num_threads: usize, opcodes_setup: impl FnOnce(&OpcodeRegistry)) -> Arc<RuntimeShared> {
    let runtime = RuntimeShared::new(num_threads);
    opcodes_setup(&runtime.opcodes);
    runtime.opcodes.seal();
    log::info!("tm-core: startup with {num_threads} threads, mode={:?}", runtime.dispatcher.mode);
    Arc::new(runtime)
}

/// `shutdown()`: dumps statistics if `TM_STATISTICS=1` (spec.md 6).
pub fn shutdown(runtime: &RuntimeShared) {
    runtime.stats.dump_if_enabled();
    log::info!("tm-core: shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::MergePolicy;

    #[test]
    fn startup_seals_registry_against_further_registration() {
        let runtime = startup(4, |opcodes| {
            opcodes.register("demo", MergePolicy::NONE).unwrap();
        });
        assert!(runtime.opcodes.register("late", MergePolicy::NONE).is_err());
    }

    #[test]
    fn thread_enter_past_budget_is_fatal() {
        let runtime = RuntimeShared::new(1);
        assert!(runtime.thread_enter().is_ok());
        assert!(runtime.thread_enter().is_err());
    }

    #[test]
    fn thread_barrier_wait_releases_every_thread_together() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use threadpool::ThreadPool;

        let runtime = Arc::new(RuntimeShared::new(4));
        let arrived = Arc::new(AtomicUsize::new(0));
        let pool = ThreadPool::new(4);

        for _ in 0..4 {
            let runtime = runtime.clone();
            let arrived = arrived.clone();
            pool.execute(move || {
                arrived.fetch_add(1, Ordering::SeqCst);
                runtime.thread_barrier_wait();
                // Every thread must see all four arrivals once its own wait
                // returns, never just its own.
                assert_eq!(arrived.load(Ordering::SeqCst), 4);
            });
        }
        pool.join();
    }
}
