// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The HTM/STM hybrid dispatcher (spec.md 4.8).
//!
//! Hardware intrinsics are abstracted behind a thin port (spec.md 9,
//! "HTM intrinsics"), since no novel HTM implementation is in scope
//! (spec.md 1). [`NoHtm`] is the fallback port for platforms without
//! hardware transactional memory: it reports `Capacity` immediately,
//! which forces every transaction onto the software path.

use crate::clock::GlobalClock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// The three dispatch-mode families `spec.md` 4.8 names, plus the fourth
/// the original runtime actually distinguishes (SPEC_FULL.md 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// HTM attempted first; on repeated failure, falls through to the full
    /// software path, which also validates against the STM locks.
    HtmDirectStm,
    /// The HTM body itself issues STM load primitives, so its accesses are
    /// validated against the STM locks even while committing in hardware.
    HtmStm,
    /// No hardware transactions; a process-wide counter serializes HTM
    /// attempts (never made, in this mode) against in-flight software
    /// transactions.
    MutexFallback,
}

impl DispatchMode {
    pub fn from_feature_flags() -> Self {
        if cfg!(feature = "htm_direct_stm") {
            DispatchMode::HtmDirectStm
        } else if cfg!(feature = "mutex_fallback") {
            DispatchMode::MutexFallback
        } else {
            DispatchMode::HtmStm
        }
    }
}

/// Outcome of one hardware-transaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HtmOutcome {
    Committed,
    Aborted(AbortReason),
}

/// The nine abort buckets `tm.h`'s `HTM_STATS` macro tracks
/// (SPEC_FULL.md 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Unknown,
    Explicit,
    Retry,
    Conflict,
    Capacity,
    Debug,
    Nested,
    BeginStarted,
    BeginFailed,
}

/// A hardware-transaction port (spec.md 9). Real backends wrap CPU
/// intrinsics (e.g. `_xbegin`/`_xend`/`_xabort`); [`NoHtm`] is the
/// always-software fallback.
pub trait HardwareTransaction {
    /// Attempts to begin a hardware transaction. `subscribe` is the value
    /// the body must observe to treat a concurrent software commit as a
    /// conflict (the global clock's reserved bit, or the mutex-fallback
    /// counter, depending on `DispatchMode`).
    fn begin(&self) -> HtmOutcome;
    fn end(&self) -> HtmOutcome;
    fn abort(&self, reason: AbortReason) -> !;
    fn available(&self) -> bool;
}

/// Software-only fallback: every `begin` reports `Capacity`, forcing the
/// caller onto the STM path immediately (spec.md 9).
pub struct NoHtm;

impl HardwareTransaction for NoHtm {
    fn begin(&self) -> HtmOutcome {
        HtmOutcome::Aborted(AbortReason::Capacity)
    }
    fn end(&self) -> HtmOutcome {
        HtmOutcome::Aborted(AbortReason::Capacity)
    }
    fn abort(&self, _reason: AbortReason) -> ! {
        unreachable!("NoHtm never begins a hardware transaction to abort")
    }
    fn available(&self) -> bool {
        false
    }
}

/// One atomic counter per `AbortReason` bucket, dumped at `shutdown()` when
/// `TM_STATISTICS=1` (spec.md 6).
#[derive(Default)]
pub struct HtmAbortCounters {
    unknown: AtomicU64,
    explicit: AtomicU64,
    retry: AtomicU64,
    conflict: AtomicU64,
    capacity: AtomicU64,
    debug: AtomicU64,
    nested: AtomicU64,
    begin_started: AtomicU64,
    begin_failed: AtomicU64,
}

impl HtmAbortCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, reason: AbortReason) {
        let counter = match reason {
            AbortReason::Unknown => &self.unknown,
            AbortReason::Explicit => &self.explicit,
            AbortReason::Retry => &self.retry,
            AbortReason::Conflict => &self.conflict,
            AbortReason::Capacity => &self.capacity,
            AbortReason::Debug => &self.debug,
            AbortReason::Nested => &self.nested,
            AbortReason::BeginStarted => &self.begin_started,
            AbortReason::BeginFailed => &self.begin_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> [(&'static str, u64); 9] {
        [
            ("unknown", self.unknown.load(Ordering::Relaxed)),
            ("explicit", self.explicit.load(Ordering::Relaxed)),
            ("retry", self.retry.load(Ordering::Relaxed)),
            ("conflict", self.conflict.load(Ordering::Relaxed)),
            ("capacity", self.capacity.load(Ordering::Relaxed)),
            ("debug", self.debug.load(Ordering::Relaxed)),
            ("nested", self.nested.load(Ordering::Relaxed)),
            ("begin_started", self.begin_started.load(Ordering::Relaxed)),
            ("begin_failed", self.begin_failed.load(Ordering::Relaxed)),
        ]
    }
}

/// Process-wide counter of in-flight software transactions, used by the
/// `MutexFallback` dispatch mode: HTM subscribes to it at begin (and would
/// abort were it nonzero), software transactions bump it around their body
/// (spec.md 4.8).
#[derive(Default)]
pub struct ActiveSoftwareCounter(AtomicUsize);

impl ActiveSoftwareCounter {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn enter(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }
    pub fn exit(&self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
    pub fn count(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// Per-thread retry budget `R` from spec.md 4.8: "if HTM aborts more than R
/// times, the same transaction is attempted in software."
pub const HTM_RETRY_BUDGET: u32 = 5;

/// Decides, for one attempt index, whether to keep retrying in hardware or
/// fall through to software — spec.md 4.8's per-thread retry budget, plus
/// the reserved-clock-bit / active-counter subscription rule depending on
/// `mode`.
pub struct HybridDispatcher<H: HardwareTransaction> {
    pub htm: H,
    pub mode: DispatchMode,
}

impl<H: HardwareTransaction> HybridDispatcher<H> {
    pub fn new(htm: H, mode: DispatchMode) -> Self {
        Self { htm, mode }
    }

    /// True if, given the clock's reserved bit, a hardware attempt would be
    /// admissible right now under this dispatch mode.
    pub fn htm_may_proceed(&self, clock: &GlobalClock, active_sw: &ActiveSoftwareCounter) -> bool {
        match self.mode {
            DispatchMode::HtmDirectStm | DispatchMode::HtmStm => !clock.htm_in_progress(),
            DispatchMode::MutexFallback => active_sw.count() == 0,
        }
    }

    /// Attempts up to `HTM_RETRY_BUDGET` hardware transactions, classifying
    /// every abort. Returns `true` on hardware commit, `false` if the
    /// software path should be used instead.
    pub fn try_hardware<F>(
        &self,
        clock: &GlobalClock,
        active_sw: &ActiveSoftwareCounter,
        counters: &HtmAbortCounters,
        mut body: F,
    ) -> bool
    where
        F: FnMut() -> bool,
    {
        if !self.htm.available() {
            counters.record(AbortReason::Capacity);
            return false;
        }
        for _ in 0..HTM_RETRY_BUDGET {
            if !self.htm_may_proceed(clock, active_sw) {
                counters.record(AbortReason::Conflict);
                continue;
            }
            match self.htm.begin() {
                HtmOutcome::Aborted(reason) => {
                    counters.record(reason);
                    if matches!(reason, AbortReason::Capacity) {
                        return false;
                    }
                    continue;
                }
                HtmOutcome::Committed => {
                    counters.record(AbortReason::BeginStarted);
                    if body() {
                        if matches!(self.htm.end(), HtmOutcome::Committed) {
                            return true;
                        }
                    }
                    counters.record(AbortReason::Explicit);
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_htm_reports_capacity() {
        let htm = NoHtm;
        assert!(!htm.available());
        assert_eq!(htm.begin(), HtmOutcome::Aborted(AbortReason::Capacity));
    }

    #[test]
    fn dispatcher_falls_through_to_software_without_htm() {
        let clock = GlobalClock::new();
        let active = ActiveSoftwareCounter::new();
        let counters = HtmAbortCounters::new();
        let dispatcher = HybridDispatcher::new(NoHtm, DispatchMode::HtmStm);

        let committed = dispatcher.try_hardware(&clock, &active, &counters, || true);
        assert!(!committed);
        assert!(counters.snapshot().iter().any(|(name, n)| *name == "capacity" && *n > 0));
    }

    #[test]
    fn mutex_fallback_blocks_htm_while_software_active() {
        let clock = GlobalClock::new();
        let active = ActiveSoftwareCounter::new();
        active.enter();
        let dispatcher = HybridDispatcher::new(NoHtm, DispatchMode::MutexFallback);
        assert!(!dispatcher.htm_may_proceed(&clock, &active));
        active.exit();
        assert!(dispatcher.htm_may_proceed(&clock, &active));
    }
}
