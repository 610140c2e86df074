// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Runtime statistics (spec.md 6).
//!
//! `TM_STATISTICS=1` is the one environment variable the runtime reads; it
//! gates whether commit/abort/merge counters are dumped at `shutdown()`.
//! Everything else is a compile-time constant (spec.md 6: "all other
//! tuning... is compile-time constants whose values do not affect the
//! observable contract").

use crate::htm::HtmAbortCounters;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Stats {
    pub commits: AtomicU64,
    pub aborts: AtomicU64,
    pub merges_resumed: AtomicU64,
    pub merges_restarted: AtomicU64,
    pub htm: HtmAbortCounters,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abort(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_merge_resumed(&self) {
        self.merges_resumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_merge_restarted(&self) {
        self.merges_restarted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn statistics_enabled() -> bool {
        std::env::var("TM_STATISTICS")
            .map(|v| v == "1")
            .unwrap_or(false)
    }

    /// Dumps counters via `log::info!` if `TM_STATISTICS=1`, mirroring
    /// `tm.h`'s `HTM_STATS_PRINT` called from the runtime's shutdown path.
    pub fn dump_if_enabled(&self) {
        if !Self::statistics_enabled() {
            return;
        }
        log::info!(
            "tm-core stats: commits={} aborts={} merges_resumed={} merges_restarted={}",
            self.commits.load(Ordering::Relaxed),
            self.aborts.load(Ordering::Relaxed),
            self.merges_resumed.load(Ordering::Relaxed),
            self.merges_restarted.load(Ordering::Relaxed),
        );
        for (reason, count) in self.htm.snapshot() {
            log::info!("tm-core htm abort[{reason}]={count}");
        }
    }
}
