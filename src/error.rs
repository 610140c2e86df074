// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the transactional runtime (spec.md 7).
//!
//! No user-visible error ever escapes a transaction body: [`TmError::Conflict`]
//! and [`TmError::Restart`] are consumed internally by the retry loop in
//! [`crate::atomically`], [`TmError::Capacity`] never reaches the software
//! path, and [`TmError::Fatal`] is only ever turned into a panic.

use thiserror::Error as DeriveError;

/// Global result type used across the runtime.
pub type Result<T> = core::result::Result<T, TmError>;

#[derive(Debug, DeriveError)]
pub enum TmError {
    /// A read or a commit-time validation observed a version newer than the
    /// transaction's snapshot, or a write slot is locked by another
    /// transaction. Handled locally by entering the merge engine.
    #[error("conflict detected on shared memory access")]
    Conflict,

    /// Internal signal: the transaction must restart from its checkpoint.
    /// Never surfaces from [`crate::atomically`].
    #[error("transaction restarted")]
    Restart,

    /// HTM-only: hardware resource exhausted, fall through to software path.
    #[error("hardware transaction capacity exceeded")]
    Capacity,

    /// Opcode registry corrupt, thread count exceeded, or an invariant was
    /// violated. Propagation of a `Fatal` always ends in a process abort.
    #[error("fatal runtime error: {0}")]
    Fatal(String),
}

impl TmError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        TmError::Fatal(msg.into())
    }

    /// Fatal errors are not recoverable; this turns one into a panic the way
    /// an assertion failure in the original runtime would abort the process.
    pub fn panic_if_fatal(&self) {
        if let TmError::Fatal(msg) = self {
            panic!("tm-core: fatal runtime error: {msg}");
        }
    }
}
