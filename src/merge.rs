// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The merge engine (spec.md 4.7).
//!
//! Invoked in place of aborting whenever an in-flight read or a commit-time
//! validation observes a conflict. Walks from the conflicting read's owning
//! operation up through the operation tree, consulting each ancestor's
//! merge callback before giving up and escalating to a real abort.

use crate::access::ReadHandle;
use crate::descriptor::Descriptor;
use crate::oplog::OpHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeVerdict {
    /// The context has been repaired; resume the transaction.
    Ok,
    /// This callback fixed the current operation, but the parent must also
    /// adjust; continue the walk upward.
    OkParent,
    /// Local state is now inconsistent; restart the transaction (no abort).
    Retry,
    /// This callback does not know how to fix the observed conflict; fall
    /// through to the parent operation.
    Unsupported,
    /// The conflict is fatal; abort the transaction.
    Abort,
}

/// What the caller (an access primitive or the commit protocol) should do
/// once the merge walk concludes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictOutcome {
    Resume,
    Restart,
    Abort,
}

/// Passed to a merge callback. Per spec.md 4.7 this carries the conflicting
/// address, the conflicting read record, the operation being repaired, the
/// previous (child) operation if the conflict is propagating upward, the
/// operation's return-value slot, and whether this is the first (leaf)
/// invocation of the walk.
pub struct MergeContext<'a> {
    pub descriptor: &'a mut Descriptor,
    pub addr: usize,
    pub read: ReadHandle,
    pub op: OpHandle,
    pub previous: Option<OpHandle>,
    pub leaf: bool,
    pub original_ret: Option<usize>,
    repaired_ret: Option<Option<usize>>,
    finished: bool,
}

impl<'a> MergeContext<'a> {
    /// `finish_merge()`: subsequent reads/writes the callback performs are
    /// attributed to the repair, not the original flow (spec.md 4.7).
    pub fn finish_merge(&mut self) {
        self.finished = true;
    }

    pub fn did_finish(&self) -> bool {
        self.finished
    }

    /// `set_op_ret`: records a repaired return value for the operation
    /// being merged. `resolve_conflict` persists it into the operation log
    /// once the callback returns, so an ancestor's delayed callback can
    /// later read the propagated result back out via `get_op_ret` (spec.md
    /// 4.7: "propagate the repair upward").
    pub fn set_op_ret(&mut self, ret: Option<usize>) {
        self.repaired_ret = Some(ret);
    }
}

/// Runs the just-in-time / delayed merge walk for a conflict discovered on
/// `read` while accessing `addr`. Guarantee (i) of spec.md 4.7 — the
/// descriptor is quiescent during a callback, no other thread mutates it —
/// holds because the descriptor is thread-local and never shared.
pub fn resolve_conflict(descriptor: &mut Descriptor, read: ReadHandle, addr: usize) -> ConflictOutcome {
    let tx_id = descriptor.id;
    let mut op = descriptor.read_set.get(read).op;
    let mut previous: Option<OpHandle> = None;
    let mut leaf = true;

    log::debug!("TX({tx_id}): entering merge engine for read {read:?} at {addr:#x}");

    loop {
        let opcode = descriptor.oplog.get_op_opcode(op);
        let closed = descriptor.oplog.is_closed(op);
        let policy = descriptor.runtime.opcodes.desc(opcode).merge;
        let callback = if closed { policy.delayed } else { policy.just_in_time };
        let original_ret = descriptor.oplog.get_op_ret(op);

        if let Some(cb) = callback {
            let mut ctx = MergeContext {
                descriptor,
                addr,
                read,
                op,
                previous,
                leaf,
                original_ret,
                repaired_ret: None,
                finished: false,
            };
            let verdict = cb(&mut ctx);
            let repaired_ret = ctx.repaired_ret;
            descriptor = ctx.descriptor;
            if let Some(new_ret) = repaired_ret {
                descriptor.oplog.set_op_ret(op, new_ret);
            }

            match verdict {
                MergeVerdict::Ok => {
                    log::debug!("TX({tx_id}): merge callback on {op:?} returned OK, resuming");
                    return ConflictOutcome::Resume;
                }
                MergeVerdict::Retry => {
                    log::debug!("TX({tx_id}): merge callback on {op:?} returned RETRY");
                    return ConflictOutcome::Restart;
                }
                MergeVerdict::Abort => {
                    log::debug!("TX({tx_id}): merge callback on {op:?} returned ABORT");
                    return ConflictOutcome::Abort;
                }
                MergeVerdict::OkParent => { /* fixed here, continue propagating upward */ }
                MergeVerdict::Unsupported => {
                    if closed {
                        // spec.md 9, open question 3: treat as RETRY, the
                        // documented safe default.
                        log::debug!("TX({tx_id}): UNSUPPORTED on closed op {op:?}, treating as RETRY");
                        return ConflictOutcome::Restart;
                    }
                    // else fall through to the parent, same as no callback.
                }
            }
        }

        previous = Some(op);
        leaf = false;
        match descriptor.oplog.parent_of(op) {
            Some(parent) => op = parent,
            None => {
                log::debug!("TX({tx_id}): merge walk exhausted every ancestor, aborting");
                return ConflictOutcome::Abort;
            }
        }
    }
}
