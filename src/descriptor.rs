// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The per-thread transaction descriptor (spec.md 3, 4.3, 4.4).
//!
//! One descriptor per thread, never moved between threads (spec.md 5).
//! Owns the read/write sets, operation log, and allocation log; everything
//! here is touched only by its owning thread except through the merge
//! engine, which the spec guarantees runs with the descriptor quiescent.

use crate::access::{ReadHandle, ReadSet, TmValue, Width, WriteHandle, WriteSet};
use crate::alloc::AllocLog;
use crate::error::{Result, TmError};
use crate::lifecycle::RuntimeShared;
use crate::lock_table::LockState;
use crate::merge::{resolve_conflict, ConflictOutcome};
use crate::opcode::{OpArgs, Opcode};
use crate::oplog::{OpHandle, OpLog};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Idle,
    Active,
    Committing,
    Aborted,
}

/// Hints from spec.md 4.3. Neither affects correctness, both affect
/// performance / contention-manager policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxAttributes {
    pub read_only: bool,
    pub no_overwrite: bool,
}

/// What a caller of an access primitive, or the commit protocol, should do
/// next after a low-level operation. Per spec.md 7, an unrepaired conflict
/// always escalates to a transparent `Restart`, never to a process-visible
/// abort — that is reserved for `TmError::Fatal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxSignal {
    Continue,
    Restart,
}

pub struct Descriptor {
    pub id: usize,
    pub status: TxStatus,
    pub snapshot: usize,
    pub attrs: TxAttributes,
    pub read_set: ReadSet,
    pub write_set: WriteSet,
    pub oplog: OpLog,
    pub alloc_log: AllocLog,
    pub runtime: Arc<RuntimeShared>,
}

impl Descriptor {
    pub fn new(id: usize, runtime: Arc<RuntimeShared>) -> Self {
        Self {
            id,
            status: TxStatus::Idle,
            snapshot: 0,
            attrs: TxAttributes::default(),
            read_set: ReadSet::new(),
            write_set: WriteSet::new(),
            oplog: OpLog::new(),
            alloc_log: AllocLog::new(),
            runtime,
        }
    }

    /// Lock-table owner id. Must be odd (spec.md 3: "the identifier of the
    /// owning transaction (odd)"); thread ids start at 0 so we shift and
    /// force the low bit.
    pub fn owner_id(&self) -> usize {
        (self.id << 1) | 1
    }

    /// `begin(attributes)` (spec.md 4.3): installs the checkpoint (handled
    /// by the retry loop in `crate::atomically`), samples the clock,
    /// clears every log, opens the root operation.
    pub fn begin(&mut self, attrs: TxAttributes) {
        self.status = TxStatus::Active;
        self.attrs = attrs;
        self.snapshot = self.runtime.clock.read();
        self.read_set.reset();
        self.write_set.reset();
        self.oplog.reset();
        self.alloc_log.reset();
    }

    #[cfg(test)]
    pub(crate) fn begin_transaction(&mut self) {
        self.begin(TxAttributes::default());
    }

    pub fn current_op(&self) -> OpHandle {
        self.oplog.current()
    }

    pub fn begin_op(&mut self, opcode: Opcode, args: OpArgs) -> OpHandle {
        self.oplog.begin_op(opcode, args)
    }

    pub fn end_op(&mut self, op: OpHandle, ret: Option<usize>) {
        self.oplog.end_op(op, ret);
    }

    // --- shared-memory access primitives (spec.md 4.4) ---

    pub fn load(&mut self, addr: usize, width: Width, tag: Option<usize>) -> Result<TmValue> {
        // Read-your-own-writes: a buffered write to this address always
        // wins over shared state, since it will be what commit eventually
        // writes back.
        if let Some((_, value, _)) = self.write_set.find_latest_write_to(addr) {
            return Ok(value);
        }

        let slot = self.runtime.locks.slot_for(addr);
        match self.try_read(addr, slot, width, tag) {
            Ok(value) => Ok(value),
            Err(read) => match resolve_conflict(self, read, addr) {
                ConflictOutcome::Resume => {
                    self.runtime.stats.record_merge_resumed();
                    log::debug!("TX({}): load conflict at {addr:#x} resumed by merge", self.id);
                    Ok(self.read_set.get(read).value)
                }
                ConflictOutcome::Restart => {
                    self.runtime.stats.record_merge_restarted();
                    log::debug!("TX({}): load conflict at {addr:#x} forced a restart", self.id);
                    self.read_set.undo_read(read);
                    self.oplog.remove_read_from_op(self.read_set.get(read).op, read);
                    Err(TmError::Restart)
                }
                ConflictOutcome::Abort => {
                    log::debug!("TX({}): load conflict at {addr:#x} unresolved", self.id);
                    self.read_set.undo_read(read);
                    self.oplog.remove_read_from_op(self.read_set.get(read).op, read);
                    Err(TmError::Conflict)
                }
            },
        }
    }

    /// The inner body of spec.md 4.4's load algorithm, returning either the
    /// value or the freshly-inserted (still provisional) read record so
    /// the caller can hand it to the merge engine.
    fn try_read(
        &mut self,
        addr: usize,
        slot: crate::lock_table::LockSlot,
        width: Width,
        tag: Option<usize>,
    ) -> std::result::Result<TmValue, ReadHandle> {
        let owner = self.owner_id();
        let before = self.runtime.locks.read(slot);
        if let LockState::Locked { owner: held_by } = before {
            if held_by != owner {
                return Err(self.provisional_conflict(addr, slot, width, tag));
            }
        }

        let value = unsafe { read_raw(addr, width) };

        let after = self.runtime.locks.read(slot);
        if after != before {
            return Err(self.provisional_conflict(addr, slot, width, tag));
        }

        let version = match after {
            LockState::Unlocked { version } => version,
            LockState::Locked { owner: held_by } if held_by == owner => self.snapshot,
            LockState::Locked { .. } => return Err(self.provisional_conflict(addr, slot, width, tag)),
        };

        if version > self.snapshot {
            if self.try_extend() {
                self.snapshot = self.runtime.clock.read();
            } else {
                return Err(self.provisional_conflict(addr, slot, width, tag));
            }
        }

        let op = self.oplog.current();
        let handle = self.read_set.push(slot, version, addr, value, width, tag, op);
        self.oplog.attach_read(op, handle);
        Ok(value)
    }

    /// Inserts a placeholder read record standing in for the conflicting
    /// access, so the merge engine has something to repair (resolves the
    /// "no read record yet exists" ambiguity left open by spec.md: we would
    /// rather hand the merge engine a concrete, if provisional, record than
    /// special-case its absence).
    fn provisional_conflict(
        &mut self,
        addr: usize,
        slot: crate::lock_table::LockSlot,
        width: Width,
        tag: Option<usize>,
    ) -> ReadHandle {
        let op = self.oplog.current();
        let stale_value = unsafe { read_raw(addr, width) };
        let handle = self
            .read_set
            .push(slot, self.snapshot, addr, stale_value, width, tag, op);
        self.oplog.attach_read(op, handle);
        handle
    }

    /// Revalidates every live read against the current clock; on success
    /// the caller may advance its snapshot. Shared by the load-time
    /// extension attempt and commit step 4.
    pub fn try_extend(&self) -> bool {
        self.revalidate_against(self.runtime.clock.read())
    }

    pub fn revalidate_against(&self, ceiling: usize) -> bool {
        self.revalidate_filtered(ceiling, None)
    }

    /// Like [`Descriptor::revalidate_against`] but skips `except`: used
    /// after a merge callback has already vouched for that specific read
    /// (`MergeVerdict::Ok`), so its live lock-table version — still newer
    /// than `ceiling` by design — must not reconvert the repair into a
    /// restart.
    pub fn revalidate_except(&self, ceiling: usize, except: ReadHandle) -> bool {
        self.revalidate_filtered(ceiling, Some(except))
    }

    fn revalidate_filtered(&self, ceiling: usize, except: Option<ReadHandle>) -> bool {
        let owner = self.owner_id();
        for (h, rec) in self.read_set.iter() {
            if Some(h) == except {
                continue;
            }
            match self.runtime.locks.read(rec.slot) {
                LockState::Unlocked { version } => {
                    if version > ceiling {
                        return false;
                    }
                }
                LockState::Locked { owner: held_by } => {
                    if held_by != owner {
                        return false;
                    }
                }
            }
        }
        true
    }

    pub fn store(&mut self, addr: usize, value: TmValue, width: Width) {
        let slot = self.runtime.locks.slot_for(addr);
        let op = self.oplog.current();
        let handle = self.write_set.get_or_create(slot, op);
        self.write_set
            .append_triple(handle, crate::access::WriteTriple { addr, value, width });
        self.oplog.attach_write(op, handle);
    }

    pub fn did_read(&self, addr: usize) -> Option<ReadHandle> {
        self.read_set
            .iter()
            .filter(|(_, r)| r.addr == addr)
            .last()
            .map(|(h, _)| h)
    }

    pub fn did_write(&self, addr: usize) -> Option<WriteHandle> {
        self.write_set.find_latest_write_to(addr).map(|(h, _, _)| h)
    }

    pub fn undo_read(&mut self, h: ReadHandle) {
        let op = self.read_set.get(h).op;
        self.oplog.remove_read_from_op(op, h);
        self.read_set.undo_read(h);
    }

    pub fn undo_write(&mut self, h: WriteHandle) {
        let op = self.write_set.get(h).op;
        self.oplog.remove_write_from_op(op, h);
        self.write_set.undo_write(h);
    }

    /// `read_update`: a merge callback's way of repairing a stale read in
    /// place instead of undoing it. Refreshes both the cached value and the
    /// recorded version against the slot's current state, so a later
    /// revalidation pass over the rest of the read set (anything other than
    /// the specific read the merge walk was invoked for, see
    /// `commit::commit`'s use of `revalidate_except`) sees a record that is
    /// actually current rather than one still carrying its original stale
    /// version.
    pub fn read_update(&mut self, h: ReadHandle, value: TmValue) {
        let slot = self.read_set.get(h).slot;
        let version = match self.runtime.locks.read(slot) {
            LockState::Unlocked { version } => version,
            LockState::Locked { .. } => self.snapshot,
        };
        let rec = self.read_set.get_mut(h);
        rec.value = value;
        rec.version_at_read = version;
    }

    pub fn write_update(&mut self, h: WriteHandle, value: TmValue) {
        if let Some(last) = self.write_set.get(h).triples.last() {
            let addr = last.addr;
            let width = last.width;
            self.write_set.append_triple(h, crate::access::WriteTriple { addr, value, width });
        }
    }

    pub fn set_tag(&mut self, h: ReadHandle, tag: usize) {
        self.read_set.get_mut(h).tag = Some(tag);
    }

    pub fn get_tag(&self, h: ReadHandle) -> Option<usize> {
        self.read_set.get(h).tag
    }
}

/// Raw shared-memory read. `addr` is assumed to be a live pointer of at
/// least `width`'s size, per the host application's contract with the
/// runtime (the same assumption `tm.h`'s `TM_SHARED_READ` macros make).
unsafe fn read_raw(addr: usize, width: Width) -> TmValue {
    match width {
        Width::Word => TmValue::from_word(*(addr as *const usize)),
        Width::Ptr => TmValue::from_ptr(*(addr as *const *mut u8)),
        Width::Float => TmValue::from_f32(*(addr as *const f32)),
        Width::Double => TmValue::from_f64(*(addr as *const f64)),
    }
}

/// Raw shared-memory write, used only by the commit protocol once every
/// write-set slot has been locked.
pub(crate) unsafe fn write_raw(addr: usize, value: TmValue, width: Width) {
    match width {
        Width::Word => *(addr as *mut usize) = value.as_word(),
        Width::Ptr => *(addr as *mut *mut u8) = value.as_ptr(),
        Width::Float => *(addr as *mut f32) = value.as_f32(),
        Width::Double => *(addr as *mut f64) = value.as_f64(),
    }
}
