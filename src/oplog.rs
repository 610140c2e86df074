// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The operation log (spec.md 4.6).
//!
//! Operations bracket regions of transactional code the application can
//! describe semantically. They form a tree rooted at an implicit `ROOT`
//! operation opened by every transaction (SPEC_FULL.md 3). Per the cyclic-
//! structure design note in spec.md 9, the tree is stored as an arena of
//! stable indices rather than as boxed nodes with real pointers — parent,
//! first-child and next-sibling links are all just other indices into the
//! same `Vec`, and the whole arena is cleared (not reallocated) at `begin()`.

use crate::access::{ReadHandle, WriteHandle};
use crate::opcode::{OpArgs, Opcode, ROOT_OPCODE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpHandle(pub usize);

pub struct OpRecord {
    pub opcode: Opcode,
    pub args: OpArgs,
    pub ret: Option<usize>,
    pub parent: Option<OpHandle>,
    pub first_child: Option<OpHandle>,
    pub next_sibling: Option<OpHandle>,
    pub reads: Vec<ReadHandle>,
    pub writes: Vec<WriteHandle>,
    pub closed: bool,
}

/// Arena backing one transaction descriptor's operation tree.
pub struct OpLog {
    records: Vec<OpRecord>,
    /// The currently open operation; reads/writes are attributed here.
    current: OpHandle,
    root: OpHandle,
}

impl OpLog {
    /// Fresh log with only the root operation open, as `begin()` requires.
    pub fn new() -> Self {
        let root = OpRecord {
            opcode: ROOT_OPCODE,
            args: Vec::new(),
            ret: None,
            parent: None,
            first_child: None,
            next_sibling: None,
            reads: Vec::new(),
            writes: Vec::new(),
            closed: false,
        };
        Self {
            records: vec![root],
            current: OpHandle(0),
            root: OpHandle(0),
        }
    }

    /// Resets the arena in place for the next `begin()`, per the "reset at
    /// begin" design note (spec.md 9). Avoids reallocating the backing Vec.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn root(&self) -> OpHandle {
        self.root
    }

    pub fn current(&self) -> OpHandle {
        self.current
    }

    fn rec(&self, op: OpHandle) -> &OpRecord {
        &self.records[op.0]
    }

    fn rec_mut(&mut self, op: OpHandle) -> &mut OpRecord {
        &mut self.records[op.0]
    }

    /// `begin_op`: pushes a new child of the currently open operation and
    /// makes it current. Implements invariant 5 (nesting reflects exactly
    /// when each op was opened).
    pub fn begin_op(&mut self, opcode: Opcode, args: OpArgs) -> OpHandle {
        let parent = self.current;
        let handle = OpHandle(self.records.len());
        self.records.push(OpRecord {
            opcode,
            args,
            ret: None,
            parent: Some(parent),
            first_child: None,
            next_sibling: None,
            reads: Vec::new(),
            writes: Vec::new(),
            closed: false,
        });

        let prev_first_child = self.rec(parent).first_child;
        self.rec_mut(handle).next_sibling = prev_first_child;
        self.rec_mut(parent).first_child = Some(handle);

        self.current = handle;
        handle
    }

    /// `end_op`: closes `op`, installs the return value, and restores the
    /// parent as the currently open operation. The closed operation remains
    /// eligible for delayed merges (spec.md 4.6, 4.7).
    pub fn end_op(&mut self, op: OpHandle, ret: Option<usize>) {
        {
            let rec = self.rec_mut(op);
            rec.ret = ret;
            rec.closed = true;
        }
        if let Some(parent) = self.rec(op).parent {
            self.current = parent;
        }
    }

    pub fn attach_read(&mut self, op: OpHandle, read: ReadHandle) {
        self.rec_mut(op).reads.push(read);
    }

    pub fn attach_write(&mut self, op: OpHandle, write: WriteHandle) {
        self.rec_mut(op).writes.push(write);
    }

    // --- accessors (spec.md 4.6) ---

    pub fn get_op_opcode(&self, op: OpHandle) -> Opcode {
        self.rec(op).opcode
    }

    pub fn get_op_args(&self, op: OpHandle) -> &OpArgs {
        &self.rec(op).args
    }

    pub fn get_op_ret(&self, op: OpHandle) -> Option<usize> {
        self.rec(op).ret
    }

    /// `set_op_ret`: overwrites an operation's return-value slot in place,
    /// open or closed. This is how a merge callback's repair propagates
    /// upward (spec.md 4.7): a delayed callback on the parent later reads
    /// it back via `get_op_ret`.
    pub fn set_op_ret(&mut self, op: OpHandle, ret: Option<usize>) {
        self.rec_mut(op).ret = ret;
    }

    pub fn parent_of(&self, op: OpHandle) -> Option<OpHandle> {
        self.rec(op).parent
    }

    pub fn is_closed(&self, op: OpHandle) -> bool {
        self.rec(op).closed
    }

    pub fn reads_of(&self, op: OpHandle) -> &[ReadHandle] {
        &self.rec(op).reads
    }

    pub fn writes_of(&self, op: OpHandle) -> &[WriteHandle] {
        &self.rec(op).writes
    }

    /// `same_opid`: operations compare equal iff they are the same arena slot.
    pub fn same_opid(a: OpHandle, b: OpHandle) -> bool {
        a.0 == b.0
    }

    /// `find_op_descendant`: depth-first search of `op`'s subtree for the
    /// first (nearest, in pre-order) operation with the given opcode.
    pub fn find_op_descendant(&self, op: OpHandle, opcode: Opcode) -> Option<OpHandle> {
        let mut child = self.rec(op).first_child;
        while let Some(c) = child {
            if self.rec(c).opcode == opcode {
                return Some(c);
            }
            if let Some(found) = self.find_op_descendant(c, opcode) {
                return Some(found);
            }
            child = self.rec(c).next_sibling;
        }
        None
    }

    /// `undo_op_descendants`: removes every descendant of `op` carrying
    /// `opcode`, together with reads/writes attributed to them. Returns the
    /// removed reads/writes so the caller (descriptor) can splice them out
    /// of the read/write set proper.
    pub fn undo_op_descendants(
        &mut self,
        op: OpHandle,
        opcode: Opcode,
    ) -> (Vec<ReadHandle>, Vec<WriteHandle>) {
        let mut removed_reads = Vec::new();
        let mut removed_writes = Vec::new();
        let mut stack: Vec<OpHandle> = Vec::new();

        let mut child = self.rec(op).first_child;
        let mut keep_head: Option<OpHandle> = None;
        let mut keep_tail: Option<OpHandle> = None;
        while let Some(c) = child {
            let next = self.rec(c).next_sibling;
            if self.rec(c).opcode == opcode {
                stack.push(c);
            } else if keep_head.is_none() {
                keep_head = Some(c);
                keep_tail = Some(c);
            } else {
                self.rec_mut(keep_tail.unwrap()).next_sibling = Some(c);
                keep_tail = Some(c);
            }
            child = next;
        }
        if let Some(tail) = keep_tail {
            self.rec_mut(tail).next_sibling = None;
        }
        self.rec_mut(op).first_child = keep_head;

        while let Some(node) = stack.pop() {
            removed_reads.extend(self.rec(node).reads.iter().copied());
            removed_writes.extend(self.rec(node).writes.iter().copied());
            let mut gc = self.rec(node).first_child;
            while let Some(g) = gc {
                stack.push(g);
                gc = self.rec(g).next_sibling;
            }
        }

        (removed_reads, removed_writes)
    }

    /// `clear_op`: resets a closed operation as if its body had not
    /// executed, dropping the given reads/writes/children attribution.
    /// Caller is responsible for unwinding those handles from the
    /// descriptor-level read/write set.
    pub fn clear_op(&mut self, op: OpHandle) -> (Vec<ReadHandle>, Vec<WriteHandle>) {
        let rec = self.rec_mut(op);
        let reads = std::mem::take(&mut rec.reads);
        let writes = std::mem::take(&mut rec.writes);
        rec.ret = None;
        rec.closed = false;
        rec.first_child = None;
        (reads, writes)
    }

    pub fn remove_read_from_op(&mut self, op: OpHandle, read: ReadHandle) {
        self.rec_mut(op).reads.retain(|r| *r != read);
    }

    pub fn remove_write_from_op(&mut self, op: OpHandle, write: WriteHandle) {
        self.rec_mut(op).writes.retain(|w| *w != write);
    }
}

impl Default for OpLog {
    fn default() -> Self {
        Self::new()
    }
}
