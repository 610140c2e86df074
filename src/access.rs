// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Shared-memory access primitives (spec.md 4.4).
//!
//! One load/store pair per access width. Values are boxed into a single
//! [`TmValue`] wide enough for the widest primitive (spec.md 3: "the
//! observed value, sufficient for the widest primitive"), and the read/
//! write sets are arenas of stable handles for the same cyclic-structure
//! reason as [`crate::oplog`].

use crate::lock_table::LockSlot;
use crate::oplog::OpHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Word,
    Ptr,
    Float,
    Double,
}

/// A value wide enough to hold any supported access width, stored as raw
/// bits. Width-specific helpers convert at the edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmValue(pub u64);

impl TmValue {
    pub fn from_word(v: usize) -> Self {
        TmValue(v as u64)
    }
    pub fn as_word(self) -> usize {
        self.0 as usize
    }
    pub fn from_ptr(p: *mut u8) -> Self {
        TmValue(p as u64)
    }
    pub fn as_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }
    pub fn from_f32(v: f32) -> Self {
        TmValue(v.to_bits() as u64)
    }
    pub fn as_f32(self) -> f32 {
        f32::from_bits(self.0 as u32)
    }
    pub fn from_f64(v: f64) -> Self {
        TmValue(v.to_bits())
    }
    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadHandle(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteHandle(pub usize);

pub struct ReadRecord {
    pub slot: LockSlot,
    pub version_at_read: usize,
    pub addr: usize,
    pub value: TmValue,
    pub width: Width,
    pub tag: Option<usize>,
    pub op: OpHandle,
    pub prev: Option<ReadHandle>,
    pub next: Option<ReadHandle>,
    /// Tombstoned entries keep their slot alive so neighbouring `prev`/
    /// `next` links stay valid after `undo_read`, but are skipped by
    /// iteration and revalidation.
    pub live: bool,
}

#[derive(Clone, Copy)]
pub struct WriteTriple {
    pub addr: usize,
    pub value: TmValue,
    pub width: Width,
}

pub struct WriteRecord {
    pub slot: LockSlot,
    pub op: OpHandle,
    pub triples: Vec<WriteTriple>,
    pub live: bool,
}

/// Per-transaction arena of read records, kept as a doubly linked list over
/// a `Vec` so insertion order (invariant 3) survives `undo_read` splices.
#[derive(Default)]
pub struct ReadSet {
    records: Vec<ReadRecord>,
    head: Option<ReadHandle>,
    tail: Option<ReadHandle>,
}

impl ReadSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.records.clear();
        self.head = None;
        self.tail = None;
    }

    pub fn push(
        &mut self,
        slot: LockSlot,
        version_at_read: usize,
        addr: usize,
        value: TmValue,
        width: Width,
        tag: Option<usize>,
        op: OpHandle,
    ) -> ReadHandle {
        let handle = ReadHandle(self.records.len());
        let prev = self.tail;
        self.records.push(ReadRecord {
            slot,
            version_at_read,
            addr,
            value,
            width,
            tag,
            op,
            prev,
            next: None,
            live: true,
        });
        if let Some(p) = prev {
            self.records[p.0].next = Some(handle);
        } else {
            self.head = Some(handle);
        }
        self.tail = Some(handle);
        handle
    }

    pub fn get(&self, h: ReadHandle) -> &ReadRecord {
        &self.records[h.0]
    }

    pub fn get_mut(&mut self, h: ReadHandle) -> &mut ReadRecord {
        &mut self.records[h.0]
    }

    /// `undo_read`: splices `h` out of the linked order while preserving it
    /// for the surviving neighbours (spec.md 4.6, testable property
    /// "read-set ordering preserved across undo").
    pub fn undo_read(&mut self, h: ReadHandle) {
        let (prev, next) = {
            let rec = &self.records[h.0];
            (rec.prev, rec.next)
        };
        match prev {
            Some(p) => self.records[p.0].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.records[n.0].prev = prev,
            None => self.tail = prev,
        }
        self.records[h.0].live = false;
        log::trace!("read-set: tombstoned {h:?} at {:#x}", self.records[h.0].addr);
    }

    /// Iterates live reads in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (ReadHandle, &ReadRecord)> {
        let mut cur = self.head;
        std::iter::from_fn(move || {
            let h = cur?;
            let rec = &self.records[h.0];
            cur = rec.next;
            Some((h, rec))
        })
    }

    /// `get_load_next(read, same_op, reverse)`: walks the ordered chain from
    /// `read`, optionally restricted to records in the same operation.
    pub fn get_load_next(
        &self,
        read: ReadHandle,
        same_op: bool,
        reverse: bool,
    ) -> Option<ReadHandle> {
        let rec = &self.records[read.0];
        let mut cur = if reverse { rec.prev } else { rec.next };
        while let Some(h) = cur {
            let candidate = &self.records[h.0];
            if !candidate.live {
                cur = if reverse { candidate.prev } else { candidate.next };
                continue;
            }
            if !same_op || Same::op(candidate.op, rec.op) {
                return Some(h);
            }
            cur = if reverse { candidate.prev } else { candidate.next };
        }
        None
    }

    /// `get_load_last(op)`: the most recent live read attributed to `op`.
    pub fn get_load_last(&self, op: OpHandle) -> Option<ReadHandle> {
        let mut cur = self.tail;
        while let Some(h) = cur {
            let rec = &self.records[h.0];
            if rec.live && Same::op(rec.op, op) {
                return Some(h);
            }
            cur = rec.prev;
        }
        None
    }
}

struct Same;
impl Same {
    fn op(a: OpHandle, b: OpHandle) -> bool {
        a.0 == b.0
    }
}

#[derive(Default)]
pub struct WriteSet {
    records: Vec<WriteRecord>,
    by_slot: std::collections::HashMap<usize, WriteHandle>,
}

impl WriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.records.clear();
        self.by_slot.clear();
    }

    pub fn find_by_slot(&self, slot: LockSlot) -> Option<WriteHandle> {
        self.by_slot.get(&slot.0).copied()
    }

    /// Looks up the write record for `slot`, creating one lazily under `op`
    /// if absent (spec.md 4.4: "look up the existing write record (create
    /// one if absent...)").
    pub fn get_or_create(&mut self, slot: LockSlot, op: OpHandle) -> WriteHandle {
        if let Some(h) = self.find_by_slot(slot) {
            return h;
        }
        let handle = WriteHandle(self.records.len());
        self.records.push(WriteRecord {
            slot,
            op,
            triples: Vec::new(),
            live: true,
        });
        self.by_slot.insert(slot.0, handle);
        handle
    }

    pub fn append_triple(&mut self, h: WriteHandle, triple: WriteTriple) {
        self.records[h.0].triples.push(triple);
    }

    pub fn get(&self, h: WriteHandle) -> &WriteRecord {
        &self.records[h.0]
    }

    pub fn undo_write(&mut self, h: WriteHandle) {
        let slot = self.records[h.0].slot;
        self.records[h.0].live = false;
        self.records[h.0].triples.clear();
        self.by_slot.remove(&slot.0);
    }

    /// Slots in ascending order, the commit protocol's lock-acquisition
    /// order (spec.md 5: "locks are acquired in ascending slot-index order
    /// at commit to avoid deadlock").
    pub fn slots_ascending(&self) -> Vec<(LockSlot, WriteHandle)> {
        let mut out: Vec<(LockSlot, WriteHandle)> = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.live)
            .map(|(i, r)| (r.slot, WriteHandle(i)))
            .collect();
        out.sort_by_key(|(slot, _)| slot.0);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.records.iter().all(|r| !r.live)
    }

    /// Finds the most recent buffered write to `addr`, for read-your-own-
    /// writes semantics and `did_write`.
    pub fn find_latest_write_to(&self, addr: usize) -> Option<(WriteHandle, TmValue, Width)> {
        for (i, rec) in self.records.iter().enumerate().rev() {
            if !rec.live {
                continue;
            }
            if let Some(t) = rec.triples.iter().rev().find(|t| t.addr == addr) {
                return Some((WriteHandle(i), t.value, t.width));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::OpHandle;

    fn slot(n: usize) -> LockSlot {
        LockSlot(n)
    }

    #[test]
    fn read_set_preserves_order_after_undo() {
        let mut rs = ReadSet::new();
        let op = OpHandle(0);
        let a = rs.push(slot(1), 0, 0x10, TmValue::from_word(1), Width::Word, None, op);
        let b = rs.push(slot(2), 0, 0x20, TmValue::from_word(2), Width::Word, None, op);
        let c = rs.push(slot(3), 0, 0x30, TmValue::from_word(3), Width::Word, None, op);

        rs.undo_read(b);

        let order: Vec<usize> = rs.iter().map(|(h, _)| h.0).collect();
        assert_eq!(order, vec![a.0, c.0]);
    }

    #[test]
    fn write_set_buffers_multiple_triples_per_slot() {
        let mut ws = WriteSet::new();
        let op = OpHandle(0);
        let h = ws.get_or_create(slot(5), op);
        ws.append_triple(
            h,
            WriteTriple {
                addr: 0x100,
                value: TmValue::from_word(1),
                width: Width::Word,
            },
        );
        ws.append_triple(
            h,
            WriteTriple {
                addr: 0x108,
                value: TmValue::from_word(2),
                width: Width::Word,
            },
        );
        assert_eq!(ws.get(h).triples.len(), 2);
        assert_eq!(ws.slots_ascending(), vec![(slot(5), h)]);
    }

    #[test]
    fn find_latest_write_returns_most_recent() {
        let mut ws = WriteSet::new();
        let op = OpHandle(0);
        let h = ws.get_or_create(slot(1), op);
        ws.append_triple(
            h,
            WriteTriple {
                addr: 0x200,
                value: TmValue::from_word(10),
                width: Width::Word,
            },
        );
        ws.append_triple(
            h,
            WriteTriple {
                addr: 0x200,
                value: TmValue::from_word(20),
                width: Width::Word,
            },
        );
        let (_, val, _) = ws.find_latest_write_to(0x200).unwrap();
        assert_eq!(val.as_word(), 20);
    }
}
