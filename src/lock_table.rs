// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The versioned-lock table (spec.md 4.2).
//!
//! A fixed, power-of-two-sized array of single-word locks. An address maps
//! to a slot by shifting off the low alignment bits and masking to the table
//! size, the same address-to-slot scheme `tm.h`'s `GET_LOCK`/`TX_GET_LOCK`
//! macros use. A lock word's low bit distinguishes the two states: even
//! means "unlocked, value is a version"; odd means "locked, value is
//! `(owner_id << 1) | 1`".

use std::sync::atomic::{AtomicUsize, Ordering};

/// log2 of the lock table size. 2^20 slots, matching the teacher's
/// `VersionLock` table sizing order of magnitude.
const TABLE_BITS: u32 = 20;
const TABLE_SIZE: usize = 1 << TABLE_BITS;
const TABLE_MASK: usize = TABLE_SIZE - 1;

/// Bytes of address granularity folded into a single slot. Matches typical
/// word alignment so adjacent words don't all collide on the same slot.
const ADDR_SHIFT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSlot(pub usize);

/// A lock word's decoded state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked { version: usize },
    Locked { owner: usize },
}

fn decode(word: usize) -> LockState {
    if word & 1 == 0 {
        LockState::Unlocked { version: word }
    } else {
        LockState::Locked { owner: word >> 1 }
    }
}

fn encode_locked(owner: usize) -> usize {
    (owner << 1) | 1
}

pub struct LockTable {
    slots: Vec<AtomicUsize>,
}

impl LockTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(TABLE_SIZE);
        slots.resize_with(TABLE_SIZE, AtomicUsize::new);
        Self { slots }
    }

    /// Maps an address to its lock slot (spec.md 4.2: "addresses map to
    /// slots via shift-and-mask").
    pub fn slot_for(&self, addr: usize) -> LockSlot {
        LockSlot((addr >> ADDR_SHIFT) & TABLE_MASK)
    }

    pub fn read(&self, slot: LockSlot) -> LockState {
        decode(self.slots[slot.0].load(Ordering::Acquire))
    }

    /// Attempts to acquire the slot for `owner`, succeeding only if it was
    /// unlocked and its version is not newer than `snapshot`. Returns the
    /// observed version on success so the caller can detect its own
    /// already-held lock (self-conflict) cheaply.
    pub fn try_lock(&self, slot: LockSlot, owner: usize) -> Result<usize, LockState> {
        let word = self.slots[slot.0].load(Ordering::Acquire);
        match decode(word) {
            LockState::Locked { owner: held_by } => Err(LockState::Locked { owner: held_by }),
            LockState::Unlocked { version } => {
                match self.slots[slot.0].compare_exchange(
                    word,
                    encode_locked(owner),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => Ok(version),
                    Err(now) => Err(decode(now)),
                }
            }
        }
    }

    /// Releases `slot`, installing `new_version` as its unlocked version.
    /// `new_version` must be even (spec.md invariant: versions are always
    /// even numbers taken from the global clock).
    pub fn unlock_with_version(&self, slot: LockSlot, new_version: usize) {
        debug_assert_eq!(new_version & 1, 0, "lock versions must be even");
        self.slots[slot.0].store(new_version, Ordering::Release);
    }

    /// Releases `slot` back to its pre-lock version, used on abort.
    pub fn unlock_restore(&self, slot: LockSlot, version: usize) {
        self.unlock_with_version(slot, version);
    }

    pub fn is_locked_by(&self, slot: LockSlot, owner: usize) -> bool {
        matches!(self.read(slot), LockState::Locked { owner: o } if o == owner)
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_mapping_is_stable_and_masked() {
        let table = LockTable::new();
        let a = table.slot_for(0x1000);
        let b = table.slot_for(0x1000);
        assert_eq!(a, b);
        assert!(a.0 < TABLE_SIZE);
    }

    #[test]
    fn lock_unlock_roundtrip() {
        let table = LockTable::new();
        let slot = table.slot_for(0x4000);

        let v0 = table.try_lock(slot, 7).expect("should acquire free lock");
        assert_eq!(v0, 0);
        assert!(table.is_locked_by(slot, 7));

        assert!(table.try_lock(slot, 9).is_err(), "second owner must fail");

        table.unlock_with_version(slot, 42);
        assert_eq!(table.read(slot), LockState::Unlocked { version: 42 });
    }

    #[test]
    fn lock_rejects_stale_owner_after_version_bump() {
        let table = LockTable::new();
        let slot = table.slot_for(0x8000);

        table.try_lock(slot, 1).unwrap();
        table.unlock_with_version(slot, 10);

        let v = table.try_lock(slot, 2).unwrap();
        assert_eq!(v, 10);
        table.unlock_restore(slot, 10);
    }
}
