// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The commit protocol (spec.md 4.5).
//!
//! Eight steps: trivial-commit fast path, lock acquisition in ascending
//! slot order (spec.md 5's deadlock-avoidance discipline), clock advance,
//! conditional revalidation, write-back, unlock, allocator commit, close
//! the root operation. Steps 2 and 4 are the only ones that can fail.
//!
//! Design decision (documented in DESIGN.md): a step-2 lock-acquisition
//! failure has no specific stale read record to hand the merge engine, so
//! it always restarts directly rather than entering `merge::resolve_conflict`.
//! A step-4 revalidation failure does identify a specific stale read, so it
//! is routed through the merge engine exactly like a load-time conflict. Per
//! spec.md 7, an unrepaired conflict always escalates to a transparent
//! restart, never to a process-visible abort.

use crate::descriptor::{write_raw, Descriptor, TxSignal, TxStatus};
use crate::lock_table::{LockSlot, LockState};
use crate::merge::{resolve_conflict, ConflictOutcome};

pub fn commit(desc: &mut Descriptor) -> TxSignal {
    desc.status = TxStatus::Committing;

    // Step 1: trivial commit. A transaction with no buffered writes has no
    // shared-memory footprint to validate or publish.
    if desc.write_set.is_empty() {
        desc.oplog.end_op(desc.oplog.root(), None);
        desc.status = TxStatus::Idle;
        desc.runtime.stats.record_commit();
        return TxSignal::Continue;
    }

    let owner = desc.owner_id();
    let slots = desc.write_set.slots_ascending();

    // Step 2: lock acquisition, ascending slot order to avoid deadlock.
    let mut acquired: Vec<(LockSlot, usize)> = Vec::with_capacity(slots.len());
    for (slot, _) in &slots {
        match desc.runtime.locks.try_lock(*slot, owner) {
            Ok(prev_version) => acquired.push((*slot, prev_version)),
            Err(_) => {
                log::debug!("TX({}): locking slot {slot:?} failed, restarting", desc.id);
                release(desc, &acquired);
                desc.runtime.stats.record_abort();
                return TxSignal::Restart;
            }
        }
    }

    // Step 3.
    let new_version = desc.runtime.clock.advance();

    // Step 4: another transaction committed between our begin and our
    // locking; revalidate.
    if new_version != desc.snapshot + 2 && !desc.revalidate_against(desc.snapshot) {
        log::debug!("TX({}): validating read set failed at commit", desc.id);
        match find_stale_read(desc, owner) {
            Some(read) => {
                let addr = desc.read_set.get(read).addr;
                match resolve_conflict(desc, read, addr) {
                    // The merge callback repaired this specific read in
                    // place; re-validating it against the live lock table
                    // would immediately re-detect the same version bump it
                    // was just told to ignore (spec.md 3: "false sharing is
                    // acceptable and managed by the merge engine"). Trust the
                    // OK verdict for `read` and only revalidate every other
                    // live read.
                    ConflictOutcome::Resume if desc.revalidate_except(desc.snapshot, read) => {
                        desc.runtime.stats.record_merge_resumed();
                    }
                    ConflictOutcome::Resume => {
                        release(desc, &acquired);
                        return TxSignal::Restart;
                    }
                    ConflictOutcome::Restart => {
                        release(desc, &acquired);
                        desc.runtime.stats.record_merge_restarted();
                        return TxSignal::Restart;
                    }
                    ConflictOutcome::Abort => {
                        release(desc, &acquired);
                        desc.runtime.stats.record_abort();
                        return TxSignal::Restart;
                    }
                }
            }
            None => {
                release(desc, &acquired);
                return TxSignal::Restart;
            }
        }
    }

    // Step 5: publish buffered writes.
    for (_, handle) in &slots {
        let record = desc.write_set.get(*handle);
        for triple in &record.triples {
            unsafe { write_raw(triple.addr, triple.value, triple.width) };
        }
    }

    // Step 6: unlock with the new version.
    for (slot, _) in &acquired {
        desc.runtime.locks.unlock_with_version(*slot, new_version);
    }

    // Step 7: allocator log becomes real.
    desc.alloc_log.commit();

    // Step 8: close the root operation.
    desc.oplog.end_op(desc.oplog.root(), None);

    desc.status = TxStatus::Idle;
    desc.runtime.stats.record_commit();
    TxSignal::Continue
}

/// Publishes a transaction whose body ran and ended inside a hardware
/// transaction (spec.md 4.8). The hardware attempt is the linearisation
/// point: it already gave the buffered writes atomicity and isolation, so
/// there is no lock acquisition, clock advance, or revalidation to do here,
/// only making the write set's effects permanent and closing out the logs
/// the same way the software path's steps 5/7/8 do.
pub fn commit_hardware(desc: &mut Descriptor) {
    for (_, handle) in desc.write_set.slots_ascending() {
        let record = desc.write_set.get(handle);
        for triple in &record.triples {
            unsafe { write_raw(triple.addr, triple.value, triple.width) };
        }
    }

    desc.alloc_log.commit();
    desc.oplog.end_op(desc.oplog.root(), None);

    desc.status = TxStatus::Idle;
    desc.runtime.stats.record_commit();
    log::debug!("TX({}): committed in hardware", desc.id);
}

/// Restores every acquired lock to its pre-commit version, used whenever
/// commit backs out after step 2.
fn release(desc: &Descriptor, acquired: &[(LockSlot, usize)]) {
    for (slot, version) in acquired {
        desc.runtime.locks.unlock_restore(*slot, *version);
    }
}

fn find_stale_read(desc: &Descriptor, owner: usize) -> Option<crate::access::ReadHandle> {
    for (h, rec) in desc.read_set.iter() {
        match desc.runtime.locks.read(rec.slot) {
            LockState::Unlocked { version } if version > desc.snapshot => return Some(h),
            LockState::Locked { owner: held_by } if held_by != owner => return Some(h),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{TmValue, Width};
    use crate::descriptor::TxAttributes;
    use crate::lifecycle::RuntimeShared;
    use crate::merge::{MergeContext, MergeVerdict};
    use crate::opcode::MergePolicy;
    use std::sync::Arc;

    #[test]
    fn write_only_commit_publishes_and_unlocks() {
        let rt = Arc::new(RuntimeShared::for_testing());
        let mut d = Descriptor::new(0, rt.clone());
        d.begin(TxAttributes::default());

        let mut cell: usize = 0;
        let addr = &mut cell as *mut usize as usize;
        d.store(addr, TmValue::from_word(55), Width::Word);

        let signal = commit(&mut d);
        assert_eq!(signal, TxSignal::Continue);
        assert_eq!(cell, 55);

        let slot = rt.locks.slot_for(addr);
        assert!(matches!(rt.locks.read(slot), LockState::Unlocked { .. }));
    }

    #[test]
    fn empty_transaction_commits_trivially() {
        let rt = Arc::new(RuntimeShared::for_testing());
        let mut d = Descriptor::new(0, rt);
        d.begin(TxAttributes::default());
        assert_eq!(commit(&mut d), TxSignal::Continue);
    }

    #[test]
    fn commit_hardware_publishes_without_touching_the_lock_table() {
        let rt = Arc::new(RuntimeShared::for_testing());
        let mut d = Descriptor::new(0, rt.clone());
        d.begin(TxAttributes::default());

        let mut cell: usize = 0;
        let addr = &mut cell as *mut usize as usize;
        d.store(addr, TmValue::from_word(7), Width::Word);

        let slot = rt.locks.slot_for(addr);
        let before = rt.locks.read(slot);

        commit_hardware(&mut d);

        assert_eq!(cell, 7);
        assert_eq!(rt.locks.read(slot), before, "a hardware commit never touches the lock table");
    }

    #[test]
    fn merge_ok_verdict_is_not_reconverted_into_a_restart_by_blanket_revalidation() {
        fn bump_merge(ctx: &mut MergeContext) -> MergeVerdict {
            let fresh = unsafe { *(ctx.addr as *const usize) };
            ctx.descriptor.read_update(ctx.read, TmValue::from_word(fresh));
            MergeVerdict::Ok
        }

        let rt = Arc::new(RuntimeShared::for_testing());
        let op = rt
            .opcodes
            .register(
                "bump",
                MergePolicy {
                    just_in_time: Some(bump_merge),
                    delayed: None,
                },
            )
            .unwrap();

        let mut d = Descriptor::new(0, rt.clone());
        d.begin(TxAttributes::default());

        let mut watched: usize = 1;
        let watched_addr = &mut watched as *mut usize as usize;
        let mut cell: usize = 0;
        let addr = &mut cell as *mut usize as usize;

        let _scope = d.begin_op(op, vec![]);
        let _ = d.load(watched_addr, Width::Word, None).unwrap();
        d.store(addr, TmValue::from_word(1), Width::Word);

        // Perturb `watched_addr`'s slot between the read and commit, the way
        // a concurrent committer would bump an unrelated version (spec.md 3:
        // false sharing), without actually changing the value our read saw.
        let slot = rt.locks.slot_for(watched_addr);
        let prev = rt.locks.try_lock(slot, 0xBEEF).expect("uncontended in this test");
        let bumped = rt.clock.advance();
        rt.locks.unlock_with_version(slot, bumped.max(prev + 2));

        let signal = commit(&mut d);
        assert_eq!(
            signal,
            TxSignal::Continue,
            "a merge OK verdict on one read must not be reconverted into a restart \
             by revalidating that same read again"
        );
        assert_eq!(cell, 1);
    }

    #[test]
    fn lock_held_by_other_forces_restart() {
        let rt = Arc::new(RuntimeShared::for_testing());
        let mut d = Descriptor::new(0, rt.clone());
        d.begin(TxAttributes::default());

        let mut cell: usize = 0;
        let addr = &mut cell as *mut usize as usize;
        d.store(addr, TmValue::from_word(1), Width::Word);

        let slot = rt.locks.slot_for(addr);
        rt.locks.try_lock(slot, 999).unwrap();

        assert_eq!(commit(&mut d), TxSignal::Restart);
    }
}
