// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # tm-core
//!
//! A hybrid HTM/STM transactional memory runtime with a merge-aware
//! operation log. `TM_BEGIN`/`TM_END` become [`atomically`]; the
//! shared-memory load/store wrappers, the operation-logging façade, and the
//! conflict-detection / merge / commit machinery are exposed through
//! [`Transaction`].
//!
//! Everything the host application needs is: register opcodes and their
//! merge callbacks at [`startup`], then wrap each critical section in
//! [`atomically`].
#![allow(clippy::type_complexity)]

pub mod access;
pub mod alloc;
pub mod clock;
pub mod commit;
pub mod descriptor;
pub mod error;
pub mod htm;
pub mod lifecycle;
pub mod lock_table;
pub mod merge;
pub mod opcode;
pub mod oplog;
pub mod stats;

pub use access::{TmValue, Width};
pub use alloc::AllocHandle;
pub use descriptor::{Descriptor, TxAttributes, TxSignal, TxStatus};
pub use error::{Result, TmError};
pub use lifecycle::{shutdown, startup, RuntimeShared};
pub use merge::{MergeContext, MergeVerdict};
pub use opcode::{MergeCallback, MergePolicy, OpArgs, Opcode, OpcodeRegistry, ROOT_OPCODE};
pub use oplog::OpHandle;

use access::{ReadHandle, WriteHandle};
use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    static DESCRIPTOR: RefCell<Option<Descriptor>> = RefCell::new(None);
}

/// The handle a transaction body operates through. Borrowed for the
/// duration of one attempt; a restart drops it and rebuilds a fresh one
/// against the same descriptor (spec.md 9: "wrap each transaction body in
/// a loop... mark the body as non-returning except through a commit
/// success").
pub struct Transaction<'a> {
    desc: &'a mut Descriptor,
}

impl<'a> Transaction<'a> {
    pub fn load_word(&mut self, addr: usize) -> Result<usize> {
        self.desc.load(addr, Width::Word, None).map(TmValue::as_word)
    }

    pub fn store_word(&mut self, addr: usize, value: usize) {
        self.desc.store(addr, TmValue::from_word(value), Width::Word);
    }

    pub fn load_ptr(&mut self, addr: usize) -> Result<*mut u8> {
        self.desc.load(addr, Width::Ptr, None).map(TmValue::as_ptr)
    }

    pub fn store_ptr(&mut self, addr: usize, value: *mut u8) {
        self.desc.store(addr, TmValue::from_ptr(value), Width::Ptr);
    }

    pub fn load_float(&mut self, addr: usize) -> Result<f32> {
        self.desc.load(addr, Width::Float, None).map(TmValue::as_f32)
    }

    pub fn store_float(&mut self, addr: usize, value: f32) {
        self.desc.store(addr, TmValue::from_f32(value), Width::Float);
    }

    pub fn load_double(&mut self, addr: usize) -> Result<f64> {
        self.desc.load(addr, Width::Double, None).map(TmValue::as_f64)
    }

    pub fn store_double(&mut self, addr: usize, value: f64) {
        self.desc.store(addr, TmValue::from_f64(value), Width::Double);
    }

    /// `load_tag`: a load that additionally attaches an advisory semantic
    /// tag to the resulting read record (spec.md 4.4).
    pub fn load_tag(&mut self, addr: usize, width: Width, tag: usize) -> Result<TmValue> {
        self.desc.load(addr, width, Some(tag))
    }

    pub fn did_read(&self, addr: usize) -> Option<ReadHandle> {
        self.desc.did_read(addr)
    }

    pub fn did_write(&self, addr: usize) -> Option<WriteHandle> {
        self.desc.did_write(addr)
    }

    pub fn undo_read(&mut self, h: ReadHandle) {
        self.desc.undo_read(h);
    }

    pub fn undo_write(&mut self, h: WriteHandle) {
        self.desc.undo_write(h);
    }

    pub fn read_update(&mut self, h: ReadHandle, value: TmValue) {
        self.desc.read_update(h, value);
    }

    pub fn write_update(&mut self, h: WriteHandle, value: TmValue) {
        self.desc.write_update(h, value);
    }

    pub fn set_tag(&mut self, h: ReadHandle, tag: usize) {
        self.desc.set_tag(h, tag);
    }

    pub fn get_tag(&self, h: ReadHandle) -> Option<usize> {
        self.desc.get_tag(h)
    }

    // --- operation log (spec.md 4.6) ---

    pub fn current_op(&self) -> OpHandle {
        self.desc.current_op()
    }

    pub fn begin_op(&mut self, opcode: Opcode, args: OpArgs) -> OpHandle {
        self.desc.begin_op(opcode, args)
    }

    pub fn end_op(&mut self, op: OpHandle, ret: Option<usize>) {
        self.desc.end_op(op, ret);
    }

    pub fn get_op_opcode(&self, op: OpHandle) -> Opcode {
        self.desc.oplog.get_op_opcode(op)
    }

    pub fn get_op_args(&self, op: OpHandle) -> &OpArgs {
        self.desc.oplog.get_op_args(op)
    }

    pub fn get_op_ret(&self, op: OpHandle) -> Option<usize> {
        self.desc.oplog.get_op_ret(op)
    }

    pub fn get_load_op(&self, read: ReadHandle) -> OpHandle {
        self.desc.read_set.get(read).op
    }

    pub fn get_store_op(&self, write: WriteHandle) -> OpHandle {
        self.desc.write_set.get(write).op
    }

    pub fn get_load_next(&self, read: ReadHandle, same_op: bool, reverse: bool) -> Option<ReadHandle> {
        self.desc.read_set.get_load_next(read, same_op, reverse)
    }

    pub fn get_load_last(&self, op: OpHandle) -> Option<ReadHandle> {
        self.desc.read_set.get_load_last(op)
    }

    pub fn same_opid(&self, a: OpHandle, b: OpHandle) -> bool {
        oplog::OpLog::same_opid(a, b)
    }

    pub fn find_op_descendant(&self, op: OpHandle, opcode: Opcode) -> Option<OpHandle> {
        self.desc.oplog.find_op_descendant(op, opcode)
    }

    pub fn undo_op_descendants(&mut self, op: OpHandle, opcode: Opcode) {
        let (reads, writes) = self.desc.oplog.undo_op_descendants(op, opcode);
        for r in reads {
            self.desc.read_set.undo_read(r);
        }
        for w in writes {
            self.desc.write_set.undo_write(w);
        }
    }

    pub fn clear_op(&mut self, op: OpHandle) {
        let (reads, writes) = self.desc.oplog.clear_op(op);
        for r in reads {
            self.desc.read_set.undo_read(r);
        }
        for w in writes {
            self.desc.write_set.undo_write(w);
        }
    }

    // --- allocator (spec.md 4.9) ---

    pub fn tx_malloc(&mut self, size: usize, align: usize) -> Result<*mut u8> {
        self.desc.alloc_log.tx_malloc(size, align).map(|(ptr, _)| ptr)
    }

    pub fn tx_free(&mut self, ptr: *mut u8, size: usize, align: usize) -> Result<()> {
        self.desc.alloc_log.tx_free(ptr, size, align).map(|_| ())
    }

    pub fn did_malloc(&self, ptr: *mut u8) -> Option<AllocHandle> {
        self.desc.alloc_log.did_malloc(ptr)
    }

    pub fn did_free(&self, ptr: *mut u8) -> Option<AllocHandle> {
        self.desc.alloc_log.did_free(ptr)
    }

    pub fn undo_malloc(&mut self, h: AllocHandle) {
        self.desc.alloc_log.undo_malloc(h);
    }

    pub fn undo_free(&mut self, h: AllocHandle) {
        self.desc.alloc_log.undo_free(h);
    }

    /// `restart()`: signals that the current attempt must be abandoned and
    /// retried from `begin()`, without treating it as a hard failure.
    pub fn restart(&self) -> TmError {
        TmError::Restart
    }
}

/// `thread_enter()` / `thread_exit()` wrapped around the thread-local
/// descriptor's lifetime: the first [`atomically`] call on a thread
/// registers it; there is no explicit teardown API since Rust drops the
/// thread-local storage automatically. Exposed for hosts that want to
/// register up front.
pub fn thread_enter(runtime: &Arc<RuntimeShared>) -> Result<()> {
    ensure_descriptor(runtime)
}

pub fn thread_exit(runtime: &Arc<RuntimeShared>) {
    DESCRIPTOR.with(|cell| {
        if let Some(desc) = cell.borrow().as_ref() {
            runtime.thread_exit(desc.id);
        }
        *cell.borrow_mut() = None;
    });
}

/// `thread_barrier_wait()`: blocks the calling thread until every
/// registered thread has reached the same point (spec.md 2/6's "light
/// barriers").
pub fn thread_barrier_wait(runtime: &Arc<RuntimeShared>) {
    runtime.thread_barrier_wait();
}

fn ensure_descriptor(runtime: &Arc<RuntimeShared>) -> Result<()> {
    DESCRIPTOR.with(|cell| {
        let mut slot = cell.borrow_mut();
        let needs_new = match slot.as_ref() {
            Some(desc) => !Arc::ptr_eq(&desc.runtime, runtime),
            None => true,
        };
        if needs_new {
            let id = runtime.thread_enter()?;
            *slot = Some(Descriptor::new(id, runtime.clone()));
        }
        Ok(())
    })
}

/// `TM_BEGIN`/`TM_END`: runs `body` to completion exactly once from the
/// caller's point of view, transparently retrying on internal `Restart`/
/// `Conflict` signals (spec.md 9's longjmp-loop substitute). `Fatal`
/// propagates as a panic; `Capacity` never reaches the software path (it is
/// consumed entirely within the HTM dispatcher).
///
/// Every attempt is first offered to [`htm::HybridDispatcher::try_hardware`]
/// (spec.md 4.8); with the crate's only real backend, [`htm::NoHtm`],
/// reporting itself unavailable, this always falls through to the software
/// path below, but it still exercises `dispatch_mode`/`active_sw`/the
/// clock's reserved bit the way a real hardware backend would.
pub fn atomically<F, T>(runtime: &Arc<RuntimeShared>, attrs: TxAttributes, mut body: F) -> T
where
    F: FnMut(&mut Transaction) -> Result<T>,
{
    ensure_descriptor(runtime).expect("tm-core: thread_enter failed");

    DESCRIPTOR.with(|cell| {
        let mut slot = cell.borrow_mut();
        let desc = slot.as_mut().expect("descriptor installed by ensure_descriptor");

        loop {
            let mut hw_outcome: Option<Result<T>> = None;
            let committed_in_hw = runtime.dispatcher.try_hardware(
                &runtime.clock,
                &runtime.active_sw,
                &runtime.stats.htm,
                || {
                    desc.begin(attrs);
                    runtime.clock.mark_htm_started();
                    let outcome = {
                        let mut tx = Transaction { desc };
                        body(&mut tx)
                    };
                    runtime.clock.mark_htm_finished();
                    if let Err(fatal @ TmError::Fatal(_)) = &outcome {
                        fatal.panic_if_fatal();
                    }
                    let ok = outcome.is_ok();
                    hw_outcome = Some(outcome);
                    ok
                },
            );

            if committed_in_hw {
                commit::commit_hardware(desc);
                return hw_outcome
                    .expect("try_hardware only reports a commit after running the body")
                    .expect("a hardware commit implies the body returned Ok");
            }

            // Software path: reached whenever hardware declines outright
            // (`NoHtm`), exhausts its retry budget, or is blocked by
            // `DispatchMode::MutexFallback`'s active-software subscription.
            runtime.active_sw.enter();
            desc.begin(attrs);
            let outcome = {
                let mut tx = Transaction { desc };
                body(&mut tx)
            };

            let value = match outcome {
                Ok(value) => match commit::commit(desc) {
                    TxSignal::Continue => Some(value),
                    TxSignal::Restart => {
                        desc.alloc_log.rollback();
                        desc.status = TxStatus::Aborted;
                        None
                    }
                },
                Err(TmError::Restart) | Err(TmError::Conflict) => {
                    desc.alloc_log.rollback();
                    desc.status = TxStatus::Aborted;
                    None
                }
                Err(TmError::Capacity) => {
                    unreachable!("tm-core: Capacity must be consumed by the HTM dispatcher")
                }
                Err(fatal @ TmError::Fatal(_)) => {
                    fatal.panic_if_fatal();
                    unreachable!()
                }
            };
            runtime.active_sw.exit();

            if let Some(value) = value {
                return value;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use threadpool::ThreadPool;

    #[test]
    fn commit_publishes_store_visibly() {
        let runtime = startup(2, |_| {});
        let mut cell: usize = 10;
        let addr = &mut cell as *mut usize as usize;

        atomically(&runtime, TxAttributes::default(), |tx| {
            let v = tx.load_word(addr)?;
            tx.store_word(addr, v + 5);
            Ok(())
        });

        assert_eq!(cell, 15);
    }

    /// Scaled-down "counter race" (spec.md 8, scenario 1): several threads
    /// each bump the same shared word many times through `atomically`; the
    /// final value must equal the total number of increments regardless of
    /// how many attempts any individual increment needed.
    #[test]
    fn concurrent_increments_sum_exactly() {
        struct SharedCell(*mut usize);
        unsafe impl Send for SharedCell {}
        unsafe impl Sync for SharedCell {}

        let runtime = startup(8, |_| {});
        let mut cell: usize = 0;
        let shared = Arc::new(SharedCell(&mut cell as *mut usize));
        let addr = shared.0 as usize;

        let threads = 4;
        let increments_per_thread = 200;
        let pool = ThreadPool::new(threads);

        for _ in 0..threads {
            let runtime = runtime.clone();
            let shared = shared.clone();
            pool.execute(move || {
                let _ = &shared;
                for _ in 0..increments_per_thread {
                    atomically(&runtime, TxAttributes::default(), |tx| {
                        let v = tx.load_word(addr)?;
                        tx.store_word(addr, v + 1);
                        Ok(())
                    });
                }
            });
        }
        pool.join();

        assert_eq!(cell, threads * increments_per_thread);
        shutdown(&runtime);
    }
}
