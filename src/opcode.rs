// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The opcode registry (spec.md 3, 4.6).
//!
//! An opcode describes one kind of logical operation an application
//! registers against the runtime (e.g. "rbtree lookup"), before any
//! transaction runs. Registration is one-shot: the table is immutable once
//! the first transaction begins, matching `tm.h`'s `TM_LOG_OP_INIT` pattern
//! of registering all opcodes during a single-threaded startup phase.

use crate::error::{Result, TmError};
use crate::merge::{MergeContext, MergeVerdict};
use std::sync::RwLock;

pub type OpArgs = Vec<usize>;
pub type MergeCallback = fn(&mut MergeContext) -> MergeVerdict;

/// Reserved opcode for the implicit root operation every transaction opens
/// at `begin()` (SPEC_FULL.md 3, "current_op() and the implicit root
/// operation").
pub const ROOT_OPCODE: Opcode = Opcode(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Opcode(pub u32);

/// Per-phase merge policy: `None` means the engine never invokes a callback
/// for that phase and falls straight through to the parent operation;
/// `Some` means a callback exists, though it may still answer
/// `MergeVerdict::Unsupported` at runtime (SPEC_FULL.md 3).
#[derive(Clone, Copy)]
pub struct MergePolicy {
    pub just_in_time: Option<MergeCallback>,
    pub delayed: Option<MergeCallback>,
}

impl MergePolicy {
    pub const NONE: MergePolicy = MergePolicy {
        just_in_time: None,
        delayed: None,
    };
}

#[derive(Clone)]
pub struct OpcodeDesc {
    pub name: &'static str,
    pub merge: MergePolicy,
}

#[derive(Default)]
pub struct OpcodeRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    descs: Vec<OpcodeDesc>,
    sealed: bool,
}

impl OpcodeRegistry {
    pub fn new() -> Self {
        let registry = Self {
            inner: RwLock::new(RegistryInner {
                descs: Vec::new(),
                sealed: false,
            }),
        };
        registry
            .register("ROOT", MergePolicy::NONE)
            .expect("ROOT opcode registration cannot fail");
        registry
    }

    /// Registers a new opcode. Must happen before the first transaction
    /// begins; calling this after the registry is sealed is a programming
    /// error (`spec.md` 4.6: "immutable after registration").
    pub fn register(&self, name: &'static str, merge: MergePolicy) -> Result<Opcode> {
        let mut inner = self.inner.write().expect("opcode registry lock poisoned");
        if inner.sealed {
            return Err(TmError::fatal(format!(
                "cannot register opcode '{name}': registry already sealed"
            )));
        }
        let id = Opcode(inner.descs.len() as u32);
        inner.descs.push(OpcodeDesc { name, merge });
        Ok(id)
    }

    /// Seals the registry so no further opcodes can be registered. Called
    /// once by `lifecycle::startup`.
    pub fn seal(&self) {
        self.inner.write().expect("opcode registry lock poisoned").sealed = true;
    }

    pub fn desc(&self, op: Opcode) -> OpcodeDesc {
        let inner = self.inner.read().expect("opcode registry lock poisoned");
        inner.descs[op.0 as usize].clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("opcode registry lock poisoned").descs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_opcode_is_preregistered() {
        let registry = OpcodeRegistry::new();
        assert_eq!(registry.desc(ROOT_OPCODE).name, "ROOT");
    }

    #[test]
    fn registration_fails_after_seal() {
        let registry = OpcodeRegistry::new();
        registry.register("lookup", MergePolicy::NONE).unwrap();
        registry.seal();
        assert!(registry.register("insert", MergePolicy::NONE).is_err());
    }

    #[test]
    fn opcodes_are_assigned_in_order() {
        let registry = OpcodeRegistry::new();
        let a = registry.register("a", MergePolicy::NONE).unwrap();
        let b = registry.register("b", MergePolicy::NONE).unwrap();
        assert_eq!(b.0, a.0 + 1);
    }
}
