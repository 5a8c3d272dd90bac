#![forbid(unsafe_code)]

//! Per-binding flow states and the merge rules the checker applies
//! while walking a function body. States form the capability lattice
//! extended with a bottom (`Uninitialized`) and a top (`Invalid`);
//! merge points take the pointwise join and loops iterate the body to
//! a fixed point (the lattice is finite, so iteration terminates).

use std::collections::HashMap;

use sable_ast::{BindingId, Capability, UseKind};

use crate::lattice;

/// The flow-typed state of one binding at one program point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowState {
    /// Declared but not yet given a value.
    Uninitialized,
    /// Holding a reference with this capability.
    Cap(Capability),
    /// Moved out, recovered away, or poisoned by an earlier violation.
    Invalid,
}

impl FlowState {
    pub fn display(&self) -> String {
        match self {
            FlowState::Uninitialized => "uninitialized".to_string(),
            FlowState::Cap(cap) => cap.display().to_string(),
            FlowState::Invalid => "invalid".to_string(),
        }
    }

    pub fn cap(&self) -> Option<Capability> {
        match self {
            FlowState::Cap(cap) => Some(*cap),
            _ => None,
        }
    }

    pub fn is_usable(&self) -> bool {
        matches!(self, FlowState::Cap(_))
    }

    /// Whether the state grants the right a plain use needs.
    pub fn allows(&self, kind: UseKind) -> bool {
        let Some(cap) = self.cap() else {
            return false;
        };
        let rights = lattice::rights_of(cap);
        match kind {
            UseKind::Read => rights.read,
            UseKind::Write => rights.write,
            UseKind::Identity => rights.identity,
        }
    }

    /// Join at a control-flow merge: `Invalid` is absorbing, and a
    /// binding that may be uninitialized on one incoming path stays
    /// `Uninitialized` after the merge. A loop head must not forget
    /// that the first iteration runs before any assignment in the
    /// body. Capabilities join in the lattice; two capabilities with
    /// no usable common form merge to `Invalid`.
    pub fn join(self, other: FlowState) -> FlowState {
        match (self, other) {
            (FlowState::Invalid, _) | (_, FlowState::Invalid) => FlowState::Invalid,
            (FlowState::Uninitialized, _) | (_, FlowState::Uninitialized) => {
                FlowState::Uninitialized
            }
            (FlowState::Cap(a), FlowState::Cap(b)) => match lattice::join(a, b) {
                Some(j) => FlowState::Cap(j),
                None => FlowState::Invalid,
            },
        }
    }
}

/// What aliasing a reference leaves behind and what the alias gets.
/// Aliasing breaks exclusivity on both sides: an isolated or owned
/// source keeps its ownership obligation as owned-but-shared, a
/// mutable-exclusive source loses write on both sides, and frozen or
/// identity-only references alias freely without changing.
pub fn alias_result(source: Capability) -> (Capability, Capability) {
    match source {
        Capability::Isolated | Capability::Owned => (Capability::Owned, Capability::Owned),
        Capability::MutableExclusive | Capability::SharedRead => {
            (Capability::SharedRead, Capability::SharedRead)
        }
        Capability::Frozen => (Capability::Frozen, Capability::Frozen),
        Capability::IdentityOnly => (Capability::IdentityOnly, Capability::IdentityOnly),
    }
}

/// Flow states for every binding in scope at one program point.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlowEnv {
    states: HashMap<BindingId, FlowState>,
}

impl FlowEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: BindingId) -> FlowState {
        self.states
            .get(&id)
            .copied()
            .unwrap_or(FlowState::Uninitialized)
    }

    pub fn set(&mut self, id: BindingId, state: FlowState) {
        self.states.insert(id, state);
    }

    pub fn remove(&mut self, id: BindingId) {
        self.states.remove(&id);
    }

    pub fn ids(&self) -> impl Iterator<Item = BindingId> + '_ {
        self.states.keys().copied()
    }

    /// Pointwise join over the union of both key sets.
    pub fn join_with(&self, other: &FlowEnv) -> FlowEnv {
        let mut out = FlowEnv::new();
        for (&id, &state) in &self.states {
            out.set(id, state.join(other.get(id)));
        }
        for (&id, &state) in &other.states {
            if !self.states.contains_key(&id) {
                out.set(id, state.join(self.get(id)));
            }
        }
        out
    }
}
