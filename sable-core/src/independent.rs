#![forbid(unsafe_code)]

//! Container instances with an independent element parameter. The
//! container's type never encodes the element capability; per instance
//! it reifies exactly one ownership flag, fixed when the first element
//! is stored. Element accesses get their capability computed per call
//! site.
//!
//! Elements are tracked as pseudo-bindings in the sharing forest, so
//! freezing and isolation recovery reuse the same connected-component
//! machinery as plain references.

use std::collections::HashMap;

use sable_ast::{BindingId, Capability};

use crate::lattice;
use crate::sharing::SharingForest;

/// Whether the container owns its elements. Fixed at the first store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// Elements require isolation on entry and isolation recovery plus
    /// destruction on removal.
    Owned,
    /// Elements are plain aliases; removal carries no destruction
    /// obligation.
    Unowned,
}

impl Ownership {
    pub fn display(&self) -> &'static str {
        match self {
            Ownership::Owned => "owned",
            Ownership::Unowned => "unowned",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContainerViolation {
    NoSuchElement { index: usize },
    ElementGone { index: usize },
    OwnedRequiresIsolated { found: Capability },
    SharingBlocked { op: &'static str, blockers: Vec<BindingId> },
    AliasNotWeaker { base: Capability, requested: Capability },
    FrozenElement { op: &'static str, index: usize },
}

impl ContainerViolation {
    pub fn message(&self) -> String {
        match self {
            ContainerViolation::NoSuchElement { index } => {
                format!("container has no element {index}")
            }
            ContainerViolation::ElementGone { index } => {
                format!("element {index} was already taken or discarded")
            }
            ContainerViolation::OwnedRequiresIsolated { found } => format!(
                "owned container requires an isolated element, found `{}`",
                found.display()
            ),
            ContainerViolation::SharingBlocked { op, .. } => {
                format!("{op} blocked by live members of the sharing set")
            }
            ContainerViolation::AliasNotWeaker { base, requested } => format!(
                "requested alias capability `{}` is stronger than the `{}` view the container gives",
                requested.display(),
                base.display()
            ),
            ContainerViolation::FrozenElement { op, index } => {
                format!("cannot {op} element {index}: it is frozen")
            }
        }
    }

    pub fn blockers(&self) -> &[BindingId] {
        match self {
            ContainerViolation::SharingBlocked { blockers, .. } => blockers,
            _ => &[],
        }
    }
}

#[derive(Clone, Debug)]
struct ElementSlot {
    binding: BindingId,
    live: bool,
}

#[derive(Clone, Debug)]
pub struct ContainerInstance {
    binding: BindingId,
    ownership: Option<Ownership>,
    elements: Vec<ElementSlot>,
}

impl ContainerInstance {
    pub fn ownership(&self) -> Option<Ownership> {
        self.ownership
    }

    pub fn element_binding(&self, index: usize) -> Option<BindingId> {
        self.elements
            .get(index)
            .filter(|slot| slot.live)
            .map(|slot| slot.binding)
    }

    fn live_element(&self, index: usize) -> Result<BindingId, ContainerViolation> {
        let slot = self
            .elements
            .get(index)
            .ok_or(ContainerViolation::NoSuchElement { index })?;
        if !slot.live {
            return Err(ContainerViolation::ElementGone { index });
        }
        Ok(slot.binding)
    }

    /// The container binding plus every live element binding.
    fn family(&self) -> Vec<BindingId> {
        let mut out = vec![self.binding];
        out.extend(
            self.elements
                .iter()
                .filter(|slot| slot.live)
                .map(|slot| slot.binding),
        );
        out
    }
}

/// All container instances of a compilation unit, keyed by the binding
/// holding the container.
#[derive(Debug, Default)]
pub struct ContainerTable {
    instances: HashMap<BindingId, ContainerInstance>,
}

impl ContainerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, binding: BindingId) {
        self.instances.insert(
            binding,
            ContainerInstance {
                binding,
                ownership: None,
                elements: Vec::new(),
            },
        );
    }

    pub fn is_container(&self, binding: BindingId) -> bool {
        self.instances.contains_key(&binding)
    }

    pub fn get(&self, binding: BindingId) -> Option<&ContainerInstance> {
        self.instances.get(&binding)
    }

    fn instance_mut(&mut self, binding: BindingId) -> &mut ContainerInstance {
        self.instances.get_mut(&binding).expect("container instance")
    }

    /// Store an element. The first store fixes the ownership flag from
    /// the element's capability: isolated elements make the container
    /// owned, anything else makes it unowned. Returns the (possibly
    /// just fixed) ownership.
    ///
    /// The caller is responsible for the source binding: an owned add
    /// is a move, an unowned add is an alias of the source.
    pub fn add(
        &mut self,
        container: BindingId,
        elem_binding: BindingId,
        elem_cap: Capability,
    ) -> Result<Ownership, ContainerViolation> {
        let instance = self.instance_mut(container);
        let ownership = *instance.ownership.get_or_insert(if elem_cap == Capability::Isolated {
            Ownership::Owned
        } else {
            Ownership::Unowned
        });
        if ownership == Ownership::Owned && elem_cap != Capability::Isolated {
            return Err(ContainerViolation::OwnedRequiresIsolated { found: elem_cap });
        }
        instance.elements.push(ElementSlot {
            binding: elem_binding,
            live: true,
        });
        Ok(ownership)
    }

    /// Remove an element, returning its binding and the capability the
    /// result gets: isolated when the container owns it and nothing
    /// else shares it, owned-but-shared when owned but still aliased,
    /// a plain read alias otherwise. The caller verified the container
    /// has exclusive-write on itself.
    pub fn take(
        &mut self,
        container: BindingId,
        index: usize,
        forest: &mut SharingForest,
    ) -> Result<(BindingId, Capability), ContainerViolation> {
        let instance = self.instance_mut(container);
        let elem = instance.live_element(index)?;
        let ownership = instance.ownership.unwrap_or(Ownership::Unowned);
        instance.elements[index].live = false;
        let cap = match ownership {
            Ownership::Owned if forest.can_recover(elem) => Capability::Isolated,
            Ownership::Owned => Capability::Owned,
            Ownership::Unowned => Capability::SharedRead,
        };
        Ok((elem, cap))
    }

    /// Remove and destroy an element. For an owned container the
    /// element's isolation must be recoverable first; an unowned
    /// discard is unconditional.
    pub fn discard(
        &mut self,
        container: BindingId,
        index: usize,
        forest: &mut SharingForest,
    ) -> Result<BindingId, ContainerViolation> {
        let instance = self.instance_mut(container);
        let elem = instance.live_element(index)?;
        if instance.ownership == Some(Ownership::Owned) {
            let blockers = forest.live_others(elem);
            if !blockers.is_empty() {
                return Err(ContainerViolation::SharingBlocked {
                    op: "discard",
                    blockers,
                });
            }
        }
        self.instance_mut(container).elements[index].live = false;
        forest.retire(elem);
        Ok(elem)
    }

    /// The capability an element alias gets: the container capability's
    /// viewpoint over the element's owned form, then upcast to an
    /// explicitly requested weaker capability if the caller asked for
    /// one. A request stronger than the view is a violation, never a
    /// silent downgrade. The caller verified the container is at least
    /// read-capable.
    pub fn alias_element(
        &self,
        container: BindingId,
        index: usize,
        container_cap: Capability,
        requested: Option<Capability>,
    ) -> Result<(BindingId, Capability), ContainerViolation> {
        let instance = self.instances.get(&container).expect("container instance");
        let elem = instance.live_element(index)?;
        let base = lattice::combine_viewpoint(container_cap, Capability::Owned);
        let cap = match requested {
            Some(req) if lattice::is_subtype(base, req) => req,
            Some(req) => {
                return Err(ContainerViolation::AliasNotWeaker {
                    base,
                    requested: req,
                })
            }
            None => base,
        };
        Ok((elem, cap))
    }

    /// Recover isolation of one element. Requires the element to be
    /// the only live member of its set and the container plus every
    /// other element to have no live aliases outside the family. The
    /// recovered element gets a fresh binding (`fresh`) so the old set
    /// membership stays retired.
    pub fn recover(
        &mut self,
        container: BindingId,
        index: usize,
        forest: &mut SharingForest,
        fresh: BindingId,
    ) -> Result<BindingId, ContainerViolation> {
        let instance = self.instances.get(&container).expect("container instance");
        let elem = instance.live_element(index)?;
        // Freezing retires the whole component, so the blocker check
        // below would pass vacuously; the freeze is terminal.
        if forest.is_frozen(elem) {
            return Err(ContainerViolation::FrozenElement {
                op: "recover-isolation of",
                index,
            });
        }
        let family = instance.family();

        let mut blockers = forest.live_others(elem);
        for &member in &family {
            if member == elem {
                continue;
            }
            for other in forest.live_others(member) {
                if !family.contains(&other) && !blockers.contains(&other) {
                    blockers.push(other);
                }
            }
        }
        if !blockers.is_empty() {
            return Err(ContainerViolation::SharingBlocked {
                op: "recover-isolation",
                blockers,
            });
        }

        forest.retire(elem);
        self.instance_mut(container).elements[index].binding = fresh;
        Ok(elem)
    }

    /// Freeze one element and, with it, the whole connected component
    /// it shares a set with. The precondition is the same family-wide
    /// one as for freezing the container: the container binding itself
    /// and every reference reaching any element must be read-only,
    /// since a still-writable container could mutate or destroy the
    /// element after the freeze. Returns all bindings that became
    /// frozen.
    pub fn freeze_element(
        &mut self,
        container: BindingId,
        index: usize,
        forest: &mut SharingForest,
        mut is_writer: impl FnMut(BindingId) -> bool,
    ) -> Result<Vec<BindingId>, ContainerViolation> {
        let instance = self.instances.get(&container).expect("container instance");
        let elem = instance.live_element(index)?;
        if forest.is_frozen(elem) {
            return Ok(Vec::new());
        }
        let family = instance.family();
        let mut blockers = Vec::new();
        if forest.is_live(container) && is_writer(container) {
            blockers.push(container);
        }
        for &member in &family {
            for other in forest.live_others(member) {
                if !family.contains(&other) && is_writer(other) && !blockers.contains(&other) {
                    blockers.push(other);
                }
            }
        }
        if !blockers.is_empty() {
            return Err(ContainerViolation::SharingBlocked {
                op: "freeze",
                blockers,
            });
        }
        Ok(forest.freeze_component(elem))
    }

    /// Freeze the container and all its elements atomically. The
    /// precondition covers every element's component and the container
    /// binding's own aliases.
    pub fn freeze_container(
        &mut self,
        container: BindingId,
        forest: &mut SharingForest,
        mut is_writer: impl FnMut(BindingId) -> bool,
    ) -> Result<Vec<BindingId>, ContainerViolation> {
        let instance = self.instances.get(&container).expect("container instance");
        let family = instance.family();

        let mut blockers = Vec::new();
        for &member in &family {
            for other in forest.live_others(member) {
                if !family.contains(&other) && is_writer(other) && !blockers.contains(&other) {
                    blockers.push(other);
                }
            }
        }
        if !blockers.is_empty() {
            return Err(ContainerViolation::SharingBlocked {
                op: "freeze",
                blockers,
            });
        }

        let mut frozen = Vec::new();
        for member in family {
            for id in forest.freeze_component(member) {
                if !frozen.contains(&id) {
                    frozen.push(id);
                }
            }
            if !frozen.contains(&member) {
                frozen.push(member);
            }
        }
        Ok(frozen)
    }
}
