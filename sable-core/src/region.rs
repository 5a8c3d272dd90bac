#![forbid(unsafe_code)]

//! Regions abstract "everything reachable through this reference". A
//! region's bound says how long the reference may be held: forever, or
//! no longer than some owning binding's scope. The bound of a region is
//! the meet of the bounds of every region reachable from it, with
//! "more restrictive wins".

use std::collections::HashMap;

use sable_ast::{BindingId, RegionId};

/// How long a reference into a region may be held.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bound {
    /// Never invalidated.
    Unbounded,
    /// Valid only while the named binding's scope is live. The depth is
    /// the scope nesting depth of that binding; deeper scopes are more
    /// restrictive.
    BoundTo { owner: BindingId, depth: u32 },
}

impl Bound {
    /// Meet of two bounds: the more restrictive (deeper-scoped) wins.
    pub fn meet(self, other: Bound) -> Bound {
        match (self, other) {
            (Bound::Unbounded, b) => b,
            (a, Bound::Unbounded) => a,
            (
                Bound::BoundTo { depth: da, .. },
                b @ Bound::BoundTo { depth: db, .. },
            ) if db > da => b,
            (a, _) => a,
        }
    }
}

#[derive(Clone, Debug)]
struct RegionNode {
    bound: Bound,
    /// Regions reachable from this one (sub-objects, aliased parts).
    reaches: Vec<RegionId>,
}

/// Owns every region of a compilation unit. Reachability may be
/// cyclic; `bound_of` walks with a visited set.
#[derive(Debug, Default)]
pub struct RegionTable {
    nodes: HashMap<RegionId, RegionNode>,
    next: u32,
}

impl RegionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, bound: Bound) -> RegionId {
        let id = RegionId(self.next);
        self.next += 1;
        self.nodes.insert(
            id,
            RegionNode {
                bound,
                reaches: Vec::new(),
            },
        );
        id
    }

    /// Record that `from` reaches `to` (a sub-object edge or an alias
    /// into another region).
    pub fn connect(&mut self, from: RegionId, to: RegionId) {
        let node = self.nodes.get_mut(&from).expect("region node");
        if !node.reaches.contains(&to) {
            node.reaches.push(to);
        }
    }

    /// The effective bound: the meet over everything reachable.
    pub fn bound_of(&self, region: RegionId) -> Bound {
        let mut bound = Bound::Unbounded;
        let mut visited = vec![region];
        let mut work = vec![region];
        while let Some(id) = work.pop() {
            let node = self.nodes.get(&id).expect("region node");
            bound = bound.meet(node.bound);
            for &next in &node.reaches {
                if !visited.contains(&next) {
                    visited.push(next);
                    work.push(next);
                }
            }
        }
        bound
    }

    /// True when the region's effective bound is owned by one of the
    /// given bindings (used when a scope ends to invalidate dependents).
    pub fn bound_by_any(&self, region: RegionId, owners: &[BindingId]) -> bool {
        match self.bound_of(region) {
            Bound::Unbounded => false,
            Bound::BoundTo { owner, .. } => owners.contains(&owner),
        }
    }
}
