#![forbid(unsafe_code)]

//! Sharing sets: for every live reference, the set of other references
//! whose reachable subgraphs may overlap. Implemented as a union-find
//! forest with path compression and union by rank; the only queries
//! the analysis needs are "same set?" and "merge", and the structure
//! tolerates cyclic object graphs for free.
//!
//! Identity-only and frozen references are never members: they can
//! neither break isolation nor induce sharing. Members are retired in
//! place (scope exit, move, freeze) rather than removed, so finds stay
//! near-constant.

use sable_ast::BindingId;

#[derive(Debug, Default)]
pub struct SharingForest {
    parent: Vec<u32>,
    rank: Vec<u8>,
    live: Vec<bool>,
    /// Identity-only/frozen at declaration: excluded from membership.
    exempt: Vec<bool>,
    frozen: Vec<bool>,
}

impl SharingForest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a binding. Ids must arrive in allocation order; the
    /// checker hands them out contiguously.
    pub fn register(&mut self, id: BindingId, exempt: bool) {
        assert_eq!(id.0 as usize, self.parent.len(), "binding id out of order");
        self.parent.push(id.0);
        self.rank.push(0);
        self.live.push(!exempt);
        self.exempt.push(exempt);
        self.frozen.push(false);
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    pub fn is_live(&self, id: BindingId) -> bool {
        self.live[id.0 as usize]
    }

    pub fn is_frozen(&self, id: BindingId) -> bool {
        self.frozen[id.0 as usize]
    }

    pub fn is_exempt(&self, id: BindingId) -> bool {
        self.exempt[id.0 as usize]
    }

    fn find(&mut self, id: u32) -> u32 {
        let mut root = id;
        while self.parent[root as usize] != root {
            root = self.parent[root as usize];
        }
        // Path compression.
        let mut cur = id;
        while self.parent[cur as usize] != root {
            let next = self.parent[cur as usize];
            self.parent[cur as usize] = root;
            cur = next;
        }
        root
    }

    /// Record that two references may reach overlapping subgraphs. A
    /// no-op when either side is exempt (identity-only/frozen cannot
    /// induce sharing).
    pub fn alias(&mut self, a: BindingId, b: BindingId) {
        if self.exempt[a.0 as usize]
            || self.exempt[b.0 as usize]
            || self.frozen[a.0 as usize]
            || self.frozen[b.0 as usize]
        {
            return;
        }
        let ra = self.find(a.0);
        let rb = self.find(b.0);
        if ra == rb {
            return;
        }
        match self.rank[ra as usize].cmp(&self.rank[rb as usize]) {
            std::cmp::Ordering::Less => self.parent[ra as usize] = rb,
            std::cmp::Ordering::Greater => self.parent[rb as usize] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb as usize] = ra;
                self.rank[ra as usize] += 1;
            }
        }
    }

    pub fn same_set(&mut self, a: BindingId, b: BindingId) -> bool {
        self.find(a.0) == self.find(b.0)
    }

    /// Drop a reference from the live set (scope exit or move-out).
    pub fn retire(&mut self, id: BindingId) {
        self.live[id.0 as usize] = false;
    }

    /// Live members of `id`'s set other than `id` itself.
    pub fn live_others(&mut self, id: BindingId) -> Vec<BindingId> {
        let root = self.find(id.0);
        (0..self.parent.len() as u32)
            .filter(|&other| {
                other != id.0 && self.live[other as usize] && self.find(other) == root
            })
            .map(BindingId)
            .collect()
    }

    /// Every live member of `id`'s set, `id` included when live.
    pub fn component_live(&mut self, id: BindingId) -> Vec<BindingId> {
        let root = self.find(id.0);
        (0..self.parent.len() as u32)
            .filter(|&other| self.live[other as usize] && self.find(other) == root)
            .map(BindingId)
            .collect()
    }

    /// Isolation is recoverable iff nothing else in the set is live.
    pub fn can_recover(&mut self, id: BindingId) -> bool {
        self.live_others(id).is_empty()
    }

    /// Freezing is legal iff every other live member is a non-writer.
    pub fn can_freeze(
        &mut self,
        id: BindingId,
        mut is_writer: impl FnMut(BindingId) -> bool,
    ) -> bool {
        self.live_others(id).into_iter().all(|m| !is_writer(m))
    }

    /// Freeze the whole connected component: every member leaves the
    /// live set permanently. Subsequent aliases of frozen references do
    /// not re-enter.
    pub fn freeze_component(&mut self, id: BindingId) -> Vec<BindingId> {
        let members = self.component_live(id);
        for &m in &members {
            self.live[m.0 as usize] = false;
            self.frozen[m.0 as usize] = true;
        }
        // The target itself freezes even when already retired.
        self.frozen[id.0 as usize] = true;
        members
    }
}
