//! Sparse weighted directed graph used by the difference-bound domain.
//!
//! Vertices live in an arena of adjacency slots. A forgotten vertex is
//! cleared and its slot is recycled through a free list, so vertex ids stay
//! dense across long sequences of assignments. Each edge is stored twice
//! (successor and predecessor side) so both directions can be walked with
//! their weights.

use std::collections::BTreeMap;

pub type VertId = usize;
pub type Weight = i64;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Slot {
    succs: BTreeMap<VertId, Weight>,
    preds: BTreeMap<VertId, Weight>,
    occupied: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Graph {
    slots: Vec<Slot>,
    /// Recycled slots, reused most-recently-freed first.
    free: Vec<VertId>,
    edge_count: usize,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// A graph with vertices `0..n` and no edges.
    pub fn with_vertices(n: usize) -> Self {
        let mut g = Graph::new();
        for _ in 0..n {
            g.new_vertex();
        }
        g
    }

    /// Number of slots, occupied or not; every vertex id is below this.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edge_count
    }

    pub fn is_vertex(&self, v: VertId) -> bool {
        self.slots.get(v).is_some_and(|s| s.occupied)
    }

    pub fn new_vertex(&mut self) -> VertId {
        if let Some(v) = self.free.pop() {
            self.slots[v].occupied = true;
            return v;
        }
        self.slots.push(Slot {
            occupied: true,
            ..Slot::default()
        });
        self.slots.len() - 1
    }

    /// Removes `v` and all its edges, making its id available again.
    pub fn forget(&mut self, v: VertId) {
        if !self.is_vertex(v) {
            return;
        }
        let succs = std::mem::take(&mut self.slots[v].succs);
        for d in succs.keys() {
            self.slots[*d].preds.remove(&v);
        }
        let preds = std::mem::take(&mut self.slots[v].preds);
        for s in preds.keys() {
            self.slots[*s].succs.remove(&v);
        }
        self.edge_count -= succs.len() + preds.len();
        self.slots[v].occupied = false;
        self.free.push(v);
    }

    pub fn verts(&self) -> impl Iterator<Item = VertId> + '_ {
        self.slots.iter().enumerate().filter(|(_, s)| s.occupied).map(|(v, _)| v)
    }

    pub fn lookup(&self, s: VertId, d: VertId) -> Option<Weight> {
        self.slots.get(s).and_then(|slot| slot.succs.get(&d).copied())
    }

    pub fn elem(&self, s: VertId, d: VertId) -> bool {
        self.lookup(s, d).is_some()
    }

    pub fn succs(&self, v: VertId) -> impl Iterator<Item = (VertId, Weight)> + '_ {
        self.slots[v].succs.iter().map(|(d, w)| (*d, *w))
    }

    pub fn preds(&self, v: VertId) -> impl Iterator<Item = (VertId, Weight)> + '_ {
        self.slots[v].preds.iter().map(|(s, w)| (*s, *w))
    }

    pub fn num_succs(&self, v: VertId) -> usize {
        self.slots[v].succs.len()
    }

    pub fn num_preds(&self, v: VertId) -> usize {
        self.slots[v].preds.len()
    }

    /// Adds or overwrites the edge `s -> d`.
    pub fn set_edge(&mut self, s: VertId, w: Weight, d: VertId) {
        debug_assert!(self.is_vertex(s) && self.is_vertex(d), "edge {s} -> {d} on a free vertex");
        if self.slots[s].succs.insert(d, w).is_none() {
            self.edge_count += 1;
        }
        self.slots[d].preds.insert(s, w);
    }

    /// Keeps the smaller of the current and the new weight.
    /// Returns true if the edge was added or tightened.
    pub fn update_edge(&mut self, s: VertId, w: Weight, d: VertId) -> bool {
        match self.lookup(s, d) {
            Some(old) if old <= w => false,
            _ => {
                self.set_edge(s, w, d);
                true
            }
        }
    }

    pub fn remove_edge(&mut self, s: VertId, d: VertId) {
        if self.slots[s].succs.remove(&d).is_some() {
            self.slots[d].preds.remove(&s);
            self.edge_count -= 1;
        }
    }

    /// Every edge as `(src, weight, dest)`.
    pub fn edges(&self) -> Vec<(VertId, Weight, VertId)> {
        let mut out = Vec::with_capacity(self.edge_count);
        for s in self.verts() {
            for (d, w) in self.succs(s) {
                out.push((s, w, d));
            }
        }
        out
    }

    /// Copies `src` into a fresh graph whose vertex `i` stands for
    /// `perm[i]` of `src` (or for a new unconstrained vertex when `None`).
    pub fn renamed(src: &Graph, perm: &[Option<VertId>]) -> Graph {
        let mut g = Graph::with_vertices(perm.len());
        let mut inverse: Vec<Option<VertId>> = vec![None; src.size()];
        for (new, old) in perm.iter().enumerate() {
            if let Some(old) = old {
                inverse[*old] = Some(new);
            }
        }
        for (new_s, old_s) in perm.iter().enumerate() {
            let Some(old_s) = old_s else {
                continue;
            };
            for (old_d, w) in src.succs(*old_s) {
                if let Some(new_d) = inverse[old_d] {
                    g.set_edge(new_s, w, new_d);
                }
            }
        }
        g
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edges_and_forget() {
        let mut g = Graph::with_vertices(3);
        g.set_edge(0, 5, 1);
        g.set_edge(1, -2, 2);
        assert_eq!(g.num_edges(), 2);
        assert!(!g.update_edge(0, 7, 1));
        assert!(g.update_edge(0, 3, 1));
        assert_eq!(g.lookup(0, 1), Some(3));
        assert_eq!(g.preds(2).collect::<Vec<_>>(), vec![(1, -2)]);

        g.forget(1);
        assert_eq!(g.num_edges(), 0);
        assert!(!g.is_vertex(1));
        assert_eq!(g.num_succs(0), 0);

        // The freed slot is reused.
        assert_eq!(g.new_vertex(), 1);
        assert_eq!(g.verts().count(), 3);
    }

    #[test]
    fn test_renamed() {
        let mut g = Graph::with_vertices(4);
        g.set_edge(0, 1, 3);
        g.set_edge(3, 2, 2);
        g.set_edge(1, 9, 2);
        let r = Graph::renamed(&g, &[Some(0), Some(3), Some(2), None]);
        assert_eq!(r.lookup(0, 1), Some(1));
        assert_eq!(r.lookup(1, 2), Some(2));
        assert_eq!(r.num_edges(), 2);
        assert!(r.is_vertex(3));
    }
}
