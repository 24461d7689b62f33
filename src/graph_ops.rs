//! Shortest-path machinery over [`Graph`].
//!
//! A *potential* is a satisfying assignment of the difference constraints:
//! for every edge `s -w-> d`, `pot[d] <= pot[s] + w`. With a valid potential
//! the reduced weights `pot[s] + w - pot[d]` are non-negative, so closure can
//! run Dijkstra from a handful of vertices instead of a cubic pass.
//!
//! Potentials are kept in `i128` so that sums of `i64` weights never
//! overflow. Derived edges whose weight does not fit back into [`Weight`]
//! are dropped: losing a constraint is always sound.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use crate::graph::{Graph, VertId, Weight};

pub type Potential = i128;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Shortest distances from (or to) `src`, skipping `exclude` entirely.
///
/// Returns actual (not reduced) distances for every vertex reached, `src`
/// excluded.
fn dijkstra(
    g: &Graph,
    pot: &[Potential],
    src: VertId,
    direction: Direction,
    exclude: Option<VertId>,
) -> Vec<(VertId, Potential)> {
    let mut dist: BTreeMap<VertId, Potential> = BTreeMap::new();
    let mut done: BTreeSet<VertId> = BTreeSet::new();
    let mut heap = BinaryHeap::new();
    dist.insert(src, 0);
    heap.push(Reverse((0 as Potential, src)));

    while let Some(Reverse((d, u))) = heap.pop() {
        if !done.insert(u) {
            continue;
        }
        let edges: Vec<(VertId, Weight)> = match direction {
            Direction::Forward => g.succs(u).collect(),
            Direction::Backward => g.preds(u).collect(),
        };
        for (x, w) in edges {
            if Some(x) == exclude || x == src || done.contains(&x) {
                continue;
            }
            let reduced = match direction {
                Direction::Forward => pot[u] + w as Potential - pot[x],
                Direction::Backward => pot[x] + w as Potential - pot[u],
            };
            if reduced < 0 {
                log::trace!("Skipping edge with negative reduced weight at vertex {}", x);
                continue;
            }
            let nd = d + reduced;
            if dist.get(&x).map_or(true, |&old| nd < old) {
                dist.insert(x, nd);
                heap.push(Reverse((nd, x)));
            }
        }
    }

    dist.into_iter()
        .filter(|(x, _)| *x != src)
        .map(|(x, rd)| {
            let actual = match direction {
                Direction::Forward => rd - pot[src] + pot[x],
                Direction::Backward => rd - pot[x] + pot[src],
            };
            (x, actual)
        })
        .collect()
}

fn to_weight(p: Potential) -> Option<Weight> {
    Weight::try_from(p).ok()
}

/// Restores the potential after the edge `ii -> jj` was added or tightened.
///
/// Returns false when the new edge closes a negative cycle, i.e. the
/// constraint system became infeasible.
pub fn repair_potential(g: &Graph, pot: &mut [Potential], ii: VertId, jj: VertId) -> bool {
    let Some(w) = g.lookup(ii, jj) else {
        return true;
    };
    let start = pot[ii] + w as Potential - pot[jj];
    if start >= 0 {
        return true;
    }

    // Dijkstra from jj over reduced weights, offset by the initial violation.
    let mut delta: BTreeMap<VertId, Potential> = BTreeMap::new();
    let mut done: BTreeSet<VertId> = BTreeSet::new();
    let mut heap = BinaryHeap::new();
    delta.insert(jj, start);
    heap.push(Reverse((start, jj)));

    while let Some(Reverse((d, u))) = heap.pop() {
        if d >= 0 {
            break;
        }
        if !done.insert(u) {
            continue;
        }
        if u == ii {
            return false;
        }
        for (x, wx) in g.succs(u) {
            if done.contains(&x) {
                continue;
            }
            let reduced = pot[u] + wx as Potential - pot[x];
            let nd = d + reduced.max(0);
            if nd < 0 && delta.get(&x).map_or(true, |&old| nd < old) {
                delta.insert(x, nd);
                heap.push(Reverse((nd, x)));
            }
        }
    }

    for v in done {
        if let Some(d) = delta.get(&v) {
            pot[v] += *d;
        }
    }
    true
}

/// Recomputes a valid potential from scratch (Bellman-Ford from a virtual
/// source). Returns false if the graph has a negative cycle.
pub fn select_potentials(g: &Graph, pot: &mut Vec<Potential>) -> bool {
    pot.resize(g.size(), 0);
    let edges = g.edges();
    let n = g.verts().count();
    for _ in 0..=n {
        let mut changed = false;
        for &(s, w, d) in &edges {
            let candidate = pot[s] + w as Potential;
            if candidate < pot[d] {
                pot[d] = candidate;
                changed = true;
            }
        }
        if !changed {
            return true;
        }
    }
    false
}

/// Adds every shortest-path edge into and out of `v`.
pub fn close_after_assign(g: &mut Graph, pot: &[Potential], v: VertId, exclude: Option<VertId>) {
    let forward = dijkstra(g, pot, v, Direction::Forward, exclude);
    let backward = dijkstra(g, pot, v, Direction::Backward, exclude);
    for (d, dist) in forward {
        if let Some(w) = to_weight(dist) {
            g.update_edge(v, w, d);
        }
    }
    for (s, dist) in backward {
        if let Some(w) = to_weight(dist) {
            g.update_edge(s, w, v);
        }
    }
}

/// Closes the graph after the single edge `ii -> jj` changed, assuming it
/// was closed before. Vertex `exclude` takes no part.
pub fn close_over_edge(g: &mut Graph, ii: VertId, jj: VertId, exclude: VertId) {
    let Some(c) = g.lookup(ii, jj) else {
        return;
    };

    let mut src_dec = Vec::new();
    let preds: Vec<(VertId, Weight)> = g.preds(ii).collect();
    for (se, w_se) in preds {
        if se == jj || se == exclude {
            continue;
        }
        if let Some(wt) = w_se.checked_add(c) {
            if g.update_edge(se, wt, jj) {
                src_dec.push((se, w_se));
            }
        }
    }

    let mut dest_dec = Vec::new();
    let succs: Vec<(VertId, Weight)> = g.succs(jj).collect();
    for (de, w_de) in succs {
        if de == ii || de == exclude {
            continue;
        }
        if let Some(wt) = c.checked_add(w_de) {
            if g.update_edge(ii, wt, de) {
                dest_dec.push((de, w_de));
            }
        }
    }

    for &(se, w_se) in &src_dec {
        for &(de, w_de) in &dest_dec {
            if se == de {
                continue;
            }
            if let Some(wt) = w_se.checked_add(c).and_then(|x| x.checked_add(w_de)) {
                g.update_edge(se, wt, de);
            }
        }
    }
}

/// Full closure among all vertices but `exclude`, one Dijkstra per vertex.
pub fn close_after_meet(g: &mut Graph, pot: &[Potential], exclude: VertId) {
    let sources: Vec<VertId> = g.verts().filter(|&v| v != exclude).collect();
    close_from(g, pot, &sources, exclude);
}

/// Re-closes the graph after widening dropped edges out of `unstable`.
pub fn close_after_widen(g: &mut Graph, pot: &[Potential], unstable: &BTreeSet<VertId>, exclude: VertId) {
    let sources: Vec<VertId> = unstable
        .iter()
        .copied()
        .filter(|&v| v != exclude && g.is_vertex(v))
        .collect();
    close_from(g, pot, &sources, exclude);
}

fn close_from(g: &mut Graph, pot: &[Potential], sources: &[VertId], exclude: VertId) {
    let mut delta = Vec::new();
    for &v in sources {
        for (d, dist) in dijkstra(g, pot, v, Direction::Forward, Some(exclude)) {
            if let Some(w) = to_weight(dist) {
                delta.push((v, w, d));
            }
        }
    }
    for (s, w, d) in delta {
        g.update_edge(s, w, d);
    }
}

/// Pointwise minimum. `is_closed` is cleared if `r` tightened anything.
pub fn meet(l: &Graph, r: &Graph, is_closed: &mut bool) -> Graph {
    let mut g = l.clone();
    for (s, w, d) in r.edges() {
        if g.update_edge(s, w, d) {
            *is_closed = false;
        }
    }
    g
}

/// Pointwise maximum over the edges present in both operands.
pub fn join(l: &Graph, r: &Graph) -> Graph {
    let mut g = Graph::with_vertices(l.size().max(r.size()));
    for (s, wl, d) in l.edges() {
        if let Some(wr) = r.lookup(s, d) {
            g.set_edge(s, wl.max(wr), d);
        }
    }
    g
}

/// Keeps the edges of `l` that `r` still satisfies. Every vertex that lost
/// an outgoing edge is recorded in `unstable`.
pub fn widen(l: &Graph, r: &Graph, unstable: &mut BTreeSet<VertId>) -> Graph {
    let mut g = Graph::with_vertices(l.size().max(r.size()));
    for (s, wl, d) in l.edges() {
        match r.lookup(s, d) {
            Some(wr) if wr <= wl => g.set_edge(s, wl, d),
            _ => {
                unstable.insert(s);
            }
        }
    }
    g
}

/// True if no edge between vertices other than `exclude` can be tightened
/// by a two-edge path that avoids `exclude`.
pub fn is_closed(g: &Graph, exclude: VertId) -> bool {
    for k in g.verts().filter(|&k| k != exclude) {
        let preds: Vec<(VertId, Weight)> = g.preds(k).filter(|(s, _)| *s != exclude).collect();
        let succs: Vec<(VertId, Weight)> = g.succs(k).filter(|(d, _)| *d != exclude).collect();
        for &(s, w1) in &preds {
            for &(d, w2) in &succs {
                if s == d {
                    continue;
                }
                let Some(path) = w1.checked_add(w2) else {
                    continue;
                };
                match g.lookup(s, d) {
                    Some(w) if w <= path => {}
                    _ => return false,
                }
            }
        }
    }
    true
}

/// Checks that `pot` satisfies every edge.
pub fn check_potential(g: &Graph, pot: &[Potential]) -> bool {
    g.edges().into_iter().all(|(s, w, d)| pot[d] <= pot[s] + w as Potential)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> (Graph, Vec<Potential>) {
        // 0 -> 1 -> 2 -> 3, weights 1, 2, 3.
        let mut g = Graph::with_vertices(4);
        let mut pot = vec![0; 4];
        g.set_edge(0, 1, 1);
        g.set_edge(1, 2, 2);
        g.set_edge(2, 3, 3);
        assert!(select_potentials(&g, &mut pot));
        (g, pot)
    }

    #[test]
    fn test_select_potentials_detects_negative_cycle() {
        let mut g = Graph::with_vertices(2);
        g.set_edge(0, 1, 1);
        g.set_edge(1, -2, 0);
        let mut pot = vec![0; 2];
        assert!(!select_potentials(&g, &mut pot));
    }

    #[test]
    fn test_repair_potential() {
        let (g, pot) = chain();
        // 1 -> 2 -> 3 -> 1 has weight 0: still feasible.
        let mut feasible = g.clone();
        let mut pot1 = pot.clone();
        feasible.set_edge(3, -5, 1);
        assert!(repair_potential(&feasible, &mut pot1, 3, 1));
        assert!(check_potential(&feasible, &pot1));
        // Weight -1: infeasible.
        let mut infeasible = g.clone();
        let mut pot2 = pot.clone();
        infeasible.set_edge(3, -6, 1);
        assert!(!repair_potential(&infeasible, &mut pot2, 3, 1));
    }

    #[test]
    fn test_close_after_meet_is_idempotent() {
        let (mut g, pot) = chain();
        close_after_meet(&mut g, &pot, usize::MAX);
        assert_eq!(g.lookup(0, 3), Some(6));
        assert_eq!(g.lookup(1, 3), Some(5));
        assert!(is_closed(&g, usize::MAX));
        let once = g.clone();
        close_after_meet(&mut g, &pot, usize::MAX);
        assert_eq!(g, once);
    }

    #[test]
    fn test_close_after_assign_respects_exclusion() {
        let (mut g, pot) = chain();
        close_after_assign(&mut g, &pot, 1, Some(0));
        assert_eq!(g.lookup(1, 3), Some(5));
        assert_eq!(g.lookup(0, 2), None);
    }

    #[test]
    fn test_close_over_edge() {
        let mut g = Graph::with_vertices(5);
        g.set_edge(1, 1, 2);
        g.set_edge(3, 1, 4);
        // Closed so far; now add 2 -> 3 and close.
        g.set_edge(2, 1, 3);
        close_over_edge(&mut g, 2, 3, 0);
        assert_eq!(g.lookup(1, 3), Some(2));
        assert_eq!(g.lookup(2, 4), Some(2));
        assert_eq!(g.lookup(1, 4), Some(3));
        assert!(is_closed(&g, 0));
    }

    #[test]
    fn test_join_and_widen() {
        let mut a = Graph::with_vertices(3);
        let mut b = Graph::with_vertices(3);
        a.set_edge(1, 2, 2);
        a.set_edge(0, 5, 1);
        b.set_edge(1, 4, 2);
        b.set_edge(0, 5, 1);
        let j = join(&a, &b);
        assert_eq!(j.lookup(1, 2), Some(4));
        assert_eq!(j.lookup(0, 1), Some(5));

        let mut unstable = BTreeSet::new();
        let w = widen(&a, &b, &mut unstable);
        assert_eq!(w.lookup(1, 2), None);
        assert_eq!(w.lookup(0, 1), Some(5));
        assert!(unstable.contains(&1));
        assert!(!unstable.contains(&0));
    }
}
