//! Split difference-bound matrices.
//!
//! A [`SplitDbm`] stores constraints `y - x <= k` as weighted edges of a
//! sparse [`Graph`], plus a distinguished vertex `0` standing for the
//! constant zero: the edge `0 -k-> v` is the upper bound `v <= k` and the
//! edge `v -k-> 0` is the lower bound `v >= -k`.
//!
//! The graph is kept *split-closed*: every relational edge (between two
//! non-zero vertices) is the shortest path that avoids vertex `0`, and every
//! bound edge is the shortest path in the whole graph. Keeping paths through
//! `0` out of the relational part means bounds can change without
//! rewriting the quadratic set of relations they imply.
//!
//! Closure is incremental. Each state carries a potential function (see
//! [`crate::graph_ops`]) so single-source shortest paths run as Dijkstra
//! over non-negative reduced weights. Widening leaves the graph open and
//! records the vertices that lost edges; they are re-closed lazily by
//! [`SplitDbm::normalize`] on next use.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

use crate::graph::{Graph, VertId, Weight};
use crate::graph_ops::{self, Potential};
use crate::interval::Interval;
use crate::linear::{ConstraintKind, LinearConstraint, LinearExpression};
use crate::number::Number;
use crate::variable::Variable;

/// Difference constraints extracted from `e <= 0`.
#[derive(Debug, Default)]
struct LeqConstraints {
    /// `(x, y, k)`: `x - y <= k`.
    diffs: Vec<(Variable, Variable, Weight)>,
    /// `(x, k)`: `x >= k`.
    lbs: Vec<(Variable, Weight)>,
    /// `(x, k)`: `x <= k`.
    ubs: Vec<(Variable, Weight)>,
}

#[derive(Debug, Clone)]
pub struct SplitDbm {
    vert_map: BTreeMap<Variable, VertId>,
    rev_map: Vec<Option<Variable>>,
    g: Graph,
    potential: Vec<Potential>,
    /// Vertices whose outgoing edges were dropped by widening.
    unstable: BTreeSet<VertId>,
    is_bottom: bool,
}

impl Default for SplitDbm {
    fn default() -> Self {
        SplitDbm::top()
    }
}

fn weight_of(n: &Number) -> Option<Weight> {
    n.to_i64()
}

impl SplitDbm {
    pub fn top() -> Self {
        SplitDbm {
            vert_map: BTreeMap::new(),
            rev_map: vec![None],
            g: Graph::with_vertices(1),
            potential: vec![0],
            unstable: BTreeSet::new(),
            is_bottom: false,
        }
    }

    pub fn bottom() -> Self {
        SplitDbm {
            is_bottom: true,
            ..SplitDbm::top()
        }
    }

    pub fn is_bottom(&self) -> bool {
        self.is_bottom
    }

    pub fn is_top(&self) -> bool {
        !self.is_bottom && self.g.num_edges() == 0
    }

    pub fn set_to_top(&mut self) {
        *self = SplitDbm::top();
    }

    pub fn set_to_bottom(&mut self) {
        *self = SplitDbm::bottom();
    }

    /// Variables currently constrained.
    pub fn variables(&self) -> Vec<Variable> {
        self.vert_map.keys().copied().collect()
    }

    fn get_vert(&mut self, x: Variable) -> VertId {
        if let Some(&v) = self.vert_map.get(&x) {
            return v;
        }
        let v = self.g.new_vertex();
        self.ensure_slot(v);
        self.potential[v] = self.potential[0];
        self.rev_map[v] = Some(x);
        self.vert_map.insert(x, v);
        v
    }

    fn ensure_slot(&mut self, v: VertId) {
        if self.rev_map.len() <= v {
            self.rev_map.resize(v + 1, None);
        }
        if self.potential.len() <= v {
            self.potential.resize(v + 1, 0);
        }
    }

    fn lb_weight(&self, x: Variable) -> Option<Weight> {
        let v = *self.vert_map.get(&x)?;
        self.g.lookup(v, 0)?.checked_neg()
    }

    fn ub_weight(&self, x: Variable) -> Option<Weight> {
        let v = *self.vert_map.get(&x)?;
        self.g.lookup(0, v)
    }

    /// Re-closes the graph if widening left it open.
    pub fn normalize(&mut self) {
        if self.unstable.is_empty() {
            return;
        }
        let unstable = std::mem::take(&mut self.unstable);
        graph_ops::close_after_widen(&mut self.g, &self.potential, &unstable, 0);
        graph_ops::close_after_assign(&mut self.g, &self.potential, 0, None);
    }

    fn normalized(&self) -> Cow<'_, SplitDbm> {
        if self.unstable.is_empty() {
            Cow::Borrowed(self)
        } else {
            let mut copy = self.clone();
            copy.normalize();
            Cow::Owned(copy)
        }
    }

    fn interval_of(&self, x: Variable) -> Interval {
        let Some(&v) = self.vert_map.get(&x) else {
            return Interval::top();
        };
        let lb = match self.g.lookup(v, 0) {
            Some(w) => crate::interval::Bound::Finite(-Number::from(w)),
            None => crate::interval::Bound::MinusInfinity,
        };
        let ub = match self.g.lookup(0, v) {
            Some(w) => crate::interval::Bound::Finite(Number::from(w)),
            None => crate::interval::Bound::PlusInfinity,
        };
        Interval::new(lb, ub)
    }

    fn interval_of_expression(&self, e: &LinearExpression) -> Interval {
        let mut r = Interval::singleton(e.constant_term().clone());
        for (v, c) in e.terms() {
            r = &r + &(&Interval::singleton(c.clone()) * &self.interval_of(v));
        }
        r
    }

    pub fn eval_interval_var(&self, x: Variable) -> Interval {
        if self.is_bottom {
            return Interval::bottom();
        }
        self.normalized().interval_of(x)
    }

    pub fn eval_interval(&self, e: &LinearExpression) -> Interval {
        if self.is_bottom {
            return Interval::bottom();
        }
        self.normalized().interval_of_expression(e)
    }

    /// Differences `(y, k)` such that `e - y` is bounded by `k` from above
    /// (`extract_upper`) or from below.
    fn diffcsts_of_assign(&self, e: &LinearExpression, extract_upper: bool) -> Vec<(Variable, Weight)> {
        self.try_diffcsts_of_assign(e, extract_upper).unwrap_or_default()
    }

    fn try_diffcsts_of_assign(&self, e: &LinearExpression, extract_upper: bool) -> Option<Vec<(Variable, Weight)>> {
        let mut residual = weight_of(e.constant_term())?;
        let mut unbounded: Option<Variable> = None;
        let mut terms = Vec::new();
        for (y, n) in e.terms() {
            let coeff = weight_of(n)?;
            if coeff < 0 {
                let bound = if extract_upper {
                    self.lb_weight(y)
                } else {
                    self.ub_weight(y)
                }?;
                residual = residual.checked_add(bound.checked_mul(coeff)?)?;
            } else {
                let bound = if extract_upper {
                    self.ub_weight(y)
                } else {
                    self.lb_weight(y)
                };
                match bound {
                    None => {
                        if unbounded.is_some() || coeff != 1 {
                            return None;
                        }
                        unbounded = Some(y);
                    }
                    Some(b) => {
                        residual = residual.checked_add(b.checked_mul(coeff)?)?;
                        terms.push((y, b));
                    }
                }
            }
        }
        match unbounded {
            Some(u) => Some(vec![(u, residual)]),
            None => Some(
                terms
                    .into_iter()
                    .filter_map(|(y, b)| residual.checked_sub(b).map(|k| (y, k)))
                    .collect(),
            ),
        }
    }

    fn diffcsts_of_lin_leq(&self, e: &LinearExpression) -> Option<LeqConstraints> {
        let mut exp_ub = weight_of(e.constant_term())?.checked_neg()?;
        let mut unbounded_lb: Option<(Variable, Weight)> = None;
        let mut unbounded_ub: Option<(Variable, Weight)> = None;
        // (coefficient magnitude, variable, bound used)
        let mut pos_terms: Vec<(Weight, Variable, Weight)> = Vec::new();
        let mut neg_terms: Vec<(Weight, Variable, Weight)> = Vec::new();

        for (y, n) in e.terms() {
            let coeff = weight_of(n)?;
            if coeff > 0 {
                match self.lb_weight(y) {
                    None => {
                        if unbounded_lb.is_some() {
                            return None;
                        }
                        unbounded_lb = Some((y, coeff));
                    }
                    Some(ymin) => {
                        exp_ub = exp_ub.checked_sub(ymin.checked_mul(coeff)?)?;
                        pos_terms.push((coeff, y, ymin));
                    }
                }
            } else {
                let magnitude = coeff.checked_neg()?;
                match self.ub_weight(y) {
                    None => {
                        if unbounded_ub.is_some() {
                            return None;
                        }
                        unbounded_ub = Some((y, magnitude));
                    }
                    Some(ymax) => {
                        exp_ub = exp_ub.checked_add(ymax.checked_mul(magnitude)?)?;
                        neg_terms.push((magnitude, y, ymax));
                    }
                }
            }
        }

        let mut out = LeqConstraints::default();
        match (unbounded_lb, unbounded_ub) {
            (Some((x, xc)), Some((y, yc))) => {
                if xc == 1 && yc == 1 {
                    out.diffs.push((x, y, exp_ub));
                }
            }
            (Some((x, xc)), None) => {
                if xc == 1 {
                    for &(_, nv, k) in &neg_terms {
                        out.diffs.push((x, nv, exp_ub.checked_sub(k)?));
                    }
                }
                out.ubs.push((x, exp_ub / xc));
            }
            (None, Some((y, yc))) => {
                if yc == 1 {
                    for &(_, pv, k) in &pos_terms {
                        out.diffs.push((pv, y, exp_ub.checked_add(k)?));
                    }
                }
                out.lbs.push((y, exp_ub.checked_neg()? / yc));
            }
            (None, None) => {
                for &(_, nv, nk) in &neg_terms {
                    for &(_, pv, pk) in &pos_terms {
                        out.diffs.push((pv, nv, exp_ub.checked_sub(nk)?.checked_add(pk)?));
                    }
                }
                for &(nc, nv, nk) in &neg_terms {
                    out.lbs.push((nv, (exp_ub.checked_neg()? / nc).checked_add(nk)?));
                }
                for &(pc, pv, pk) in &pos_terms {
                    out.ubs.push((pv, (exp_ub / pc).checked_add(pk)?));
                }
            }
        }
        Some(out)
    }

    /// Adds `e <= 0`. Returns false if the state became bottom.
    fn add_linear_leq(&mut self, e: &LinearExpression) -> bool {
        let Some(csts) = self.diffcsts_of_lin_leq(e) else {
            log::trace!("Dropping constraint that overflows the weight type");
            return true;
        };

        for (x, lb) in csts.lbs {
            let Some(w) = lb.checked_neg() else {
                continue;
            };
            let v = self.get_vert(x);
            if self.g.lookup(v, 0).is_some_and(|old| old <= w) {
                continue;
            }
            self.g.set_edge(v, w, 0);
            if !graph_ops::repair_potential(&self.g, &mut self.potential, v, 0) {
                self.set_to_bottom();
                return false;
            }
        }

        for (x, ub) in csts.ubs {
            let v = self.get_vert(x);
            if self.g.lookup(0, v).is_some_and(|old| old <= ub) {
                continue;
            }
            self.g.set_edge(0, ub, v);
            if !graph_ops::repair_potential(&self.g, &mut self.potential, 0, v) {
                self.set_to_bottom();
                return false;
            }
        }

        for (x, y, k) in csts.diffs {
            let src = self.get_vert(y);
            let dest = self.get_vert(x);
            if src == dest || !self.g.update_edge(src, k, dest) {
                continue;
            }
            if !graph_ops::repair_potential(&self.g, &mut self.potential, src, dest) {
                self.set_to_bottom();
                return false;
            }
            graph_ops::close_over_edge(&mut self.g, src, dest, 0);
        }

        graph_ops::close_after_assign(&mut self.g, &self.potential, 0, None);
        true
    }

    fn add_univar_disequation(&mut self, x: Variable, n: &Number) {
        let i = self.interval_of(x);
        if !i.contains(n) {
            return;
        }
        let at = crate::interval::Bound::Finite(n.clone());
        match (i.lb() == &at, i.ub() == &at) {
            (true, true) => self.set_to_bottom(),
            (true, false) => {
                // x >= n + 1
                self.add_linear_leq(&(LinearExpression::constant(n + 1i64) - x));
            }
            (false, true) => {
                // x <= n - 1
                self.add_linear_leq(&(LinearExpression::variable(x) - (n - 1i64)));
            }
            (false, false) => {}
        }
    }

    fn add_disequation(&mut self, e: &LinearExpression) {
        let terms: Vec<(Variable, Number)> = e.terms().map(|(v, c)| (v, c.clone())).collect();
        for (y, c) in terms {
            let residual = e.clone().add_term(y, -&c);
            let Some(k) = self.interval_of_expression(&residual).singleton_value() else {
                continue;
            };
            // c*y + k != 0
            if (&k % &c).is_zero() {
                let n = -(&k / &c);
                self.add_univar_disequation(y, &n);
                if self.is_bottom {
                    return;
                }
            }
        }
    }

    /// Adds a constraint. Returns false if the state became infeasible.
    pub fn add_constraint(&mut self, cst: &LinearConstraint) -> bool {
        if self.is_bottom {
            return false;
        }
        if cst.is_tautology() {
            return true;
        }
        if cst.is_contradiction() {
            self.set_to_bottom();
            return false;
        }
        self.normalize();
        let e = &cst.expression;
        match cst.kind {
            ConstraintKind::LessOrEqualsZero => {
                self.add_linear_leq(e);
            }
            ConstraintKind::LessThanZero => {
                self.add_linear_leq(&(e.clone() + 1i64));
            }
            ConstraintKind::EqualsZero => {
                if self.add_linear_leq(e) {
                    self.add_linear_leq(&(-e.clone()));
                }
            }
            ConstraintKind::NotZero => self.add_disequation(e),
        }
        !self.is_bottom
    }

    /// `x := e`.
    pub fn assign(&mut self, x: Variable, e: &LinearExpression) {
        if self.is_bottom {
            return;
        }
        self.normalize();
        if e.as_variable() == Some(x) {
            return;
        }
        let x_int = self.interval_of_expression(e);
        if x_int.is_singleton() || e.is_constant() {
            self.set(x, &x_int);
            return;
        }

        let diffs_lb = self.diffcsts_of_assign(e, false);
        let diffs_ub = self.diffcsts_of_assign(e, true);
        if diffs_lb.is_empty() && diffs_ub.is_empty() {
            self.set(x, &x_int);
            return;
        }

        // Value of e in the model described by the potential.
        let Some(mut e_val) = e.constant_term().to_i64().map(Potential::from) else {
            self.set(x, &x_int);
            return;
        };
        for (y, c) in e.terms() {
            let Some(c) = c.to_i64() else {
                self.set(x, &x_int);
                return;
            };
            if let Some(&yv) = self.vert_map.get(&y) {
                e_val += Potential::from(c) * (self.potential[yv] - self.potential[0]);
            }
        }

        let v = self.g.new_vertex();
        self.ensure_slot(v);
        self.rev_map[v] = None;
        self.potential[v] = self.potential[0] + e_val;

        for (y, k) in diffs_lb {
            let yv = self.get_vert(y);
            if let Some(w) = k.checked_neg() {
                self.g.set_edge(v, w, yv);
            }
        }
        for (y, k) in diffs_ub {
            let yv = self.get_vert(y);
            self.g.set_edge(yv, k, v);
        }
        graph_ops::close_after_assign(&mut self.g, &self.potential, v, Some(0));

        if let Some(lb) = x_int.lb().number().and_then(weight_of).and_then(Weight::checked_neg) {
            self.g.update_edge(v, lb, 0);
        }
        if let Some(ub) = x_int.ub().number().and_then(weight_of) {
            self.g.update_edge(0, ub, v);
        }

        self.forget(x);
        self.vert_map.insert(x, v);
        self.rev_map[v] = Some(x);
    }

    /// `x := intv`, forgetting all relations of `x`.
    pub fn set(&mut self, x: Variable, intv: &Interval) {
        if self.is_bottom {
            return;
        }
        if intv.is_bottom() {
            self.set_to_bottom();
            return;
        }
        self.forget(x);
        if intv.is_top() {
            return;
        }
        let ub = intv.ub().number().and_then(weight_of);
        let lb = intv.lb().number().and_then(weight_of);
        let neg_lb = lb.and_then(Weight::checked_neg);
        if ub.is_none() && neg_lb.is_none() {
            return;
        }
        let v = self.get_vert(x);
        if let Some(ub) = ub {
            self.potential[v] = self.potential[0] + Potential::from(ub);
            self.g.set_edge(0, ub, v);
        }
        if let (Some(lb), Some(neg_lb)) = (lb, neg_lb) {
            self.potential[v] = self.potential[0] + Potential::from(lb);
            self.g.set_edge(v, neg_lb, 0);
        }
    }

    pub fn forget(&mut self, x: Variable) {
        if self.is_bottom {
            return;
        }
        self.normalize();
        if let Some(v) = self.vert_map.remove(&x) {
            self.g.forget(v);
            self.rev_map[v] = None;
        }
    }

    pub fn forget_all(&mut self, xs: &[Variable]) {
        for &x in xs {
            self.forget(x);
        }
    }

    /// Inclusion test.
    pub fn le(&self, o: &SplitDbm) -> bool {
        if self.is_bottom {
            return true;
        }
        if o.is_bottom {
            return false;
        }
        if o.g.num_edges() == 0 {
            return true;
        }
        let a = self.normalized();
        let b = o.normalized();

        let mut rename: Vec<Option<VertId>> = vec![None; b.g.size()];
        rename[0] = Some(0);
        for (x, &ov) in &b.vert_map {
            if b.g.num_succs(ov) == 0 && b.g.num_preds(ov) == 0 {
                continue;
            }
            match a.vert_map.get(x) {
                Some(&v) => rename[ov] = Some(v),
                None => return false,
            }
        }

        for (os, ow, od) in b.g.edges() {
            let (Some(s), Some(d)) = (rename[os], rename[od]) else {
                return false;
            };
            if a.g.lookup(s, d).is_some_and(|w| w <= ow) {
                continue;
            }
            if let (Some(w1), Some(w2)) = (a.g.lookup(s, 0), a.g.lookup(0, d)) {
                if Potential::from(w1) + Potential::from(w2) <= Potential::from(ow) {
                    continue;
                }
            }
            return false;
        }
        true
    }

    /// Least upper bound.
    pub fn join(&self, o: &SplitDbm) -> SplitDbm {
        if self.is_bottom {
            return o.normalized().into_owned();
        }
        if o.is_bottom {
            return self.normalized().into_owned();
        }
        let a = self.normalized();
        let b = o.normalized();

        // Common variables only: a variable missing on either side is top.
        let mut perm_x = vec![Some(0)];
        let mut perm_y = vec![Some(0)];
        let mut pot_rx: Vec<Potential> = vec![0];
        let mut pot_ry: Vec<Potential> = vec![0];
        let mut vert_map = BTreeMap::new();
        let mut rev_map = vec![None];
        for (x, &vx) in &a.vert_map {
            if let Some(&vy) = b.vert_map.get(x) {
                vert_map.insert(*x, perm_x.len());
                rev_map.push(Some(*x));
                perm_x.push(Some(vx));
                perm_y.push(Some(vy));
                pot_rx.push(a.potential[vx] - a.potential[0]);
                pot_ry.push(b.potential[vy] - b.potential[0]);
            }
        }
        let gx = Graph::renamed(&a.g, &perm_x);
        let gy = Graph::renamed(&b.g, &perm_y);

        // Relations of one side that the bounds of the other side imply.
        let g_rx = Self::meet_with_implied(&gx, &gy, &pot_rx);
        let g_ry = Self::meet_with_implied(&gy, &gx, &pot_ry);
        let mut join_g = graph_ops::join(&g_rx, &g_ry);

        // Reapply relations between a variable whose lower bound went up and
        // one whose upper bound went up (and symmetrically for down).
        let n = perm_x.len();
        let mut lb_up = Vec::new();
        let mut lb_down = Vec::new();
        let mut ub_up = Vec::new();
        let mut ub_down = Vec::new();
        for v in 1..n {
            if let (Some(wx), Some(wy)) = (gx.lookup(0, v), gy.lookup(0, v)) {
                if wx < wy {
                    ub_up.push(v);
                }
                if wy < wx {
                    ub_down.push(v);
                }
            }
            if let (Some(wx), Some(wy)) = (gx.lookup(v, 0), gy.lookup(v, 0)) {
                if wx < wy {
                    lb_down.push(v);
                }
                if wy < wx {
                    lb_up.push(v);
                }
            }
        }
        for (lbs, ubs) in [(&lb_up, &ub_up), (&lb_down, &ub_down)] {
            for &s in lbs {
                let (Some(dx_s), Some(dy_s)) = (gx.lookup(s, 0), gy.lookup(s, 0)) else {
                    continue;
                };
                for &d in ubs {
                    if s == d {
                        continue;
                    }
                    let (Some(ux), Some(uy)) = (gx.lookup(0, d), gy.lookup(0, d)) else {
                        continue;
                    };
                    if let (Some(wx), Some(wy)) = (dx_s.checked_add(ux), dy_s.checked_add(uy)) {
                        join_g.update_edge(s, wx.max(wy), d);
                    }
                }
            }
        }

        // Drop vertices left without constraints.
        for v in 1..n {
            if join_g.num_succs(v) == 0 && join_g.num_preds(v) == 0 {
                join_g.forget(v);
                if let Some(x) = rev_map[v].take() {
                    vert_map.remove(&x);
                }
            }
        }

        let result = SplitDbm {
            vert_map,
            rev_map,
            g: join_g,
            potential: pot_rx,
            unstable: BTreeSet::new(),
            is_bottom: false,
        };
        if cfg!(debug_assertions) && !graph_ops::is_closed(&result.g, 0) {
            panic!("Bug! join result is not closed");
        }
        result
    }

    fn meet_with_implied(gx: &Graph, gy: &Graph, pot: &[Potential]) -> Graph {
        let mut implied = Graph::with_vertices(gx.size());
        for (s, _, d) in gy.edges() {
            if s == 0 || d == 0 {
                continue;
            }
            if let (Some(w1), Some(w2)) = (gx.lookup(s, 0), gx.lookup(0, d)) {
                if let Some(w) = w1.checked_add(w2) {
                    implied.set_edge(s, w, d);
                }
            }
        }
        let mut is_closed = true;
        let mut g = graph_ops::meet(gx, &implied, &mut is_closed);
        if !is_closed {
            graph_ops::close_after_meet(&mut g, pot, 0);
        }
        g
    }

    /// Keeps the constraints of `self` that `o` satisfies. The result is
    /// left open; it is re-closed by the next operation that needs it.
    pub fn widen(&self, o: &SplitDbm) -> SplitDbm {
        if self.is_bottom {
            return o.normalized().into_owned();
        }
        if o.is_bottom {
            return self.clone();
        }
        let b = o.normalized();

        let mut perm_x = vec![Some(0)];
        let mut perm_y = vec![Some(0)];
        let mut pot: Vec<Potential> = vec![0];
        let mut vert_map = BTreeMap::new();
        let mut rev_map = vec![None];
        let mut unstable = BTreeSet::new();
        for (x, &vx) in &self.vert_map {
            if let Some(&vy) = b.vert_map.get(x) {
                let id = perm_x.len();
                if self.unstable.contains(&vx) {
                    unstable.insert(id);
                }
                vert_map.insert(*x, id);
                rev_map.push(Some(*x));
                perm_x.push(Some(vx));
                perm_y.push(Some(vy));
                pot.push(self.potential[vx] - self.potential[0]);
            }
        }
        let gx = Graph::renamed(&self.g, &perm_x);
        let gy = Graph::renamed(&b.g, &perm_y);
        let g = graph_ops::widen(&gx, &gy, &mut unstable);

        SplitDbm {
            vert_map,
            rev_map,
            g,
            potential: pot,
            unstable,
            is_bottom: false,
        }
    }

    /// Greatest lower bound; `None` when the conjunction is infeasible.
    pub fn meet(&self, o: &SplitDbm) -> Option<SplitDbm> {
        if self.is_bottom || o.is_bottom {
            return None;
        }
        let a = self.normalized();
        let b = o.normalized();

        let mut perm_x = vec![Some(0)];
        let mut perm_y = vec![Some(0)];
        let mut pot: Vec<Potential> = vec![0];
        let mut vert_map = BTreeMap::new();
        let mut rev_map = vec![None];
        for (x, &vx) in &a.vert_map {
            vert_map.insert(*x, perm_x.len());
            rev_map.push(Some(*x));
            perm_x.push(Some(vx));
            perm_y.push(b.vert_map.get(x).copied());
            pot.push(a.potential[vx] - a.potential[0]);
        }
        for (x, &vy) in &b.vert_map {
            if a.vert_map.contains_key(x) {
                continue;
            }
            vert_map.insert(*x, perm_x.len());
            rev_map.push(Some(*x));
            perm_x.push(None);
            perm_y.push(Some(vy));
            pot.push(b.potential[vy] - b.potential[0]);
        }
        let gx = Graph::renamed(&a.g, &perm_x);
        let gy = Graph::renamed(&b.g, &perm_y);

        let mut is_closed = true;
        let mut g = graph_ops::meet(&gx, &gy, &mut is_closed);
        if !graph_ops::select_potentials(&g, &mut pot) {
            return None;
        }
        if !is_closed {
            graph_ops::close_after_meet(&mut g, &pot, 0);
            graph_ops::close_after_assign(&mut g, &pot, 0, None);
        }
        Some(SplitDbm {
            vert_map,
            rev_map,
            g,
            potential: pot,
            unstable: BTreeSet::new(),
            is_bottom: false,
        })
    }

    /// Narrowing is the identity on the left operand: sound, but it does
    /// not recover precision lost to widening.
    pub fn narrow(&self, o: &SplitDbm) -> SplitDbm {
        if self.is_bottom || o.is_bottom {
            return SplitDbm::bottom();
        }
        self.normalized().into_owned()
    }

    /// Does every state described by `self` satisfy `cst`?
    pub fn entail(&self, cst: &LinearConstraint) -> bool {
        if self.is_bottom {
            return true;
        }
        if cst.is_tautology() {
            return true;
        }
        if cst.is_contradiction() {
            return false;
        }
        let range = self.eval_interval(&cst.expression);
        let zero = Number::zero();
        let quick = match cst.kind {
            ConstraintKind::LessOrEqualsZero => range.ub() <= &crate::interval::Bound::Finite(zero.clone()),
            ConstraintKind::LessThanZero => range.ub() < &crate::interval::Bound::Finite(zero.clone()),
            ConstraintKind::EqualsZero => range.singleton_value() == Some(zero.clone()),
            ConstraintKind::NotZero => !range.contains(&zero),
        };
        if quick {
            return true;
        }
        if cst.kind == ConstraintKind::EqualsZero {
            let e = cst.expression.clone();
            return self.entail(&LinearConstraint::new(e.clone(), ConstraintKind::LessOrEqualsZero))
                && self.entail(&LinearConstraint::new(-e, ConstraintKind::LessOrEqualsZero));
        }
        let mut copy = self.clone();
        copy.add_constraint(&cst.negate());
        copy.is_bottom()
    }

    /// Is `cst` satisfiable together with `self`?
    pub fn intersect(&self, cst: &LinearConstraint) -> bool {
        if self.is_bottom || cst.is_contradiction() {
            return false;
        }
        if cst.is_tautology() {
            return true;
        }
        let mut copy = self.clone();
        copy.add_constraint(cst)
    }

    /// Every constrained variable with its (non-top) interval.
    pub fn intervals(&self) -> Vec<(Variable, Interval)> {
        if self.is_bottom {
            return Vec::new();
        }
        let this = self.normalized();
        this.vert_map
            .keys()
            .map(|&x| (x, this.interval_of(x)))
            .filter(|(_, i)| !i.is_top())
            .collect()
    }

    /// Every relational edge as `(x, y, k)` meaning `y - x <= k`.
    pub fn relations(&self) -> Vec<(Variable, Variable, Weight)> {
        if self.is_bottom {
            return Vec::new();
        }
        let this = self.normalized();
        this.g
            .edges()
            .into_iter()
            .filter(|(s, _, d)| *s != 0 && *d != 0)
            .filter_map(|(s, w, d)| Some((this.rev_map[s]?, this.rev_map[d]?, w)))
            .collect()
    }

    /// True if the graph is split-closed; exposed for consistency checks.
    pub fn is_closed(&self) -> bool {
        graph_ops::is_closed(&self.g, 0) && graph_ops::check_potential(&self.g, &self.potential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::{eq, le, lt, neq};
    use crate::variable::DataKind;

    fn var(i: u8) -> Variable {
        Variable::reg(DataKind::SValues, i)
    }

    fn interval(a: i64, b: i64) -> Interval {
        Interval::new(a, b)
    }

    #[test]
    fn test_set_and_eval() {
        let mut d = SplitDbm::top();
        d.set(var(1), &interval(2, 5));
        assert_eq!(d.eval_interval_var(var(1)), interval(2, 5));
        assert!(d.eval_interval_var(var(2)).is_top());
        d.set(var(1), &Interval::bottom());
        assert!(d.is_bottom());
    }

    #[test]
    fn test_assign_tracks_relations() {
        let mut d = SplitDbm::top();
        d.set(var(1), &interval(0, 10));
        d.assign(var(2), &(var(1) + 3i64));
        assert_eq!(d.eval_interval_var(var(2)), interval(3, 13));
        assert!(d.entail(&eq(var(2), var(1) + 3i64)));

        // Bounding one side bounds the other through the relation.
        assert!(d.add_constraint(&le(var(2), 5i64)));
        assert_eq!(d.eval_interval_var(var(1)), interval(0, 2));
        assert!(d.is_closed());
    }

    #[test]
    fn test_assign_self_increment() {
        let mut d = SplitDbm::top();
        d.set(var(1), &interval(0, 10));
        d.assign(var(2), &LinearExpression::variable(var(1)));
        d.assign(var(1), &(var(1) + 1i64));
        assert_eq!(d.eval_interval_var(var(1)), interval(1, 11));
        assert!(d.entail(&eq(var(1), var(2) + 1i64)));
    }

    #[test]
    fn test_constraints_and_bottom() {
        let mut d = SplitDbm::top();
        assert!(d.add_constraint(&le(var(1), var(2))));
        assert!(d.add_constraint(&le(var(2), var(3))));
        assert!(d.entail(&le(var(1), var(3))));
        assert!(!d.entail(&lt(var(1), var(3))));
        assert!(d.add_constraint(&le(var(3), var(1))));
        assert!(d.entail(&eq(var(1), var(3))));
        assert!(!d.add_constraint(&lt(var(3), var(1))));
        assert!(d.is_bottom());
    }

    #[test]
    fn test_disequation_trims_bounds() {
        let mut d = SplitDbm::top();
        d.set(var(1), &interval(0, 3));
        assert!(d.add_constraint(&neq(var(1), 0i64)));
        assert_eq!(d.eval_interval_var(var(1)), interval(1, 3));
        assert!(d.add_constraint(&neq(var(1), 2i64)));
        assert_eq!(d.eval_interval_var(var(1)), interval(1, 3));
        d.set(var(2), &interval(4, 4));
        assert!(!d.add_constraint(&neq(var(2), 4i64)));
    }

    #[test]
    fn test_join_is_upper_bound() {
        let mut a = SplitDbm::top();
        a.set(var(1), &interval(0, 0));
        a.assign(var(2), &(var(1) + 4i64));
        a.set(var(3), &interval(7, 9));
        let mut b = SplitDbm::top();
        b.set(var(1), &interval(5, 6));
        b.assign(var(2), &(var(1) + 4i64));

        let j = a.join(&b);
        assert!(a.le(&j));
        assert!(b.le(&j));
        assert_eq!(j.eval_interval_var(var(1)), interval(0, 6));
        assert!(j.eval_interval_var(var(3)).is_top());
        // The relation survives the join.
        assert!(j.entail(&eq(var(2), var(1) + 4i64)));
        assert!(j.is_closed());
    }

    #[test]
    fn test_join_recovers_relation_between_constants() {
        let mut a = SplitDbm::top();
        a.set(var(1), &interval(0, 0));
        a.set(var(2), &interval(0, 0));
        let mut b = SplitDbm::top();
        b.set(var(1), &interval(1, 1));
        b.set(var(2), &interval(1, 1));
        let j = a.join(&b);
        assert!(j.entail(&eq(var(1), var(2))));
    }

    #[test]
    fn test_meet() {
        let mut a = SplitDbm::top();
        a.set(var(1), &interval(0, 10));
        let mut b = SplitDbm::top();
        b.set(var(1), &interval(5, 20));
        b.add_constraint(&le(var(2), var(1)));
        let m = a.meet(&b).unwrap();
        assert_eq!(m.eval_interval_var(var(1)), interval(5, 10));
        assert_eq!(m.eval_interval_var(var(2)).ub(), &crate::interval::Bound::Finite(Number::from(10)));

        let mut c = SplitDbm::top();
        c.set(var(1), &interval(11, 12));
        assert!(a.meet(&c).is_none());
    }

    #[test]
    fn test_widening_terminates_on_counting_loop() {
        // x := 0; while (..) x := x + 1
        let mut head = SplitDbm::top();
        head.set(var(1), &interval(0, 0));
        let mut iterations = 0;
        loop {
            iterations += 1;
            assert!(iterations < 10, "widening did not stabilize");
            let mut body = head.clone();
            body.assign(var(1), &(var(1) + 1i64));
            let next = head.join(&body);
            if next.le(&head) {
                break;
            }
            head = head.widen(&next);
        }
        let i = head.eval_interval_var(var(1));
        assert_eq!(i, Interval::at_least(0));
    }

    #[test]
    fn test_widening_keeps_stable_relations() {
        let mut a = SplitDbm::top();
        a.set(var(1), &interval(0, 10));
        a.assign(var(2), &LinearExpression::variable(var(1)));
        let mut b = a.clone();
        b.assign(var(1), &(var(1) + 1i64));
        b.assign(var(2), &(var(2) + 1i64));
        let j = a.join(&b);
        let w = a.widen(&j);
        assert!(w.entail(&eq(var(1), var(2))));
        assert!(a.le(&w) && j.le(&w));
        assert_eq!(w.eval_interval_var(var(1)), Interval::at_least(0));
    }

    #[test]
    fn test_overflowing_weights_are_dropped() {
        let big = i64::MAX - 1;
        let mut d = SplitDbm::top();
        assert!(d.add_constraint(&le(var(1), var(2) + big)));
        assert!(d.add_constraint(&le(var(2), var(3) + big)));
        assert!(d.add_constraint(&le(var(3), big)));
        assert!(d.add_constraint(&le(var(3), var(1) + big)));
        // x - z <= 2 * big does not fit a weight.
        d.assign(var(1), &(var(2) + big));
        assert!(!d.is_bottom());
        assert!(d.is_closed());
        assert!(d.eval_interval_var(var(1)).is_top());

        let mut other = SplitDbm::top();
        other.set(var(1), &interval(0, 3));
        other.set(var(3), &interval(0, 3));
        let j = d.join(&other);
        assert!(d.le(&j) && other.le(&j));
        assert!(j.is_closed());
        let w = d.widen(&other);
        assert!(d.le(&w) && other.le(&w));
    }

    #[test]
    fn test_closure_is_idempotent() {
        let mut d = SplitDbm::top();
        d.add_constraint(&le(var(1), var(2) + 1i64));
        d.add_constraint(&le(var(2), var(3) + 2i64));
        d.add_constraint(&le(var(3), 5i64));
        assert!(d.is_closed());
        let before = d.relations();
        let mut again = d.clone();
        graph_ops::close_after_meet(&mut again.g, &again.potential, 0);
        graph_ops::close_after_assign(&mut again.g, &again.potential, 0, None);
        assert_eq!(again.relations(), before);
        assert_eq!(again.intervals(), d.intervals());
        assert_eq!(d.eval_interval_var(var(1)).ub(), &crate::interval::Bound::Finite(Number::from(8)));
    }

    #[test]
    fn test_narrow_is_identity() {
        let mut a = SplitDbm::top();
        a.set(var(1), &Interval::at_least(0));
        let mut b = SplitDbm::top();
        b.set(var(1), &interval(0, 5));
        let n = a.narrow(&b);
        assert_eq!(n.eval_interval_var(var(1)), Interval::at_least(0));
    }

    #[test]
    fn test_intersect() {
        let mut d = SplitDbm::top();
        d.set(var(1), &interval(0, 5));
        assert!(d.intersect(&eq(var(1), 3i64)));
        assert!(!d.intersect(&eq(var(1), 6i64)));
        assert!(d.entail(&le(var(1), 5i64)));
        assert!(!d.entail(&le(var(1), 4i64)));
    }
}
