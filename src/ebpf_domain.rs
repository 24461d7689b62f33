//! The program state: the numeric domain plus the stack.
//!
//! Every register owns the variables listed in [`RegPack`]; memory cells of
//! the stack are variables of the same kinds owned by the [`ArrayDomain`].
//! The instruction semantics live in [`crate::transformer`].

use std::collections::{BTreeMap, BTreeSet};

use crate::array_domain::{ArrayDomain, Cell};
use crate::context::AnalysisContext;
use crate::error::{Result, VerifierError};
use crate::finite_domain::NumAbsDomain;
use crate::instruction::Reg;
use crate::interval::{Bound, Interval};
use crate::label::Label;
use crate::linear::{ge, le, LinearConstraint, LinearExpression};
use crate::number::Number;
use crate::platform::{MapDescriptor, MapValueType, EBPF_TOTAL_STACK_SIZE, MAX_PACKET_SIZE, MIN_META_OFFSET, PTR_MAX};
use crate::type_domain::{reg_pack, TypeDomain};
use crate::type_encoding::TypeEncoding;
use crate::variable::{DataKind, Variable, VariableName};

/// Largest range of map fds that map queries enumerate.
const MAX_MAP_FD_SPAN: i64 = 64;

#[derive(Debug, Clone, Default)]
pub struct EbpfDomain {
    pub inv: NumAbsDomain,
    pub stack: ArrayDomain,
}

impl EbpfDomain {
    pub fn top() -> Self {
        EbpfDomain {
            inv: NumAbsDomain::top(),
            stack: ArrayDomain::top(),
        }
    }

    pub fn bottom() -> Self {
        EbpfDomain {
            inv: NumAbsDomain::bottom(),
            stack: ArrayDomain::top(),
        }
    }

    pub fn is_bottom(&self) -> bool {
        self.inv.is_bottom()
    }

    pub fn is_top(&self) -> bool {
        self.inv.is_top() && self.stack.is_top()
    }

    pub fn set_to_top(&mut self) {
        self.inv.set_to_top();
        self.stack.set_to_top();
    }

    pub fn set_to_bottom(&mut self) {
        self.inv.set_to_bottom();
    }

    pub fn le(&self, other: &EbpfDomain) -> bool {
        if self.is_bottom() {
            return true;
        }
        if other.is_bottom() {
            return false;
        }
        self.inv.le(&other.inv) && self.stack.le(&other.stack)
    }

    /// Join that keeps the facts of region tags possible on only one side.
    pub fn join(&self, ctx: &AnalysisContext, other: &EbpfDomain) -> EbpfDomain {
        if self.is_bottom() {
            return other.clone();
        }
        if other.is_bottom() {
            return self.clone();
        }
        EbpfDomain {
            inv: TypeDomain::new(ctx.vars()).selective_join(&self.inv, &other.inv),
            stack: self.stack.join(&other.stack),
        }
    }

    pub fn widen(&self, other: &EbpfDomain) -> EbpfDomain {
        if self.is_bottom() {
            return other.clone();
        }
        if other.is_bottom() {
            return self.clone();
        }
        EbpfDomain {
            inv: self.inv.widen(&other.inv),
            stack: self.stack.widen(&other.stack),
        }
    }

    pub fn meet(&self, other: &EbpfDomain) -> EbpfDomain {
        match self.inv.meet(&other.inv) {
            Some(inv) => EbpfDomain {
                inv,
                stack: self.stack.meet(&other.stack),
            },
            None => EbpfDomain::bottom(),
        }
    }

    pub fn narrow(&self, other: &EbpfDomain) -> EbpfDomain {
        if self.is_bottom() || other.is_bottom() {
            return EbpfDomain::bottom();
        }
        EbpfDomain {
            inv: self.inv.narrow(&other.inv),
            stack: self.stack.narrow(&other.stack),
        }
    }

    pub fn add_constraint(&mut self, cst: &LinearConstraint) -> bool {
        self.inv.add_constraint(cst)
    }

    /// The state on entry to the program: `r10` points to the top of the
    /// stack, `r1` to the context.
    pub fn setup_entry(ctx: &AnalysisContext) -> EbpfDomain {
        let mut dom = EbpfDomain::top();
        let types = TypeDomain::new(ctx.vars());

        let r10 = reg_pack(Reg::R10_STACK_POINTER);
        dom.inv.add_constraint(&ge(r10.svalue, EBPF_TOTAL_STACK_SIZE));
        dom.inv.add_constraint(&le(r10.svalue, PTR_MAX));
        dom.inv.assign(r10.uvalue, r10.svalue);
        dom.inv.assign(r10.stack_offset, EBPF_TOTAL_STACK_SIZE);
        types.assign_type(&mut dom.inv, Reg::R10_STACK_POINTER, TypeEncoding::Stack);

        let r1 = reg_pack(Reg::R1_ARG);
        dom.inv.add_constraint(&ge(r1.svalue, 1i64));
        dom.inv.add_constraint(&le(r1.svalue, PTR_MAX));
        dom.inv.assign(r1.uvalue, r1.svalue);
        dom.inv.assign(r1.ctx_offset, 0i64);
        types.assign_type(&mut dom.inv, Reg::R1_ARG, TypeEncoding::Ctx);

        dom.initialize_packet(ctx);
        dom
    }

    /// Forgets the packet size and metadata offset and re-establishes their
    /// static bounds.
    pub fn initialize_packet(&mut self, ctx: &AnalysisContext) {
        let packet_size = Variable::packet_size();
        let meta_offset = Variable::meta_offset();
        self.inv.havoc(packet_size);
        self.inv.havoc(meta_offset);
        self.inv.add_constraint(&ge(packet_size, 0i64));
        self.inv.add_constraint(&le(packet_size, MAX_PACKET_SIZE - 1));
        if ctx.program_info.context.meta >= 0 {
            self.inv.add_constraint(&ge(meta_offset, MIN_META_OFFSET));
            self.inv.add_constraint(&le(meta_offset, 0i64));
        } else {
            self.inv.assign(meta_offset, 0i64);
        }
    }

    pub fn initialize_loop_counter(&mut self, ctx: &AnalysisContext, head: &Label) {
        let counter = ctx.vars().loop_counter(&head.to_string());
        self.inv.assign(counter, 0i64);
    }

    /// The greatest value any loop counter may have here.
    pub fn loop_count_upper_bound(&self, ctx: &AnalysisContext) -> Bound {
        ctx.vars()
            .loop_counters()
            .into_iter()
            .map(|c| self.inv.interval(c).ub().clone())
            .fold(Bound::Finite(Number::zero()), std::cmp::max)
    }

    /// The offset variable of `reg` for region `t`, if the region has one.
    pub fn type_offset_variable(reg: Reg, t: TypeEncoding) -> Option<Variable> {
        let pack = reg_pack(reg);
        match t {
            TypeEncoding::Ctx => Some(pack.ctx_offset),
            TypeEncoding::Packet => Some(pack.packet_offset),
            TypeEncoding::Stack => Some(pack.stack_offset),
            TypeEncoding::Shared => Some(pack.shared_offset),
            _ => None,
        }
    }

    /// The offset variable of `reg` when its region is known exactly.
    pub fn reg_offset_variable(&self, ctx: &AnalysisContext, reg: Reg) -> Option<Variable> {
        let t = TypeDomain::new(ctx.vars()).get_reg_type(&self.inv, reg);
        Self::type_offset_variable(reg, t)
    }

    /// Descriptors of every map `reg` may refer to, or `None` if the fd is
    /// not bounded or names an unknown map.
    fn map_descriptors<'c>(&self, ctx: &'c AnalysisContext, reg: Reg) -> Option<Vec<&'c MapDescriptor>> {
        let fds = self.inv.interval(reg_pack(reg).map_fd);
        let lb = fds.lb().number()?.to_i64()?;
        let ub = fds.ub().number()?.to_i64()?;
        if ub - lb >= MAX_MAP_FD_SPAN {
            return None;
        }
        (lb..=ub)
            .map(|fd| i32::try_from(fd).ok().and_then(|fd| ctx.program_info.map_descriptor(fd)))
            .collect()
    }

    /// A property shared by every map `reg` may refer to.
    fn common_map_property<T: PartialEq>(
        &self,
        ctx: &AnalysisContext,
        reg: Reg,
        property: impl Fn(&MapDescriptor) -> T,
    ) -> Option<T> {
        let descriptors = self.map_descriptors(ctx, reg)?;
        let mut values = descriptors.into_iter().map(property);
        let first = values.next()?;
        values.all(|v| v == first).then_some(first)
    }

    fn map_size_interval(&self, ctx: &AnalysisContext, reg: Reg, size: impl Fn(&MapDescriptor) -> u32) -> Interval {
        match self.map_descriptors(ctx, reg) {
            Some(descriptors) if !descriptors.is_empty() => descriptors
                .into_iter()
                .map(|d| Interval::singleton(size(d)))
                .fold(Interval::bottom(), |acc, i| acc.join(&i)),
            _ => Interval::top(),
        }
    }

    pub fn map_type(&self, ctx: &AnalysisContext, reg: Reg) -> Option<u32> {
        self.common_map_property(ctx, reg, |d| d.map_type)
    }

    pub fn map_value_type(&self, ctx: &AnalysisContext, reg: Reg) -> Option<MapValueType> {
        self.common_map_property(ctx, reg, |d| d.value_type)
    }

    pub fn map_inner_map_fd(&self, ctx: &AnalysisContext, reg: Reg) -> Option<i32> {
        self.common_map_property(ctx, reg, |d| d.inner_map_fd).flatten()
    }

    pub fn map_is_array(&self, ctx: &AnalysisContext, reg: Reg) -> bool {
        self.common_map_property(ctx, reg, |d| d.is_array).unwrap_or(false)
    }

    pub fn map_key_size(&self, ctx: &AnalysisContext, reg: Reg) -> Interval {
        self.map_size_interval(ctx, reg, |d| d.key_size)
    }

    pub fn map_value_size(&self, ctx: &AnalysisContext, reg: Reg) -> Interval {
        self.map_size_interval(ctx, reg, |d| d.value_size)
    }

    pub fn map_max_entries(&self, ctx: &AnalysisContext, reg: Reg) -> Interval {
        self.map_size_interval(ctx, reg, |d| d.max_entries)
    }

    /// Renders the state as a sorted set of facts, e.g. `r1.type=ctx`,
    /// `r0.svalue=[0, 2]`, `r2.svalue-r1.svalue<=4`. Relations already
    /// implied by the bounds of their variables are left out.
    pub fn to_set(&self, ctx: &AnalysisContext) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        if self.is_bottom() {
            out.insert("_|_".to_string());
            return out;
        }
        let vars = ctx.vars();
        let intervals: BTreeMap<Variable, Interval> = self.inv.dbm().intervals().into_iter().collect();
        for (v, i) in &intervals {
            let name = vars.display(*v);
            if vars.kind(*v) == Some(DataKind::Types) {
                out.insert(render_type_fact(&name, i));
            } else {
                out.insert(format!("{}={}", name, i));
            }
        }
        for (x, y, w) in self.inv.dbm().relations() {
            let y_ub = intervals.get(&y).and_then(|i| i.ub().number().cloned());
            let x_lb = intervals.get(&x).and_then(|i| i.lb().number().cloned());
            if let (Some(ub), Some(lb)) = (y_ub, x_lb) {
                if ub - &lb <= w {
                    continue;
                }
            }
            out.insert(format!("{}-{}<={}", vars.display(y), vars.display(x), w));
        }
        out.extend(self.stack.num_bytes().to_set());
        out
    }

    /// Multi-line rendering of [`EbpfDomain::to_set`].
    pub fn render(&self, ctx: &AnalysisContext) -> String {
        let facts: Vec<String> = self.to_set(ctx).into_iter().collect();
        format!("[{}]", facts.join(", "))
    }

    /// Parses facts in the format of [`EbpfDomain::to_set`] into a state.
    /// Facts about the same variable are intersected.
    pub fn from_constraints(ctx: &AnalysisContext, facts: &[&str]) -> Result<EbpfDomain> {
        let mut dom = EbpfDomain::top();
        let vars = ctx.vars();
        let invalid = |fact: &str| VerifierError::InvalidConstraint(fact.to_string());
        for &fact in facts {
            let fact = fact.trim();
            if fact == "_|_" {
                return Ok(EbpfDomain::bottom());
            }
            let mut csts = Vec::new();
            if let Some((lhs, w)) = fact.split_once("<=") {
                let (y, x) = lhs.split_once('-').ok_or_else(|| invalid(fact))?;
                let y = vars.parse(y).ok_or_else(|| invalid(fact))?;
                let x = vars.parse(x).ok_or_else(|| invalid(fact))?;
                let w: i64 = w.parse().map_err(|_| invalid(fact))?;
                csts.push(le(LinearExpression::variable(y) - x, w));
            } else if let Some((lhs, names)) = fact.split_once(" in ") {
                let v = vars.parse(lhs).ok_or_else(|| invalid(fact))?;
                let tags = names
                    .strip_prefix('{')
                    .and_then(|s| s.strip_suffix('}'))
                    .ok_or_else(|| invalid(fact))?
                    .split(',')
                    .map(|name| TypeEncoding::from_name(name.trim()).map(TypeEncoding::tag))
                    .collect::<Option<Vec<i64>>>()
                    .ok_or_else(|| invalid(fact))?;
                let lb = tags.iter().min().ok_or_else(|| invalid(fact))?;
                let ub = tags.iter().max().ok_or_else(|| invalid(fact))?;
                csts.push(ge(v, *lb));
                csts.push(le(v, *ub));
            } else if let Some((lhs, rhs)) = fact.split_once('=') {
                if rhs == "number" {
                    if let Some((offset, size)) = parse_numeric_bytes(lhs) {
                        let idx = LinearExpression::constant(offset);
                        dom.stack.store_numbers(&dom.inv, &idx, &LinearExpression::constant(size));
                        continue;
                    }
                }
                let v = vars.parse(lhs).ok_or_else(|| invalid(fact))?;
                let interval = if vars.kind(v) == Some(DataKind::Types) {
                    let t = TypeEncoding::from_name(rhs).ok_or_else(|| invalid(fact))?;
                    Interval::singleton(t.tag())
                } else {
                    parse_interval(rhs).ok_or_else(|| invalid(fact))?
                };
                if let Some(n) = interval.lb().number() {
                    csts.push(ge(v, n));
                }
                if let Some(n) = interval.ub().number() {
                    csts.push(le(v, n));
                }
                if let VariableName::Cell { kind, offset, size } = vars.name(v) {
                    dom.stack.track_cell(kind, Cell::new(offset, size));
                }
            } else {
                return Err(invalid(fact));
            }
            if !dom.inv.add_constraints(&csts) {
                return Ok(EbpfDomain::bottom());
            }
        }
        Ok(dom)
    }
}

fn render_type_fact(name: &str, tags: &Interval) -> String {
    if let Some(t) = tags.singleton_value().and_then(|n| n.to_i64()).and_then(TypeEncoding::from_tag) {
        return format!("{}={}", name, t);
    }
    let lb = tags.lb().number().and_then(|n| n.to_i64()).unwrap_or(TypeEncoding::Uninit.tag());
    let ub = tags.ub().number().and_then(|n| n.to_i64()).unwrap_or(TypeEncoding::MAX);
    let mut names = Vec::new();
    if lb <= TypeEncoding::Uninit.tag() {
        names.push(TypeEncoding::Uninit.name());
    }
    names.extend(TypeEncoding::iterate(lb, ub).into_iter().map(TypeEncoding::name));
    format!("{} in {{{}}}", name, names.join(", "))
}

/// `s[a...b].type` or `s[a].type` as `(a, b - a + 1)`.
fn parse_numeric_bytes(lhs: &str) -> Option<(i64, i64)> {
    let range = lhs.strip_prefix("s[")?.strip_suffix("].type")?;
    let (a, b) = match range.split_once("...") {
        Some((a, b)) => (a.parse::<i64>().ok()?, b.parse::<i64>().ok()?),
        None => {
            let a = range.parse::<i64>().ok()?;
            (a, a)
        }
    };
    (a <= b).then_some((a, b - a + 1))
}

fn parse_bound(s: &str) -> Option<Bound> {
    match s.trim() {
        "-oo" => Some(Bound::MinusInfinity),
        "+oo" => Some(Bound::PlusInfinity),
        n => n.parse::<Number>().ok().map(Bound::Finite),
    }
}

/// `n` or `[a, b]`, with `-oo` and `+oo` for unbounded ends.
fn parse_interval(s: &str) -> Option<Interval> {
    match s.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        Some(range) => {
            let (a, b) = range.split_once(',')?;
            Some(Interval::new(parse_bound(a)?, parse_bound(b)?))
        }
        None => s.parse::<Number>().ok().map(Interval::singleton),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::type_encoding::TypeGroup;

    #[test]
    fn test_entry_state() {
        let ctx = AnalysisContext::default();
        let dom = EbpfDomain::setup_entry(&ctx);
        let types = TypeDomain::new(ctx.vars());
        assert!(types.is_in_group(&dom.inv, Reg::R10_STACK_POINTER, TypeGroup::Stack));
        assert!(types.is_in_group(&dom.inv, Reg::R1_ARG, TypeGroup::Ctx));
        assert_eq!(types.get_reg_type(&dom.inv, Reg(2)), TypeEncoding::Uninit);
        let facts = dom.to_set(&ctx);
        assert!(facts.contains("r10.type=stack"));
        assert!(facts.contains("r10.stack_offset=4096"));
        assert!(facts.contains("r1.ctx_offset=0"));
        assert!(facts.contains("meta_offset=0"));
        assert!(facts.contains("packet_size=[0, 65534]"));
    }

    #[test]
    fn test_join_keeps_region_specific_offsets() {
        let ctx = AnalysisContext::default();
        let types = TypeDomain::new(ctx.vars());
        let r1 = reg_pack(Reg(1));

        let mut a = EbpfDomain::top();
        types.assign_type(&mut a.inv, Reg(1), TypeEncoding::Stack);
        a.inv.assign(r1.stack_offset, 4000i64);
        let mut b = EbpfDomain::top();
        types.assign_type(&mut b.inv, Reg(1), TypeEncoding::Packet);
        b.inv.assign(r1.packet_offset, 10i64);

        let joined = a.join(&ctx, &b);
        assert_eq!(joined.inv.interval(r1.stack_offset), Interval::singleton(4000));
        assert_eq!(joined.inv.interval(r1.packet_offset), Interval::singleton(10));
        assert!(types.is_in_group(&joined.inv, Reg(1), TypeGroup::StackOrPacket));
        assert!(a.le(&joined) && b.le(&joined));
    }

    #[test]
    fn test_bottom_is_neutral() {
        let ctx = AnalysisContext::default();
        let entry = EbpfDomain::setup_entry(&ctx);
        let bottom = EbpfDomain::bottom();
        assert!(bottom.le(&entry));
        assert!(!entry.le(&bottom));
        assert!(bottom.join(&ctx, &entry).le(&entry));
        assert!(entry.meet(&bottom).is_bottom());
    }

    #[test]
    fn test_facts_round_trip() {
        let ctx = AnalysisContext::default();
        let dom = EbpfDomain::from_constraints(
            &ctx,
            &[
                "r1.type=number",
                "r1.svalue=[0, 10]",
                "r2.type in {ctx, packet}",
                "r3.svalue-r1.svalue<=4",
                "s[4088...4095].type=number",
            ],
        )
        .expect("well-formed facts");
        let types = TypeDomain::new(ctx.vars());
        assert!(types.is_in_group(&dom.inv, Reg(1), TypeGroup::Number));
        assert!(dom.stack.all_num(&dom.inv, &LinearExpression::constant(4088), &LinearExpression::constant(4096)));

        let facts = dom.to_set(&ctx);
        assert!(facts.contains("r1.svalue=[0, 10]"));
        assert!(facts.contains("r2.type in {ctx, packet}"));
        assert!(facts.contains("r3.svalue=[-oo, 14]"));
        assert!(facts.contains("s[4088...4095].type=number"));

        let strs: Vec<&str> = facts.iter().map(String::as_str).collect();
        let again = EbpfDomain::from_constraints(&ctx, &strs).expect("rendered facts parse");
        assert_eq!(again.to_set(&ctx), facts);
    }

    #[test]
    fn test_malformed_fact() {
        let ctx = AnalysisContext::default();
        let err = EbpfDomain::from_constraints(&ctx, &["r1.svalue"]).unwrap_err();
        assert_eq!(err, VerifierError::InvalidConstraint("r1.svalue".to_string()));
        assert!(EbpfDomain::from_constraints(&ctx, &["r1.type=pointer"]).is_err());
    }

    #[test]
    fn test_map_queries() {
        let mut ctx = AnalysisContext::default();
        ctx.program_info.maps.push(MapDescriptor {
            original_fd: 3,
            map_type: 1,
            key_size: 4,
            value_size: 16,
            max_entries: 8,
            inner_map_fd: None,
            value_type: MapValueType::Any,
            is_array: false,
        });
        let mut dom = EbpfDomain::top();
        dom.inv.assign(reg_pack(Reg(1)).map_fd, 3i64);
        assert_eq!(dom.map_type(&ctx, Reg(1)), Some(1));
        assert_eq!(dom.map_value_size(&ctx, Reg(1)), Interval::singleton(16));
        assert_eq!(dom.map_inner_map_fd(&ctx, Reg(1)), None);
        assert!(dom.map_key_size(&ctx, Reg(2)).is_top());
    }
}
