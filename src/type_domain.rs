//! Region-tag queries and case splitting over the tags of a register.

use std::collections::BTreeMap;

use crate::instruction::Reg;
use crate::interval::Interval;
use crate::linear::{eq, ge, le, neq, LinearConstraint, LinearExpression};
use crate::number::Number;
use crate::finite_domain::NumAbsDomain;
use crate::type_encoding::{TypeEncoding, TypeGroup};
use crate::variable::{DataKind, Variable, VariableFactory};

/// The variables of one register.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegPack {
    pub svalue: Variable,
    pub uvalue: Variable,
    pub ctx_offset: Variable,
    pub map_fd: Variable,
    pub packet_offset: Variable,
    pub shared_offset: Variable,
    pub stack_offset: Variable,
    pub type_: Variable,
    pub shared_region_size: Variable,
    pub stack_numeric_size: Variable,
}

pub fn reg_pack(r: Reg) -> RegPack {
    let v = |kind| Variable::reg(kind, r.0);
    RegPack {
        svalue: v(DataKind::SValues),
        uvalue: v(DataKind::UValues),
        ctx_offset: v(DataKind::CtxOffsets),
        map_fd: v(DataKind::MapFds),
        packet_offset: v(DataKind::PacketOffsets),
        shared_offset: v(DataKind::SharedOffsets),
        stack_offset: v(DataKind::StackOffsets),
        type_: v(DataKind::Types),
        shared_region_size: v(DataKind::SharedRegionSizes),
        stack_numeric_size: v(DataKind::StackNumericSizes),
    }
}

/// Which variable kinds are meaningful only while the owner may have a tag.
pub const TYPE_SPECIFIC_KINDS: [(TypeEncoding, DataKind); 8] = [
    (TypeEncoding::Ctx, DataKind::CtxOffsets),
    (TypeEncoding::Map, DataKind::MapFds),
    (TypeEncoding::MapPrograms, DataKind::MapFds),
    (TypeEncoding::Packet, DataKind::PacketOffsets),
    (TypeEncoding::Shared, DataKind::SharedOffsets),
    (TypeEncoding::Stack, DataKind::StackOffsets),
    (TypeEncoding::Shared, DataKind::SharedRegionSizes),
    (TypeEncoding::Stack, DataKind::StackNumericSizes),
];

fn tag(t: TypeEncoding) -> LinearExpression {
    LinearExpression::constant(t.tag())
}

/// Tag queries on a numeric state. Needs the variable factory to find every
/// tag variable and its companions.
#[derive(Debug, Copy, Clone)]
pub struct TypeDomain<'a> {
    vars: &'a VariableFactory,
}

impl<'a> TypeDomain<'a> {
    pub fn new(vars: &'a VariableFactory) -> Self {
        TypeDomain { vars }
    }

    pub fn assign_type(&self, inv: &mut NumAbsDomain, lhs: Reg, t: TypeEncoding) {
        inv.assign(reg_pack(lhs).type_, t.tag());
    }

    /// Copies the tag of `rhs`, or forgets the tag when it is unknown.
    pub fn assign_type_expr(&self, inv: &mut NumAbsDomain, lhs: Variable, rhs: Option<LinearExpression>) {
        match rhs {
            Some(e) => inv.assign(lhs, e),
            None => inv.havoc(lhs),
        }
    }

    pub fn havoc_type(&self, inv: &mut NumAbsDomain, r: Reg) {
        inv.havoc(reg_pack(r).type_);
    }

    /// The tag of `v` when it is known exactly, else `Uninit`.
    pub fn get_type(&self, inv: &NumAbsDomain, v: &LinearExpression) -> TypeEncoding {
        inv.eval_interval(v)
            .singleton_value()
            .and_then(|n| n.to_i64())
            .and_then(TypeEncoding::from_tag)
            .unwrap_or(TypeEncoding::Uninit)
    }

    pub fn get_reg_type(&self, inv: &NumAbsDomain, r: Reg) -> TypeEncoding {
        self.get_type(inv, &reg_pack(r).type_.into())
    }

    /// May `v` hold tag `t`?
    pub fn has_type(&self, inv: &NumAbsDomain, v: Variable, t: TypeEncoding) -> bool {
        inv.interval(v).contains(&Number::from(t.tag()))
    }

    pub fn reg_has_type(&self, inv: &NumAbsDomain, r: Reg, t: TypeEncoding) -> bool {
        self.has_type(inv, reg_pack(r).type_, t)
    }

    pub fn same_type(&self, inv: &NumAbsDomain, a: Reg, b: Reg) -> bool {
        inv.entail(&eq(reg_pack(a).type_, reg_pack(b).type_))
    }

    /// Does `a` imply `b` in `inv`?
    pub fn implies_type(&self, inv: &NumAbsDomain, a: &LinearConstraint, b: &LinearConstraint) -> bool {
        let mut when = inv.clone();
        if !when.add_constraint(a) {
            return true;
        }
        when.entail(b)
    }

    pub fn is_in_group(&self, inv: &NumAbsDomain, r: Reg, group: TypeGroup) -> bool {
        let t = reg_pack(r).type_;
        use TypeEncoding as T;
        match group {
            TypeGroup::Number => inv.entail(&eq(t, tag(T::Number))),
            TypeGroup::MapFd => inv.entail(&eq(t, tag(T::Map))),
            TypeGroup::MapFdPrograms => inv.entail(&eq(t, tag(T::MapPrograms))),
            TypeGroup::Ctx => inv.entail(&eq(t, tag(T::Ctx))),
            TypeGroup::Packet => inv.entail(&eq(t, tag(T::Packet))),
            TypeGroup::Stack => inv.entail(&eq(t, tag(T::Stack))),
            TypeGroup::Shared => inv.entail(&eq(t, tag(T::Shared))),
            TypeGroup::NonMapFd | TypeGroup::PtrOrNum => inv.entail(&ge(t, tag(T::Number))),
            TypeGroup::Mem => inv.entail(&ge(t, tag(T::Packet))),
            TypeGroup::MemOrNum => inv.entail(&ge(t, tag(T::Number))) && inv.entail(&neq(t, tag(T::Ctx))),
            TypeGroup::Pointer => inv.entail(&ge(t, tag(T::Ctx))),
            TypeGroup::StackOrPacket => inv.entail(&ge(t, tag(T::Packet))) && inv.entail(&le(t, tag(T::Stack))),
            TypeGroup::SingletonPtr => inv.entail(&ge(t, tag(T::Ctx))) && inv.entail(&le(t, tag(T::Stack))),
        }
    }

    /// Joins `src` into `dst`, keeping the companions of a tag that is
    /// possible in exactly one of them. In the other operand such a
    /// companion is meaningless, not unknown.
    pub fn selective_join(&self, dst: &NumAbsDomain, src: &NumAbsDomain) -> NumAbsDomain {
        let mut extra: BTreeMap<Variable, Interval> = BTreeMap::new();
        if !dst.is_bottom() {
            for type_var in self.vars.type_variables() {
                for (t, kind) in TYPE_SPECIFIC_KINDS {
                    let in_dst = self.has_type(dst, type_var, t);
                    let in_src = self.has_type(src, type_var, t);
                    let v = self.vars.kind_var(kind, type_var);
                    if in_dst && !in_src {
                        extra.entry(v).or_insert_with(|| dst.interval(v));
                    } else if !in_dst && in_src {
                        extra.entry(v).or_insert_with(|| src.interval(v));
                    }
                }
            }
        }
        let mut out = dst.join(src);
        for (v, i) in &extra {
            out.set(*v, i);
        }
        out
    }

    /// Runs `transition` once for every tag `reg` may hold, under the
    /// assumption that it holds exactly that tag, and merges the results
    /// with [`TypeDomain::selective_join`]. An unknown tag runs it once
    /// with `Uninit`.
    pub fn join_over_types(
        &self,
        inv: &NumAbsDomain,
        reg: Reg,
        mut transition: impl FnMut(&mut NumAbsDomain, TypeEncoding),
    ) -> NumAbsDomain {
        let type_var = reg_pack(reg).type_;
        let types = inv.interval(type_var);
        if types.is_bottom() {
            return NumAbsDomain::bottom();
        }
        if types.is_top() {
            let mut res = inv.clone();
            transition(&mut res, TypeEncoding::Uninit);
            return res;
        }
        let lb = types.lb().number().and_then(|n| n.to_i64()).unwrap_or(TypeEncoding::MIN);
        let ub = types.ub().number().and_then(|n| n.to_i64()).unwrap_or(TypeEncoding::MAX);
        let mut res = NumAbsDomain::bottom();
        for t in TypeEncoding::iterate(lb, ub) {
            let mut tmp = inv.clone();
            if !tmp.add_constraint(&eq(type_var, t.tag())) {
                continue;
            }
            transition(&mut tmp, t);
            res = self.selective_join(&res, &tmp);
        }
        res
    }

    /// Runs one transition under `condition` and the other under its
    /// negation, then joins.
    pub fn join_by_if_else(
        &self,
        inv: &NumAbsDomain,
        condition: &LinearConstraint,
        if_true: impl FnOnce(&mut NumAbsDomain),
        if_false: impl FnOnce(&mut NumAbsDomain),
    ) -> NumAbsDomain {
        let mut true_case = inv.clone();
        if true_case.add_constraint(condition) {
            if_true(&mut true_case);
        }
        let mut false_case = inv.clone();
        if false_case.add_constraint(&condition.negate()) {
            if_false(&mut false_case);
        }
        true_case.join(&false_case)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_in_group_after_immediate() {
        let vars = VariableFactory::new();
        let types = TypeDomain::new(&vars);
        let mut inv = NumAbsDomain::top();
        types.assign_type(&mut inv, Reg(3), TypeEncoding::Number);
        assert!(types.is_in_group(&inv, Reg(3), TypeGroup::Number));
        assert!(types.is_in_group(&inv, Reg(3), TypeGroup::MemOrNum));
        assert!(!types.is_in_group(&inv, Reg(3), TypeGroup::Pointer));
        assert_eq!(types.get_reg_type(&inv, Reg(3)), TypeEncoding::Number);
        assert_eq!(types.get_reg_type(&inv, Reg(4)), TypeEncoding::Uninit);
    }

    #[test]
    fn test_selective_join_keeps_offsets() {
        let vars = VariableFactory::new();
        let types = TypeDomain::new(&vars);
        let r1 = reg_pack(Reg(1));

        let mut a = NumAbsDomain::top();
        types.assign_type(&mut a, Reg(1), TypeEncoding::Stack);
        a.assign(r1.stack_offset, 100i64);
        let mut b = NumAbsDomain::top();
        types.assign_type(&mut b, Reg(1), TypeEncoding::Packet);
        b.assign(r1.packet_offset, 4i64);

        let plain = a.join(&b);
        assert!(plain.interval(r1.stack_offset).is_top());

        let j = types.selective_join(&a, &b);
        assert_eq!(j.interval(r1.type_), Interval::new(-2, -1));
        assert_eq!(j.interval(r1.stack_offset), Interval::singleton(100i64));
        assert_eq!(j.interval(r1.packet_offset), Interval::singleton(4i64));
    }

    #[test]
    fn test_join_over_types() {
        let vars = VariableFactory::new();
        let types = TypeDomain::new(&vars);
        let r2 = reg_pack(Reg(2));
        let mut inv = NumAbsDomain::top();
        inv.set(r2.type_, &Interval::new(TypeEncoding::Number.tag(), TypeEncoding::Ctx.tag()));

        let mut seen = Vec::new();
        let out = types.join_over_types(&inv, Reg(2), |s, t| {
            seen.push(t);
            if t == TypeEncoding::Ctx {
                s.assign(r2.ctx_offset, 8i64);
            } else {
                s.assign(r2.svalue, 0i64);
            }
        });
        assert_eq!(seen, vec![TypeEncoding::Number, TypeEncoding::Ctx]);
        assert_eq!(out.interval(r2.ctx_offset), Interval::singleton(8i64));

        let mut unknown = Vec::new();
        types.join_over_types(&NumAbsDomain::top(), Reg(2), |_, t| unknown.push(t));
        assert_eq!(unknown, vec![TypeEncoding::Uninit]);
    }

    #[test]
    fn test_join_by_if_else() {
        let vars = VariableFactory::new();
        let types = TypeDomain::new(&vars);
        let x = reg_pack(Reg(0)).svalue;
        let mut inv = NumAbsDomain::top();
        inv.set(x, &Interval::new(0, 10));
        let y = reg_pack(Reg(1)).svalue;
        let out = types.join_by_if_else(&inv, &le(x, 5i64), |s| s.assign(y, 1i64), |s| s.assign(y, 2i64));
        assert_eq!(out.interval(y), Interval::new(1, 2));
        assert!(types.implies_type(&inv, &le(x, 3i64), &le(x, 5i64)));
    }
}
