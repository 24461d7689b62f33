//! Machine-integer semantics on top of the relational domain.
//!
//! Every register value is tracked twice: as a signed 64-bit integer
//! (`svalue`) and as an unsigned one (`uvalue`). Arithmetic is computed on the
//! mathematical integers of the [`SplitDbm`] and then wrapped back into the
//! representable range; when wrapping would split an interval the variable
//! is forgotten instead.

use crate::instruction::CondOp;
use crate::interval::{Bound, Interval};
use crate::linear::{eq, ge, gt, le, lt, neq, LinearConstraint, LinearExpression};
use crate::number::Number;
use crate::split_dbm::SplitDbm;
use crate::variable::Variable;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    SDiv,
    UDiv,
    SRem,
    URem,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BitwiseOp {
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BinaryOp {
    Arith(ArithOp),
    Bitwise(BitwiseOp),
}

impl BinaryOp {
    fn is_signed(self) -> bool {
        matches!(
            self,
            BinaryOp::Arith(ArithOp::SDiv | ArithOp::SRem) | BinaryOp::Bitwise(BitwiseOp::AShr)
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct NumAbsDomain {
    dom: SplitDbm,
}

/// `a op b` for an ordering comparison, ignoring signedness.
fn ordered(op: CondOp, a: LinearExpression, b: LinearExpression) -> LinearConstraint {
    match op {
        CondOp::Lt | CondOp::SLt => lt(a, b),
        CondOp::Le | CondOp::SLe => le(a, b),
        CondOp::Gt | CondOp::SGt => gt(a, b),
        CondOp::Ge | CondOp::SGe => ge(a, b),
        CondOp::Eq | CondOp::Ne | CondOp::Set | CondOp::NSet => {
            panic!("Bug! {:?} is not an ordering comparison", op)
        }
    }
}

fn interval_of_width(width: u32, signed: bool) -> Interval {
    if signed {
        Interval::signed_int(width)
    } else {
        Interval::unsigned_int(width)
    }
}

impl NumAbsDomain {
    pub fn top() -> Self {
        NumAbsDomain { dom: SplitDbm::top() }
    }

    pub fn bottom() -> Self {
        NumAbsDomain {
            dom: SplitDbm::bottom(),
        }
    }

    pub fn is_bottom(&self) -> bool {
        self.dom.is_bottom()
    }

    pub fn is_top(&self) -> bool {
        self.dom.is_top()
    }

    pub fn set_to_bottom(&mut self) {
        self.dom.set_to_bottom();
    }

    pub fn set_to_top(&mut self) {
        self.dom.set_to_top();
    }

    pub fn le(&self, o: &NumAbsDomain) -> bool {
        self.dom.le(&o.dom)
    }

    pub fn join(&self, o: &NumAbsDomain) -> NumAbsDomain {
        NumAbsDomain {
            dom: self.dom.join(&o.dom),
        }
    }

    pub fn widen(&self, o: &NumAbsDomain) -> NumAbsDomain {
        NumAbsDomain {
            dom: self.dom.widen(&o.dom),
        }
    }

    pub fn meet(&self, o: &NumAbsDomain) -> Option<NumAbsDomain> {
        self.dom.meet(&o.dom).map(|dom| NumAbsDomain { dom })
    }

    pub fn narrow(&self, o: &NumAbsDomain) -> NumAbsDomain {
        NumAbsDomain {
            dom: self.dom.narrow(&o.dom),
        }
    }

    /// The underlying relational state, for rendering.
    pub fn dbm(&self) -> &SplitDbm {
        &self.dom
    }

    pub fn add_constraint(&mut self, cst: &LinearConstraint) -> bool {
        self.dom.add_constraint(cst)
    }

    pub fn add_constraints(&mut self, csts: &[LinearConstraint]) -> bool {
        for cst in csts {
            if !self.dom.add_constraint(cst) {
                return false;
            }
        }
        true
    }

    pub fn entail(&self, cst: &LinearConstraint) -> bool {
        self.dom.entail(cst)
    }

    pub fn intersect(&self, cst: &LinearConstraint) -> bool {
        self.dom.intersect(cst)
    }

    pub fn eval_interval(&self, e: &LinearExpression) -> Interval {
        self.dom.eval_interval(e)
    }

    pub fn interval(&self, x: Variable) -> Interval {
        self.dom.eval_interval_var(x)
    }

    pub fn assign(&mut self, x: Variable, e: impl Into<LinearExpression>) {
        self.dom.assign(x, &e.into());
    }

    pub fn set(&mut self, x: Variable, intv: &Interval) {
        self.dom.set(x, intv);
    }

    pub fn havoc(&mut self, x: Variable) {
        self.dom.forget(x);
    }

    pub fn havoc_all(&mut self, xs: &[Variable]) {
        self.dom.forget_all(xs);
    }

    fn operand_interval(&self, e: &LinearExpression, width: u32, signed: bool) -> Interval {
        let i = self.eval_interval(e);
        let range = interval_of_width(width, signed);
        if width == 64 || i.le(&range) {
            i
        } else {
            range
        }
    }

    /// `x := y op z` on the mathematical integers.
    pub fn apply(&mut self, op: BinaryOp, x: Variable, y: Variable, z: &LinearExpression, width: u32) {
        let signed = op.is_signed();
        match op {
            BinaryOp::Arith(ArithOp::Add) => self.assign(x, LinearExpression::variable(y) + z.clone()),
            BinaryOp::Arith(ArithOp::Sub) => self.assign(x, LinearExpression::variable(y) - z.clone()),
            BinaryOp::Arith(ArithOp::Mul) => {
                if z.is_constant() {
                    self.assign(x, LinearExpression::variable(y) * z.constant_term());
                } else {
                    let r = &self.interval(y) * &self.eval_interval(z);
                    self.set(x, &r);
                }
            }
            _ => {
                let l = self.operand_interval(&LinearExpression::variable(y), width, signed);
                let r = self.operand_interval(z, width, signed);
                let result = match op {
                    BinaryOp::Arith(ArithOp::SDiv) => l.sdiv(&r),
                    BinaryOp::Arith(ArithOp::UDiv) => l.udiv(&r),
                    BinaryOp::Arith(ArithOp::SRem) => l.srem(&r),
                    BinaryOp::Arith(ArithOp::URem) => l.urem(&r),
                    BinaryOp::Bitwise(BitwiseOp::And) => l.and(&r),
                    BinaryOp::Bitwise(BitwiseOp::Or) => l.or(&r),
                    BinaryOp::Bitwise(BitwiseOp::Xor) => l.xor(&r),
                    BinaryOp::Bitwise(BitwiseOp::Shl) => l.shl(&r),
                    BinaryOp::Bitwise(BitwiseOp::LShr) | BinaryOp::Bitwise(BitwiseOp::AShr) => l.shr(&r),
                    BinaryOp::Arith(ArithOp::Add | ArithOp::Sub | ArithOp::Mul) => {
                        panic!("Bug! linear operation {:?} reached the interval fallback", op)
                    }
                };
                self.set(x, &result);
            }
        }
    }

    /// Wraps `lhs` into `width` bits, forgetting it when the wrapped range
    /// is not an interval.
    fn overflow_bounds(&mut self, lhs: Variable, width: u32, is_signed: bool) {
        let interval = self.interval(lhs);
        if interval.is_bottom() {
            self.havoc(lhs);
            return;
        }
        let (Some(lb), Some(ub)) = (interval.lb().number(), interval.ub().number()) else {
            self.havoc(lhs);
            return;
        };
        if ub - lb >= Number::pow2(width) - 1i64 {
            self.havoc(lhs);
            return;
        }
        let mut new_lb = lb.truncate_to_uint(width);
        let mut new_ub = ub.truncate_to_uint(width);
        if is_signed {
            new_lb = new_lb.truncate_to_sint(64);
            new_ub = new_ub.truncate_to_sint(64);
        }
        if new_lb > new_ub {
            self.havoc(lhs);
            return;
        }
        let new_interval = Interval::new(new_lb, new_ub);
        if new_interval != interval {
            self.set(lhs, &new_interval);
        }
    }

    pub fn overflow_signed(&mut self, lhs: Variable, width: u32) {
        self.overflow_bounds(lhs, width, true);
    }

    pub fn overflow_unsigned(&mut self, lhs: Variable, width: u32) {
        self.overflow_bounds(lhs, width, false);
    }

    /// Computes on the signed shadow, then derives the unsigned one.
    pub fn apply_signed(
        &mut self,
        op: BinaryOp,
        xs: Variable,
        xu: Variable,
        y: Variable,
        z: &LinearExpression,
        width: u32,
    ) {
        self.apply(op, xs, y, z, width);
        if width > 0 {
            self.assign(xu, xs);
            self.overflow_signed(xs, width);
            self.overflow_unsigned(xu, width);
        }
    }

    /// Computes on the unsigned shadow, then derives the signed one.
    pub fn apply_unsigned(
        &mut self,
        op: BinaryOp,
        xs: Variable,
        xu: Variable,
        y: Variable,
        z: &LinearExpression,
        width: u32,
    ) {
        self.apply(op, xu, y, z, width);
        if width > 0 {
            self.assign(xs, xu);
            self.overflow_signed(xs, width);
            self.overflow_unsigned(xu, width);
        }
    }

    /// `lhs += op2` without wrapping; used for pointer offsets.
    pub fn add(&mut self, lhs: Variable, op2: impl Into<LinearExpression>) {
        self.assign(lhs, LinearExpression::variable(lhs) + op2.into());
    }

    pub fn sub(&mut self, lhs: Variable, op2: impl Into<LinearExpression>) {
        self.assign(lhs, LinearExpression::variable(lhs) - op2.into());
    }

    /// Prefers the signed shadow as the source when it is known.
    fn overflow_source(&self, lhss: Variable, lhsu: Variable) -> Variable {
        if self.interval(lhss).is_top() {
            lhsu
        } else {
            lhss
        }
    }

    pub fn add_overflow(&mut self, lhss: Variable, lhsu: Variable, op2: &LinearExpression, width: u32) {
        let y = self.overflow_source(lhss, lhsu);
        self.apply_signed(BinaryOp::Arith(ArithOp::Add), lhss, lhsu, y, op2, width);
    }

    pub fn sub_overflow(&mut self, lhss: Variable, lhsu: Variable, op2: &LinearExpression, width: u32) {
        let y = self.overflow_source(lhss, lhsu);
        self.apply_signed(BinaryOp::Arith(ArithOp::Sub), lhss, lhsu, y, op2, width);
    }

    pub fn neg(&mut self, lhss: Variable, lhsu: Variable, width: u32) {
        let minus_one = LinearExpression::constant(-1i64);
        self.apply_signed(BinaryOp::Arith(ArithOp::Mul), lhss, lhsu, lhss, &minus_one, width);
    }

    pub fn mul(&mut self, lhss: Variable, lhsu: Variable, op2: &LinearExpression, width: u32) {
        self.apply_signed(BinaryOp::Arith(ArithOp::Mul), lhss, lhsu, lhss, op2, width);
    }

    pub fn sdiv(&mut self, lhss: Variable, lhsu: Variable, op2: &LinearExpression, width: u32) {
        self.apply_signed(BinaryOp::Arith(ArithOp::SDiv), lhss, lhsu, lhss, op2, width);
    }

    pub fn udiv(&mut self, lhss: Variable, lhsu: Variable, op2: &LinearExpression, width: u32) {
        self.apply_unsigned(BinaryOp::Arith(ArithOp::UDiv), lhss, lhsu, lhsu, op2, width);
    }

    pub fn srem(&mut self, lhss: Variable, lhsu: Variable, op2: &LinearExpression, width: u32) {
        self.apply_signed(BinaryOp::Arith(ArithOp::SRem), lhss, lhsu, lhss, op2, width);
    }

    pub fn urem(&mut self, lhss: Variable, lhsu: Variable, op2: &LinearExpression, width: u32) {
        self.apply_unsigned(BinaryOp::Arith(ArithOp::URem), lhss, lhsu, lhsu, op2, width);
    }

    pub fn bitwise_and(&mut self, lhss: Variable, lhsu: Variable, op2: &LinearExpression, width: u32) {
        self.apply_unsigned(BinaryOp::Bitwise(BitwiseOp::And), lhss, lhsu, lhsu, op2, width);
    }

    pub fn bitwise_or(&mut self, lhss: Variable, lhsu: Variable, op2: &LinearExpression, width: u32) {
        self.apply_unsigned(BinaryOp::Bitwise(BitwiseOp::Or), lhss, lhsu, lhsu, op2, width);
    }

    pub fn bitwise_xor(&mut self, lhss: Variable, lhsu: Variable, op2: &LinearExpression, width: u32) {
        self.apply_unsigned(BinaryOp::Bitwise(BitwiseOp::Xor), lhss, lhsu, lhsu, op2, width);
    }

    pub fn shl_overflow(&mut self, lhss: Variable, lhsu: Variable, op2: &LinearExpression) {
        self.apply_unsigned(BinaryOp::Bitwise(BitwiseOp::Shl), lhss, lhsu, lhsu, op2, 64);
    }

    fn finite_u64_bounds(interval: &Interval) -> Option<(u64, u64)> {
        let lb = interval.lb().number()?.to_u64()?;
        let ub = interval.ub().number()?.to_u64()?;
        Some((lb, ub))
    }

    /// Re-derives `svalue` from the freshly computed `uvalue`.
    fn derive_signed_from_unsigned(&mut self, svalue: Variable, uvalue: Variable) {
        self.assign(svalue, uvalue);
        self.overflow_signed(svalue, 64);
    }

    /// Left shift by an immediate.
    pub fn shl(&mut self, svalue: Variable, uvalue: Variable, imm: u32, width: u32) {
        let imm = imm & (width - 1);
        let interval = self.interval(uvalue);
        let Some((mut lb, mut ub)) = Self::finite_u64_bounds(&interval) else {
            self.shl_overflow(svalue, uvalue, &LinearExpression::constant(i64::from(imm)));
            return;
        };
        let uint_max = if width == 64 { u64::MAX } else { u64::from(u32::MAX) };
        let lost = |v: u64| if imm == 0 { 0 } else { v.checked_shr(width - imm).unwrap_or(0) };
        if lost(lb) != lost(ub) {
            lb = 0;
            ub = (uint_max << imm) & uint_max;
        } else {
            lb = (lb << imm) & uint_max;
            ub = (ub << imm) & uint_max;
        }
        self.set(uvalue, &Interval::new(Number::from(lb), Number::from(ub)));
        self.derive_signed_from_unsigned(svalue, uvalue);
    }

    /// Logical shift right by an immediate.
    pub fn lshr(&mut self, svalue: Variable, uvalue: Variable, imm: u32, width: u32) {
        let imm = imm & (width - 1);
        let interval = self.interval(uvalue);
        let (mut lb, mut ub) = (0u64, u64::MAX >> imm);
        if let Some((l, u)) = Self::finite_u64_bounds(&interval) {
            if width == 64 {
                lb = l >> imm;
                ub = u >> imm;
            } else if u <= u64::from(u32::MAX) {
                lb = l >> imm;
                ub = u >> imm;
            } else {
                ub = u64::from(u32::MAX) >> imm;
            }
        } else if width == 32 {
            ub = u64::from(u32::MAX) >> imm;
        }
        self.set(uvalue, &Interval::new(Number::from(lb), Number::from(ub)));
        self.derive_signed_from_unsigned(svalue, uvalue);
    }

    /// Arithmetic shift right. Returns false if the shift amount is not a
    /// known constant, in which case both shadows are forgotten.
    pub fn ashr(&mut self, svalue: Variable, uvalue: Variable, right_svalue: &LinearExpression, width: u32) -> bool {
        let Some(imm) = self.eval_interval(right_svalue).singleton_value().and_then(|n| n.to_i64()) else {
            self.havoc(svalue);
            self.havoc(uvalue);
            return false;
        };
        let imm = (imm & i64::from(width - 1)) as u32;
        let left = self.operand_interval(&LinearExpression::variable(svalue), width, true);
        let (mut lb, mut ub) = (i64::MIN >> imm, i64::MAX >> imm);
        if let (Some(l), Some(u)) = (
            left.lb().number().and_then(Number::to_i64),
            left.ub().number().and_then(Number::to_i64),
        ) {
            lb = l >> imm;
            ub = u >> imm;
            if width == 32 {
                // The 32-bit result is zero-extended into the register.
                let (l32, u32_) = (u64::from(lb as u32), u64::from(ub as u32));
                if l32 <= u32_ && (lb >= 0) == (ub >= 0) {
                    lb = l32 as i64;
                    ub = u32_ as i64;
                } else {
                    lb = 0;
                    ub = i64::from(u32::MAX);
                }
            }
        } else if width == 32 {
            lb = 0;
            ub = i64::from(u32::MAX);
        }
        self.set(svalue, &Interval::new(lb, ub));
        self.assign(uvalue, svalue);
        self.overflow_unsigned(uvalue, 64);
        true
    }

    /// Sign-extends the low `bits` of `right_svalue` into `svalue`.
    pub fn sign_extend(
        &mut self,
        svalue: Variable,
        uvalue: Variable,
        right_svalue: &LinearExpression,
        width: u32,
        bits: u32,
    ) {
        let mut right = self.eval_interval(right_svalue);
        let span = Number::pow2(bits);
        let wide = match right.finite_size() {
            Some(size) => size >= span,
            None => true,
        };
        if wide {
            right = Interval::signed_int(bits);
        }
        let (Some(lb), Some(ub)) = (right.lb().number(), right.ub().number()) else {
            self.havoc(svalue);
            self.havoc(uvalue);
            return;
        };
        let lb = lb.truncate_to_sint(bits);
        let ub = ub.truncate_to_sint(bits);
        if lb > ub {
            self.set(svalue, &Interval::signed_int(bits));
        } else {
            self.set(svalue, &Interval::new(lb, ub));
        }
        if width > 0 {
            self.assign(uvalue, svalue);
            self.overflow_signed(svalue, width);
            self.overflow_unsigned(uvalue, width);
        }
    }

    /// Constraints implied by `left op right` for a comparison of the given
    /// width. Both shadows of each side are supplied.
    ///
    /// 32-bit comparisons are refined only when the operands already lie in
    /// the range where the low 32 bits equal the whole value; otherwise
    /// nothing is learned.
    pub fn assume_cst(
        &self,
        op: CondOp,
        is64: bool,
        left_svalue: Variable,
        left_uvalue: Variable,
        right_svalue: &LinearExpression,
        right_uvalue: &LinearExpression,
    ) -> Vec<LinearConstraint> {
        let ls = LinearExpression::variable(left_svalue);
        let lu = LinearExpression::variable(left_uvalue);
        let rs = right_svalue.clone();
        let ru = right_uvalue.clone();

        let lsi = self.interval(left_svalue);
        let lui = self.interval(left_uvalue);
        let rsi = self.eval_interval(&rs);
        let rui = self.eval_interval(&ru);

        let signed_fits = is64 || (lsi.le(&Interval::signed_int(32)) && rsi.le(&Interval::signed_int(32)));
        let unsigned_fits = is64 || (lui.le(&Interval::unsigned_int(32)) && rui.le(&Interval::unsigned_int(32)));

        let nonneg = Interval::nonnegative_int(if is64 { 64 } else { 32 });
        let left_nonneg = lsi.le(&nonneg) || lui.le(&nonneg);
        let right_nonneg = rsi.le(&nonneg) || rui.le(&nonneg);

        match op {
            CondOp::Eq => {
                let mut out = Vec::new();
                if signed_fits {
                    out.push(eq(ls.clone(), rs.clone()));
                }
                if unsigned_fits {
                    out.push(eq(lu.clone(), ru.clone()));
                }
                out
            }
            CondOp::Ne => {
                let mut out = Vec::new();
                if signed_fits {
                    out.push(neq(ls.clone(), rs.clone()));
                }
                if unsigned_fits {
                    out.push(neq(lu.clone(), ru.clone()));
                }
                out
            }
            CondOp::Set | CondOp::NSet => self.assume_bit_cst(op, is64, &lui, &rui),
            CondOp::SLt | CondOp::SLe | CondOp::SGt | CondOp::SGe => {
                if signed_fits {
                    vec![ordered(op, ls, rs)]
                } else {
                    vec![]
                }
            }
            CondOp::Lt | CondOp::Le | CondOp::Gt | CondOp::Ge => {
                if !unsigned_fits {
                    return vec![];
                }
                let mut out = vec![ge(lu.clone(), 0i64), ordered(op, lu.clone(), ru)];
                let bounded_above = matches!(op, CondOp::Lt | CondOp::Le) && right_nonneg;
                if (left_nonneg && right_nonneg) || bounded_above {
                    // Both values are below 2^63 (or 2^31): the shadows agree.
                    out.push(eq(ls.clone(), lu));
                    if right_nonneg {
                        out.push(ordered(op, ls, rs));
                    }
                }
                out
            }
        }
    }

    fn assume_bit_cst(&self, op: CondOp, is64: bool, left: &Interval, right: &Interval) -> Vec<LinearConstraint> {
        let (Some(l), Some(r)) = (left.singleton_value(), right.singleton_value()) else {
            return vec![];
        };
        let (Some(l), Some(mut r)) = (l.to_u64(), r.to_u64()) else {
            return vec![];
        };
        if !is64 {
            r &= u64::from(u32::MAX);
        }
        let set = l & r != 0;
        let holds = if op == CondOp::Set { set } else { !set };
        if holds {
            vec![LinearConstraint::true_const()]
        } else {
            vec![LinearConstraint::false_const()]
        }
    }

    /// Lower bound of `x`, if finite and representable.
    pub fn lower_bound(&self, x: Variable) -> Option<i64> {
        match self.interval(x).lb() {
            Bound::Finite(n) => n.to_i64(),
            _ => None,
        }
    }

    /// Upper bound of `x`, if finite and representable.
    pub fn upper_bound(&self, x: Variable) -> Option<i64> {
        match self.interval(x).ub() {
            Bound::Finite(n) => n.to_i64(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable::DataKind;

    fn sv(r: u8) -> Variable {
        Variable::reg(DataKind::SValues, r)
    }

    fn uv(r: u8) -> Variable {
        Variable::reg(DataKind::UValues, r)
    }

    fn constant(n: i64) -> LinearExpression {
        LinearExpression::constant(n)
    }

    #[test]
    fn test_add_overflow_keeps_relation() {
        let mut d = NumAbsDomain::top();
        d.set(sv(1), &Interval::new(0, 9));
        d.assign(uv(1), sv(1));
        d.assign(sv(2), sv(1));
        d.add_overflow(sv(1), uv(1), &constant(1), 64);
        assert_eq!(d.interval(sv(1)), Interval::new(1, 10));
        assert_eq!(d.interval(uv(1)), Interval::new(1, 10));
        assert!(d.entail(&eq(sv(1), LinearExpression::variable(sv(2)) + 1i64)));
    }

    #[test]
    fn test_overflow_wraps_or_forgets() {
        let mut d = NumAbsDomain::top();
        d.set(sv(1), &Interval::new(i64::MAX, i64::MAX));
        d.assign(uv(1), sv(1));
        d.add_overflow(sv(1), uv(1), &constant(1), 64);
        assert_eq!(d.interval(sv(1)), Interval::singleton(i64::MIN));
        assert_eq!(d.interval(uv(1)), Interval::singleton(Number::pow2(63)));

        d.set(sv(2), &Interval::new(-1, 1));
        d.assign(uv(2), sv(2));
        d.overflow_unsigned(uv(2), 64);
        assert!(d.interval(uv(2)).is_top());
    }

    #[test]
    fn test_32bit_arithmetic_zero_extends() {
        let mut d = NumAbsDomain::top();
        d.set(sv(1), &Interval::singleton(-1));
        d.assign(uv(1), sv(1));
        d.overflow_unsigned(uv(1), 64);
        d.add_overflow(sv(1), uv(1), &constant(0), 32);
        assert_eq!(d.interval(sv(1)), Interval::singleton(u32::MAX));
        assert_eq!(d.interval(uv(1)), Interval::singleton(u32::MAX));
    }

    #[test]
    fn test_shifts() {
        let mut d = NumAbsDomain::top();
        d.set(uv(1), &Interval::new(1, 3));
        d.shl(sv(1), uv(1), 4, 64);
        assert_eq!(d.interval(uv(1)), Interval::new(16, 48));
        assert_eq!(d.interval(sv(1)), Interval::new(16, 48));
        d.lshr(sv(1), uv(1), 3, 64);
        assert_eq!(d.interval(uv(1)), Interval::new(2, 6));

        d.set(sv(2), &Interval::new(-16, -8));
        assert!(d.ashr(sv(2), uv(2), &constant(2), 64));
        assert_eq!(d.interval(sv(2)), Interval::new(-4, -2));
        let wrap = Number::pow2(64);
        assert_eq!(d.interval(uv(2)), Interval::new(&wrap - 4i64, &wrap - 2i64));
    }

    #[test]
    fn test_sign_extend() {
        let mut d = NumAbsDomain::top();
        d.sign_extend(sv(1), uv(1), &constant(0xff), 64, 8);
        assert_eq!(d.interval(sv(1)), Interval::singleton(-1));
        assert_eq!(d.interval(uv(1)), Interval::singleton(u64::MAX));
    }

    #[test]
    fn test_unsigned_comparison_refines_signed_shadow() {
        let mut d = NumAbsDomain::top();
        let csts = d.assume_cst(CondOp::Lt, true, sv(1), uv(1), &constant(10), &constant(10));
        assert!(d.add_constraints(&csts));
        assert_eq!(d.interval(uv(1)), Interval::new(0, 9));
        assert_eq!(d.interval(sv(1)), Interval::new(0, 9));
    }

    #[test]
    fn test_signed_comparison() {
        let mut d = NumAbsDomain::top();
        d.set(sv(1), &Interval::new(-5, 5));
        let csts = d.assume_cst(CondOp::SGt, true, sv(1), uv(1), &constant(2), &constant(2));
        assert!(d.add_constraints(&csts));
        assert_eq!(d.interval(sv(1)), Interval::new(3, 5));
    }

    #[test]
    fn test_bit_test_on_constants() {
        let mut d = NumAbsDomain::top();
        d.set(sv(1), &Interval::singleton(6));
        d.set(uv(1), &Interval::singleton(6));
        let csts = d.assume_cst(CondOp::Set, true, sv(1), uv(1), &constant(1), &constant(1));
        assert!(!d.clone().add_constraints(&csts));
        let csts = d.assume_cst(CondOp::NSet, true, sv(1), uv(1), &constant(1), &constant(1));
        assert!(d.add_constraints(&csts));
    }
}
