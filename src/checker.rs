//! Deciding preconditions.
//!
//! The same visitor runs in two modes. [`check`] evaluates every
//! requirement of an [`Assertion`] against a copy of the state and returns
//! the warnings for the ones that are not entailed. [`assume`] instead adds
//! each requirement to the state, which is how the analysis continues past
//! an unproven precondition when asked to.

use std::cell::RefCell;

use crate::assertion::{
    get_assertions, AccessType, Addable, Assertion, BoundedLoopCount, Comparable, FuncConstraint, TypeConstraint,
    ValidAccess, ValidCall, ValidDivisor, ValidMapKeyValue, ValidSize, ValidStore, ZeroCtxOffset,
};
use crate::context::{AnalysisContext, VerifierOptions};
use crate::ebpf_domain::EbpfDomain;
use crate::finite_domain::NumAbsDomain;
use crate::instruction::{Imm, Reg, Value};
use crate::linear::{eq, ge, gt, le, lt, neq, LinearConstraint, LinearExpression};
use crate::platform::{EBPF_SUBPROGRAM_STACK_SIZE, EBPF_TOTAL_STACK_SIZE, MAX_PACKET_SIZE};
use crate::type_domain::{reg_pack, TypeDomain};
use crate::type_encoding::{TypeEncoding, TypeGroup};
use crate::variable::{DataKind, Variable};

/// The warnings for the requirements of `assertion` that `dom` does not
/// entail. A bottom state satisfies everything.
pub fn check(ctx: &AnalysisContext, dom: &EbpfDomain, assertion: &Assertion) -> Vec<String> {
    if dom.is_bottom() {
        return Vec::new();
    }
    let mut copy = dom.clone();
    let warnings = RefCell::new(Vec::new());
    Checker::new(ctx, assertion, Mode::Check, &warnings).visit(&mut copy);
    warnings.into_inner()
}

/// Refines `dom` with every requirement of `assertion`.
pub fn assume(ctx: &AnalysisContext, dom: &mut EbpfDomain, assertion: &Assertion) {
    if dom.is_bottom() {
        return;
    }
    let warnings = RefCell::new(Vec::new());
    Checker::new(ctx, assertion, Mode::Assume, &warnings).visit(dom);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Mode {
    Check,
    Assume,
}

fn check_require(inv: &NumAbsDomain, cst: &LinearConstraint) -> bool {
    if inv.is_bottom() {
        return true;
    }
    if cst.is_contradiction() {
        return false;
    }
    inv.entail(cst)
}

fn type_is_pointer(reg: Reg) -> LinearConstraint {
    ge(reg_pack(reg).type_, TypeEncoding::Ctx.tag())
}

fn type_is_number(reg: Reg) -> LinearConstraint {
    eq(reg_pack(reg).type_, TypeEncoding::Number.tag())
}

fn type_is_not_stack(reg: Reg) -> LinearConstraint {
    neq(reg_pack(reg).type_, TypeEncoding::Stack.tag())
}

/// `[offset_var + s.offset, ... + width)` of an access.
fn access_bounds(s: &ValidAccess, offset_var: Variable) -> (LinearExpression, LinearExpression) {
    let lb = LinearExpression::from(offset_var) + i64::from(s.offset);
    let ub = match s.width {
        Value::Imm(Imm(w)) => lb.clone() + w as i64,
        Value::Reg(r) => lb.clone() + reg_pack(r).svalue,
    };
    (lb, ub)
}

struct Checker<'a> {
    ctx: &'a AnalysisContext,
    types: TypeDomain<'a>,
    assertion: &'a Assertion,
    mode: Mode,
    warnings: &'a RefCell<Vec<String>>,
}

impl<'a> Checker<'a> {
    fn new(
        ctx: &'a AnalysisContext,
        assertion: &'a Assertion,
        mode: Mode,
        warnings: &'a RefCell<Vec<String>>,
    ) -> Self {
        Checker {
            ctx,
            types: TypeDomain::new(ctx.vars()),
            assertion,
            mode,
            warnings,
        }
    }

    fn require(&self, inv: &mut NumAbsDomain, cst: LinearConstraint, msg: &str) {
        match self.mode {
            Mode::Assume => {
                inv.add_constraint(&cst);
            }
            Mode::Check => {
                if !check_require(inv, &cst) {
                    let warning = format!("{} ({})", msg, self.assertion);
                    log::trace!("Unproven: {}", warning);
                    self.warnings.borrow_mut().push(warning);
                }
            }
        }
    }

    /// A requirement that no state satisfies.
    fn fail(&self, inv: &mut NumAbsDomain, msg: &str) {
        self.require(inv, LinearConstraint::false_const(), msg);
    }

    fn visit(&self, dom: &mut EbpfDomain) {
        match self.assertion {
            Assertion::Comparable(s) => self.comparable(dom, s),
            Assertion::Addable(s) => self.addable(dom, s),
            Assertion::ValidDivisor(s) => self.valid_divisor(dom, s),
            Assertion::ValidAccess(s) => self.valid_access(dom, s),
            Assertion::ValidStore(s) => self.valid_store(dom, s),
            Assertion::ValidSize(s) => self.valid_size(dom, s),
            Assertion::ValidMapKeyValue(s) => self.valid_map_key_value(dom, s),
            Assertion::ValidCall(s) => self.valid_call(dom, s),
            Assertion::TypeConstraint(s) => self.type_constraint(dom, s),
            Assertion::FuncConstraint(s) => self.func_constraint(dom, s),
            Assertion::ZeroCtxOffset(s) => self.zero_ctx_offset(dom, s),
            Assertion::BoundedLoopCount(s) => self.bounded_loop_count(dom, s),
        }
    }

    fn check_access_stack(&self, inv: &mut NumAbsDomain, lb: &LinearExpression, ub: &LinearExpression) {
        let r10 = reg_pack(Reg::R10_STACK_POINTER).stack_offset;
        if let Some(offset) = inv.interval(r10).singleton_value().and_then(|n| n.to_i64()) {
            self.require(
                inv,
                ge(lb.clone(), offset - EBPF_SUBPROGRAM_STACK_SIZE),
                "Lower bound must be at least r10.stack_offset - EBPF_SUBPROGRAM_STACK_SIZE",
            );
        }
        self.require(
            inv,
            le(ub.clone(), EBPF_TOTAL_STACK_SIZE),
            "Upper bound must be at most EBPF_TOTAL_STACK_SIZE",
        );
    }

    fn check_access_context(&self, inv: &mut NumAbsDomain, lb: &LinearExpression, ub: &LinearExpression) {
        let size = self.ctx.program_info.context.size;
        self.require(inv, ge(lb.clone(), 0i64), "Lower bound must be at least 0");
        self.require(
            inv,
            le(ub.clone(), i64::from(size)),
            &format!("Upper bound must be at most {}", size),
        );
    }

    /// Without `packet_size` only the static packet bound is checked.
    fn check_access_packet(
        &self,
        inv: &mut NumAbsDomain,
        lb: &LinearExpression,
        ub: &LinearExpression,
        packet_size: Option<Variable>,
    ) {
        self.require(inv, ge(lb.clone(), Variable::meta_offset()), "Lower bound must be at least meta_offset");
        match packet_size {
            Some(size) => self.require(inv, le(ub.clone(), size), "Upper bound must be at most packet_size"),
            None => self.require(
                inv,
                le(ub.clone(), MAX_PACKET_SIZE),
                &format!("Upper bound must be at most {}", MAX_PACKET_SIZE),
            ),
        }
    }

    fn check_access_shared(
        &self,
        inv: &mut NumAbsDomain,
        lb: &LinearExpression,
        ub: &LinearExpression,
        region_size: Variable,
    ) {
        self.require(inv, ge(lb.clone(), 0i64), "Lower bound must be at least 0");
        let msg = format!("Upper bound must be at most {}", self.ctx.vars().display(region_size));
        self.require(inv, le(ub.clone(), region_size), &msg);
    }

    fn comparable(&self, dom: &mut EbpfDomain, s: &Comparable) {
        if self.types.same_type(&dom.inv, s.r1, s.r2) {
            // Numbers are always comparable; pointers must point into the
            // same singleton region and be within bounds.
            let mut pointers = dom.inv.clone();
            pointers.add_constraint(&neq(reg_pack(s.r2).type_, TypeEncoding::Number.tag()));
            if !self.types.is_in_group(&pointers, s.r1, TypeGroup::SingletonPtr)
                && !self.types.is_in_group(&pointers, s.r1, TypeGroup::MapFd)
            {
                self.fail(&mut dom.inv, "Cannot subtract pointers to non-singleton regions");
                return;
            }
            for reg in [s.r1, s.r2] {
                let bounds = ValidAccess {
                    reg,
                    offset: 0,
                    width: Value::Imm(Imm(0)),
                    or_null: false,
                    access_type: AccessType::Compare,
                };
                self.valid_access(dom, &bounds);
            }
        } else {
            self.require(&mut dom.inv, type_is_number(s.r2), "Cannot subtract pointers to different regions");
        }
    }

    fn addable(&self, dom: &mut EbpfDomain, s: &Addable) {
        if !self.types.implies_type(&dom.inv, &type_is_pointer(s.ptr), &type_is_number(s.num)) {
            self.fail(&mut dom.inv, "Only numbers can be added to pointers");
        }
    }

    fn valid_divisor(&self, dom: &mut EbpfDomain, s: &ValidDivisor) {
        let reg = reg_pack(s.reg);
        if !self.types.implies_type(&dom.inv, &type_is_pointer(s.reg), &type_is_number(s.reg)) {
            self.fail(&mut dom.inv, "Only numbers can be used as divisors");
        }
        if !self.ctx.options.allow_division_by_zero {
            let v = if s.is_signed { reg.svalue } else { reg.uvalue };
            self.require(&mut dom.inv, neq(v, 0i64), "Possible division by zero");
        }
    }

    fn valid_store(&self, dom: &mut EbpfDomain, s: &ValidStore) {
        if !self.types.implies_type(&dom.inv, &type_is_not_stack(s.mem), &type_is_number(s.val)) {
            self.fail(&mut dom.inv, "Only numbers can be stored to externally-visible regions");
        }
    }

    fn type_constraint(&self, dom: &mut EbpfDomain, s: &TypeConstraint) {
        if !self.types.is_in_group(&dom.inv, s.reg, s.types) {
            self.fail(&mut dom.inv, "Invalid type");
        }
    }

    fn bounded_loop_count(&self, dom: &mut EbpfDomain, s: &BoundedLoopCount) {
        let counter = self.ctx.vars().loop_counter(&s.name.to_string());
        self.require(&mut dom.inv, le(counter, s.limit), "Loop counter is too large");
    }

    fn func_constraint(&self, dom: &mut EbpfDomain, s: &FuncConstraint) {
        let id = dom
            .inv
            .interval(reg_pack(s.reg).svalue)
            .singleton_value()
            .and_then(|n| n.to_i32());
        let Some(id) = id else {
            self.fail(&mut dom.inv, "callx helper function id is not a valid singleton");
            return;
        };
        let platform = &self.ctx.program_info.platform;
        let call = platform.helper(id).filter(|_| platform.is_helper_usable(id));
        let Some(call) = call else {
            self.fail(&mut dom.inv, &format!("invalid helper function id {}", id));
            return;
        };
        // Treat the call as if the id were immediate.
        let options = VerifierOptions::default();
        for sub in get_assertions(&crate::instruction::Instruction::Call(call), &self.ctx.program_info, &options) {
            Checker::new(self.ctx, &sub, self.mode, self.warnings).visit(dom);
        }
    }

    fn valid_size(&self, dom: &mut EbpfDomain, s: &ValidSize) {
        let r = reg_pack(s.reg);
        let cst = if s.can_be_zero { ge(r.svalue, 0i64) } else { gt(r.svalue, 0i64) };
        self.require(&mut dom.inv, cst, "Invalid size");
    }

    fn valid_call(&self, dom: &mut EbpfDomain, s: &ValidCall) {
        if s.stack_frame_prefix.is_empty() {
            return;
        }
        let is_tail_call = self
            .ctx
            .program_info
            .platform
            .helper(s.func)
            .is_some_and(|call| call.is_tail_call);
        if is_tail_call {
            self.fail(&mut dom.inv, "tail call not supported in subprogram");
        }
    }

    fn valid_map_key_value(&self, dom: &mut EbpfDomain, s: &ValidMapKeyValue) {
        let ctx = self.ctx;
        let size = if s.key {
            dom.map_key_size(ctx, s.map_fd_reg)
        } else {
            dom.map_value_size(ctx, s.map_fd_reg)
        };
        let Some(width) = size.singleton_value().and_then(|n| n.to_i64()) else {
            let what = if s.key { "key" } else { "value" };
            self.fail(&mut dom.inv, &format!("Map {} size is not singleton", what));
            return;
        };
        let is_array = dom.map_is_array(ctx, s.map_fd_reg);
        let max_entries = dom.map_max_entries(ctx, s.map_fd_reg);
        let access = reg_pack(s.access_reg);
        let stack = &dom.stack;
        let strict = ctx.options.strict;

        dom.inv = self.types.join_over_types(&dom.inv, s.access_reg, |inv, t| match t {
            TypeEncoding::Stack => {
                let lb = LinearExpression::from(access.stack_offset);
                let ub = lb.clone() + width;
                if !stack.all_num(inv, &lb, &ub) {
                    let show = |n: Option<i64>, inf: &str| {
                        n.and_then(|n| i32::try_from(n).ok())
                            .map_or_else(|| inf.to_string(), |n| n.to_string())
                    };
                    let lo = inv.interval(access.stack_offset).lb().number().and_then(|n| n.to_i64());
                    let hi = inv.eval_interval(&ub).ub().number().and_then(|n| n.to_i64());
                    let msg = format!(
                        "Illegal map update with a non-numerical value [{}-{})",
                        show(lo, "-oo"),
                        show(hi, "oo")
                    );
                    self.fail(inv, &msg);
                } else if strict && is_array {
                    let offset = inv.interval(access.stack_offset).singleton_value().and_then(|n| n.to_i64());
                    match offset {
                        None => self.fail(inv, "Pointer must be a singleton"),
                        Some(offset) if s.key => {
                            let key = ctx.vars().cell_var(DataKind::SValues, offset, 4);
                            match max_entries.lb().number() {
                                Some(max) => self.require(inv, lt(key, max.clone()), "Array index overflow"),
                                None => self.fail(inv, "Max entries is not finite"),
                            }
                            self.require(inv, ge(key, 0i64), "Array index underflow");
                        }
                        Some(_) => {}
                    }
                }
            }
            TypeEncoding::Packet => {
                let lb = LinearExpression::from(access.packet_offset);
                let ub = lb.clone() + width;
                self.check_access_packet(inv, &lb, &ub, None);
            }
            TypeEncoding::Shared => {
                let lb = LinearExpression::from(access.shared_offset);
                let ub = lb.clone() + width;
                self.check_access_shared(inv, &lb, &ub, access.shared_region_size);
                self.require(inv, gt(access.svalue, 0i64), "Possible null access");
            }
            _ => self.fail(inv, "Only stack or packet can be used as a parameter"),
        });
    }

    fn valid_access(&self, dom: &mut EbpfDomain, s: &ValidAccess) {
        let is_comparison_check = s.width == Value::Imm(Imm(0));
        let reg = reg_pack(s.reg);
        let stack = &dom.stack;
        dom.inv = self.types.join_over_types(&dom.inv, s.reg, |inv, t| match t {
            TypeEncoding::Packet => {
                let (lb, ub) = access_bounds(s, reg.packet_offset);
                let size = (!is_comparison_check).then(Variable::packet_size);
                self.check_access_packet(inv, &lb, &ub, size);
            }
            TypeEncoding::Stack => {
                let (lb, ub) = access_bounds(s, reg.stack_offset);
                self.check_access_stack(inv, &lb, &ub);
                if s.access_type == AccessType::Read && !stack.all_num(inv, &lb, &ub) {
                    // Below the pointer only the cells themselves count.
                    let within_numeric_run = s.offset >= 0 && {
                        let width = match s.width {
                            Value::Imm(Imm(w)) => LinearExpression::constant(w as i64),
                            Value::Reg(r) => reg_pack(r).svalue.into(),
                        };
                        let run = LinearExpression::from(reg.stack_numeric_size) - i64::from(s.offset);
                        inv.entail(&le(width, run))
                    };
                    if !within_numeric_run {
                        self.fail(inv, "Stack content is not numeric");
                    }
                }
            }
            TypeEncoding::Ctx => {
                let (lb, ub) = access_bounds(s, reg.ctx_offset);
                self.check_access_context(inv, &lb, &ub);
            }
            TypeEncoding::Shared => {
                let (lb, ub) = access_bounds(s, reg.shared_offset);
                self.check_access_shared(inv, &lb, &ub, reg.shared_region_size);
                if !is_comparison_check && !s.or_null {
                    self.require(inv, gt(reg.svalue, 0i64), "Possible null access");
                }
            }
            TypeEncoding::Number => {
                if !is_comparison_check {
                    if s.or_null {
                        self.require(inv, eq(reg.svalue, 0i64), "Non-null number");
                    } else {
                        self.fail(inv, "Only pointers can be dereferenced");
                    }
                }
            }
            TypeEncoding::Map | TypeEncoding::MapPrograms => {
                if !is_comparison_check {
                    self.fail(inv, "FDs cannot be dereferenced directly");
                }
            }
            TypeEncoding::Uninit => self.fail(inv, "Invalid type"),
        });
    }

    fn zero_ctx_offset(&self, dom: &mut EbpfDomain, s: &ZeroCtxOffset) {
        let reg = reg_pack(s.reg);
        self.require(&mut dom.inv, eq(reg.ctx_offset, 0i64), "Nonzero context offset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::Label;

    fn stack_access(offset: i32, width: u64, access_type: AccessType) -> Assertion {
        Assertion::ValidAccess(ValidAccess {
            reg: Reg::R10_STACK_POINTER,
            offset,
            width: Value::Imm(Imm(width)),
            or_null: false,
            access_type,
        })
    }

    #[test]
    fn test_stack_write_in_bounds() {
        let ctx = AnalysisContext::default();
        let dom = EbpfDomain::setup_entry(&ctx);
        assert!(check(&ctx, &dom, &stack_access(-8, 8, AccessType::Write)).is_empty());
    }

    #[test]
    fn test_stack_access_above_frame() {
        let ctx = AnalysisContext::default();
        let dom = EbpfDomain::setup_entry(&ctx);
        let warnings = check(&ctx, &dom, &stack_access(4, 8, AccessType::Write));
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("Upper bound must be at most EBPF_TOTAL_STACK_SIZE"));
    }

    #[test]
    fn test_stack_read_uninitialized() {
        let ctx = AnalysisContext::default();
        let dom = EbpfDomain::setup_entry(&ctx);
        let warnings = check(&ctx, &dom, &stack_access(-8, 8, AccessType::Read));
        assert_eq!(warnings, vec!["Stack content is not numeric (valid_access(r10.offset-8, width=8) for read)"]);
    }

    #[test]
    fn test_exit_value_type() {
        let ctx = AnalysisContext::default();
        let dom = EbpfDomain::setup_entry(&ctx);
        let r0_number = Assertion::TypeConstraint(TypeConstraint {
            reg: Reg::R0_RETURN_VALUE,
            types: TypeGroup::Number,
        });
        assert_eq!(check(&ctx, &dom, &r0_number), vec!["Invalid type (r0.type == number)"]);
        let r1_ctx = Assertion::TypeConstraint(TypeConstraint {
            reg: Reg::R1_ARG,
            types: TypeGroup::Ctx,
        });
        assert!(check(&ctx, &dom, &r1_ctx).is_empty());
    }

    #[test]
    fn test_context_bounds() {
        let ctx = AnalysisContext::default();
        let dom = EbpfDomain::setup_entry(&ctx);
        let access = |offset| {
            Assertion::ValidAccess(ValidAccess {
                reg: Reg::R1_ARG,
                offset,
                width: Value::Imm(Imm(4)),
                or_null: false,
                access_type: AccessType::Read,
            })
        };
        assert!(check(&ctx, &dom, &access(188)).is_empty());
        let warnings = check(&ctx, &dom, &access(190));
        assert!(warnings[0].starts_with("Upper bound must be at most 192"));
    }

    #[test]
    fn test_assume_refines_loop_counter() {
        let ctx = AnalysisContext::default();
        let head = Label::new(2);
        let mut dom = EbpfDomain::setup_entry(&ctx);
        let counter = ctx.vars().loop_counter(&head.to_string());
        dom.inv.havoc(counter);
        let bound = Assertion::BoundedLoopCount(BoundedLoopCount { name: head, limit: 10 });
        assert_eq!(check(&ctx, &dom, &bound).len(), 1);
        assume(&ctx, &mut dom, &bound);
        assert!(check(&ctx, &dom, &bound).is_empty());
    }

    #[test]
    fn test_bottom_satisfies_everything() {
        let ctx = AnalysisContext::default();
        let dom = EbpfDomain::bottom();
        assert!(check(&ctx, &dom, &stack_access(4, 8, AccessType::Read)).is_empty());
    }

    #[test]
    fn test_zero_ctx_offset() {
        let ctx = AnalysisContext::default();
        let mut dom = EbpfDomain::setup_entry(&ctx);
        let zero = Assertion::ZeroCtxOffset(ZeroCtxOffset { reg: Reg::R1_ARG });
        assert!(check(&ctx, &dom, &zero).is_empty());
        dom.inv.assign(reg_pack(Reg::R1_ARG).ctx_offset, 8i64);
        assert_eq!(check(&ctx, &dom, &zero), vec!["Nonzero context offset (r1.ctx_offset == 0)"]);
    }
}
