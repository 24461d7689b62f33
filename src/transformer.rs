//! Instruction semantics.
//!
//! [`transform`] maps one [`Instruction`] to its effect on an
//! [`EbpfDomain`]. Preconditions are not checked here; see
//! [`crate::checker`]. The transformer assumes they hold only where the
//! semantics would otherwise be undefined (for example, it ignores the
//! combinations of region tags that the `Addable` precondition rules out).

use crate::array_domain::ArrayDomain;
use crate::context::AnalysisContext;
use crate::ebpf_domain::EbpfDomain;
use crate::finite_domain::{ArithOp, BinaryOp, NumAbsDomain};
use crate::instruction::{
    Atomic, AtomicOp, Bin, BinOp, Call, CondOp, Condition, Exit, Imm, Instruction, Mem, Reg, Un, UnOp, Value,
    ArgPairKind, ArgSingleKind,
};
use crate::interval::Interval;
use crate::linear::{eq, ge, gt, le, lt, neq, LinearConstraint, LinearExpression};
use crate::number::Number;
use crate::platform::{MapValueType, EBPF_SUBPROGRAM_STACK_SIZE, EBPF_TOTAL_STACK_SIZE, PTR_MAX};
use crate::type_domain::{reg_pack, TypeDomain, TYPE_SPECIFIC_KINDS};
use crate::type_encoding::TypeEncoding;
use crate::variable::{DataKind, Variable};

/// Applies `ins` to `dom`. A bottom state stays bottom.
///
/// # Panics
///
/// If an instruction other than [`Instruction::Assume`] turns a reachable
/// state into bottom. That is a bug in the transformer, not a property of
/// the program.
pub fn transform(ctx: &AnalysisContext, dom: &mut EbpfDomain, ins: &Instruction) {
    if dom.is_bottom() {
        return;
    }
    let pre = dom.clone();
    Transformer::new(ctx).apply(dom, ins);
    if dom.is_bottom() && !matches!(ins, Instruction::Assume(_)) {
        panic!(
            "Bug! pre-invariant {} followed by instruction {} leads to bottom",
            pre.render(ctx),
            ins
        );
    }
}

fn havoc_offsets(inv: &mut NumAbsDomain, reg: Reg) {
    let r = reg_pack(reg);
    inv.havoc(r.ctx_offset);
    inv.havoc(r.map_fd);
    inv.havoc(r.packet_offset);
    inv.havoc(r.shared_offset);
    inv.havoc(r.shared_region_size);
    inv.havoc(r.stack_offset);
    inv.havoc(r.stack_numeric_size);
}

/// Forgets everything about `reg` except its region tag.
fn havoc_register(inv: &mut NumAbsDomain, reg: Reg) {
    let r = reg_pack(reg);
    havoc_offsets(inv, reg);
    inv.havoc(r.svalue);
    inv.havoc(r.uvalue);
}

fn assign_or_havoc(inv: &mut NumAbsDomain, x: Variable, e: Option<LinearExpression>) {
    match e {
        Some(e) => inv.assign(x, e),
        None => inv.havoc(x),
    }
}

fn type_is(reg: Reg, t: TypeEncoding) -> LinearConstraint {
    eq(reg_pack(reg).type_, t.tag())
}

fn type_is_pointer(reg: Reg) -> LinearConstraint {
    ge(reg_pack(reg).type_, TypeEncoding::Ctx.tag())
}

/// May an expression evaluating to a region tag be `t`?
fn may_have_type(inv: &NumAbsDomain, e: &LinearExpression, t: TypeEncoding) -> bool {
    inv.eval_interval(e).contains(&Number::from(t.tag()))
}

/// The kinds that only mean something while the owner may hold a region.
fn region_kinds() -> Vec<DataKind> {
    let mut kinds: Vec<DataKind> = Vec::new();
    for (_, kind) in TYPE_SPECIFIC_KINDS {
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    kinds
}

fn u32_mask() -> LinearExpression {
    LinearExpression::constant(i64::from(u32::MAX))
}

/// The offset constraint implied by comparing two pointers into the same
/// region. Signedness does not matter for offsets.
fn offset_constraint(op: CondOp, dst: Variable, src: Variable) -> Option<LinearConstraint> {
    match op {
        CondOp::Eq => Some(eq(dst, src)),
        CondOp::Ne => Some(neq(dst, src)),
        CondOp::Ge | CondOp::SGe => Some(ge(dst, src)),
        CondOp::Le | CondOp::SLe => Some(le(dst, src)),
        CondOp::Gt | CondOp::SGt => Some(gt(dst, src)),
        CondOp::Lt | CondOp::SLt => Some(lt(dst, src)),
        CondOp::Set | CondOp::NSet => None,
    }
}

fn movsx_bits(op: BinOp) -> Option<u32> {
    match op {
        BinOp::MovSx8 => Some(8),
        BinOp::MovSx16 => Some(16),
        BinOp::MovSx32 => Some(32),
        _ => None,
    }
}

fn swap_bytes(op: UnOp, n: i64, big_endian: bool, signed: bool) -> Option<Number> {
    // (width in bits, whether the host order differs from the requested one)
    let (width, swap) = match op {
        UnOp::Be16 => (16, !big_endian),
        UnOp::Be32 => (32, !big_endian),
        UnOp::Be64 => (64, !big_endian),
        UnOp::Le16 => (16, big_endian),
        UnOp::Le32 => (32, big_endian),
        UnOp::Le64 => (64, big_endian),
        UnOp::Swap16 => (16, true),
        UnOp::Swap32 => (32, true),
        UnOp::Swap64 => (64, true),
        UnOp::Neg => return None,
    };
    let bits = n as u64;
    Some(match (width, swap) {
        (16, true) => Number::from((bits as u16).swap_bytes()),
        (16, false) => Number::from(bits as u16),
        (32, true) => Number::from((bits as u32).swap_bytes()),
        (32, false) => Number::from(bits as u32),
        (_, true) if signed => Number::from(n.swap_bytes()),
        (_, true) => Number::from(bits.swap_bytes()),
        (_, false) if signed => Number::from(n),
        (_, false) => Number::from(bits),
    })
}

struct Transformer<'a> {
    ctx: &'a AnalysisContext,
    types: TypeDomain<'a>,
}

impl<'a> Transformer<'a> {
    fn new(ctx: &'a AnalysisContext) -> Self {
        Transformer {
            ctx,
            types: TypeDomain::new(ctx.vars()),
        }
    }

    fn apply(&self, dom: &mut EbpfDomain, ins: &Instruction) {
        match ins {
            Instruction::Undefined { .. } | Instruction::Jmp(_) => {}
            Instruction::Bin(bin) => self.bin(dom, bin),
            Instruction::Un(un) => self.un(dom, un),
            Instruction::LoadMapFd(l) => self.load_mapfd(&mut dom.inv, l.dst, l.mapfd, false),
            Instruction::LoadMapAddress(l) => self.load_map_address(&mut dom.inv, l.dst, l.mapfd, l.offset),
            Instruction::Call(call) => self.call(dom, call),
            Instruction::CallLocal(call) => {
                self.save_callee_saved_registers(&mut dom.inv, &call.stack_frame_prefix);
                self.add_imm(&mut dom.inv, &dom.stack, Reg::R10_STACK_POINTER, -EBPF_SUBPROGRAM_STACK_SIZE, 64);
            }
            Instruction::Callx(callx) => {
                let id = dom.inv.interval(reg_pack(callx.func).svalue).singleton_value().and_then(|n| n.to_i32());
                let platform = &self.ctx.program_info.platform;
                if let Some(call) = id.filter(|id| platform.is_helper_usable(*id)).and_then(|id| platform.helper(id)) {
                    self.call(dom, &call);
                }
            }
            Instruction::Exit(exit) => self.exit(dom, exit),
            Instruction::Mem(mem) => self.mem(dom, mem),
            Instruction::Packet(_) => {
                let r0 = Reg::R0_RETURN_VALUE;
                self.types.assign_type(&mut dom.inv, r0, TypeEncoding::Number);
                havoc_register(&mut dom.inv, r0);
                self.scratch_caller_saved_registers(&mut dom.inv);
            }
            Instruction::Atomic(atomic) => self.atomic(dom, atomic),
            Instruction::Assume(assume) => self.assume(dom, &assume.cond),
            Instruction::IncrementLoopCounter(inc) => {
                let counter = self.ctx.vars().loop_counter(&inc.name.to_string());
                dom.inv.add(counter, 1i64);
            }
        }
    }

    fn assume(&self, dom: &mut EbpfDomain, cond: &Condition) {
        let dst = reg_pack(cond.left);
        match cond.right {
            Value::Reg(src_reg) => {
                let src = reg_pack(src_reg);
                if self.types.same_type(&dom.inv, cond.left, src_reg) {
                    dom.inv = self.types.join_over_types(&dom.inv, cond.left, |inv, t| {
                        if t == TypeEncoding::Number {
                            let csts = inv.assume_cst(
                                cond.op,
                                cond.is64,
                                dst.svalue,
                                dst.uvalue,
                                &src.svalue.into(),
                                &src.uvalue.into(),
                            );
                            inv.add_constraints(&csts);
                        } else if let (Some(d), Some(s)) = (
                            EbpfDomain::type_offset_variable(cond.left, t),
                            EbpfDomain::type_offset_variable(src_reg, t),
                        ) {
                            if let Some(cst) = offset_constraint(cond.op, d, s) {
                                inv.add_constraint(&cst);
                            }
                        }
                    });
                } else {
                    // Comparing values of different regions says nothing we can use.
                    log::trace!("Comparison of {} and {} with different types", cond.left, src_reg);
                    dom.inv.set_to_top();
                }
            }
            Value::Imm(Imm(imm)) => {
                let rs = LinearExpression::constant(imm as i64);
                let ru = LinearExpression::constant(Number::from(imm));
                let csts = dom.inv.assume_cst(cond.op, cond.is64, dst.svalue, dst.uvalue, &rs, &ru);
                dom.inv.add_constraints(&csts);
            }
        }
    }

    fn un(&self, dom: &mut EbpfDomain, un: &Un) {
        let dst = reg_pack(un.dst);
        if un.op == UnOp::Neg {
            dom.inv.neg(dst.svalue, dst.uvalue, if un.is64 { 64 } else { 32 });
            havoc_offsets(&mut dom.inv, un.dst);
            return;
        }
        let big_endian = self.ctx.options.big_endian;
        if matches!((un.op, big_endian), (UnOp::Be64, true) | (UnOp::Le64, false)) {
            return;
        }
        let is_number = dom.inv.entail(&type_is(un.dst, TypeEncoding::Number));
        for (v, signed) in [(dst.svalue, true), (dst.uvalue, false)] {
            let swapped = dom
                .inv
                .interval(v)
                .singleton_value()
                .and_then(|n| n.to_i64())
                .filter(|_| is_number)
                .and_then(|n| swap_bytes(un.op, n, big_endian, signed));
            match swapped {
                Some(n) => dom.inv.set(v, &Interval::singleton(n)),
                None => {
                    dom.inv.havoc(v);
                    havoc_offsets(&mut dom.inv, un.dst);
                }
            }
        }
    }

    fn exit(&self, dom: &mut EbpfDomain, exit: &Exit) {
        let prefix = &exit.stack_frame_prefix;
        if prefix.is_empty() {
            return;
        }
        // The callee's frame is gone.
        let r10 = reg_pack(Reg::R10_STACK_POINTER);
        if let Some(offset) = dom.inv.interval(r10.stack_offset).singleton_value().and_then(|n| n.to_i64()) {
            let start = LinearExpression::constant(offset - EBPF_SUBPROGRAM_STACK_SIZE);
            dom.stack.havoc_all_kinds(self.ctx, &mut dom.inv, &start, EBPF_SUBPROGRAM_STACK_SIZE);
        }
        self.restore_callee_saved_registers(&mut dom.inv, prefix);
        self.add_imm(&mut dom.inv, &dom.stack, Reg::R10_STACK_POINTER, EBPF_SUBPROGRAM_STACK_SIZE, 64);
    }

    fn scratch_caller_saved_registers(&self, inv: &mut NumAbsDomain) {
        for r in Reg::R1_ARG.0..=Reg::R5_ARG.0 {
            havoc_register(inv, Reg(r));
            self.types.havoc_type(inv, Reg(r));
        }
    }

    fn save_callee_saved_registers(&self, inv: &mut NumAbsDomain, prefix: &str) {
        for r in Reg::R6.0..=Reg::R9.0 {
            for kind in DataKind::ALL {
                let src = Variable::reg(kind, r);
                if !inv.interval(src).is_top() {
                    inv.assign(self.ctx.vars().frame_var(prefix, r, kind), src);
                }
            }
        }
    }

    fn restore_callee_saved_registers(&self, inv: &mut NumAbsDomain, prefix: &str) {
        for r in Reg::R6.0..=Reg::R9.0 {
            for kind in DataKind::ALL {
                let saved = self.ctx.vars().frame_var(prefix, r, kind);
                if inv.interval(saved).is_top() {
                    inv.havoc(Variable::reg(kind, r));
                } else {
                    inv.assign(Variable::reg(kind, r), saved);
                }
                inv.havoc(saved);
            }
        }
    }

    fn assign_valid_ptr(&self, inv: &mut NumAbsDomain, reg: Reg, maybe_null: bool) {
        let r = reg_pack(reg);
        inv.havoc(r.svalue);
        inv.havoc(r.uvalue);
        if maybe_null {
            inv.add_constraint(&ge(r.svalue, 0i64));
        } else {
            inv.add_constraint(&gt(r.svalue, 0i64));
        }
        inv.add_constraint(&le(r.svalue, PTR_MAX));
        inv.assign(r.uvalue, r.svalue);
    }

    fn load_mapfd(&self, inv: &mut NumAbsDomain, dst: Reg, mapfd: i32, maybe_null: bool) {
        let value_type = self.ctx.program_info.map_descriptor(mapfd).map(|d| d.value_type);
        let t = if value_type == Some(MapValueType::Program) {
            TypeEncoding::MapPrograms
        } else {
            TypeEncoding::Map
        };
        self.types.assign_type(inv, dst, t);
        inv.assign(reg_pack(dst).map_fd, i64::from(mapfd));
        self.assign_valid_ptr(inv, dst, maybe_null);
    }

    fn load_map_address(&self, inv: &mut NumAbsDomain, dst: Reg, mapfd: i32, offset: i32) {
        let r = reg_pack(dst);
        let desc = self
            .ctx
            .program_info
            .map_descriptor(mapfd)
            .filter(|d| d.value_type != MapValueType::Program);
        let Some(desc) = desc else {
            // Rejected when the control-flow graph is built.
            havoc_register(inv, dst);
            self.types.havoc_type(inv, dst);
            return;
        };
        self.types.assign_type(inv, dst, TypeEncoding::Shared);
        inv.assign(r.shared_offset, i64::from(offset));
        inv.assign(r.shared_region_size, i64::from(desc.value_size));
        self.assign_valid_ptr(inv, dst, false);
    }

    /// Re-derives the numeric run length of a stack pointer when nothing is
    /// known about it.
    fn recompute_stack_numeric_size(&self, inv: &mut NumAbsDomain, stack: &ArrayDomain, type_var: Variable) {
        let vars = self.ctx.vars();
        let size = vars.kind_var(DataKind::StackNumericSizes, type_var);
        if !inv.interval(size).is_top() || !self.types.has_type(inv, type_var, TypeEncoding::Stack) {
            return;
        }
        let n = stack.min_all_num_size(inv, vars.kind_var(DataKind::StackOffsets, type_var));
        if n > 0 {
            inv.assign(size, n);
        }
    }

    /// `reg += imm`, moving the region offset along with the value.
    fn add_imm(&self, inv: &mut NumAbsDomain, stack: &ArrayDomain, reg: Reg, imm: i64, width: u32) {
        let r = reg_pack(reg);
        let offset = EbpfDomain::type_offset_variable(reg, self.types.get_reg_type(inv, reg));
        inv.add_overflow(r.svalue, r.uvalue, &LinearExpression::constant(imm), width);
        if let Some(offset) = offset {
            inv.add(offset, imm);
            if imm > 0 {
                inv.sub(r.stack_numeric_size, imm);
            } else if imm < 0 {
                inv.havoc(r.stack_numeric_size);
            }
            self.recompute_stack_numeric_size(inv, stack, r.type_);
        }
    }

    fn shl(&self, inv: &mut NumAbsDomain, reg: Reg, imm: u32, width: u32) {
        let r = reg_pack(reg);
        if inv.entail(&type_is(reg, TypeEncoding::Number)) {
            inv.shl(r.svalue, r.uvalue, imm, width);
        } else {
            let amount = LinearExpression::constant(i64::from(imm & (width - 1)));
            inv.shl_overflow(r.svalue, r.uvalue, &amount);
        }
        havoc_offsets(inv, reg);
    }

    fn lshr(&self, inv: &mut NumAbsDomain, reg: Reg, imm: u32, width: u32) {
        let r = reg_pack(reg);
        if inv.entail(&type_is(reg, TypeEncoding::Number)) {
            inv.lshr(r.svalue, r.uvalue, imm, width);
        } else {
            inv.havoc(r.svalue);
            inv.havoc(r.uvalue);
        }
        havoc_offsets(inv, reg);
    }

    fn ashr(&self, inv: &mut NumAbsDomain, reg: Reg, amount: &LinearExpression, width: u32) {
        let r = reg_pack(reg);
        if inv.entail(&type_is(reg, TypeEncoding::Number)) {
            inv.ashr(r.svalue, r.uvalue, amount, width);
        } else {
            inv.havoc(r.svalue);
            inv.havoc(r.uvalue);
        }
        havoc_offsets(inv, reg);
    }

    fn load_stack(
        &self,
        inv: &mut NumAbsDomain,
        stack: &mut ArrayDomain,
        target: Reg,
        addr: &LinearExpression,
        width: i32,
        src: Reg,
    ) {
        let ctx = self.ctx;
        let t = reg_pack(target);
        let w = i64::from(width);
        let loaded_type = stack.load(ctx, inv, DataKind::Types, addr, w);
        self.types.assign_type_expr(inv, t.type_, loaded_type);
        if inv.entail(&le(w, reg_pack(src).stack_numeric_size)) {
            self.types.assign_type(inv, target, TypeEncoding::Number);
        }

        if !matches!(width, 1 | 2 | 4 | 8) {
            havoc_register(inv, target);
            return;
        }
        // Read before havocking: the address may be based on the target.
        let svalue = stack.load(ctx, inv, DataKind::SValues, addr, w);
        let uvalue = stack.load(ctx, inv, DataKind::UValues, addr, w);
        havoc_register(inv, target);
        assign_or_havoc(inv, t.svalue, svalue);
        assign_or_havoc(inv, t.uvalue, uvalue);

        for kind in region_kinds() {
            let possible = TYPE_SPECIFIC_KINDS
                .iter()
                .any(|(ty, k)| *k == kind && self.types.has_type(inv, t.type_, *ty));
            if possible {
                let value = stack.load(ctx, inv, kind, addr, w);
                assign_or_havoc(inv, Variable::reg(kind, target.0), value);
            }
        }
    }

    fn load_ctx(&self, inv: &mut NumAbsDomain, target: Reg, addr: &LinearExpression, width: i32) {
        let desc = &self.ctx.program_info.context;
        let t = reg_pack(target);
        if desc.end < 0 {
            havoc_register(inv, target);
            self.types.assign_type(inv, target, TypeEncoding::Number);
            return;
        }
        let range = inv.eval_interval(addr);
        havoc_register(inv, target);
        let touches = |field: i32| field >= 0 && range.contains(&Number::from(field));
        let may_touch_ptr = touches(desc.data) || touches(desc.end) || touches(desc.meta);
        let not_a_pointer = |inv: &mut NumAbsDomain| {
            if may_touch_ptr {
                self.types.havoc_type(inv, target);
            } else {
                self.types.assign_type(inv, target, TypeEncoding::Number);
            }
        };

        let Some(addr) = range.singleton_value().and_then(|n| n.to_i64()) else {
            not_a_pointer(inv);
            return;
        };
        let offset_width = desc.end - desc.data;
        let packet_offset: LinearExpression = if addr == i64::from(desc.data) {
            LinearExpression::constant(0i64)
        } else if addr == i64::from(desc.end) {
            Variable::packet_size().into()
        } else if desc.meta >= 0 && addr == i64::from(desc.meta) {
            Variable::meta_offset().into()
        } else {
            not_a_pointer(inv);
            return;
        };
        if width == offset_width {
            inv.assign(t.packet_offset, packet_offset);
            self.types.assign_type(inv, target, TypeEncoding::Packet);
            inv.add_constraint(&ge(t.svalue, 4098i64));
            inv.add_constraint(&le(t.svalue, PTR_MAX));
        } else {
            self.types.havoc_type(inv, target);
        }
    }

    fn load_packet_or_shared(&self, inv: &mut NumAbsDomain, target: Reg, width: i32) {
        let t = reg_pack(target);
        self.types.assign_type(inv, target, TypeEncoding::Number);
        havoc_register(inv, target);
        // Narrow loads give small values that often index arrays.
        let range = match width {
            1 => Interval::unsigned_int(8),
            2 => Interval::unsigned_int(16),
            _ => return,
        };
        inv.set(t.svalue, &range);
        inv.set(t.uvalue, &range);
    }

    fn load(&self, dom: &mut EbpfDomain, mem: &Mem, target: Reg) {
        let base_reg = mem.access.basereg;
        let base = reg_pack(base_reg);
        let offset = i64::from(mem.access.offset);
        let width = mem.access.width;
        if base_reg == Reg::R10_STACK_POINTER {
            let addr = LinearExpression::from(base.stack_offset) + offset;
            self.load_stack(&mut dom.inv, &mut dom.stack, target, &addr, width, base_reg);
            return;
        }
        let stack = &mut dom.stack;
        dom.inv = self.types.join_over_types(&dom.inv, base_reg, |inv, t| match t {
            TypeEncoding::Uninit | TypeEncoding::Map | TypeEncoding::MapPrograms | TypeEncoding::Number => {}
            TypeEncoding::Ctx => {
                let addr = LinearExpression::from(base.ctx_offset) + offset;
                self.load_ctx(inv, target, &addr, width);
            }
            TypeEncoding::Stack => {
                let addr = LinearExpression::from(base.stack_offset) + offset;
                self.load_stack(inv, stack, target, &addr, width, base_reg);
            }
            TypeEncoding::Packet | TypeEncoding::Shared => self.load_packet_or_shared(inv, target, width),
        });
    }

    /// Stores `value` into `[addr, addr + width)` and assigns the cell.
    fn store_cell(
        &self,
        inv: &mut NumAbsDomain,
        stack: &mut ArrayDomain,
        kind: DataKind,
        addr: &LinearExpression,
        width: i64,
        value: &LinearExpression,
    ) {
        if let Some(cell) = stack.store(self.ctx, inv, kind, addr, width, value) {
            inv.assign(cell, value.clone());
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn store_stack(
        &self,
        pre: &NumAbsDomain,
        inv: &mut NumAbsDomain,
        stack: &mut ArrayDomain,
        addr: &LinearExpression,
        width: i32,
        val_type: &LinearExpression,
        val_svalue: &LinearExpression,
        val_uvalue: &LinearExpression,
        val_reg: Option<Reg>,
    ) {
        let w = i64::from(width);
        self.store_cell(inv, stack, DataKind::Types, addr, w, val_type);
        if width == 8 {
            self.store_cell(inv, stack, DataKind::SValues, addr, w, val_svalue);
            self.store_cell(inv, stack, DataKind::UValues, addr, w, val_uvalue);
            for kind in region_kinds() {
                let possible = TYPE_SPECIFIC_KINDS
                    .iter()
                    .any(|(t, k)| *k == kind && may_have_type(pre, val_type, *t));
                match val_reg {
                    Some(r) if possible => {
                        self.store_cell(inv, stack, kind, addr, w, &Variable::reg(kind, r.0).into());
                    }
                    _ => stack.havoc(self.ctx, inv, kind, addr, w),
                }
            }
        } else {
            let numeric = self.types.get_type(pre, val_type) == TypeEncoding::Number;
            if matches!(width, 1 | 2 | 4) && numeric {
                self.store_cell(inv, stack, DataKind::SValues, addr, w, val_svalue);
                self.store_cell(inv, stack, DataKind::UValues, addr, w, val_uvalue);
            } else {
                stack.havoc(self.ctx, inv, DataKind::SValues, addr, w);
                stack.havoc(self.ctx, inv, DataKind::UValues, addr, w);
            }
            for kind in region_kinds() {
                stack.havoc(self.ctx, inv, kind, addr, w);
            }
        }

        // Stack pointers whose numeric run the store may have cut.
        let vars = self.ctx.vars();
        for type_var in vars.type_variables() {
            if !self.types.has_type(inv, type_var, TypeEncoding::Stack) {
                continue;
            }
            let offset = vars.kind_var(DataKind::StackOffsets, type_var);
            let size = vars.kind_var(DataKind::StackNumericSizes, type_var);
            let run_end = LinearExpression::from(offset) + size;
            if pre.intersect(&le(addr.clone(), run_end)) && pre.intersect(&ge(addr.clone() + w, offset)) {
                inv.havoc(size);
                self.recompute_stack_numeric_size(inv, stack, type_var);
            }
        }
    }

    fn mem_store(
        &self,
        dom: &mut EbpfDomain,
        mem: &Mem,
        val_type: LinearExpression,
        val_svalue: LinearExpression,
        val_uvalue: LinearExpression,
        val_reg: Option<Reg>,
    ) {
        let base_reg = mem.access.basereg;
        let offset = i64::from(mem.access.offset);
        let width = mem.access.width;
        let pre = dom.inv.clone();
        if base_reg == Reg::R10_STACK_POINTER {
            let r10 = reg_pack(base_reg).stack_offset;
            if let Some(base) = pre.interval(r10).singleton_value().and_then(|n| n.to_i64()) {
                let addr = LinearExpression::constant(base + offset);
                self.store_stack(
                    &pre,
                    &mut dom.inv,
                    &mut dom.stack,
                    &addr,
                    width,
                    &val_type,
                    &val_svalue,
                    &val_uvalue,
                    val_reg,
                );
            }
            return;
        }
        let stack = &mut dom.stack;
        dom.inv = self.types.join_over_types(&pre, base_reg, |inv, t| {
            if t == TypeEncoding::Stack {
                let addr = LinearExpression::from(reg_pack(base_reg).stack_offset) + offset;
                self.store_stack(&pre, inv, stack, &addr, width, &val_type, &val_svalue, &val_uvalue, val_reg);
            }
        });
    }

    fn mem(&self, dom: &mut EbpfDomain, mem: &Mem) {
        match mem.value {
            Value::Reg(r) if mem.is_load => self.load(dom, mem, r),
            Value::Reg(r) => {
                let v = reg_pack(r);
                self.mem_store(dom, mem, v.type_.into(), v.svalue.into(), v.uvalue.into(), Some(r));
            }
            Value::Imm(Imm(imm)) => {
                let t = LinearExpression::constant(TypeEncoding::Number.tag());
                let s = LinearExpression::constant(imm as i64);
                let u = LinearExpression::constant(Number::from(imm));
                self.mem_store(dom, mem, t, s, u, None);
            }
        }
    }

    fn atomic(&self, dom: &mut EbpfDomain, a: &Atomic) {
        let base = a.access.basereg;
        if !dom.inv.entail(&type_is_pointer(base)) || !dom.inv.entail(&type_is(a.valreg, TypeEncoding::Number)) {
            return;
        }
        if dom.inv.entail(&neq(reg_pack(base).type_, TypeEncoding::Stack.tag())) {
            // Shared memory is volatile: only the registers that receive
            // the old value change.
            if a.op == AtomicOp::CmpXchg {
                havoc_register(&mut dom.inv, Reg::R0_RETURN_VALUE);
            } else if a.fetch {
                havoc_register(&mut dom.inv, a.valreg);
            }
            return;
        }

        let scratch = Reg::R11_ATOMIC_SCRATCH;
        let access = |value: Reg, is_load: bool| Mem {
            access: a.access.clone(),
            value: Value::Reg(value),
            is_load,
        };
        self.mem(dom, &access(scratch, true));
        let op = match a.op {
            AtomicOp::Add => BinOp::Add,
            AtomicOp::Or => BinOp::Or,
            AtomicOp::And => BinOp::And,
            AtomicOp::Xor => BinOp::Xor,
            AtomicOp::Xchg | AtomicOp::CmpXchg => BinOp::Mov,
        };
        let bin = Bin {
            op,
            dst: scratch,
            v: Value::Reg(a.valreg),
            is64: a.access.width == 8,
            lddw: false,
        };
        self.bin(dom, &bin);
        if a.op == AtomicOp::CmpXchg {
            self.mem(dom, &access(Reg::R0_RETURN_VALUE, true));
            // Whether the exchange happened is unknown.
            havoc_register(&mut dom.inv, scratch);
        } else if a.fetch {
            self.mem(dom, &access(a.valreg, true));
        }
        self.mem(dom, &access(scratch, false));
        havoc_register(&mut dom.inv, scratch);
        self.types.havoc_type(&mut dom.inv, scratch);
    }

    fn call(&self, dom: &mut EbpfDomain, call: &Call) {
        let ctx = self.ctx;
        let maybe_fd_reg = call
            .singles
            .iter()
            .rev()
            .find(|s| s.kind == ArgSingleKind::MapFd)
            .map(|s| s.reg);

        for pair in call.pairs.iter().filter(|p| p.kind == ArgPairKind::PtrToWritableMem) {
            let Some(addr) = dom.reg_offset_variable(ctx, pair.mem) else {
                continue;
            };
            let addr = LinearExpression::from(addr);
            let size = reg_pack(pair.size).svalue;
            // The written range is at most as long as the largest size.
            let span = dom
                .inv
                .interval(size)
                .ub()
                .number()
                .and_then(|n| n.to_i64())
                .unwrap_or(EBPF_TOTAL_STACK_SIZE)
                .clamp(0, EBPF_TOTAL_STACK_SIZE);
            let mut store_numbers = true;
            let stack = &mut dom.stack;
            dom.inv = self.types.join_over_types(&dom.inv, pair.mem, |inv, t| {
                if t == TypeEncoding::Stack {
                    for kind in DataKind::ALL {
                        if kind != DataKind::StackNumericSizes {
                            stack.havoc(ctx, inv, kind, &addr, span);
                        }
                    }
                } else {
                    store_numbers = false;
                }
            });
            if store_numbers {
                // Helpers never write pointers and always initialize.
                dom.stack.store_numbers(&dom.inv, &addr, &size.into());
            }
        }

        let r0 = Reg::R0_RETURN_VALUE;
        let r0_pack = reg_pack(r0);
        dom.inv.havoc(r0_pack.stack_numeric_size);
        if call.is_map_lookup {
            let inner = maybe_fd_reg
                .filter(|fd| dom.map_value_type(ctx, *fd) == Some(MapValueType::Map))
                .and_then(|fd| dom.map_inner_map_fd(ctx, fd));
            if let Some(inner) = inner {
                self.load_mapfd(&mut dom.inv, r0, inner, true);
            } else {
                let region_size = maybe_fd_reg
                    .filter(|fd| dom.map_value_type(ctx, *fd) != Some(MapValueType::Map))
                    .map(|fd| dom.map_value_size(ctx, fd))
                    .unwrap_or_else(Interval::top);
                // The only way to get a null pointer.
                self.assign_valid_ptr(&mut dom.inv, r0, true);
                dom.inv.assign(r0_pack.shared_offset, 0i64);
                dom.inv.set(r0_pack.shared_region_size, &region_size);
                self.types.assign_type(&mut dom.inv, r0, TypeEncoding::Shared);
            }
        } else {
            havoc_register(&mut dom.inv, r0);
            self.types.assign_type(&mut dom.inv, r0, TypeEncoding::Number);
        }
        self.scratch_caller_saved_registers(&mut dom.inv);
        if call.reallocate_packet {
            self.forget_packet_pointers(dom);
        }
    }

    fn forget_packet_pointers(&self, dom: &mut EbpfDomain) {
        let vars = self.ctx.vars();
        for type_var in vars.type_variables() {
            if self.types.has_type(&dom.inv, type_var, TypeEncoding::Packet) {
                for kind in [DataKind::Types, DataKind::PacketOffsets, DataKind::SValues, DataKind::UValues] {
                    dom.inv.havoc(vars.kind_var(kind, type_var));
                }
            }
        }
        dom.initialize_packet(self.ctx);
    }

    fn bin(&self, dom: &mut EbpfDomain, bin: &Bin) {
        let width: u32 = if bin.is64 { 64 } else { 32 };
        match bin.v {
            Value::Imm(Imm(raw)) => {
                let imm = if bin.is64 { raw as i64 } else { i64::from(raw as u32 as i32) };
                if !self.bin_imm(dom, bin, imm, width) {
                    return;
                }
            }
            Value::Reg(src) => {
                if !self.bin_reg(dom, bin, src, width) {
                    return;
                }
            }
        }
        if !bin.is64 {
            let dst = reg_pack(bin.dst);
            dom.inv.bitwise_and(dst.svalue, dst.uvalue, &u32_mask(), 64);
        }
    }

    /// `dst op= imm`. Returns false when the instruction turned out to be
    /// a no-op.
    fn bin_imm(&self, dom: &mut EbpfDomain, bin: &Bin, imm: i64, width: u32) -> bool {
        let dst_reg = bin.dst;
        let dst = reg_pack(dst_reg);
        let inv = &mut dom.inv;
        if !bin.is64 {
            inv.bitwise_and(dst.svalue, dst.uvalue, &u32_mask(), 64);
            // A 32-bit operation on a pointer leaves nothing meaningful.
            if !self.types.reg_has_type(inv, dst_reg, TypeEncoding::Number) {
                havoc_register(inv, dst_reg);
                self.types.havoc_type(inv, dst_reg);
            }
        }
        let k = LinearExpression::constant(imm);
        match bin.op {
            BinOp::Mov => {
                inv.assign(dst.svalue, imm);
                inv.assign(dst.uvalue, imm);
                inv.overflow_unsigned(dst.uvalue, width);
                self.types.assign_type(inv, dst_reg, TypeEncoding::Number);
                havoc_offsets(inv, dst_reg);
            }
            BinOp::MovSx8 | BinOp::MovSx16 | BinOp::MovSx32 => {
                let bits = movsx_bits(bin.op).unwrap_or(64);
                self.types.assign_type(inv, dst_reg, TypeEncoding::Number);
                havoc_offsets(inv, dst_reg);
                inv.sign_extend(dst.svalue, dst.uvalue, &k, width, bits);
            }
            BinOp::Add | BinOp::Sub => {
                if imm == 0 {
                    return false;
                }
                let imm = if bin.op == BinOp::Add { imm } else { -imm };
                self.add_imm(inv, &dom.stack, dst_reg, imm, width);
            }
            BinOp::Mul => {
                inv.mul(dst.svalue, dst.uvalue, &k, width);
                havoc_offsets(inv, dst_reg);
            }
            BinOp::UDiv => {
                inv.udiv(dst.svalue, dst.uvalue, &k, width);
                havoc_offsets(inv, dst_reg);
            }
            BinOp::UMod => {
                inv.urem(dst.svalue, dst.uvalue, &k, width);
                havoc_offsets(inv, dst_reg);
            }
            BinOp::SDiv => {
                inv.sdiv(dst.svalue, dst.uvalue, &k, width);
                havoc_offsets(inv, dst_reg);
            }
            BinOp::SMod => {
                inv.srem(dst.svalue, dst.uvalue, &k, width);
                havoc_offsets(inv, dst_reg);
            }
            BinOp::Or => {
                inv.bitwise_or(dst.svalue, dst.uvalue, &k, width);
                havoc_offsets(inv, dst_reg);
            }
            BinOp::Xor => {
                inv.bitwise_xor(dst.svalue, dst.uvalue, &k, width);
                havoc_offsets(inv, dst_reg);
            }
            BinOp::And => {
                inv.bitwise_and(dst.svalue, dst.uvalue, &k, width);
                if imm as i32 > 0 {
                    // A positive mask bounds both shadows.
                    inv.add_constraints(&[
                        le(dst.svalue, imm),
                        le(dst.uvalue, imm),
                        ge(dst.svalue, 0i64),
                        ge(dst.uvalue, 0i64),
                    ]);
                }
                havoc_offsets(inv, dst_reg);
            }
            BinOp::Lsh => self.shl(inv, dst_reg, imm as u32, width),
            BinOp::Rsh => self.lshr(inv, dst_reg, imm as u32, width),
            BinOp::Arsh => self.ashr(inv, dst_reg, &k, width),
        }
        true
    }

    /// `dst op= src`. Returns false when the instruction turned out to be
    /// a no-op.
    fn bin_reg(&self, dom: &mut EbpfDomain, bin: &Bin, src_reg: Reg, width: u32) -> bool {
        let dst_reg = bin.dst;
        let dst = reg_pack(dst_reg);
        let src = reg_pack(src_reg);
        let src_svalue = LinearExpression::from(src.svalue);
        let src_uvalue = LinearExpression::from(src.uvalue);
        let src_is_number = dom.inv.entail(&type_is(src_reg, TypeEncoding::Number));
        match bin.op {
            BinOp::Add => self.add_reg(dom, dst_reg, src_reg, width),
            BinOp::Sub => self.sub_reg(dom, dst_reg, src_reg, width),
            BinOp::Mul => {
                dom.inv.mul(dst.svalue, dst.uvalue, &src_svalue, width);
                havoc_offsets(&mut dom.inv, dst_reg);
            }
            BinOp::UDiv => {
                dom.inv.udiv(dst.svalue, dst.uvalue, &src_uvalue, width);
                havoc_offsets(&mut dom.inv, dst_reg);
            }
            BinOp::UMod => {
                dom.inv.urem(dst.svalue, dst.uvalue, &src_uvalue, width);
                havoc_offsets(&mut dom.inv, dst_reg);
            }
            BinOp::SDiv => {
                dom.inv.sdiv(dst.svalue, dst.uvalue, &src_svalue, width);
                havoc_offsets(&mut dom.inv, dst_reg);
            }
            BinOp::SMod => {
                dom.inv.srem(dst.svalue, dst.uvalue, &src_svalue, width);
                havoc_offsets(&mut dom.inv, dst_reg);
            }
            BinOp::Or => {
                dom.inv.bitwise_or(dst.svalue, dst.uvalue, &src_uvalue, width);
                havoc_offsets(&mut dom.inv, dst_reg);
            }
            BinOp::And => {
                dom.inv.bitwise_and(dst.svalue, dst.uvalue, &src_uvalue, width);
                havoc_offsets(&mut dom.inv, dst_reg);
            }
            BinOp::Xor => {
                dom.inv.bitwise_xor(dst.svalue, dst.uvalue, &src_uvalue, width);
                havoc_offsets(&mut dom.inv, dst_reg);
            }
            BinOp::Lsh | BinOp::Rsh => {
                let amount = dom
                    .inv
                    .interval(src.uvalue)
                    .singleton_value()
                    .filter(|_| src_is_number)
                    .map(|n| (n.as_u64_bits() & u64::from(width - 1)) as u32);
                match amount {
                    Some(imm) => {
                        if !bin.is64 {
                            dom.inv.bitwise_and(dst.svalue, dst.uvalue, &u32_mask(), 64);
                        }
                        if bin.op == BinOp::Lsh {
                            self.shl(&mut dom.inv, dst_reg, imm, width);
                        } else {
                            self.lshr(&mut dom.inv, dst_reg, imm, width);
                        }
                    }
                    None if bin.op == BinOp::Lsh => {
                        dom.inv.shl_overflow(dst.svalue, dst.uvalue, &src_uvalue);
                        havoc_offsets(&mut dom.inv, dst_reg);
                    }
                    None => {
                        havoc_register(&mut dom.inv, dst_reg);
                    }
                }
            }
            BinOp::Arsh => {
                if src_is_number {
                    self.ashr(&mut dom.inv, dst_reg, &src_svalue, width);
                } else {
                    havoc_register(&mut dom.inv, dst_reg);
                }
            }
            BinOp::MovSx8 | BinOp::MovSx16 | BinOp::MovSx32 => {
                let bits = movsx_bits(bin.op).unwrap_or(64);
                if dst_reg == src_reg && dom.inv.interval(dst.svalue).le(&Interval::signed_int(bits)) {
                    return false;
                }
                if src_is_number {
                    self.types.assign_type(&mut dom.inv, dst_reg, TypeEncoding::Number);
                    havoc_offsets(&mut dom.inv, dst_reg);
                    dom.inv.sign_extend(dst.svalue, dst.uvalue, &src_svalue, width, bits);
                } else {
                    havoc_register(&mut dom.inv, dst_reg);
                }
            }
            BinOp::Mov => {
                if dst_reg == src_reg && dom.inv.interval(dst.uvalue).le(&Interval::unsigned_int(width)) {
                    return false;
                }
                self.mov_reg(dom, dst_reg, src_reg, bin.is64);
            }
        }
        true
    }

    fn mov_reg(&self, dom: &mut EbpfDomain, dst_reg: Reg, src_reg: Reg, is64: bool) {
        let dst = reg_pack(dst_reg);
        let src = reg_pack(src_reg);
        let inv = &mut dom.inv;
        inv.assign(dst.svalue, src.svalue);
        inv.assign(dst.uvalue, src.uvalue);
        havoc_offsets(inv, dst_reg);
        *inv = self.types.join_over_types(inv, src_reg, |inv, t| {
            // Region fields only survive a full-width move.
            let fields: &[DataKind] = match t {
                TypeEncoding::Ctx => &[DataKind::CtxOffsets],
                TypeEncoding::Map | TypeEncoding::MapPrograms => &[DataKind::MapFds],
                TypeEncoding::Packet => &[DataKind::PacketOffsets],
                TypeEncoding::Shared => &[DataKind::SharedRegionSizes, DataKind::SharedOffsets],
                TypeEncoding::Stack => &[DataKind::StackOffsets, DataKind::StackNumericSizes],
                TypeEncoding::Number => {
                    inv.assign(dst.type_, t.tag());
                    return;
                }
                TypeEncoding::Uninit => return,
            };
            if is64 {
                inv.assign(dst.type_, t.tag());
                for kind in fields {
                    inv.assign(Variable::reg(*kind, dst_reg.0), Variable::reg(*kind, src_reg.0));
                }
            } else {
                // The low half of a pointer is not a pointer.
                inv.havoc(dst.type_);
            }
        });
        if is64 {
            if dst_reg != src_reg || self.types.get_reg_type(inv, dst_reg) == TypeEncoding::Uninit {
                inv.havoc(dst.type_);
            }
            inv.assign(dst.type_, src.type_);
        }
    }

    fn add_reg(&self, dom: &mut EbpfDomain, dst_reg: Reg, src_reg: Reg, width: u32) {
        let dst = reg_pack(dst_reg);
        let src = reg_pack(src_reg);
        let src_svalue = LinearExpression::from(src.svalue);
        if self.types.same_type(&dom.inv, dst_reg, src_reg) {
            // Both are numbers.
            dom.inv.add_overflow(dst.svalue, dst.uvalue, &src_svalue, width);
            return;
        }
        let pre = dom.inv.clone();
        let stack = &dom.stack;
        let types = self.types;
        let added = types.join_over_types(&pre, dst_reg, |inv, dst_type| {
            *inv = types.join_over_types(inv, src_reg, |inv, src_type| {
                let number = TypeEncoding::Number;
                if dst_type == number && src_type != number {
                    // num += ptr
                    types.assign_type(inv, dst_reg, src_type);
                    let offsets = (
                        EbpfDomain::type_offset_variable(dst_reg, src_type),
                        EbpfDomain::type_offset_variable(src_reg, src_type),
                    );
                    if let (Some(dst_offset), Some(src_offset)) = offsets {
                        inv.assign(dst_offset, LinearExpression::from(dst.svalue) + src_offset);
                    }
                    if src_type == TypeEncoding::Shared {
                        inv.assign(dst.shared_region_size, src.shared_region_size);
                    }
                } else if dst_type != number && src_type == number {
                    // ptr += num
                    types.assign_type(inv, dst_reg, dst_type);
                    if let Some(dst_offset) = EbpfDomain::type_offset_variable(dst_reg, dst_type) {
                        inv.add(dst_offset, src.svalue);
                        if dst_type == TypeEncoding::Stack {
                            if pre.intersect(&lt(src.svalue, 0i64)) {
                                inv.havoc(dst.stack_numeric_size);
                                self.recompute_stack_numeric_size(inv, stack, dst.type_);
                            } else {
                                inv.sub(dst.stack_numeric_size, src.svalue);
                            }
                        }
                    }
                } else if dst_type == number && src_type == number {
                    inv.apply_signed(BinaryOp::Arith(ArithOp::Add), dst.svalue, dst.uvalue, dst.svalue, &src_svalue, width);
                } else {
                    // Ruled out by the preconditions.
                    inv.set_to_bottom();
                }
            });
        });
        dom.inv = if added.is_bottom() {
            // No combination is legal; keep going with nothing known.
            log::debug!("Addition of incompatible regions {} += {}", dst_reg, src_reg);
            let mut inv = pre;
            havoc_register(&mut inv, dst_reg);
            types.havoc_type(&mut inv, dst_reg);
            inv
        } else {
            added
        };
        // The value changes only after the offsets have been computed.
        dom.inv
            .apply_signed(BinaryOp::Arith(ArithOp::Add), dst.svalue, dst.uvalue, dst.svalue, &src_svalue, width);
    }

    fn sub_reg(&self, dom: &mut EbpfDomain, dst_reg: Reg, src_reg: Reg, width: u32) {
        let dst = reg_pack(dst_reg);
        let src = reg_pack(src_reg);
        let src_svalue = LinearExpression::from(src.svalue);
        let types = self.types;
        if types.same_type(&dom.inv, dst_reg, src_reg) {
            dom.inv = types.join_over_types(&dom.inv, dst_reg, |inv, t| {
                let offsets = (
                    EbpfDomain::type_offset_variable(dst_reg, t),
                    EbpfDomain::type_offset_variable(src_reg, t),
                );
                match (t, offsets) {
                    (TypeEncoding::Number, _) => {
                        let sub = BinaryOp::Arith(ArithOp::Sub);
                        inv.apply_signed(sub, dst.svalue, dst.uvalue, dst.svalue, &src_svalue, width);
                    }
                    // ptr -= ptr: the distance between the two.
                    (_, (Some(dst_offset), Some(src_offset))) => {
                        let sub = BinaryOp::Arith(ArithOp::Sub);
                        inv.apply_signed(sub, dst.svalue, dst.uvalue, dst_offset, &src_offset.into(), width);
                        inv.havoc(dst_offset);
                    }
                    _ => {}
                }
                havoc_offsets(inv, dst_reg);
                types.assign_type(inv, dst_reg, TypeEncoding::Number);
            });
            return;
        }
        if types.get_reg_type(&dom.inv, src_reg) != TypeEncoding::Number {
            types.havoc_type(&mut dom.inv, dst_reg);
            havoc_register(&mut dom.inv, dst_reg);
            return;
        }
        let pre = dom.inv.clone();
        let dst_offset = EbpfDomain::type_offset_variable(dst_reg, types.get_reg_type(&pre, dst_reg));
        dom.inv.sub_overflow(dst.svalue, dst.uvalue, &src_svalue, width);
        if let Some(dst_offset) = dst_offset {
            dom.inv.sub(dst_offset, src.svalue);
            if types.reg_has_type(&pre, dst_reg, TypeEncoding::Stack) {
                if pre.intersect(&gt(src.svalue, 0i64)) {
                    dom.inv.havoc(dst.stack_numeric_size);
                    self.recompute_stack_numeric_size(&mut dom.inv, &dom.stack, dst.type_);
                } else {
                    dom.inv.add(dst.stack_numeric_size, src.svalue);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{Assume, Deref, IncrementLoopCounter, LoadMapFd};
    use crate::label::Label;
    use crate::platform::MapDescriptor;

    fn mov_imm(dst: u8, imm: i64) -> Instruction {
        Instruction::Bin(Bin {
            op: BinOp::Mov,
            dst: Reg(dst),
            v: Value::Imm(Imm(imm as u64)),
            is64: true,
            lddw: false,
        })
    }

    fn bin_reg(op: BinOp, dst: u8, src: u8) -> Instruction {
        Instruction::Bin(Bin {
            op,
            dst: Reg(dst),
            v: Value::Reg(Reg(src)),
            is64: true,
            lddw: false,
        })
    }

    fn stack_access(value: Value, width: i32, offset: i32, is_load: bool) -> Instruction {
        Instruction::Mem(Mem {
            access: Deref {
                width,
                basereg: Reg::R10_STACK_POINTER,
                offset,
            },
            value,
            is_load,
        })
    }

    fn run(ctx: &AnalysisContext, program: &[Instruction]) -> EbpfDomain {
        let mut dom = EbpfDomain::setup_entry(ctx);
        for ins in program {
            transform(ctx, &mut dom, ins);
        }
        dom
    }

    #[test]
    fn test_mov_imm_is_number() {
        let ctx = AnalysisContext::default();
        let dom = run(&ctx, &[mov_imm(0, 7)]);
        let r0 = reg_pack(Reg(0));
        assert_eq!(dom.inv.interval(r0.svalue), Interval::singleton(7));
        assert_eq!(dom.inv.interval(r0.uvalue), Interval::singleton(7));
        assert!(TypeDomain::new(ctx.vars()).is_in_group(&dom.inv, Reg(0), crate::type_encoding::TypeGroup::Number));
    }

    #[test]
    fn test_mov_reg_copies_pointer() {
        let ctx = AnalysisContext::default();
        let dom = run(&ctx, &[bin_reg(BinOp::Mov, 2, 10), Instruction::Bin(Bin {
            op: BinOp::Add,
            dst: Reg(2),
            v: Value::Imm(Imm((-8i64) as u64)),
            is64: true,
            lddw: false,
        })]);
        let r2 = reg_pack(Reg(2));
        assert_eq!(dom.inv.interval(r2.stack_offset), Interval::singleton(4088));
        assert_eq!(TypeDomain::new(ctx.vars()).get_reg_type(&dom.inv, Reg(2)), TypeEncoding::Stack);
    }

    #[test_log::test]
    fn test_stack_store_then_load() {
        let ctx = AnalysisContext::default();
        let dom = run(
            &ctx,
            &[
                mov_imm(1, 42),
                stack_access(Value::Reg(Reg(1)), 8, -8, false),
                stack_access(Value::Reg(Reg(3)), 8, -8, true),
            ],
        );
        let r3 = reg_pack(Reg(3));
        assert_eq!(dom.inv.interval(r3.svalue), Interval::singleton(42));
        assert_eq!(TypeDomain::new(ctx.vars()).get_reg_type(&dom.inv, Reg(3)), TypeEncoding::Number);
        assert!(dom.stack.all_num(
            &dom.inv,
            &LinearExpression::constant(4088i64),
            &LinearExpression::constant(4096i64)
        ));
    }

    #[test]
    fn test_store_pointer_keeps_offset() {
        let ctx = AnalysisContext::default();
        let dom = run(
            &ctx,
            &[
                stack_access(Value::Reg(Reg(1)), 8, -16, false),
                stack_access(Value::Reg(Reg(4)), 8, -16, true),
            ],
        );
        let r4 = reg_pack(Reg(4));
        assert_eq!(TypeDomain::new(ctx.vars()).get_reg_type(&dom.inv, Reg(4)), TypeEncoding::Ctx);
        assert_eq!(dom.inv.interval(r4.ctx_offset), Interval::singleton(0));
    }

    #[test]
    fn test_context_load_gives_packet_pointer() {
        let ctx = AnalysisContext::default();
        let load = |dst: u8, offset: i32| {
            Instruction::Mem(Mem {
                access: Deref {
                    width: 4,
                    basereg: Reg(1),
                    offset,
                },
                value: Value::Reg(Reg(dst)),
                is_load: true,
            })
        };
        let dom = run(&ctx, &[load(2, 76), load(3, 80), load(4, 0)]);
        let types = TypeDomain::new(ctx.vars());
        assert_eq!(types.get_reg_type(&dom.inv, Reg(2)), TypeEncoding::Packet);
        assert_eq!(dom.inv.interval(reg_pack(Reg(2)).packet_offset), Interval::singleton(0));
        assert!(dom
            .inv
            .entail(&eq(reg_pack(Reg(3)).packet_offset, Variable::packet_size())));
        assert_eq!(types.get_reg_type(&dom.inv, Reg(4)), TypeEncoding::Number);
    }

    #[test]
    fn test_assume_refines_and_prunes() {
        let ctx = AnalysisContext::default();
        let mut dom = run(&ctx, &[mov_imm(0, 3)]);
        let assume = |op, imm: u64| {
            Instruction::Assume(Assume {
                cond: Condition {
                    op,
                    left: Reg(0),
                    right: Value::Imm(Imm(imm)),
                    is64: true,
                },
                is_implicit: false,
            })
        };
        let mut taken = dom.clone();
        transform(&ctx, &mut taken, &assume(CondOp::Gt, 2));
        assert!(!taken.is_bottom());
        transform(&ctx, &mut dom, &assume(CondOp::Gt, 5));
        assert!(dom.is_bottom());
    }

    #[test]
    fn test_32bit_alu_truncates() {
        let ctx = AnalysisContext::default();
        let dom = run(
            &ctx,
            &[
                mov_imm(0, -1),
                Instruction::Bin(Bin {
                    op: BinOp::Add,
                    dst: Reg(0),
                    v: Value::Imm(Imm(2)),
                    is64: false,
                    lddw: false,
                }),
            ],
        );
        assert_eq!(dom.inv.interval(reg_pack(Reg(0)).uvalue), Interval::singleton(1));
    }

    #[test]
    fn test_byte_swap() {
        let ctx = AnalysisContext::default();
        let dom = run(
            &ctx,
            &[
                mov_imm(0, 0x1234),
                Instruction::Un(Un {
                    op: UnOp::Be16,
                    dst: Reg(0),
                    is64: true,
                }),
            ],
        );
        assert_eq!(dom.inv.interval(reg_pack(Reg(0)).uvalue), Interval::singleton(0x3412));
    }

    #[test]
    fn test_map_lookup_returns_nullable_shared() {
        let mut ctx = AnalysisContext::default();
        ctx.program_info.maps.push(MapDescriptor {
            original_fd: 1,
            map_type: 1,
            key_size: 4,
            value_size: 8,
            max_entries: 16,
            inner_map_fd: None,
            value_type: MapValueType::Any,
            is_array: true,
        });
        let mut lookup = Call::new(1, "map_lookup_elem");
        lookup.is_map_lookup = true;
        lookup.singles = vec![
            crate::instruction::ArgSingle {
                kind: ArgSingleKind::MapFd,
                reg: Reg(1),
            },
            crate::instruction::ArgSingle {
                kind: ArgSingleKind::PtrToMapKey,
                reg: Reg(2),
            },
        ];
        let dom = run(
            &ctx,
            &[
                Instruction::LoadMapFd(LoadMapFd { dst: Reg(1), mapfd: 1 }),
                Instruction::Call(lookup),
            ],
        );
        let r0 = reg_pack(Reg(0));
        let types = TypeDomain::new(ctx.vars());
        assert_eq!(types.get_reg_type(&dom.inv, Reg(0)), TypeEncoding::Shared);
        assert_eq!(dom.inv.interval(r0.shared_region_size), Interval::singleton(8));
        assert!(dom.inv.interval(r0.svalue).contains(&Number::zero()));
        assert_eq!(types.get_reg_type(&dom.inv, Reg(1)), TypeEncoding::Uninit);
    }

    #[test]
    fn test_subprogram_frame() {
        let ctx = AnalysisContext::default();
        let prefix = "5";
        let dom = run(
            &ctx,
            &[
                mov_imm(6, 11),
                Instruction::CallLocal(crate::instruction::CallLocal {
                    target: Label::new(5),
                    stack_frame_prefix: prefix.to_string(),
                }),
                mov_imm(6, 99),
            ],
        );
        let r10 = reg_pack(Reg::R10_STACK_POINTER);
        assert_eq!(dom.inv.interval(r10.stack_offset), Interval::singleton(4096 - 512));
        let mut after = dom.clone();
        transform(
            &ctx,
            &mut after,
            &Instruction::Exit(Exit {
                stack_frame_prefix: prefix.to_string(),
            }),
        );
        assert_eq!(after.inv.interval(r10.stack_offset), Interval::singleton(4096));
        assert_eq!(after.inv.interval(reg_pack(Reg(6)).svalue), Interval::singleton(11));
    }

    #[test]
    fn test_loop_counter_increments() {
        let ctx = AnalysisContext::default();
        let head = Label::new(3);
        let mut dom = EbpfDomain::setup_entry(&ctx);
        dom.initialize_loop_counter(&ctx, &head);
        let inc = Instruction::IncrementLoopCounter(IncrementLoopCounter { name: head.clone() });
        transform(&ctx, &mut dom, &inc);
        transform(&ctx, &mut dom, &inc);
        let counter = ctx.vars().loop_counter(&head.to_string());
        assert_eq!(dom.inv.interval(counter), Interval::singleton(2));
    }

    #[test]
    fn test_pointer_difference_is_number() {
        let ctx = AnalysisContext::default();
        let dom = run(
            &ctx,
            &[
                bin_reg(BinOp::Mov, 2, 10),
                Instruction::Bin(Bin {
                    op: BinOp::Sub,
                    dst: Reg(2),
                    v: Value::Imm(Imm(16)),
                    is64: true,
                    lddw: false,
                }),
                bin_reg(BinOp::Mov, 3, 10),
                bin_reg(BinOp::Sub, 3, 2),
            ],
        );
        assert_eq!(TypeDomain::new(ctx.vars()).get_reg_type(&dom.inv, Reg(3)), TypeEncoding::Number);
        assert_eq!(dom.inv.interval(reg_pack(Reg(3)).svalue), Interval::singleton(16));
    }
}
