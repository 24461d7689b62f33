//! Forward fixpoint iteration.
//!
//! Components of the weak topological ordering are visited in order. A cycle
//! is iterated from its head until the state flowing back into the head is
//! included in the state it started from: joins for the first
//! `widening_delay` rounds, widening afterwards. A bounded descending
//! sequence then recovers some of the precision lost to widening.

use std::collections::BTreeMap;

use crate::cfg::Program;
use crate::checker;
use crate::context::AnalysisContext;
use crate::ebpf_domain::EbpfDomain;
use crate::instruction::Instruction;
use crate::label::Label;
use crate::transformer;
use crate::wto::{Wto, WtoComponent, WtoCycle};

/// The states before and after every node.
#[derive(Debug, Clone, Default)]
pub struct Invariants {
    pre: BTreeMap<Label, EbpfDomain>,
    post: BTreeMap<Label, EbpfDomain>,
}

impl Invariants {
    /// The state before `label`; bottom for nodes that were never reached.
    pub fn pre(&self, label: &Label) -> EbpfDomain {
        self.pre.get(label).cloned().unwrap_or_else(EbpfDomain::bottom)
    }

    /// The state after `label`; bottom for nodes that were never reached.
    pub fn post(&self, label: &Label) -> EbpfDomain {
        self.post.get(label).cloned().unwrap_or_else(EbpfDomain::bottom)
    }

    /// Every reached label with its pre and post states.
    pub fn iter(&self) -> impl Iterator<Item = (&Label, &EbpfDomain, EbpfDomain)> {
        self.pre.iter().map(|(label, pre)| (label, pre, self.post(label)))
    }
}

/// The state at the program entry, with every loop counter at zero.
pub fn entry_state(ctx: &AnalysisContext, program: &Program) -> EbpfDomain {
    let mut state = EbpfDomain::setup_entry(ctx);
    for label in program.labels() {
        if let Instruction::IncrementLoopCounter(inc) = program.instruction_at(label) {
            state.initialize_loop_counter(ctx, &inc.name);
        }
    }
    state
}

/// Computes the invariants of `program`.
pub fn run(ctx: &AnalysisContext, program: &Program) -> Invariants {
    run_from(ctx, program, entry_state(ctx, program))
}

/// Computes the invariants of `program` when it starts in `entry`.
pub fn run_from(ctx: &AnalysisContext, program: &Program, entry: EbpfDomain) -> Invariants {
    let wto = Wto::new(program.cfg());
    log::trace!("wto: {}", wto);
    let mut iterator = FixpointIterator {
        ctx,
        program,
        wto: &wto,
        inv: Invariants::default(),
        visits: 0,
    };
    iterator.inv.pre.insert(program.cfg().entry_label(), entry);
    for component in wto.components() {
        iterator.visit(component);
    }
    log::debug!("Analysis converged after {} node visits", iterator.visits);
    iterator.inv
}

struct FixpointIterator<'a> {
    ctx: &'a AnalysisContext,
    program: &'a Program,
    wto: &'a Wto,
    inv: Invariants,
    visits: usize,
}

impl FixpointIterator<'_> {
    fn visit(&mut self, component: &WtoComponent) {
        match component {
            WtoComponent::Vertex(label) => self.visit_vertex(label),
            WtoComponent::Cycle(cycle) => self.visit_cycle(cycle),
        }
    }

    fn visit_vertex(&mut self, label: &Label) {
        let pre = if *label == self.program.cfg().entry_label() {
            self.inv.pre(label)
        } else {
            self.join_all_prevs(label)
        };
        self.transform_to_post(label, pre);
    }

    fn visit_cycle(&mut self, cycle: &WtoCycle) {
        let head = &cycle.head;
        let ctx = self.ctx;

        // Only edges from outside the cycle contribute to the first round.
        let mut pre = EbpfDomain::bottom();
        for prev in self.program.cfg().parents(head) {
            if !self.wto.in_cycle(prev, head) {
                pre = pre.join(ctx, &self.inv.post(prev));
            }
        }

        let mut iteration = 1;
        loop {
            self.transform_to_post(head, pre.clone());
            for c in &cycle.components {
                self.visit(c);
            }
            let new_pre = self.join_all_prevs(head);
            if new_pre.le(&pre) {
                self.inv.pre.insert(head.clone(), new_pre.clone());
                pre = new_pre;
                break;
            }
            pre = if iteration <= ctx.options.widening_delay {
                pre.join(ctx, &new_pre)
            } else {
                pre.widen(&new_pre)
            };
            iteration += 1;
        }
        log::trace!("Cycle at {} stabilized after {} iterations", head, iteration);

        for iteration in 1..=ctx.options.descending_iterations {
            self.transform_to_post(head, pre.clone());
            for c in &cycle.components {
                self.visit(c);
            }
            let new_pre = self.join_all_prevs(head);
            if pre.le(&new_pre) {
                break;
            }
            pre = if iteration == 1 {
                pre.meet(&new_pre)
            } else {
                pre.narrow(&new_pre)
            };
            self.inv.pre.insert(head.clone(), pre.clone());
        }
    }

    fn join_all_prevs(&self, label: &Label) -> EbpfDomain {
        let mut res = EbpfDomain::bottom();
        for prev in self.program.cfg().parents(label) {
            res = res.join(self.ctx, &self.inv.post(prev));
        }
        res
    }

    fn transform_to_post(&mut self, label: &Label, mut state: EbpfDomain) {
        self.visits += 1;
        self.inv.pre.insert(label.clone(), state.clone());
        if self.ctx.options.assume_assertions {
            for assertion in self.program.assertions_at(label) {
                checker::assume(self.ctx, &mut state, assertion);
            }
        }
        transformer::transform(self.ctx, &mut state, self.program.instruction_at(label));
        self.inv.post.insert(label.clone(), state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::VerifierOptions;
    use crate::instruction::{Bin, BinOp, CondOp, Condition, Exit, Imm, Jmp, Reg, Value};
    use crate::interval::Interval;
    use crate::platform::ProgramInfo;
    use crate::type_domain::reg_pack;

    fn bin(op: BinOp, dst: u8, imm: i64) -> Instruction {
        Instruction::Bin(Bin {
            op,
            dst: Reg(dst),
            v: Value::Imm(Imm(imm as u64)),
            is64: true,
            lddw: false,
        })
    }

    fn exit() -> Instruction {
        Instruction::Exit(Exit {
            stack_frame_prefix: String::new(),
        })
    }

    fn counting_loop(limit: i64) -> Vec<Instruction> {
        vec![
            bin(BinOp::Mov, 0, 0),
            bin(BinOp::Add, 0, 1),
            Instruction::Jmp(Jmp {
                cond: Some(Condition {
                    op: CondOp::Lt,
                    left: Reg(0),
                    right: Value::Imm(Imm(limit as u64)),
                    is64: true,
                }),
                target: Label::new(1),
            }),
            exit(),
        ]
    }

    #[test_log::test]
    fn test_loop_exit_state() {
        let ctx = AnalysisContext::new(ProgramInfo::default(), VerifierOptions::default());
        let program = Program::from_instructions(&counting_loop(10), &ctx.program_info, &ctx.options).unwrap();
        let inv = run(&ctx, &program);
        let at_exit = inv.pre(&Label::new(3));
        assert_eq!(at_exit.inv.interval(reg_pack(Reg(0)).uvalue), Interval::singleton(10));
    }

    #[test]
    fn test_loop_head_is_widened_then_narrowed() {
        let ctx = AnalysisContext::new(ProgramInfo::default(), VerifierOptions::default());
        let program = Program::from_instructions(&counting_loop(10), &ctx.program_info, &ctx.options).unwrap();
        let inv = run(&ctx, &program);
        let head = inv.pre(&Label::new(1));
        assert_eq!(head.inv.interval(reg_pack(Reg(0)).uvalue), Interval::new(0, 9));
    }

    #[test]
    fn test_unreached_is_bottom() {
        let ctx = AnalysisContext::new(ProgramInfo::default(), VerifierOptions::default());
        let program = Program::from_instructions(&[bin(BinOp::Mov, 0, 0), exit()], &ctx.program_info, &ctx.options)
            .unwrap();
        let inv = run(&ctx, &program);
        assert!(!inv.pre(&Label::exit()).is_bottom());
        assert!(inv.pre(&Label::new(7)).is_bottom());
    }

    #[test]
    fn test_entry_initializes_loop_counters() {
        let options = VerifierOptions {
            check_termination: true,
            ..VerifierOptions::default()
        };
        let ctx = AnalysisContext::new(ProgramInfo::default(), options);
        let program = Program::from_instructions(&counting_loop(10), &ctx.program_info, &ctx.options).unwrap();
        let entry = entry_state(&ctx, &program);
        assert_eq!(ctx.vars().loop_counters().len(), 1);
        assert_eq!(entry.loop_count_upper_bound(&ctx).to_string(), "0");
    }
}
