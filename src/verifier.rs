//! Running the analysis and collecting its verdict.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::cfg::Program;
use crate::checker;
use crate::context::AnalysisContext;
use crate::ebpf_domain::EbpfDomain;
use crate::error::Result;
use crate::fixpoint::{self, Invariants};
use crate::instruction::{Instruction, Reg};
use crate::interval::{Bound, Interval};
use crate::label::Label;
use crate::number::Number;
use crate::type_domain::reg_pack;

/// Computes the invariants of `program`, starting from the default entry
/// state. The context is reset first.
pub fn analyze(ctx: &AnalysisContext, program: &Program) -> Invariants {
    ctx.reset();
    fixpoint::run(ctx, program)
}

/// Computes the invariants of `program` starting from a state described by
/// `facts`, in the syntax of [`EbpfDomain::to_set`].
///
/// # Errors
///
/// If a fact cannot be parsed.
pub fn analyze_from(ctx: &AnalysisContext, program: &Program, facts: &[&str]) -> Result<Invariants> {
    ctx.reset();
    let mut entry = EbpfDomain::from_constraints(ctx, facts)?;
    for label in program.labels() {
        if let Instruction::IncrementLoopCounter(inc) = program.instruction_at(label) {
            entry.initialize_loop_counter(ctx, &inc.name);
        }
    }
    Ok(fixpoint::run_from(ctx, program, entry))
}

/// Analyzes `program` and checks every precondition against the computed
/// invariants.
pub fn verify(ctx: &AnalysisContext, program: &Program) -> Report {
    let invariants = analyze(ctx, program);
    let report = invariants.check_assertions(ctx, program);
    if report.verified() {
        log::info!("Program verified ({} nodes)", program.cfg().len());
    } else {
        log::info!("Program rejected with {} warnings", report.warning_count());
    }
    report
}

impl Invariants {
    /// Every failed precondition at a reachable label, and every branch
    /// outcome that turned out to be infeasible.
    pub fn check_assertions(&self, ctx: &AnalysisContext, program: &Program) -> Report {
        let mut report = Report {
            max_loop_count: self.max_loop_count(ctx),
            ..Report::default()
        };
        for (label, pre, post) in self.iter() {
            if pre.is_bottom() {
                continue;
            }
            for assertion in program.assertions_at(label) {
                let warnings = checker::check(ctx, pre, assertion);
                if !warnings.is_empty() {
                    report.warnings.entry(label.clone()).or_default().extend(warnings);
                }
            }
            if let Instruction::Assume(assume) = program.instruction_at(label) {
                if post.is_bottom() {
                    let note = format!("Code becomes unreachable (assume {})", assume.cond);
                    log::debug!("{}: {}", label, note);
                    report.reachability.entry(label.clone()).or_default().push(note);
                }
            }
        }

        let limit = Bound::from(ctx.options.max_loop_count);
        if ctx.options.check_termination && report.max_loop_count > limit {
            report
                .warnings
                .entry(Label::exit())
                .or_default()
                .push("Could not prove termination".to_string());
        }
        report.instruction_bound = instruction_bound(&report.max_loop_count, program);
        report
    }

    /// Whether every precondition holds; stops at the first failure.
    pub fn verified(&self, ctx: &AnalysisContext, program: &Program) -> bool {
        self.iter().all(|(label, pre, _)| {
            pre.is_bottom()
                || program
                    .assertions_at(label)
                    .iter()
                    .all(|a| checker::check(ctx, pre, a).is_empty())
        })
    }

    /// The greatest value any loop counter reaches.
    pub fn max_loop_count(&self, ctx: &AnalysisContext) -> Bound {
        self.iter()
            .map(|(_, _, post)| post.loop_count_upper_bound(ctx))
            .fold(Bound::Finite(Number::zero()), std::cmp::max)
    }

    /// The facts holding after `label`.
    pub fn invariant_at(&self, ctx: &AnalysisContext, label: &Label) -> BTreeSet<String> {
        self.post(label).to_set(ctx)
    }

    /// Whether the state described by `facts` is included in the state after
    /// `label`.
    ///
    /// # Errors
    ///
    /// If a fact cannot be parsed.
    pub fn is_valid_after(&self, ctx: &AnalysisContext, label: &Label, facts: &[&str]) -> Result<bool> {
        let state = EbpfDomain::from_constraints(ctx, facts)?;
        Ok(state.le(&self.post(label)))
    }

    /// The possible return values of the program.
    pub fn exit_value(&self) -> Interval {
        let post = self.post(&Label::exit());
        if post.is_bottom() {
            return Interval::bottom();
        }
        post.inv.interval(reg_pack(Reg::R0_RETURN_VALUE).svalue)
    }

    /// Every reachable node with the states around it.
    pub fn render(&self, ctx: &AnalysisContext, program: &Program) -> String {
        let mut out = String::new();
        for (label, pre, post) in self.iter() {
            out.push_str(&format!("\nPre-invariant : {}\n", pre.render(ctx)));
            if let Some(line) = program.line_info(label) {
                out.push_str(&format!("; {}\n", line));
            }
            for assertion in program.assertions_at(label) {
                out.push_str(&format!("  assert {};\n", assertion));
            }
            out.push_str(&format!("{}: {};\n", label, program.instruction_at(label)));
            out.push_str(&format!("Post-invariant: {}\n", post.render(ctx)));
        }
        out
    }
}

/// Upper bound on the instructions executed by one run of the program.
fn instruction_bound(max_loop_count: &Bound, program: &Program) -> Option<u64> {
    let Bound::Finite(n) = max_loop_count else {
        return None;
    };
    let iterations = n.to_i64().and_then(|n| u64::try_from(n).ok())?;
    let nodes = program
        .labels()
        .filter(|l| !matches!(program.instruction_at(l), Instruction::Assume(_)) && !l.is_entry() && !l.is_exit())
        .count() as u64;
    iterations.checked_add(1)?.checked_mul(nodes)
}

/// The outcome of verifying a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// Failed preconditions, by label.
    pub warnings: BTreeMap<Label, Vec<String>>,
    /// Branch outcomes that can never be taken, by label.
    pub reachability: BTreeMap<Label, Vec<String>>,
    /// The greatest value of any loop counter.
    pub max_loop_count: Bound,
    /// Worst-case number of executed instructions, if bounded.
    pub instruction_bound: Option<u64>,
}

impl Default for Report {
    fn default() -> Self {
        Report {
            warnings: BTreeMap::new(),
            reachability: BTreeMap::new(),
            max_loop_count: Bound::Finite(Number::zero()),
            instruction_bound: Some(0),
        }
    }
}

impl Report {
    /// Whether no precondition may fail.
    pub fn verified(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.values().map(Vec::len).sum()
    }

    /// Every warning as `label: message`.
    pub fn warning_set(&self) -> BTreeSet<String> {
        flatten(&self.warnings)
    }

    /// Every reachability note as `label: message`.
    pub fn reachability_set(&self) -> BTreeSet<String> {
        flatten(&self.reachability)
    }

    pub fn all_messages(&self) -> BTreeSet<String> {
        let mut all = self.warning_set();
        all.extend(self.reachability_set());
        all
    }
}

fn flatten(messages: &BTreeMap<Label, Vec<String>>) -> BTreeSet<String> {
    messages
        .iter()
        .flat_map(|(label, msgs)| msgs.iter().map(move |m| format!("{}: {}", label, m)))
        .collect()
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (label, notes) in &self.reachability {
            for note in notes {
                writeln!(f, "{}: {}", label, note)?;
            }
        }
        for (label, warnings) in &self.warnings {
            for warning in warnings {
                writeln!(f, "{}: {}", label, warning)?;
            }
        }
        if self.verified() {
            write!(f, "Verified")
        } else {
            write!(f, "Not verified: {} warnings", self.warning_count())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::VerifierOptions;
    use crate::instruction::{Bin, BinOp, CondOp, Condition, Exit, Imm, Jmp, Value};
    use crate::platform::ProgramInfo;

    fn mov(dst: u8, v: Value) -> Instruction {
        Instruction::Bin(Bin {
            op: BinOp::Mov,
            dst: Reg(dst),
            v,
            is64: true,
            lddw: false,
        })
    }

    fn exit() -> Instruction {
        Instruction::Exit(Exit {
            stack_frame_prefix: String::new(),
        })
    }

    fn check(program: &[Instruction]) -> Report {
        let ctx = AnalysisContext::default();
        let program = Program::from_instructions(program, &ctx.program_info, &ctx.options).unwrap();
        verify(&ctx, &program)
    }

    #[test_log::test]
    fn test_return_zero() {
        let report = check(&[mov(0, Value::Imm(Imm(0))), exit()]);
        assert!(report.verified(), "{}", report);
        assert_eq!(report.max_loop_count, Bound::Finite(Number::zero()));
    }

    #[test]
    fn test_returning_pointer_is_rejected() {
        let report = check(&[mov(0, Value::Reg(Reg(1))), exit()]);
        assert!(!report.verified());
        assert!(report.warnings.contains_key(&Label::new(1)));
    }

    #[test]
    fn test_infeasible_branch_note() {
        let jmp = Instruction::Jmp(Jmp {
            cond: Some(Condition {
                op: CondOp::Eq,
                left: Reg(0),
                right: Value::Imm(Imm(0)),
                is64: true,
            }),
            target: Label::new(3),
        });
        let report = check(&[mov(0, Value::Imm(Imm(0))), jmp, mov(0, Value::Imm(Imm(1))), exit()]);
        assert!(report.verified(), "{}", report);
        assert_eq!(
            report.reachability_set(),
            BTreeSet::from(["1:2: Code becomes unreachable (assume r0 != 0)".to_string()])
        );
    }

    #[test]
    fn test_exit_value() {
        let ctx = AnalysisContext::new(ProgramInfo::default(), VerifierOptions::default());
        let program =
            Program::from_instructions(&[mov(0, Value::Imm(Imm(3))), exit()], &ctx.program_info, &ctx.options)
                .unwrap();
        let inv = analyze(&ctx, &program);
        assert_eq!(inv.exit_value(), Interval::singleton(3));
        assert!(inv.invariant_at(&ctx, &Label::new(0)).contains("r0.svalue=3"));
        assert!(inv.verified(&ctx, &program));
    }

    #[test]
    fn test_analysis_from_facts() {
        let ctx = AnalysisContext::default();
        let program = Program::from_instructions(&[exit()], &ctx.program_info, &ctx.options).unwrap();
        let inv = analyze_from(&ctx, &program, &["r0.type=number", "r0.svalue=[0, 5]"]).unwrap();
        assert_eq!(inv.exit_value(), Interval::new(0, 5));
        assert!(inv.is_valid_after(&ctx, &Label::exit(), &["r0.type=number", "r0.svalue=2"]).unwrap());
        assert!(analyze_from(&ctx, &program, &["garbage"]).is_err());
    }
}
