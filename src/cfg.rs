//! Control-flow graphs.
//!
//! [`Program::from_sequence`] validates a decoded instruction sequence and
//! turns it into a graph of single-instruction nodes:
//!
//! - a conditional jump gets one synthetic node per outcome holding the
//!   [`Assume`] of the condition or its negation;
//! - every call to a subprogram inlines a copy of the callee whose labels
//!   carry the call-stack-frame prefix of the call site;
//! - with termination checking on, a loop-counter node follows every loop
//!   head of the weak topological ordering.

use std::collections::{BTreeMap, BTreeSet};

use crate::assertion::{get_assertions, Assertion};
use crate::context::VerifierOptions;
use crate::error::{Result, VerifierError};
use crate::instruction::{Assume, IncrementLoopCounter, Instruction, Reg};
use crate::label::Label;
use crate::platform::{MapValueType, ProgramInfo, MAX_CALL_STACK_FRAMES};
use crate::wto::Wto;

/// One decoded instruction and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledInstruction {
    pub label: Label,
    pub instruction: Instruction,
    /// Source line the instruction was compiled from, if known.
    pub line_info: Option<String>,
}

impl LabeledInstruction {
    pub fn new(label: Label, instruction: Instruction) -> Self {
        LabeledInstruction {
            label,
            instruction,
            line_info: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Adjacent {
    parents: BTreeSet<Label>,
    children: BTreeSet<Label>,
}

/// A directed graph over labels with distinguished entry and exit nodes.
#[derive(Debug, Clone, Default)]
pub struct Cfg {
    nodes: BTreeMap<Label, Adjacent>,
}

impl Cfg {
    /// A graph holding only the entry and exit nodes.
    pub fn new() -> Self {
        let mut cfg = Cfg::default();
        cfg.insert(&Label::entry());
        cfg.insert(&Label::exit());
        cfg
    }

    pub fn entry_label(&self) -> Label {
        Label::entry()
    }

    pub fn exit_label(&self) -> Label {
        Label::exit()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, label: &Label) -> bool {
        self.nodes.contains_key(label)
    }

    pub fn labels(&self) -> impl DoubleEndedIterator<Item = &Label> {
        self.nodes.keys()
    }

    pub fn children(&self, label: &Label) -> impl DoubleEndedIterator<Item = &Label> {
        self.nodes.get(label).into_iter().flat_map(|a| a.children.iter())
    }

    pub fn parents(&self, label: &Label) -> impl DoubleEndedIterator<Item = &Label> {
        self.nodes.get(label).into_iter().flat_map(|a| a.parents.iter())
    }

    pub fn insert(&mut self, label: &Label) {
        self.nodes.entry(label.clone()).or_default();
    }

    pub fn add_edge(&mut self, from: &Label, to: &Label) {
        assert!(*to != Label::entry(), "Bug! edge into the entry node");
        assert!(*from != Label::exit(), "Bug! edge out of the exit node");
        self.nodes.entry(from.clone()).or_default().children.insert(to.clone());
        self.nodes.entry(to.clone()).or_default().parents.insert(from.clone());
    }

    /// Puts `new` between `prev` and all of its children.
    pub fn insert_after(&mut self, prev: &Label, new: &Label) {
        assert!(prev != new, "Bug! cannot insert {} after itself", new);
        self.insert(new);
        let children = self
            .nodes
            .get_mut(prev)
            .map(|a| std::mem::take(&mut a.children))
            .unwrap_or_default();
        for child in &children {
            if let Some(a) = self.nodes.get_mut(child) {
                a.parents.remove(prev);
            }
        }
        self.add_edge(prev, new);
        for child in &children {
            self.add_edge(new, child);
        }
    }
}

/// A validated program: its graph, the instruction at every node and the
/// preconditions of each instruction.
#[derive(Debug, Clone)]
pub struct Program {
    cfg: Cfg,
    instructions: BTreeMap<Label, Instruction>,
    assertions: BTreeMap<Label, Vec<Assertion>>,
    line_info: BTreeMap<i32, String>,
}

impl Program {
    /// Builds the program of `seq`.
    ///
    /// # Errors
    ///
    /// If the sequence is structurally malformed; see [`VerifierError`].
    pub fn from_sequence(seq: &[LabeledInstruction], info: &ProgramInfo, options: &VerifierOptions) -> Result<Program> {
        if seq.is_empty() {
            return Err(VerifierError::EmptyProgram);
        }
        let index: BTreeMap<i32, usize> = seq.iter().enumerate().map(|(i, li)| (li.label.from, i)).collect();
        for li in seq {
            validate(li, &index, info)?;
        }

        let mut builder = Builder {
            seq,
            index,
            cfg: Cfg::new(),
            instructions: BTreeMap::new(),
        };
        builder.instructions.insert(Label::entry(), Instruction::nop());
        builder.instructions.insert(Label::exit(), Instruction::nop());
        let first = Label::new(seq[0].label.from);
        builder.cfg.add_edge(&Label::entry(), &first);
        builder.add_nodes(0, "", &mut Vec::new())?;

        if options.check_termination {
            builder.add_loop_counters();
        }
        let Builder { cfg, instructions, .. } = builder;

        let assertions = instructions
            .iter()
            .map(|(label, ins)| (label.clone(), get_assertions(ins, info, options)))
            .collect();
        let line_info = seq
            .iter()
            .filter_map(|li| li.line_info.clone().map(|line| (li.label.from, line)))
            .collect();
        log::debug!("Built a control-flow graph with {} nodes", cfg.len());
        Ok(Program {
            cfg,
            instructions,
            assertions,
            line_info,
        })
    }

    /// Builds the program of `instructions`, labelled by their index.
    pub fn from_instructions(
        instructions: &[Instruction],
        info: &ProgramInfo,
        options: &VerifierOptions,
    ) -> Result<Program> {
        let seq: Vec<LabeledInstruction> = instructions
            .iter()
            .enumerate()
            .map(|(i, ins)| LabeledInstruction::new(Label::new(i as i32), ins.clone()))
            .collect();
        Program::from_sequence(&seq, info, options)
    }

    pub fn cfg(&self) -> &Cfg {
        &self.cfg
    }

    pub fn labels(&self) -> impl Iterator<Item = &Label> {
        self.instructions.keys()
    }

    pub fn instruction_at(&self, label: &Label) -> &Instruction {
        match self.instructions.get(label) {
            Some(ins) => ins,
            None => panic!("Bug! no instruction at {}", label),
        }
    }

    pub fn assertions_at(&self, label: &Label) -> &[Assertion] {
        self.assertions.get(label).map_or(&[], Vec::as_slice)
    }

    /// Source line of the instruction `label` was copied from.
    pub fn line_info(&self, label: &Label) -> Option<&str> {
        self.line_info.get(&label.from).map(String::as_str)
    }
}

fn validate(li: &LabeledInstruction, index: &BTreeMap<i32, usize>, info: &ProgramInfo) -> Result<()> {
    let label = &li.label;
    let ins = &li.instruction;
    for r in ins.registers() {
        if r.0 > Reg::R10_STACK_POINTER.0 {
            return Err(VerifierError::InvalidRegister {
                label: label.clone(),
                reg: r.0,
            });
        }
    }
    if ins.written_registers().contains(&Reg::R10_STACK_POINTER) {
        return Err(VerifierError::WriteToFramePointer { label: label.clone() });
    }
    let width = match ins {
        Instruction::Mem(m) => Some((m.access.width, &[1, 2, 4, 8][..])),
        Instruction::Atomic(a) => Some((a.access.width, &[4, 8][..])),
        Instruction::Packet(p) => Some((p.width, &[1, 2, 4][..])),
        _ => None,
    };
    if let Some((width, allowed)) = width {
        if !allowed.contains(&width) {
            return Err(VerifierError::InvalidWidth {
                label: label.clone(),
                width,
            });
        }
    }
    let target = |t: &Label| {
        if index.contains_key(&t.from) {
            Ok(())
        } else {
            Err(VerifierError::InvalidJumpTarget {
                label: label.clone(),
                target: t.from,
            })
        }
    };
    match ins {
        Instruction::Jmp(j) => target(&j.target)?,
        Instruction::CallLocal(c) => target(&c.target)?,
        Instruction::LoadMapFd(l) => {
            if info.map_descriptor(l.mapfd).is_none() {
                return Err(VerifierError::InvalidMapFd {
                    label: label.clone(),
                    fd: l.mapfd,
                });
            }
        }
        Instruction::LoadMapAddress(l) => match info.map_descriptor(l.mapfd) {
            None => {
                return Err(VerifierError::InvalidMapFd {
                    label: label.clone(),
                    fd: l.mapfd,
                })
            }
            Some(d) if d.value_type == MapValueType::Program => {
                return Err(VerifierError::ProgramMapAddress {
                    label: label.clone(),
                    fd: l.mapfd,
                })
            }
            Some(_) => {}
        },
        _ => {}
    }
    Ok(())
}

struct Builder<'a> {
    seq: &'a [LabeledInstruction],
    /// Instruction index by label.
    index: BTreeMap<i32, usize>,
    cfg: Cfg,
    instructions: BTreeMap<Label, Instruction>,
}

impl Builder<'_> {
    fn label_at(&self, i: usize, prefix: &str) -> Label {
        Label::with_prefix(self.seq[i].label.from, prefix)
    }

    fn index_of(&self, target: &Label) -> usize {
        match self.index.get(&target.from) {
            Some(i) => *i,
            None => panic!("Bug! unvalidated jump target {}", target),
        }
    }

    /// The label control falls through to from instruction `i`.
    fn fallthrough(&self, i: usize, prefix: &str, label: &Label) -> Result<Label> {
        if i + 1 < self.seq.len() {
            Ok(self.label_at(i + 1, prefix))
        } else {
            Err(VerifierError::FallthroughOffEnd(label.clone()))
        }
    }

    /// Adds the code reachable from instruction `entry` in frame `prefix`.
    /// Returns the labels of the `exit` instructions of a subprogram.
    ///
    /// `call_chain` holds the entry indices of the subprograms being inlined.
    fn add_nodes(&mut self, entry: usize, prefix: &str, call_chain: &mut Vec<usize>) -> Result<Vec<Label>> {
        let mut exits = Vec::new();
        let mut visited = BTreeSet::new();
        let mut worklist = vec![entry];
        while let Some(i) = worklist.pop() {
            if !visited.insert(i) {
                continue;
            }
            let label = self.label_at(i, prefix);
            let mut ins = self.seq[i].instruction.clone();
            self.cfg.insert(&label);
            match &mut ins {
                Instruction::Exit(exit) => {
                    exit.stack_frame_prefix = prefix.to_string();
                    if prefix.is_empty() {
                        self.cfg.add_edge(&label, &Label::exit());
                    } else {
                        exits.push(label.clone());
                    }
                }
                Instruction::Jmp(jmp) => {
                    let target_index = self.index_of(&jmp.target);
                    let target = self.label_at(target_index, prefix);
                    jmp.target = target.clone();
                    worklist.push(target_index);
                    match jmp.cond.clone() {
                        None => self.cfg.add_edge(&label, &target),
                        Some(cond) => {
                            let next = self.fallthrough(i, prefix, &label)?;
                            worklist.push(i + 1);
                            if next == target {
                                self.cfg.add_edge(&label, &target);
                            } else {
                                // The condition was already asserted at the jump.
                                let outcomes = [(target, cond.clone()), (next, cond.negate())];
                                for (to, cond) in outcomes {
                                    let edge = Label::jump(label.from, to.from, prefix);
                                    self.cfg.add_edge(&label, &edge);
                                    self.cfg.add_edge(&edge, &to);
                                    let assume = Instruction::Assume(Assume { cond, is_implicit: true });
                                    self.instructions.insert(edge, assume);
                                }
                            }
                        }
                    }
                }
                Instruction::CallLocal(call) => {
                    let callee = self.index_of(&call.target);
                    if call_chain.contains(&callee) {
                        return Err(VerifierError::IllegalRecursion { label });
                    }
                    let callee_prefix = label.to_string();
                    let callee_entry = self.label_at(callee, &callee_prefix);
                    if callee_entry.call_stack_depth() > MAX_CALL_STACK_FRAMES {
                        return Err(VerifierError::CallStackTooDeep { label });
                    }
                    call.stack_frame_prefix = callee_prefix.clone();
                    call.target = callee_entry.clone();

                    call_chain.push(callee);
                    let callee_exits = self.add_nodes(callee, &callee_prefix, call_chain)?;
                    call_chain.pop();

                    let ret = self.fallthrough(i, prefix, &label)?;
                    self.cfg.add_edge(&label, &callee_entry);
                    for exit in callee_exits {
                        self.cfg.add_edge(&exit, &ret);
                    }
                    worklist.push(i + 1);
                }
                Instruction::Call(call) => {
                    call.stack_frame_prefix = prefix.to_string();
                    let next = self.fallthrough(i, prefix, &label)?;
                    self.cfg.add_edge(&label, &next);
                    worklist.push(i + 1);
                }
                _ => {
                    let next = self.fallthrough(i, prefix, &label)?;
                    self.cfg.add_edge(&label, &next);
                    worklist.push(i + 1);
                }
            }
            self.instructions.insert(label, ins);
        }
        Ok(exits)
    }

    fn add_loop_counters(&mut self) {
        let wto = Wto::new(&self.cfg);
        for head in wto.loop_heads() {
            let counter = Label::increment_counter(&head);
            self.cfg.insert_after(&head, &counter);
            let inc = Instruction::IncrementLoopCounter(IncrementLoopCounter { name: head.clone() });
            self.instructions.insert(counter, inc);
            log::trace!("Loop counter for head {}", head);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{Bin, BinOp, CallLocal, CondOp, Condition, Exit, Imm, Jmp, Value};

    fn mov(dst: u8, imm: i64) -> Instruction {
        Instruction::Bin(Bin {
            op: BinOp::Mov,
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

    fn build(program: &[Instruction]) -> Result<Program> {
        Program::from_instructions(program, &ProgramInfo::default(), &VerifierOptions::default())
    }

    #[test]
    fn test_straight_line() {
        let p = build(&[mov(0, 0), exit()]).unwrap();
        let cfg = p.cfg();
        assert_eq!(cfg.children(&Label::entry()).collect::<Vec<_>>(), vec![&Label::new(0)]);
        assert_eq!(cfg.children(&Label::new(1)).collect::<Vec<_>>(), vec![&Label::exit()]);
        assert_eq!(p.assertions_at(&Label::new(1)).len(), 1);
    }

    #[test]
    fn test_branch_outcomes() {
        let jmp = Instruction::Jmp(Jmp {
            cond: Some(Condition {
                op: CondOp::Eq,
                left: Reg(1),
                right: Value::Imm(Imm(0)),
                is64: true,
            }),
            target: Label::new(3),
        });
        let p = build(&[mov(1, 1), jmp, mov(0, 1), mov(0, 0), exit()]).unwrap();
        let children: Vec<&Label> = p.cfg().children(&Label::new(1)).collect();
        assert_eq!(children, vec![&Label::jump(1, 2, ""), &Label::jump(1, 3, "")]);
        assert_eq!(p.instruction_at(&Label::jump(1, 3, "")).to_string(), "assume r1 == 0");
        assert_eq!(p.instruction_at(&Label::jump(1, 2, "")).to_string(), "assume r1 != 0");
    }

    #[test]
    fn test_malformed() {
        assert_eq!(build(&[]).unwrap_err(), VerifierError::EmptyProgram);
        assert_eq!(
            build(&[mov(0, 0)]).unwrap_err(),
            VerifierError::FallthroughOffEnd(Label::new(0))
        );
        let far = Instruction::Jmp(Jmp {
            cond: None,
            target: Label::new(9),
        });
        assert!(matches!(build(&[far, exit()]), Err(VerifierError::InvalidJumpTarget { target: 9, .. })));
        assert!(matches!(
            build(&[mov(10, 0), exit()]),
            Err(VerifierError::WriteToFramePointer { .. })
        ));
    }

    #[test]
    fn test_subprogram_is_inlined() {
        let call = Instruction::CallLocal(CallLocal {
            target: Label::new(3),
            stack_frame_prefix: String::new(),
        });
        let p = build(&[call, mov(0, 0), exit(), mov(0, 1), exit()]).unwrap();
        let entry = Label::with_prefix(3, "0");
        assert!(p.cfg().contains(&entry));
        assert_eq!(
            p.cfg().children(&Label::with_prefix(4, "0")).collect::<Vec<_>>(),
            vec![&Label::new(1)]
        );
        match p.instruction_at(&Label::with_prefix(4, "0")) {
            Instruction::Exit(e) => assert_eq!(e.stack_frame_prefix, "0"),
            other => panic!("unexpected {}", other),
        }
        // The callee's body is not part of the main frame.
        assert!(!p.cfg().contains(&Label::new(3)));
    }

    #[test]
    fn test_recursion_is_rejected() {
        let call = Instruction::CallLocal(CallLocal {
            target: Label::new(2),
            stack_frame_prefix: String::new(),
        });
        let p = build(&[call.clone(), exit(), call, exit()]);
        assert!(matches!(p, Err(VerifierError::IllegalRecursion { .. })));
    }

    #[test]
    fn test_loop_counter_follows_head() {
        let back = Instruction::Jmp(Jmp {
            cond: Some(Condition {
                op: CondOp::Lt,
                left: Reg(0),
                right: Value::Imm(Imm(10)),
                is64: true,
            }),
            target: Label::new(1),
        });
        let add = Instruction::Bin(Bin {
            op: BinOp::Add,
            dst: Reg(0),
            v: Value::Imm(Imm(1)),
            is64: true,
            lddw: false,
        });
        let options = VerifierOptions {
            check_termination: true,
            ..VerifierOptions::default()
        };
        let p = Program::from_instructions(&[mov(0, 0), add, back, exit()], &ProgramInfo::default(), &options)
            .unwrap();
        let counter = Label::increment_counter(&Label::new(1));
        assert_eq!(p.cfg().children(&Label::new(1)).collect::<Vec<_>>(), vec![&counter]);
        assert!(matches!(p.instruction_at(&counter), Instruction::IncrementLoopCounter(_)));
        assert!(matches!(p.assertions_at(&counter), [Assertion::BoundedLoopCount(_)]));
    }
}
