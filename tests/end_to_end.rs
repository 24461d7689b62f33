use ebpf_absint::cfg::Program;
use ebpf_absint::context::{AnalysisContext, VerifierOptions};
use ebpf_absint::error::VerifierError;
use ebpf_absint::instruction::*;
use ebpf_absint::interval::{Bound, Interval};
use ebpf_absint::label::Label;
use ebpf_absint::platform::ProgramInfo;
use ebpf_absint::verifier::{analyze, verify, Report};

fn mov_imm(dst: u8, imm: i64) -> Instruction {
    Instruction::Bin(Bin {
        op: BinOp::Mov,
        dst: Reg(dst),
        v: Value::Imm(Imm(imm as u64)),
        is64: true,
        lddw: false,
    })
}

fn mov_reg(dst: u8, src: u8) -> Instruction {
    Instruction::Bin(Bin {
        op: BinOp::Mov,
        dst: Reg(dst),
        v: Value::Reg(Reg(src)),
        is64: true,
        lddw: false,
    })
}

fn add_imm(dst: u8, imm: i64) -> Instruction {
    Instruction::Bin(Bin {
        op: BinOp::Add,
        dst: Reg(dst),
        v: Value::Imm(Imm(imm as u64)),
        is64: true,
        lddw: false,
    })
}

fn store(width: i32, base: u8, offset: i32, value: Value) -> Instruction {
    Instruction::Mem(Mem {
        access: Deref {
            width,
            basereg: Reg(base),
            offset,
        },
        value,
        is_load: false,
    })
}

fn load(dst: u8, width: i32, base: u8, offset: i32) -> Instruction {
    Instruction::Mem(Mem {
        access: Deref {
            width,
            basereg: Reg(base),
            offset,
        },
        value: Value::Reg(Reg(dst)),
        is_load: true,
    })
}

fn jump(cond: Option<Condition>, target: i32) -> Instruction {
    Instruction::Jmp(Jmp {
        cond,
        target: Label::new(target),
    })
}

fn exit() -> Instruction {
    Instruction::Exit(Exit {
        stack_frame_prefix: String::new(),
    })
}

fn run(program: &[Instruction], options: VerifierOptions) -> Report {
    let ctx = AnalysisContext::new(ProgramInfo::default(), options);
    let program = Program::from_instructions(program, &ctx.program_info, &ctx.options).unwrap();
    verify(&ctx, &program)
}

#[test_log::test]
fn test_return_zero_verifies() {
    let ctx = AnalysisContext::default();
    let program = Program::from_instructions(&[mov_imm(0, 0), exit()], &ctx.program_info, &ctx.options).unwrap();
    let invariants = analyze(&ctx, &program);
    let report = invariants.check_assertions(&ctx, &program);
    assert!(report.verified(), "{}", report);
    assert_eq!(report.warning_count(), 0);
    let at_exit = invariants.invariant_at(&ctx, &Label::exit());
    assert!(at_exit.contains("r0.type=number"), "{:?}", at_exit);
    assert_eq!(invariants.exit_value(), Interval::singleton(0));
}

#[test]
fn test_returning_context_pointer_is_rejected() {
    let report = run(&[mov_reg(0, 1), exit()], VerifierOptions::default());
    assert!(!report.verified());
    assert_eq!(
        report.warning_set().into_iter().collect::<Vec<_>>(),
        vec!["1: Invalid type (r0.type == number)".to_string()]
    );
}

#[test]
fn test_stack_round_trip() {
    let program = [
        mov_imm(1, 42),
        store(8, 10, -8, Value::Reg(Reg(1))),
        load(0, 8, 10, -8),
        exit(),
    ];
    let ctx = AnalysisContext::default();
    let program = Program::from_instructions(&program, &ctx.program_info, &ctx.options).unwrap();
    let invariants = analyze(&ctx, &program);
    assert!(invariants.check_assertions(&ctx, &program).verified());
    let after_load = invariants.invariant_at(&ctx, &Label::new(2));
    assert!(after_load.contains("r0.svalue=42"), "{:?}", after_load);
    assert!(after_load.contains("s[4088...4095].type=number"), "{:?}", after_load);
}

#[test]
fn test_reading_uninitialized_stack_is_rejected() {
    let report = run(&[load(0, 8, 10, -8), exit()], VerifierOptions::default());
    assert!(report
        .warning_set()
        .contains("0: Stack content is not numeric (valid_access(r10.offset-8, width=8) for read)"));
}

#[test]
fn test_access_above_frame_pointer_is_rejected() {
    let report = run(&[store(4, 10, 4, Value::Imm(Imm(0))), mov_imm(0, 0), exit()], VerifierOptions::default());
    assert!(!report.verified());
    let warnings = &report.warnings[&Label::new(0)];
    assert!(warnings
        .iter()
        .any(|w| w.starts_with("Upper bound must be at most EBPF_TOTAL_STACK_SIZE")));
}

fn termination_options() -> VerifierOptions {
    VerifierOptions {
        check_termination: true,
        ..VerifierOptions::default()
    }
}

#[test_log::test]
fn test_bounded_loop_terminates() {
    let guard = Condition {
        op: CondOp::Lt,
        left: Reg(0),
        right: Value::Imm(Imm(10)),
        is64: true,
    };
    let program = [mov_imm(0, 0), add_imm(0, 1), jump(Some(guard), 1), exit()];
    let report = run(&program, termination_options());
    assert!(report.verified(), "{}", report);
    assert!(report.max_loop_count <= Bound::from(10));
    assert!(report.instruction_bound.is_some());
}

#[test]
fn test_unguarded_loop_does_not_terminate() {
    let program = [mov_imm(0, 0), add_imm(0, 1), jump(None, 1)];
    let report = run(&program, termination_options());
    assert!(!report.verified());
    assert!(report.warning_set().contains("exit: Could not prove termination"));
    assert_eq!(report.max_loop_count, Bound::PlusInfinity);
    assert_eq!(report.instruction_bound, None);
}

#[test]
fn test_loops_are_accepted_without_termination_check() {
    let program = [mov_imm(0, 0), add_imm(0, 1), jump(None, 1)];
    let report = run(&program, VerifierOptions::default());
    assert!(report.verified(), "{}", report);
}

#[test]
fn test_malformed_programs_fail_before_analysis() {
    let ctx = AnalysisContext::default();
    let build = |p: &[Instruction]| Program::from_instructions(p, &ctx.program_info, &ctx.options);
    assert!(matches!(build(&[mov_imm(0, 0)]), Err(VerifierError::FallthroughOffEnd(_))));
    assert!(matches!(
        build(&[jump(None, 5), exit()]),
        Err(VerifierError::InvalidJumpTarget { target: 5, .. })
    ));
    assert!(matches!(
        build(&[store(3, 10, -8, Value::Imm(Imm(0))), exit()]),
        Err(VerifierError::InvalidWidth { width: 3, .. })
    ));
}

#[test]
fn test_independent_analyses_on_threads() {
    let handles: Vec<_> = (0..4)
        .map(|i| {
            std::thread::spawn(move || {
                let program = [mov_imm(0, i), exit()];
                let ctx = AnalysisContext::default();
                let program = Program::from_instructions(&program, &ctx.program_info, &ctx.options).unwrap();
                analyze(&ctx, &program).exit_value()
            })
        })
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap(), Interval::singleton(i as i64));
    }
}

#[test]
fn test_context_reset_between_runs() {
    let ctx = AnalysisContext::default();
    let first = Program::from_instructions(&[mov_imm(0, 1), exit()], &ctx.program_info, &ctx.options).unwrap();
    let second = Program::from_instructions(&[mov_imm(0, 2), exit()], &ctx.program_info, &ctx.options).unwrap();
    let a = analyze(&ctx, &first).invariant_at(&ctx, &Label::exit());
    let b = analyze(&ctx, &second).invariant_at(&ctx, &Label::exit());
    let again = analyze(&ctx, &first).invariant_at(&ctx, &Label::exit());
    assert_ne!(a, b);
    assert_eq!(a, again);
}
