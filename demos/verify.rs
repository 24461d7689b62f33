use clap::{Parser, ValueEnum};

use ebpf_absint::cfg::Program;
use ebpf_absint::context::{AnalysisContext, VerifierOptions};
use ebpf_absint::instruction::*;
use ebpf_absint::label::Label;
use ebpf_absint::platform::ProgramInfo;
use ebpf_absint::verifier::analyze;

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Sample {
    /// r0 = 0; exit
    ReturnZero,
    /// Returns the context pointer.
    LeakPointer,
    /// Stores a number on the stack and reads it back.
    StackRoundTrip,
    /// Writes above the frame pointer.
    OutOfBounds,
    /// Counts to ten.
    BoundedLoop,
    /// Loops forever.
    InfiniteLoop,
}

#[derive(Debug, Parser)]
#[command(author, version)]
struct Cli {
    /// Program to verify.
    #[arg(value_enum, default_value = "return-zero")]
    sample: Sample,

    /// Check that every loop terminates.
    #[clap(long)]
    termination: bool,

    /// Loop bound used with `--termination`.
    #[clap(long, value_name = "INT", default_value = "100000")]
    max_loop_count: i64,

    /// Print the invariants at every label.
    #[clap(long)]
    invariants: bool,
}

fn mov(dst: u8, v: Value) -> Instruction {
    Instruction::Bin(Bin {
        op: BinOp::Mov,
        dst: Reg(dst),
        v,
        is64: true,
        lddw: false,
    })
}

fn mem(dst_or_src: Value, offset: i32, is_load: bool) -> Instruction {
    Instruction::Mem(Mem {
        access: Deref {
            width: 8,
            basereg: Reg::R10_STACK_POINTER,
            offset,
        },
        value: dst_or_src,
        is_load,
    })
}

fn exit() -> Instruction {
    Instruction::Exit(Exit {
        stack_frame_prefix: String::new(),
    })
}

fn sample(sample: Sample) -> Vec<Instruction> {
    let add_one = Instruction::Bin(Bin {
        op: BinOp::Add,
        dst: Reg(0),
        v: Value::Imm(Imm(1)),
        is64: true,
        lddw: false,
    });
    match sample {
        Sample::ReturnZero => vec![mov(0, Value::Imm(Imm(0))), exit()],
        Sample::LeakPointer => vec![mov(0, Value::Reg(Reg(1))), exit()],
        Sample::StackRoundTrip => vec![
            mov(1, Value::Imm(Imm(42))),
            mem(Value::Reg(Reg(1)), -8, false),
            mem(Value::Reg(Reg(0)), -8, true),
            exit(),
        ],
        Sample::OutOfBounds => vec![mem(Value::Imm(Imm(0)), 4, false), mov(0, Value::Imm(Imm(0))), exit()],
        Sample::BoundedLoop => vec![
            mov(0, Value::Imm(Imm(0))),
            add_one,
            Instruction::Jmp(Jmp {
                cond: Some(Condition {
                    op: CondOp::Lt,
                    left: Reg(0),
                    right: Value::Imm(Imm(10)),
                    is64: true,
                }),
                target: Label::new(1),
            }),
            exit(),
        ],
        Sample::InfiniteLoop => vec![
            mov(0, Value::Imm(Imm(0))),
            add_one,
            Instruction::Jmp(Jmp {
                cond: None,
                target: Label::new(1),
            }),
        ],
    }
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    let time_total = std::time::Instant::now();

    let args = Cli::parse();
    println!("args = {:?}", args);

    let options = VerifierOptions {
        check_termination: args.termination,
        max_loop_count: args.max_loop_count,
        ..VerifierOptions::default()
    };
    let ctx = AnalysisContext::new(ProgramInfo::default(), options);

    let instructions = sample(args.sample);
    for (i, ins) in instructions.iter().enumerate() {
        println!("{:>4}: {}", i, ins);
    }
    let program = Program::from_instructions(&instructions, &ctx.program_info, &ctx.options)?;

    let invariants = analyze(&ctx, &program);
    if args.invariants {
        println!("{}", invariants.render(&ctx, &program));
    }
    let report = invariants.check_assertions(&ctx, &program);
    println!("{}", report);
    println!("max loop count = {}", report.max_loop_count);
    match report.instruction_bound {
        Some(n) => println!("instruction bound = {}", n),
        None => println!("instruction bound = unknown"),
    }

    let time_total = time_total.elapsed();
    println!("\nAll done in {:.3} s", time_total.as_secs_f64());

    Ok(())
}
