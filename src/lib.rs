//! # ebpf-absint: a static verifier for eBPF programs
//!
//! **`ebpf-absint`** decides, without running it, whether an eBPF program is
//! safe to load: every memory access stays inside the region it points to,
//! no pointer leaks out through the return value or a map, helpers receive
//! arguments of the right kind, and (optionally) every loop terminates.
//!
//! ## How it works
//!
//! The program is turned into a control-flow graph ([`cfg`]) and analyzed by
//! abstract interpretation: the [`fixpoint`] iterator computes, for every
//! instruction, an over-approximation of all machine states that can reach
//! it. A state ([`ebpf_domain::EbpfDomain`]) tracks every register as a
//! triple of *value*, *region type* and *offset within the region*, plus the
//! contents of the stack byte by byte:
//!
//! - numbers live in a split difference-bound matrix ([`split_dbm`]) that
//!   keeps both `x in [a, b]` and `y - x <= k` facts;
//! - region types are small integers ([`type_encoding`]) stored in the same
//!   numeric domain, so "r2 is a packet pointer" is just `r2.type = -2`;
//! - the stack is an [`array_domain`] of typed cells.
//!
//! Once the invariants are known, the [`checker`] tests the preconditions
//! ([`assertion`]) of each instruction against them. A precondition that
//! may fail becomes a warning in the [`verifier::Report`].
//!
//! ## Basic usage
//!
//! ```rust
//! use ebpf_absint::cfg::Program;
//! use ebpf_absint::context::AnalysisContext;
//! use ebpf_absint::instruction::{Bin, BinOp, Exit, Imm, Instruction, Reg, Value};
//! use ebpf_absint::verifier::verify;
//!
//! // r0 = 0; exit
//! let program = [
//!     Instruction::Bin(Bin {
//!         op: BinOp::Mov,
//!         dst: Reg(0),
//!         v: Value::Imm(Imm(0)),
//!         is64: true,
//!         lddw: false,
//!     }),
//!     Instruction::Exit(Exit { stack_frame_prefix: String::new() }),
//! ];
//!
//! let ctx = AnalysisContext::default();
//! let program = Program::from_instructions(&program, &ctx.program_info, &ctx.options).unwrap();
//! let report = verify(&ctx, &program);
//! assert!(report.verified());
//! ```
//!
//! ## Analysis context
//!
//! All state shared by the abstract values of one analysis (the variable
//! interner, options, program metadata) lives in an explicit
//! [`context::AnalysisContext`]. Independent analyses use independent
//! contexts, or reset one between runs; [`verifier::analyze`] does the
//! latter.
//!
//! ## Errors
//!
//! A program that cannot even be turned into a graph (bad jump target,
//! invalid register, recursion, ...) is rejected with a
//! [`error::VerifierError`] before analysis starts. Verification failures
//! are not errors: they are data in the report.

pub mod array_domain;
pub mod assertion;
pub mod bitset;
pub mod cfg;
pub mod checker;
pub mod context;
pub mod ebpf_domain;
pub mod error;
pub mod finite_domain;
pub mod fixpoint;
pub mod graph;
pub mod graph_ops;
pub mod instruction;
pub mod interval;
pub mod label;
pub mod linear;
pub mod number;
pub mod platform;
pub mod split_dbm;
pub mod transformer;
pub mod type_domain;
pub mod type_encoding;
pub mod variable;
pub mod verifier;
pub mod wto;
