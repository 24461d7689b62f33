//! Decoded instructions.
//!
//! The instruction set is a closed sum type; every consumer matches it
//! exhaustively, so adding a variant is a compile error until all of the
//! transformer, the assertion extractor and the printer handle it.

use std::fmt;

use crate::label::Label;

/// A machine register. `r10` is the read-only frame pointer; `r11` is an
/// internal scratch register used by atomic instructions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reg(pub u8);

impl Reg {
    pub const R0_RETURN_VALUE: Reg = Reg(0);
    pub const R1_ARG: Reg = Reg(1);
    pub const R5_ARG: Reg = Reg(5);
    pub const R6: Reg = Reg(6);
    pub const R9: Reg = Reg(9);
    pub const R10_STACK_POINTER: Reg = Reg(10);
    pub const R11_ATOMIC_SCRATCH: Reg = Reg(11);
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// An immediate, stored as its 64-bit pattern.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Imm(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Reg(Reg),
    Imm(Imm),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Reg(r) => write!(f, "{}", r),
            Value::Imm(imm) => write!(f, "{}", imm.0 as i64),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BinOp {
    Mov,
    MovSx8,
    MovSx16,
    MovSx32,
    Add,
    Sub,
    Mul,
    UDiv,
    UMod,
    SDiv,
    SMod,
    Or,
    And,
    Lsh,
    Rsh,
    Arsh,
    Xor,
}

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            BinOp::Mov => "=",
            BinOp::MovSx8 => "s8=",
            BinOp::MovSx16 => "s16=",
            BinOp::MovSx32 => "s32=",
            BinOp::Add => "+=",
            BinOp::Sub => "-=",
            BinOp::Mul => "*=",
            BinOp::UDiv => "/=",
            BinOp::UMod => "%=",
            BinOp::SDiv => "s/=",
            BinOp::SMod => "s%=",
            BinOp::Or => "|=",
            BinOp::And => "&=",
            BinOp::Lsh => "<<=",
            BinOp::Rsh => ">>=",
            BinOp::Arsh => "s>>=",
            BinOp::Xor => "^=",
        }
    }
}

/// `dst op= v`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bin {
    pub op: BinOp,
    pub dst: Reg,
    pub v: Value,
    pub is64: bool,
    /// Set for the 64-bit immediate load form.
    pub lddw: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum UnOp {
    Be16,
    Be32,
    Be64,
    Le16,
    Le32,
    Le64,
    Swap16,
    Swap32,
    Swap64,
    Neg,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Un {
    pub op: UnOp,
    pub dst: Reg,
    pub is64: bool,
}

/// Loads a map file descriptor into `dst`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoadMapFd {
    pub dst: Reg,
    pub mapfd: i32,
}

/// Loads the address of a map value (direct value access) into `dst`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoadMapAddress {
    pub dst: Reg,
    pub mapfd: i32,
    pub offset: i32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ArgSingleKind {
    Anything,
    MapFdPrograms,
    MapFd,
    PtrToMapKey,
    PtrToMapValue,
    PtrToCtx,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArgSingle {
    pub kind: ArgSingleKind,
    pub reg: Reg,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ArgPairKind {
    PtrToReadableMemOrNull,
    PtrToReadableMem,
    PtrToWritableMem,
}

/// A (pointer, size) argument pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArgPair {
    pub kind: ArgPairKind,
    pub mem: Reg,
    pub size: Reg,
    pub can_be_zero: bool,
}

/// A helper function call, with its prototype resolved from the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Call {
    pub func: i32,
    pub name: String,
    pub singles: Vec<ArgSingle>,
    pub pairs: Vec<ArgPair>,
    pub is_map_lookup: bool,
    pub reallocate_packet: bool,
    pub is_tail_call: bool,
    pub stack_frame_prefix: String,
}

impl Call {
    pub fn new(func: i32, name: &str) -> Self {
        Call {
            func,
            name: name.to_string(),
            singles: Vec::new(),
            pairs: Vec::new(),
            is_map_lookup: false,
            reallocate_packet: false,
            is_tail_call: false,
            stack_frame_prefix: String::new(),
        }
    }
}

/// A call to a subprogram of the same program.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallLocal {
    pub target: Label,
    /// Prefix of the frame the callee runs in.
    pub stack_frame_prefix: String,
}

/// An indirect helper call through a register.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Callx {
    pub func: Reg,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Exit {
    /// Prefix of the frame being left; empty for the main program.
    pub stack_frame_prefix: String,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CondOp {
    Eq,
    Ne,
    Set,
    NSet,
    Lt,
    Le,
    Gt,
    Ge,
    SLt,
    SLe,
    SGt,
    SGe,
}

impl CondOp {
    pub fn negate(self) -> CondOp {
        match self {
            CondOp::Eq => CondOp::Ne,
            CondOp::Ne => CondOp::Eq,
            CondOp::Set => CondOp::NSet,
            CondOp::NSet => CondOp::Set,
            CondOp::Lt => CondOp::Ge,
            CondOp::Le => CondOp::Gt,
            CondOp::Gt => CondOp::Le,
            CondOp::Ge => CondOp::Lt,
            CondOp::SLt => CondOp::SGe,
            CondOp::SLe => CondOp::SGt,
            CondOp::SGt => CondOp::SLe,
            CondOp::SGe => CondOp::SLt,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, CondOp::SLt | CondOp::SLe | CondOp::SGt | CondOp::SGe)
    }

    fn symbol(self) -> &'static str {
        match self {
            CondOp::Eq => "==",
            CondOp::Ne => "!=",
            CondOp::Set => "&==",
            CondOp::NSet => "&!=",
            CondOp::Lt => "<",
            CondOp::Le => "<=",
            CondOp::Gt => ">",
            CondOp::Ge => ">=",
            CondOp::SLt => "s<",
            CondOp::SLe => "s<=",
            CondOp::SGt => "s>",
            CondOp::SGe => "s>=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Condition {
    pub op: CondOp,
    pub left: Reg,
    pub right: Value,
    pub is64: bool,
}

impl Condition {
    pub fn negate(&self) -> Condition {
        Condition {
            op: self.op.negate(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jmp {
    pub cond: Option<Condition>,
    pub target: Label,
}

/// A memory operand `*(width *)(basereg + offset)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Deref {
    pub width: i32,
    pub basereg: Reg,
    pub offset: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mem {
    pub access: Deref,
    pub value: Value,
    pub is_load: bool,
}

/// Legacy packet access; the result lands in r0.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Packet {
    pub width: i32,
    pub offset: i32,
    pub regoffset: Option<Reg>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AtomicOp {
    Add,
    Or,
    And,
    Xor,
    Xchg,
    CmpXchg,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Atomic {
    pub op: AtomicOp,
    pub fetch: bool,
    pub access: Deref,
    pub valreg: Reg,
}

/// Continue only if the condition holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Assume {
    pub cond: Condition,
    pub is_implicit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IncrementLoopCounter {
    pub name: Label,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Instruction {
    Undefined { opcode: u8 },
    Bin(Bin),
    Un(Un),
    LoadMapFd(LoadMapFd),
    LoadMapAddress(LoadMapAddress),
    Call(Call),
    CallLocal(CallLocal),
    Callx(Callx),
    Exit(Exit),
    Jmp(Jmp),
    Mem(Mem),
    Packet(Packet),
    Atomic(Atomic),
    Assume(Assume),
    IncrementLoopCounter(IncrementLoopCounter),
}

impl Instruction {
    /// A no-op placeholder used for the entry and exit nodes.
    pub fn nop() -> Self {
        Instruction::Undefined { opcode: 0 }
    }

    /// Registers the instruction reads or writes, for structural checks.
    pub fn registers(&self) -> Vec<Reg> {
        let value_reg = |v: &Value| match v {
            Value::Reg(r) => Some(*r),
            Value::Imm(_) => None,
        };
        match self {
            Instruction::Undefined { .. }
            | Instruction::Exit(_)
            | Instruction::CallLocal(_)
            | Instruction::IncrementLoopCounter(_)
            | Instruction::Call(_) => vec![],
            Instruction::Bin(b) => [Some(b.dst), value_reg(&b.v)].into_iter().flatten().collect(),
            Instruction::Un(u) => vec![u.dst],
            Instruction::LoadMapFd(l) => vec![l.dst],
            Instruction::LoadMapAddress(l) => vec![l.dst],
            Instruction::Callx(c) => vec![c.func],
            Instruction::Jmp(j) => match &j.cond {
                Some(c) => [Some(c.left), value_reg(&c.right)].into_iter().flatten().collect(),
                None => vec![],
            },
            Instruction::Assume(a) => [Some(a.cond.left), value_reg(&a.cond.right)].into_iter().flatten().collect(),
            Instruction::Mem(m) => [Some(m.access.basereg), value_reg(&m.value)].into_iter().flatten().collect(),
            Instruction::Packet(p) => p.regoffset.into_iter().collect(),
            Instruction::Atomic(a) => vec![a.access.basereg, a.valreg],
        }
    }

    /// Registers the instruction assigns, for structural checks.
    pub fn written_registers(&self) -> Vec<Reg> {
        match self {
            Instruction::Bin(b) => vec![b.dst],
            Instruction::Un(u) => vec![u.dst],
            Instruction::LoadMapFd(l) => vec![l.dst],
            Instruction::LoadMapAddress(l) => vec![l.dst],
            Instruction::Mem(m) if m.is_load => match m.value {
                Value::Reg(r) => vec![r],
                Value::Imm(_) => vec![],
            },
            _ => vec![],
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let left = if self.is64 {
            format!("{}", self.left)
        } else {
            format!("w{}", self.left.0)
        };
        write!(f, "{} {} {}", left, self.op.symbol(), self.right)
    }
}

impl fmt::Display for Deref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ty = match self.width {
            1 => "u8",
            2 => "u16",
            4 => "u32",
            _ => "u64",
        };
        if self.offset < 0 {
            write!(f, "*({} *)({} - {})", ty, self.basereg, -(self.offset as i64))
        } else {
            write!(f, "*({} *)({} + {})", ty, self.basereg, self.offset)
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Undefined { opcode } => write!(f, "Undefined{{{}}}", opcode),
            Instruction::Bin(b) => {
                let dst = if b.is64 {
                    format!("{}", b.dst)
                } else {
                    format!("w{}", b.dst.0)
                };
                write!(f, "{} {} {}", dst, b.op.symbol(), b.v)?;
                if b.lddw {
                    write!(f, " ll")?;
                }
                Ok(())
            }
            Instruction::Un(u) => match u.op {
                UnOp::Neg => write!(f, "{} = -{}", u.dst, u.dst),
                op => write!(f, "{} = {:?} {}", u.dst, op, u.dst),
            },
            Instruction::LoadMapFd(l) => write!(f, "{} = map_fd {}", l.dst, l.mapfd),
            Instruction::LoadMapAddress(l) => write!(f, "{} = map_val({}) + {}", l.dst, l.mapfd, l.offset),
            Instruction::Call(c) => write!(f, "call {}", c.func),
            Instruction::CallLocal(c) => write!(f, "call <{}>", c.target),
            Instruction::Callx(c) => write!(f, "callx {}", c.func),
            Instruction::Exit(_) => write!(f, "exit"),
            Instruction::Jmp(j) => match &j.cond {
                Some(c) => write!(f, "if {} goto label <{}>", c, j.target),
                None => write!(f, "goto label <{}>", j.target),
            },
            Instruction::Mem(m) => {
                if m.is_load {
                    write!(f, "{} = {}", m.value, m.access)
                } else {
                    write!(f, "{} = {}", m.access, m.value)
                }
            }
            Instruction::Packet(p) => match p.regoffset {
                Some(r) => write!(f, "r0 = *(u{} *)skb[{} + {}]", p.width * 8, r, p.offset),
                None => write!(f, "r0 = *(u{} *)skb[{}]", p.width * 8, p.offset),
            },
            Instruction::Atomic(a) => {
                let op = match a.op {
                    AtomicOp::Add => "+=",
                    AtomicOp::Or => "|=",
                    AtomicOp::And => "&=",
                    AtomicOp::Xor => "^=",
                    AtomicOp::Xchg => "x=",
                    AtomicOp::CmpXchg => "cx=",
                };
                write!(f, "lock {} {} {}", a.access, op, a.valreg)?;
                if a.fetch {
                    write!(f, " fetch")?;
                }
                Ok(())
            }
            Instruction::Assume(a) => write!(f, "assume {}", a.cond),
            Instruction::IncrementLoopCounter(c) => write!(f, "{}++", c.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let mov = Instruction::Bin(Bin {
            op: BinOp::Mov,
            dst: Reg(0),
            v: Value::Imm(Imm(0)),
            is64: true,
            lddw: false,
        });
        assert_eq!(mov.to_string(), "r0 = 0");
        let store = Instruction::Mem(Mem {
            access: Deref {
                width: 8,
                basereg: Reg::R10_STACK_POINTER,
                offset: -8,
            },
            value: Value::Reg(Reg(1)),
            is_load: false,
        });
        assert_eq!(store.to_string(), "*(u64 *)(r10 - 8) = r1");
        let cond = Condition {
            op: CondOp::Lt,
            left: Reg(1),
            right: Value::Imm(Imm(10)),
            is64: true,
        };
        assert_eq!(cond.negate().to_string(), "r1 >= 10");
    }

    #[test]
    fn test_registers() {
        let ins = Instruction::Mem(Mem {
            access: Deref {
                width: 4,
                basereg: Reg(2),
                offset: 0,
            },
            value: Value::Reg(Reg(3)),
            is_load: true,
        });
        assert_eq!(ins.registers(), vec![Reg(2), Reg(3)]);
        assert_eq!(ins.written_registers(), vec![Reg(3)]);
    }
}
