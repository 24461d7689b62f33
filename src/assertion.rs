//! Preconditions of instructions.
//!
//! Every instruction carries a list of [`Assertion`]s, extracted once before
//! the analysis by [`get_assertions`]. The checker decides them against the
//! state before the instruction.

use std::fmt;

use crate::context::VerifierOptions;
use crate::instruction::{
    ArgPairKind, ArgSingleKind, AtomicOp, BinOp, Call, CondOp, Condition, Imm, Instruction, Reg, Value,
};
use crate::label::Label;
use crate::platform::ProgramInfo;
use crate::type_encoding::TypeGroup;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AccessType {
    /// Pointer comparison; only the bounds of the pointer matter.
    Compare,
    Read,
    Write,
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessType::Compare => write!(f, "comparison"),
            AccessType::Read => write!(f, "read"),
            AccessType::Write => write!(f, "write"),
        }
    }
}

/// `r1` and `r2` can be compared or subtracted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Comparable {
    pub r1: Reg,
    pub r2: Reg,
}

/// If `ptr` is a pointer, `num` is a number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Addable {
    pub ptr: Reg,
    pub num: Reg,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValidDivisor {
    pub reg: Reg,
    pub is_signed: bool,
}

/// `[reg + offset, reg + offset + width)` lies within the region `reg`
/// points to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValidAccess {
    pub reg: Reg,
    pub offset: i32,
    pub width: Value,
    pub or_null: bool,
    pub access_type: AccessType,
}

/// If `mem` is not the stack, `val` is a number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValidStore {
    pub mem: Reg,
    pub val: Reg,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValidSize {
    pub reg: Reg,
    pub can_be_zero: bool,
}

/// `access_reg` points to a full key (or value) of the map in `map_fd_reg`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValidMapKeyValue {
    pub access_reg: Reg,
    pub map_fd_reg: Reg,
    pub key: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValidCall {
    pub func: i32,
    pub stack_frame_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeConstraint {
    pub reg: Reg,
    pub types: TypeGroup,
}

/// `reg` holds the id of a usable helper.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FuncConstraint {
    pub reg: Reg,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ZeroCtxOffset {
    pub reg: Reg,
}

/// The loop counter of `name` stays at most `limit`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BoundedLoopCount {
    pub name: Label,
    pub limit: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Assertion {
    Comparable(Comparable),
    Addable(Addable),
    ValidDivisor(ValidDivisor),
    ValidAccess(ValidAccess),
    ValidStore(ValidStore),
    ValidSize(ValidSize),
    ValidMapKeyValue(ValidMapKeyValue),
    ValidCall(ValidCall),
    TypeConstraint(TypeConstraint),
    FuncConstraint(FuncConstraint),
    ZeroCtxOffset(ZeroCtxOffset),
    BoundedLoopCount(BoundedLoopCount),
}

impl fmt::Display for Assertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Assertion::Comparable(a) => write!(f, "{}.type == {}.type", a.r1, a.r2),
            Assertion::Addable(a) => write!(f, "{}.type is pointer -> {}.type == number", a.ptr, a.num),
            Assertion::ValidDivisor(a) => write!(f, "{} != 0", a.reg),
            Assertion::ValidAccess(a) => {
                write!(f, "valid_access({}.offset", a.reg)?;
                if a.offset > 0 {
                    write!(f, "+{}", a.offset)?;
                } else if a.offset < 0 {
                    write!(f, "{}", a.offset)?;
                }
                match a.width {
                    Value::Imm(imm) if imm.0 == 0 => write!(f, ")")?,
                    width => write!(f, ", width={})", width)?,
                }
                if a.or_null {
                    write!(f, " or null")?;
                }
                write!(f, " for {}", a.access_type)
            }
            Assertion::ValidStore(a) => write!(f, "{}.type != stack -> {}.type == number", a.mem, a.val),
            Assertion::ValidSize(a) => {
                let op = if a.can_be_zero { ">=" } else { ">" };
                write!(f, "{}.value {} 0", a.reg, op)
            }
            Assertion::ValidMapKeyValue(a) => {
                let what = if a.key { "key_size" } else { "value_size" };
                write!(f, "within({}:{}({}))", a.access_reg, what, a.map_fd_reg)
            }
            Assertion::ValidCall(a) => write!(f, "valid call({})", a.func),
            Assertion::TypeConstraint(a) => {
                if a.types.is_singleton() {
                    write!(f, "{}.type == {}", a.reg, a.types)
                } else {
                    write!(f, "{}.type in {}", a.reg, a.types)
                }
            }
            Assertion::FuncConstraint(a) => write!(f, "valid call({})", a.reg),
            Assertion::ZeroCtxOffset(a) => write!(f, "{}.ctx_offset == 0", a.reg),
            Assertion::BoundedLoopCount(a) => write!(f, "pc[{}] <= {}", a.name, a.limit),
        }
    }
}

fn type_of(reg: Reg, types: TypeGroup) -> Assertion {
    Assertion::TypeConstraint(TypeConstraint { reg, types })
}

struct AssertionExtractor<'a> {
    info: &'a ProgramInfo,
    options: &'a VerifierOptions,
}

impl AssertionExtractor<'_> {
    fn extract(&self, ins: &Instruction) -> Vec<Assertion> {
        match ins {
            Instruction::Undefined { .. }
            | Instruction::LoadMapFd(_)
            | Instruction::LoadMapAddress(_)
            | Instruction::CallLocal(_) => vec![],
            Instruction::IncrementLoopCounter(c) => vec![Assertion::BoundedLoopCount(BoundedLoopCount {
                name: c.name.clone(),
                limit: self.options.max_loop_count,
            })],
            Instruction::Un(u) => vec![type_of(u.dst, TypeGroup::Number)],
            Instruction::Exit(e) => {
                if e.stack_frame_prefix.is_empty() {
                    vec![type_of(Reg::R0_RETURN_VALUE, TypeGroup::Number)]
                } else {
                    vec![]
                }
            }
            Instruction::Call(call) => self.call(call),
            Instruction::Callx(c) => vec![
                type_of(c.func, TypeGroup::Number),
                Assertion::FuncConstraint(FuncConstraint { reg: c.func }),
            ],
            Instruction::Jmp(j) => match &j.cond {
                Some(cond) => self.explicate(cond),
                None => vec![],
            },
            Instruction::Assume(a) => {
                if a.is_implicit {
                    vec![]
                } else {
                    self.explicate(&a.cond)
                }
            }
            Instruction::Packet(p) => {
                let mut res = vec![type_of(Reg::R6, TypeGroup::Ctx)];
                if let Some(r) = p.regoffset {
                    res.push(type_of(r, TypeGroup::Number));
                }
                res
            }
            Instruction::Mem(m) => {
                let base = m.access.basereg;
                let width = Value::Imm(Imm(m.access.width as u64));
                let access_type = if m.is_load { AccessType::Read } else { AccessType::Write };
                let mut res = Vec::new();
                if base != Reg::R10_STACK_POINTER {
                    res.push(type_of(base, TypeGroup::Pointer));
                }
                res.push(Assertion::ValidAccess(ValidAccess {
                    reg: base,
                    offset: m.access.offset,
                    width,
                    or_null: false,
                    access_type,
                }));
                if base != Reg::R10_STACK_POINTER && !self.info.privileged && !m.is_load {
                    if let Value::Reg(val) = m.value {
                        if m.access.width != 8 {
                            res.push(type_of(val, TypeGroup::Number));
                        } else {
                            res.push(Assertion::ValidStore(ValidStore { mem: base, val }));
                        }
                    }
                }
                res
            }
            Instruction::Atomic(a) => {
                let mut res = vec![
                    type_of(a.valreg, TypeGroup::Number),
                    type_of(a.access.basereg, TypeGroup::Pointer),
                    Assertion::ValidAccess(ValidAccess {
                        reg: a.access.basereg,
                        offset: a.access.offset,
                        width: Value::Imm(Imm(a.access.width as u64)),
                        or_null: false,
                        access_type: AccessType::Write,
                    }),
                ];
                if a.op == AtomicOp::CmpXchg {
                    res.push(type_of(Reg::R0_RETURN_VALUE, TypeGroup::Number));
                }
                res
            }
            Instruction::Bin(b) => match (b.op, b.v) {
                (BinOp::Mov, _) => vec![],
                (BinOp::MovSx8 | BinOp::MovSx16 | BinOp::MovSx32, Value::Reg(src)) => {
                    vec![type_of(src, TypeGroup::Number)]
                }
                (BinOp::MovSx8 | BinOp::MovSx16 | BinOp::MovSx32, Value::Imm(_)) => vec![],
                (BinOp::Add, Value::Reg(src)) => vec![
                    Assertion::Addable(Addable { ptr: src, num: b.dst }),
                    Assertion::Addable(Addable { ptr: b.dst, num: src }),
                ],
                (BinOp::Add, Value::Imm(_)) => vec![],
                (BinOp::Sub, Value::Reg(src)) => vec![
                    type_of(b.dst, TypeGroup::PtrOrNum),
                    Assertion::Comparable(Comparable { r1: b.dst, r2: src }),
                ],
                (BinOp::Sub, Value::Imm(_)) => vec![],
                (op @ (BinOp::UDiv | BinOp::UMod | BinOp::SDiv | BinOp::SMod), Value::Reg(src)) => vec![
                    type_of(b.dst, TypeGroup::Number),
                    Assertion::ValidDivisor(ValidDivisor {
                        reg: src,
                        is_signed: matches!(op, BinOp::SDiv | BinOp::SMod),
                    }),
                ],
                _ => vec![type_of(b.dst, TypeGroup::Number)],
            },
        }
    }

    fn call(&self, call: &Call) -> Vec<Assertion> {
        let mut res = vec![Assertion::ValidCall(ValidCall {
            func: call.func,
            stack_frame_prefix: call.stack_frame_prefix.clone(),
        })];
        let mut map_fd_reg = None;
        for arg in &call.singles {
            match arg.kind {
                ArgSingleKind::Anything => {
                    if !self.info.privileged {
                        res.push(type_of(arg.reg, TypeGroup::Number));
                    }
                }
                ArgSingleKind::MapFdPrograms => {
                    res.push(type_of(arg.reg, TypeGroup::MapFdPrograms));
                    map_fd_reg = Some(arg.reg);
                }
                ArgSingleKind::MapFd => {
                    res.push(type_of(arg.reg, TypeGroup::MapFd));
                    map_fd_reg = Some(arg.reg);
                }
                ArgSingleKind::PtrToMapKey | ArgSingleKind::PtrToMapValue => {
                    res.push(type_of(arg.reg, TypeGroup::StackOrPacket));
                    if let Some(map_fd_reg) = map_fd_reg {
                        res.push(Assertion::ValidMapKeyValue(ValidMapKeyValue {
                            access_reg: arg.reg,
                            map_fd_reg,
                            key: arg.kind == ArgSingleKind::PtrToMapKey,
                        }));
                    }
                }
                ArgSingleKind::PtrToCtx => {
                    res.push(type_of(arg.reg, TypeGroup::Ctx));
                    res.push(Assertion::ZeroCtxOffset(ZeroCtxOffset { reg: arg.reg }));
                }
            }
        }
        for arg in &call.pairs {
            let (group, or_null, access_type) = match arg.kind {
                ArgPairKind::PtrToReadableMemOrNull => (TypeGroup::MemOrNum, true, AccessType::Read),
                ArgPairKind::PtrToReadableMem => (TypeGroup::Mem, false, AccessType::Read),
                ArgPairKind::PtrToWritableMem => (TypeGroup::Mem, false, AccessType::Write),
            };
            res.push(type_of(arg.mem, group));
            res.push(type_of(arg.size, TypeGroup::Number));
            res.push(Assertion::ValidSize(ValidSize {
                reg: arg.size,
                can_be_zero: arg.can_be_zero,
            }));
            res.push(Assertion::ValidAccess(ValidAccess {
                reg: arg.mem,
                offset: 0,
                width: Value::Reg(arg.size),
                or_null,
                access_type,
            }));
        }
        res
    }

    fn explicate(&self, cond: &Condition) -> Vec<Assertion> {
        if self.info.privileged {
            return vec![];
        }
        let ordering = !matches!(cond.op, CondOp::Eq | CondOp::Ne);
        match cond.right {
            // Anything can be compared to 0.
            Value::Imm(imm) if imm.0 == 0 => vec![],
            Value::Imm(_) => vec![type_of(cond.left, TypeGroup::Number)],
            Value::Reg(right) => {
                let mut res = Vec::new();
                if ordering {
                    res.push(type_of(cond.left, TypeGroup::NonMapFd));
                }
                res.push(Assertion::Comparable(Comparable {
                    r1: cond.left,
                    r2: right,
                }));
                res
            }
        }
    }
}

/// The preconditions of `ins`.
pub fn get_assertions(ins: &Instruction, info: &ProgramInfo, options: &VerifierOptions) -> Vec<Assertion> {
    AssertionExtractor { info, options }.extract(ins)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{Bin, Deref, Exit, Mem};

    fn extract(ins: &Instruction) -> Vec<Assertion> {
        get_assertions(ins, &ProgramInfo::default(), &VerifierOptions::default())
    }

    #[test]
    fn test_exit_requires_number() {
        let main = Instruction::Exit(Exit {
            stack_frame_prefix: String::new(),
        });
        assert_eq!(extract(&main), vec![type_of(Reg(0), TypeGroup::Number)]);
        let sub = Instruction::Exit(Exit {
            stack_frame_prefix: "3".to_string(),
        });
        assert!(extract(&sub).is_empty());
    }

    #[test]
    fn test_stack_store() {
        let ins = Instruction::Mem(Mem {
            access: Deref {
                width: 8,
                basereg: Reg::R10_STACK_POINTER,
                offset: -8,
            },
            value: Value::Reg(Reg(1)),
            is_load: false,
        });
        let res = extract(&ins);
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].to_string(), "valid_access(r10.offset-8, width=8) for write");
    }

    #[test]
    fn test_shared_store_of_pointer() {
        let ins = Instruction::Mem(Mem {
            access: Deref {
                width: 8,
                basereg: Reg(2),
                offset: 4,
            },
            value: Value::Reg(Reg(1)),
            is_load: false,
        });
        let res = extract(&ins);
        assert_eq!(res[0].to_string(), "r2.type in {ctx, packet, stack, shared}");
        assert!(matches!(res[2], Assertion::ValidStore(ValidStore { mem: Reg(2), val: Reg(1) })));
    }

    #[test]
    fn test_bin_assertions() {
        let add = Instruction::Bin(Bin {
            op: BinOp::Add,
            dst: Reg(1),
            v: Value::Reg(Reg(2)),
            is64: true,
            lddw: false,
        });
        assert_eq!(extract(&add).len(), 2);
        let div = Instruction::Bin(Bin {
            op: BinOp::SDiv,
            dst: Reg(1),
            v: Value::Reg(Reg(2)),
            is64: true,
            lddw: false,
        });
        assert!(extract(&div).contains(&Assertion::ValidDivisor(ValidDivisor {
            reg: Reg(2),
            is_signed: true
        })));
        let mov = Instruction::Bin(Bin {
            op: BinOp::Mov,
            dst: Reg(1),
            v: Value::Imm(Imm(7)),
            is64: true,
            lddw: false,
        });
        assert!(extract(&mov).is_empty());
    }

    #[test]
    fn test_comparison_with_zero_is_free() {
        let cond = Condition {
            op: CondOp::Eq,
            left: Reg(1),
            right: Value::Imm(Imm(0)),
            is64: true,
        };
        let ex = AssertionExtractor {
            info: &ProgramInfo::default(),
            options: &VerifierOptions::default(),
        };
        assert!(ex.explicate(&cond).is_empty());
        let cond = Condition {
            op: CondOp::Lt,
            right: Value::Reg(Reg(2)),
            ..cond
        };
        assert_eq!(ex.explicate(&cond).len(), 2);
    }
}
