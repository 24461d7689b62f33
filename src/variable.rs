//! Variables of the numeric domain and their interning.
//!
//! Every tracked numeric fact is a [`Variable`]: a small copyable id. Register
//! variables occupy a fixed prefix of the id space and are computed
//! arithmetically, so they need no lookup. Memory cells, subprogram frame
//! variables and loop counters are interned on demand by the
//! [`VariableFactory`] owned by the analysis context.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

/// The semantic kind of a tracked numeric fact.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataKind {
    Types,
    SValues,
    UValues,
    CtxOffsets,
    MapFds,
    PacketOffsets,
    SharedOffsets,
    StackOffsets,
    SharedRegionSizes,
    StackNumericSizes,
}

impl DataKind {
    pub const ALL: [DataKind; 10] = [
        DataKind::Types,
        DataKind::SValues,
        DataKind::UValues,
        DataKind::CtxOffsets,
        DataKind::MapFds,
        DataKind::PacketOffsets,
        DataKind::SharedOffsets,
        DataKind::StackOffsets,
        DataKind::SharedRegionSizes,
        DataKind::StackNumericSizes,
    ];

    pub const COUNT: u32 = 10;

    pub fn index(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            DataKind::Types => "type",
            DataKind::SValues => "svalue",
            DataKind::UValues => "uvalue",
            DataKind::CtxOffsets => "ctx_offset",
            DataKind::MapFds => "map_fd",
            DataKind::PacketOffsets => "packet_offset",
            DataKind::SharedOffsets => "shared_offset",
            DataKind::StackOffsets => "stack_offset",
            DataKind::SharedRegionSizes => "shared_region_size",
            DataKind::StackNumericSizes => "stack_numeric_size",
        }
    }

    pub fn from_name(name: &str) -> Option<DataKind> {
        DataKind::ALL.into_iter().find(|k| k.name() == name)
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Number of register slots with reserved variables: r0..r10 plus the
/// scratch register used by atomic instructions.
pub const NUM_REGISTER_SLOTS: u32 = 12;

const PACKET_SIZE_ID: u32 = NUM_REGISTER_SLOTS * DataKind::COUNT;
const META_OFFSET_ID: u32 = PACKET_SIZE_ID + 1;
const NUM_RESERVED: u32 = META_OFFSET_ID + 1;

/// Identity of a numeric variable.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Variable(u32);

impl Variable {
    /// The variable holding `kind` of register `reg`.
    pub const fn reg(kind: DataKind, reg: u8) -> Variable {
        assert!((reg as u32) < NUM_REGISTER_SLOTS);
        Variable(reg as u32 * DataKind::COUNT + kind as u32)
    }

    pub const fn packet_size() -> Variable {
        Variable(PACKET_SIZE_ID)
    }

    pub const fn meta_offset() -> Variable {
        Variable(META_OFFSET_ID)
    }

    pub fn id(self) -> u32 {
        self.0
    }

    /// Register number and kind, for register variables.
    pub fn as_register(self) -> Option<(u8, DataKind)> {
        if self.0 < PACKET_SIZE_ID {
            let kind = DataKind::ALL[(self.0 % DataKind::COUNT) as usize];
            Some(((self.0 / DataKind::COUNT) as u8, kind))
        } else {
            None
        }
    }
}

/// Structural name of a variable, used for interning and rendering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VariableName {
    Register { reg: u8, kind: DataKind },
    PacketSize,
    MetaOffset,
    /// Content of stack bytes `[offset, offset + size)`.
    Cell { kind: DataKind, offset: i64, size: u32 },
    /// Callee-saved register of a subprogram frame.
    Frame { prefix: String, reg: u8, kind: DataKind },
    LoopCounter(String),
}

impl VariableName {
    pub fn kind(&self) -> Option<DataKind> {
        match self {
            VariableName::Register { kind, .. } | VariableName::Cell { kind, .. } | VariableName::Frame { kind, .. } => {
                Some(*kind)
            }
            _ => None,
        }
    }
}

impl fmt::Display for VariableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableName::Register { reg, kind } => write!(f, "r{}.{}", reg, kind),
            VariableName::PacketSize => write!(f, "packet_size"),
            VariableName::MetaOffset => write!(f, "meta_offset"),
            VariableName::Cell { kind, offset, size } => {
                write!(f, "s[{}...{}].{}", offset, offset + *size as i64 - 1, kind)
            }
            VariableName::Frame { prefix, reg, kind } => write!(f, "{}.r{}.{}", prefix, reg, kind),
            VariableName::LoopCounter(label) => write!(f, "pc[{}]", label),
        }
    }
}

/// Interns structural variable names into [`Variable`] ids.
///
/// Uses interior mutability so that domains holding a shared reference to
/// the context can create variables on demand.
#[derive(Debug)]
pub struct VariableFactory {
    names: RefCell<Vec<VariableName>>,
    ids: RefCell<HashMap<VariableName, Variable>>,
}

impl Default for VariableFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableFactory {
    pub fn new() -> Self {
        let factory = VariableFactory {
            names: RefCell::new(Vec::new()),
            ids: RefCell::new(HashMap::new()),
        };
        factory.reserve_fixed();
        factory
    }

    fn reserve_fixed(&self) {
        let mut names = self.names.borrow_mut();
        let mut ids = self.ids.borrow_mut();
        names.clear();
        ids.clear();
        for reg in 0..NUM_REGISTER_SLOTS as u8 {
            for kind in DataKind::ALL {
                let name = VariableName::Register { reg, kind };
                ids.insert(name.clone(), Variable::reg(kind, reg));
                names.push(name);
            }
        }
        names.push(VariableName::PacketSize);
        ids.insert(VariableName::PacketSize, Variable::packet_size());
        names.push(VariableName::MetaOffset);
        ids.insert(VariableName::MetaOffset, Variable::meta_offset());
        debug_assert_eq!(names.len() as u32, NUM_RESERVED);
    }

    /// Drops every dynamically created variable, keeping the reserved ones.
    pub fn reset(&self) {
        self.reserve_fixed();
    }

    /// Number of variables currently known.
    pub fn len(&self) -> usize {
        self.names.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn intern(&self, name: VariableName) -> Variable {
        if let Some(&v) = self.ids.borrow().get(&name) {
            return v;
        }
        let mut names = self.names.borrow_mut();
        let v = Variable(names.len() as u32);
        names.push(name.clone());
        self.ids.borrow_mut().insert(name, v);
        v
    }

    pub fn lookup(&self, name: &VariableName) -> Option<Variable> {
        self.ids.borrow().get(name).copied()
    }

    pub fn name(&self, v: Variable) -> VariableName {
        match self.names.borrow().get(v.0 as usize) {
            Some(name) => name.clone(),
            None => panic!("Variable {} does not belong to this context", v.0),
        }
    }

    pub fn display(&self, v: Variable) -> String {
        self.name(v).to_string()
    }

    pub fn kind(&self, v: Variable) -> Option<DataKind> {
        self.name(v).kind()
    }

    pub fn cell_var(&self, kind: DataKind, offset: i64, size: u32) -> Variable {
        self.intern(VariableName::Cell { kind, offset, size })
    }

    pub fn frame_var(&self, prefix: &str, reg: u8, kind: DataKind) -> Variable {
        self.intern(VariableName::Frame {
            prefix: prefix.to_string(),
            reg,
            kind,
        })
    }

    pub fn loop_counter(&self, label: &str) -> Variable {
        self.intern(VariableName::LoopCounter(label.to_string()))
    }

    /// The variable of the same owner as `type_var` but of kind `kind`.
    pub fn kind_var(&self, kind: DataKind, type_var: Variable) -> Variable {
        if let Some((reg, _)) = type_var.as_register() {
            return Variable::reg(kind, reg);
        }
        match self.name(type_var) {
            VariableName::Cell { offset, size, .. } => self.cell_var(kind, offset, size),
            VariableName::Frame { prefix, reg, .. } => self.frame_var(&prefix, reg, kind),
            name => panic!("Variable {} has no kind family", name),
        }
    }

    /// Every known variable of kind [`DataKind::Types`].
    pub fn type_variables(&self) -> Vec<Variable> {
        self.names
            .borrow()
            .iter()
            .enumerate()
            .filter(|(_, name)| name.kind() == Some(DataKind::Types))
            .map(|(i, _)| Variable(i as u32))
            .collect()
    }

    /// Every loop counter variable.
    pub fn loop_counters(&self) -> Vec<Variable> {
        self.names
            .borrow()
            .iter()
            .enumerate()
            .filter(|(_, name)| matches!(name, VariableName::LoopCounter(_)))
            .map(|(i, _)| Variable(i as u32))
            .collect()
    }

    /// Parses the rendering produced by [`VariableName`]'s `Display` for
    /// registers, cells and the packet globals.
    pub fn parse(&self, text: &str) -> Option<Variable> {
        match text {
            "packet_size" => return Some(Variable::packet_size()),
            "meta_offset" => return Some(Variable::meta_offset()),
            _ => {}
        }
        let (owner, kind) = text.rsplit_once('.')?;
        let kind = DataKind::from_name(kind)?;
        if let Some(reg) = owner.strip_prefix('r') {
            let reg: u8 = reg.parse().ok()?;
            if (reg as u32) < NUM_REGISTER_SLOTS {
                return Some(Variable::reg(kind, reg));
            }
            return None;
        }
        let range = owner.strip_prefix("s[")?.strip_suffix(']')?;
        let (start, end) = range.split_once("...")?;
        let start: i64 = start.parse().ok()?;
        let end: i64 = end.parse().ok()?;
        if end < start {
            return None;
        }
        Some(self.cell_var(kind, start, (end - start + 1) as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_variables() {
        let vars = VariableFactory::new();
        let v = Variable::reg(DataKind::StackOffsets, 10);
        assert_eq!(v.as_register(), Some((10, DataKind::StackOffsets)));
        assert_eq!(vars.display(v), "r10.stack_offset");
        assert_eq!(vars.display(Variable::packet_size()), "packet_size");
        assert_eq!(Variable::packet_size().as_register(), None);
    }

    #[test]
    fn test_interning_and_reset() {
        let vars = VariableFactory::new();
        let base = vars.len();
        let c1 = vars.cell_var(DataKind::SValues, 4088, 8);
        let c2 = vars.cell_var(DataKind::SValues, 4088, 8);
        assert_eq!(c1, c2);
        assert_eq!(vars.display(c1), "s[4088...4095].svalue");
        let t = vars.cell_var(DataKind::Types, 4088, 8);
        assert_eq!(vars.kind_var(DataKind::SValues, t), c1);
        assert!(vars.type_variables().contains(&t));
        vars.reset();
        assert_eq!(vars.len(), base);
        assert!(vars.lookup(&VariableName::Cell { kind: DataKind::SValues, offset: 4088, size: 8 }).is_none());
    }

    #[test]
    fn test_parse() {
        let vars = VariableFactory::new();
        assert_eq!(vars.parse("r3.uvalue"), Some(Variable::reg(DataKind::UValues, 3)));
        assert_eq!(vars.parse("meta_offset"), Some(Variable::meta_offset()));
        let c = vars.parse("s[4092...4095].type").unwrap();
        assert_eq!(vars.display(c), "s[4092...4095].type");
        assert_eq!(vars.parse("r99.type"), None);
        assert_eq!(vars.parse("bogus"), None);
    }
}
