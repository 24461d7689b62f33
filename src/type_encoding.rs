//! Region tags and the groups of tags that preconditions ask about.
//!
//! Tags are ordinary integers in the numeric domain, ordered so that the
//! common groups are intervals: `r.type >= packet` means "some memory
//! pointer".

use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TypeEncoding {
    Uninit,
    MapPrograms,
    Map,
    Number,
    Ctx,
    Packet,
    Stack,
    Shared,
}

impl TypeEncoding {
    /// Every tag a register can actually hold, in increasing order.
    pub const INITIALIZED: [TypeEncoding; 7] = [
        TypeEncoding::MapPrograms,
        TypeEncoding::Map,
        TypeEncoding::Number,
        TypeEncoding::Ctx,
        TypeEncoding::Packet,
        TypeEncoding::Stack,
        TypeEncoding::Shared,
    ];

    pub const MIN: i64 = TypeEncoding::MapPrograms.tag();
    pub const MAX: i64 = TypeEncoding::Shared.tag();

    pub const fn tag(self) -> i64 {
        match self {
            TypeEncoding::Uninit => -7,
            TypeEncoding::MapPrograms => -6,
            TypeEncoding::Map => -5,
            TypeEncoding::Number => -4,
            TypeEncoding::Ctx => -3,
            TypeEncoding::Packet => -2,
            TypeEncoding::Stack => -1,
            TypeEncoding::Shared => 0,
        }
    }

    pub fn from_tag(tag: i64) -> Option<TypeEncoding> {
        if tag == TypeEncoding::Uninit.tag() {
            return Some(TypeEncoding::Uninit);
        }
        TypeEncoding::INITIALIZED.into_iter().find(|t| t.tag() == tag)
    }

    /// The initialized tags in `[lb, ub]`, clipped to the valid range.
    pub fn iterate(lb: i64, ub: i64) -> Vec<TypeEncoding> {
        TypeEncoding::INITIALIZED
            .into_iter()
            .filter(|t| lb <= t.tag() && t.tag() <= ub)
            .collect()
    }

    pub fn name(self) -> &'static str {
        match self {
            TypeEncoding::Uninit => "uninit",
            TypeEncoding::MapPrograms => "map_fd_programs",
            TypeEncoding::Map => "map_fd",
            TypeEncoding::Number => "number",
            TypeEncoding::Ctx => "ctx",
            TypeEncoding::Packet => "packet",
            TypeEncoding::Stack => "stack",
            TypeEncoding::Shared => "shared",
        }
    }

    pub fn from_name(name: &str) -> Option<TypeEncoding> {
        std::iter::once(TypeEncoding::Uninit)
            .chain(TypeEncoding::INITIALIZED)
            .find(|t| t.name() == name)
    }
}

impl fmt::Display for TypeEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of tags a precondition accepts.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TypeGroup {
    Number,
    MapFd,
    MapFdPrograms,
    Ctx,
    Packet,
    Stack,
    Shared,
    /// `type >= number`
    NonMapFd,
    /// `type >= packet`
    Mem,
    /// `type >= number && type != ctx`
    MemOrNum,
    /// `type >= ctx`
    Pointer,
    /// `type >= number`
    PtrOrNum,
    /// `packet <= type <= stack`
    StackOrPacket,
    /// `ctx <= type <= stack`
    SingletonPtr,
}

impl TypeGroup {
    /// Tags belonging to the group.
    pub fn members(self) -> Vec<TypeEncoding> {
        use TypeEncoding as T;
        match self {
            TypeGroup::Number => vec![T::Number],
            TypeGroup::MapFd => vec![T::Map],
            TypeGroup::MapFdPrograms => vec![T::MapPrograms],
            TypeGroup::Ctx => vec![T::Ctx],
            TypeGroup::Packet => vec![T::Packet],
            TypeGroup::Stack => vec![T::Stack],
            TypeGroup::Shared => vec![T::Shared],
            TypeGroup::NonMapFd | TypeGroup::PtrOrNum => vec![T::Number, T::Ctx, T::Packet, T::Stack, T::Shared],
            TypeGroup::Mem => vec![T::Packet, T::Stack, T::Shared],
            TypeGroup::MemOrNum => vec![T::Number, T::Packet, T::Stack, T::Shared],
            TypeGroup::Pointer => vec![T::Ctx, T::Packet, T::Stack, T::Shared],
            TypeGroup::StackOrPacket => vec![T::Packet, T::Stack],
            TypeGroup::SingletonPtr => vec![T::Ctx, T::Packet, T::Stack],
        }
    }

    pub fn is_singleton(self) -> bool {
        self.members().len() == 1
    }
}

impl fmt::Display for TypeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let members = self.members();
        if let [single] = members.as_slice() {
            return write!(f, "{}", single);
        }
        let names: Vec<&str> = members.iter().map(|t| t.name()).collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}
