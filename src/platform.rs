//! Program metadata and read-only platform data.
//!
//! The verifier core does not know the helper-function catalogue or map
//! types of any particular kernel; it consumes them through [`Platform`] and
//! the descriptors in [`ProgramInfo`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::instruction::Call;

pub const EBPF_SUBPROGRAM_STACK_SIZE: i64 = 512;
pub const MAX_CALL_STACK_FRAMES: usize = 8;
pub const EBPF_TOTAL_STACK_SIZE: i64 = EBPF_SUBPROGRAM_STACK_SIZE * MAX_CALL_STACK_FRAMES as i64;
pub const MAX_PACKET_SIZE: i64 = 0xffff;
/// Largest value any pointer is assumed to have.
pub const PTR_MAX: i64 = i32::MAX as i64 - MAX_PACKET_SIZE;
/// Lowest possible metadata offset relative to the packet start.
pub const MIN_META_OFFSET: i64 = -4098;

/// Byte layout of the special fields of the context region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextDescriptor {
    pub size: i32,
    /// Offset of the packet-start pointer, or -1.
    pub data: i32,
    /// Offset of the packet-end pointer, or -1.
    pub end: i32,
    /// Offset of the packet-metadata pointer, or -1.
    pub meta: i32,
}

impl ContextDescriptor {
    /// A context with no packet access.
    pub fn opaque(size: i32) -> Self {
        ContextDescriptor {
            size,
            data: -1,
            end: -1,
            meta: -1,
        }
    }
}

impl Default for ContextDescriptor {
    /// Layout of a socket-filter style context.
    fn default() -> Self {
        ContextDescriptor {
            size: 192,
            data: 76,
            end: 80,
            meta: -1,
        }
    }
}

/// What a map stores as its values.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MapValueType {
    Any,
    /// Map-of-maps.
    Map,
    /// Program array.
    Program,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapDescriptor {
    pub original_fd: i32,
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    /// Fd of the template inner map for map-of-maps.
    pub inner_map_fd: Option<i32>,
    pub value_type: MapValueType,
    pub is_array: bool,
}

/// Helper-function prototypes.
pub trait Platform: fmt::Debug + Send + Sync {
    /// The call description of helper `id`, if the helper exists.
    fn helper(&self, id: i32) -> Option<Call>;

    fn is_helper_usable(&self, id: i32) -> bool {
        self.helper(id).is_some()
    }
}

/// A [`Platform`] backed by an in-memory table.
#[derive(Debug, Clone, Default)]
pub struct HelperTable {
    helpers: BTreeMap<i32, Call>,
}

impl HelperTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_helper(mut self, call: Call) -> Self {
        self.helpers.insert(call.func, call);
        self
    }
}

impl Platform for HelperTable {
    fn helper(&self, id: i32) -> Option<Call> {
        self.helpers.get(&id).cloned()
    }
}

/// Everything the analysis knows about the program besides its code.
#[derive(Debug, Clone)]
pub struct ProgramInfo {
    pub context: ContextDescriptor,
    pub maps: Vec<MapDescriptor>,
    pub platform: Arc<dyn Platform>,
    /// Privileged programs may leak pointers and compare them freely.
    pub privileged: bool,
}

impl Default for ProgramInfo {
    fn default() -> Self {
        ProgramInfo {
            context: ContextDescriptor::default(),
            maps: Vec::new(),
            platform: Arc::new(HelperTable::new()),
            privileged: false,
        }
    }
}

impl ProgramInfo {
    pub fn map_descriptor(&self, fd: i32) -> Option<&MapDescriptor> {
        self.maps.iter().find(|m| m.original_fd == fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(EBPF_TOTAL_STACK_SIZE, 4096);
        assert_eq!(PTR_MAX, 2147418112);
    }

    #[test]
    fn test_helper_table() {
        let table = HelperTable::new().with_helper(Call::new(1, "map_lookup_elem"));
        assert!(table.is_helper_usable(1));
        assert!(!table.is_helper_usable(2));
        assert_eq!(table.helper(1).map(|c| c.name), Some("map_lookup_elem".to_string()));
    }
}
