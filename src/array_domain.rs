//! Byte-addressable memory as a set of scalar cells.
//!
//! A cell `(offset, size)` of a given [`DataKind`] names the numeric variable
//! holding the content of bytes `[offset, offset + size)` of the stack for
//! that kind. Cells are created on demand and removed whenever a write may
//! overlap them; a cell's variable is only constrained while the cell is
//! live, so removing it forgets the variable too.
//!
//! Independently of the cells, [`NumericBytes`] records which bytes are known
//! to hold plain numbers.

use std::collections::{BTreeMap, BTreeSet};

use crate::bitset::NumericBytes;
use crate::context::AnalysisContext;
use crate::finite_domain::NumAbsDomain;
use crate::linear::{ge, le, LinearExpression};
use crate::number::Number;
use crate::platform::EBPF_TOTAL_STACK_SIZE;
use crate::type_encoding::TypeEncoding;
use crate::variable::{DataKind, Variable};

/// The byte range `[offset, offset + size)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cell {
    pub offset: i64,
    pub size: u32,
}

impl Cell {
    pub fn new(offset: i64, size: u32) -> Self {
        Cell { offset, size }
    }

    /// One past the last byte.
    pub fn end(&self) -> i64 {
        self.offset + self.size as i64
    }

    pub fn contains(&self, byte: i64) -> bool {
        self.offset <= byte && byte < self.end()
    }

    pub fn overlaps(&self, offset: i64, size: u32) -> bool {
        self.offset < offset + size as i64 && offset < self.end()
    }

    /// Might the cell overlap `[idx, idx + width)` in some concrete state of `inv`?
    fn may_overlap(&self, inv: &NumAbsDomain, idx: &LinearExpression, width: i64) -> bool {
        inv.intersect(&le(idx.clone(), self.end() - 1))
            && inv.intersect(&ge(idx.clone() + (width - 1), self.offset))
    }

    pub fn scalar(&self, ctx: &AnalysisContext, kind: DataKind) -> Variable {
        ctx.vars().cell_var(kind, self.offset, self.size)
    }
}

/// Live cells of one kind, grouped by offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct OffsetMap {
    cells: BTreeMap<i64, BTreeSet<u32>>,
}

impl OffsetMap {
    fn insert(&mut self, c: Cell) {
        self.cells.entry(c.offset).or_default().insert(c.size);
    }

    fn remove(&mut self, c: Cell) {
        if let Some(sizes) = self.cells.get_mut(&c.offset) {
            sizes.remove(&c.size);
            if sizes.is_empty() {
                self.cells.remove(&c.offset);
            }
        }
    }

    fn iter(&self) -> impl Iterator<Item = Cell> + '_ {
        self.cells
            .iter()
            .flat_map(|(offset, sizes)| sizes.iter().map(move |size| Cell::new(*offset, *size)))
    }

    /// Cells other than `(offset, size)` itself that share a byte with it.
    fn overlapping(&self, offset: i64, size: u32) -> Vec<Cell> {
        let end = offset + size as i64;
        self.cells
            .range(..end)
            .flat_map(|(o, sizes)| sizes.iter().map(move |s| Cell::new(*o, *s)))
            .filter(|c| c.overlaps(offset, size) && *c != Cell::new(offset, size))
            .collect()
    }

    /// Cells that may overlap the symbolic range `[idx, idx + width)`. All
    /// cells at one offset are taken together when the largest of them may
    /// overlap.
    fn symbolic_overlapping(&self, inv: &NumAbsDomain, idx: &LinearExpression, width: i64) -> Vec<Cell> {
        let mut out = Vec::new();
        for (offset, sizes) in &self.cells {
            let Some(largest) = sizes.last() else {
                continue;
            };
            if Cell::new(*offset, *largest).may_overlap(inv, idx, width) {
                out.extend(sizes.iter().map(|s| Cell::new(*offset, *s)));
            }
        }
        out
    }

    fn union(&self, other: &OffsetMap) -> OffsetMap {
        let mut out = self.clone();
        for c in other.iter() {
            out.insert(c);
        }
        out
    }
}

/// The memory domain of the stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArrayDomain {
    num_bytes: NumericBytes,
    maps: BTreeMap<DataKind, OffsetMap>,
}

/// Byte `i` (from the lowest address) of a `size`-byte value.
fn byte_of(bits: u64, i: u32, size: u32, big_endian: bool) -> u64 {
    let shift = if big_endian { size - 1 - i } else { i };
    (bits >> (8 * shift)) & 0xff
}

/// Composes bytes listed from the lowest address into a value.
fn compose(bytes: &[u64], big_endian: bool) -> u64 {
    let n = bytes.len() as u32;
    bytes.iter().enumerate().fold(0, |acc, (i, b)| {
        let shift = if big_endian { n - 1 - i as u32 } else { i as u32 };
        acc | (b << (8 * shift))
    })
}

/// The value a register receives from `size` bytes with pattern `bits`.
/// Narrow loads zero-extend; 8-byte loads keep the signedness of `kind`.
fn load_value(kind: DataKind, bits: u64, size: u32) -> Number {
    if size >= 8 && kind == DataKind::SValues {
        Number::from(bits as i64)
    } else {
        Number::from(bits)
    }
}

fn is_number_kind(kind: DataKind) -> bool {
    matches!(kind, DataKind::SValues | DataKind::UValues)
}

impl ArrayDomain {
    pub fn top() -> Self {
        Self::default()
    }

    pub fn set_to_top(&mut self) {
        *self = Self::top();
    }

    pub fn is_top(&self) -> bool {
        self.num_bytes.is_top()
    }

    pub fn num_bytes(&self) -> &NumericBytes {
        &self.num_bytes
    }

    /// Cells whose variables may currently be constrained.
    pub fn cells(&self, kind: DataKind) -> Vec<Cell> {
        self.maps.get(&kind).map(|m| m.iter().collect()).unwrap_or_default()
    }

    /// Starts tracking cell `c` of `kind`, e.g. for a state parsed from text.
    pub fn track_cell(&mut self, kind: DataKind, c: Cell) {
        self.map(kind).insert(c);
    }

    fn map(&mut self, kind: DataKind) -> &mut OffsetMap {
        self.maps.entry(kind).or_default()
    }

    fn union_maps(&self, other: &ArrayDomain) -> BTreeMap<DataKind, OffsetMap> {
        let mut out = self.maps.clone();
        for (kind, m) in &other.maps {
            let merged = match out.get(kind) {
                Some(mine) => mine.union(m),
                None => m.clone(),
            };
            out.insert(*kind, merged);
        }
        out
    }

    pub fn le(&self, other: &ArrayDomain) -> bool {
        self.num_bytes.le(&other.num_bytes)
    }

    pub fn join(&self, other: &ArrayDomain) -> ArrayDomain {
        ArrayDomain {
            num_bytes: self.num_bytes.join(&other.num_bytes),
            maps: self.union_maps(other),
        }
    }

    pub fn widen(&self, other: &ArrayDomain) -> ArrayDomain {
        ArrayDomain {
            num_bytes: self.num_bytes.widen(&other.num_bytes),
            maps: self.union_maps(other),
        }
    }

    pub fn meet(&self, other: &ArrayDomain) -> ArrayDomain {
        ArrayDomain {
            num_bytes: self.num_bytes.meet(&other.num_bytes),
            maps: self.union_maps(other),
        }
    }

    pub fn narrow(&self, other: &ArrayDomain) -> ArrayDomain {
        ArrayDomain {
            num_bytes: self.num_bytes.narrow(&other.num_bytes),
            maps: self.union_maps(other),
        }
    }

    /// The singleton `(offset, width)` of an access, if both are known.
    fn singleton_range(inv: &NumAbsDomain, idx: &LinearExpression, width: i64) -> Option<(i64, u32)> {
        let offset = inv.eval_interval(idx).singleton_value()?.to_i64()?;
        let size = u32::try_from(width).ok()?;
        Some((offset, size))
    }

    /// Forgets every cell of `kind` that may overlap the access and returns
    /// the exact range when it is statically known.
    fn kill(
        &mut self,
        ctx: &AnalysisContext,
        inv: &mut NumAbsDomain,
        kind: DataKind,
        idx: &LinearExpression,
        width: i64,
    ) -> Option<(i64, u32)> {
        let exact = Self::singleton_range(inv, idx, width);
        let cells = match exact {
            Some((offset, size)) => {
                let mut cells = self.map(kind).overlapping(offset, size);
                cells.push(Cell::new(offset, size));
                cells
            }
            None => self.map(kind).symbolic_overlapping(inv, idx, width),
        };
        for c in cells {
            inv.havoc(c.scalar(ctx, kind));
            self.map(kind).remove(c);
        }
        exact
    }

    /// Before `[offset, offset + size)` is overwritten, recreates the parts
    /// of partially overwritten numeric cells that stay intact. Only cells
    /// with a known value are split, and only into remainders of a size a
    /// load can ask for.
    fn split_remainders(
        &mut self,
        ctx: &AnalysisContext,
        inv: &mut NumAbsDomain,
        kind: DataKind,
        offset: i64,
        size: u32,
    ) -> Vec<(Cell, Number)> {
        let big_endian = ctx.options.big_endian;
        let mut out = Vec::new();
        for c in self.map(kind).overlapping(offset, size) {
            let Some(value) = inv.interval(c.scalar(ctx, kind)).singleton_value() else {
                continue;
            };
            let bits = value.as_u64_bits();
            let mut keep = |start: i64, end: i64| {
                let len = (end - start) as u32;
                if !matches!(len, 1 | 2 | 4 | 8) {
                    return;
                }
                let bytes: Vec<u64> = (start..end)
                    .map(|b| byte_of(bits, (b - c.offset) as u32, c.size, big_endian))
                    .collect();
                out.push((Cell::new(start, len), load_value(kind, compose(&bytes, big_endian), len)));
            };
            if c.offset < offset {
                keep(c.offset, offset.min(c.end()));
            }
            if c.end() > offset + size as i64 {
                keep((offset + size as i64).max(c.offset), c.end());
            }
        }
        out
    }

    /// The content of `[idx, idx + width)` for `kind`, or `None` when unknown.
    pub fn load(
        &mut self,
        ctx: &AnalysisContext,
        inv: &NumAbsDomain,
        kind: DataKind,
        idx: &LinearExpression,
        width: i64,
    ) -> Option<LinearExpression> {
        let Some((offset, size)) = Self::singleton_range(inv, idx, width) else {
            log::trace!("Ignored {} load at a non-constant offset", kind);
            return None;
        };
        if kind == DataKind::Types {
            let (only_num, only_non_num) = self.num_bytes.uniformity(offset, width);
            if only_num {
                return Some(LinearExpression::constant(TypeEncoding::Number.tag()));
            }
            if !only_non_num || width != 8 {
                return None;
            }
        }
        let overlapping = self.map(kind).overlapping(offset, size);
        if overlapping.is_empty() {
            let c = Cell::new(offset, size);
            self.map(kind).insert(c);
            return Some(c.scalar(ctx, kind).into());
        }
        if is_number_kind(kind) {
            if let Some(n) = self.reconstruct(ctx, inv, kind, &overlapping, offset, size) {
                return Some(LinearExpression::constant(n));
            }
        }
        log::trace!(
            "Ignored read from {}[{}...{}] because it overlaps with {} cells",
            kind,
            offset,
            offset + width - 1,
            overlapping.len()
        );
        None
    }

    /// Composes the loaded value byte by byte from overlapping cells whose
    /// values are known.
    fn reconstruct(
        &self,
        ctx: &AnalysisContext,
        inv: &NumAbsDomain,
        kind: DataKind,
        cells: &[Cell],
        offset: i64,
        size: u32,
    ) -> Option<Number> {
        if size > 8 {
            return None;
        }
        let big_endian = ctx.options.big_endian;
        let known: Vec<(Cell, u64)> = cells
            .iter()
            .filter_map(|c| {
                let v = inv.interval(c.scalar(ctx, kind)).singleton_value()?;
                Some((*c, v.as_u64_bits()))
            })
            .collect();
        let mut bytes = Vec::with_capacity(size as usize);
        for b in offset..offset + size as i64 {
            let (c, bits) = known.iter().find(|(c, _)| c.contains(b))?;
            bytes.push(byte_of(*bits, (b - c.offset) as u32, c.size, big_endian));
        }
        Some(load_value(kind, compose(&bytes, big_endian), size))
    }

    /// Prepares a strong update of `[idx, idx + width)` and returns the
    /// variable the caller must assign `value` to. A non-constant range only
    /// forgets what it may overwrite and returns `None`.
    pub fn store(
        &mut self,
        ctx: &AnalysisContext,
        inv: &mut NumAbsDomain,
        kind: DataKind,
        idx: &LinearExpression,
        width: i64,
        value: &LinearExpression,
    ) -> Option<Variable> {
        let remainders = match Self::singleton_range(inv, idx, width) {
            Some((offset, size)) if is_number_kind(kind) => self.split_remainders(ctx, inv, kind, offset, size),
            _ => Vec::new(),
        };
        let exact = self.kill(ctx, inv, kind, idx, width);
        for (c, v) in remainders {
            self.map(kind).insert(c);
            inv.assign(c.scalar(ctx, kind), v);
        }
        if kind == DataKind::Types {
            let is_num = inv.eval_interval(value).singleton_value() == Some(Number::from(TypeEncoding::Number.tag()));
            match exact {
                Some((offset, size)) if is_num => self.num_bytes.reset(offset, size as i64),
                Some((offset, size)) => self.num_bytes.havoc(offset, size as i64),
                None if is_num => {}
                None => self.havoc_num_bytes(inv, idx, width),
            }
        }
        let (offset, size) = exact?;
        let c = Cell::new(offset, size);
        self.map(kind).insert(c);
        Some(c.scalar(ctx, kind))
    }

    /// Forgets `kind` over `[idx, idx + width)`.
    pub fn havoc(
        &mut self,
        ctx: &AnalysisContext,
        inv: &mut NumAbsDomain,
        kind: DataKind,
        idx: &LinearExpression,
        width: i64,
    ) {
        let exact = self.kill(ctx, inv, kind, idx, width);
        if kind == DataKind::Types {
            match exact {
                Some((offset, size)) => self.num_bytes.havoc(offset, size as i64),
                None => self.havoc_num_bytes(inv, idx, width),
            }
        }
    }

    /// Every byte the range may cover stops being known numeric.
    fn havoc_num_bytes(&mut self, inv: &NumAbsDomain, idx: &LinearExpression, width: i64) {
        let range = inv.eval_interval(idx);
        let start = range.lb().number().and_then(|n| n.to_i64()).unwrap_or(0).max(0);
        let end = range
            .ub()
            .number()
            .and_then(|n| n.to_i64())
            .and_then(|ub| ub.checked_add(width))
            .unwrap_or(EBPF_TOTAL_STACK_SIZE)
            .min(EBPF_TOTAL_STACK_SIZE);
        if start < end {
            self.num_bytes.havoc(start, end - start);
        }
    }

    /// Forgets every kind over `[idx, idx + width)`.
    pub fn havoc_all_kinds(
        &mut self,
        ctx: &AnalysisContext,
        inv: &mut NumAbsDomain,
        idx: &LinearExpression,
        width: i64,
    ) {
        for kind in DataKind::ALL {
            self.havoc(ctx, inv, kind, idx, width);
        }
    }

    /// Marks `[idx, idx + width)` as numeric when the range is statically
    /// known and lies within the stack.
    pub fn store_numbers(&mut self, inv: &NumAbsDomain, idx: &LinearExpression, width: &LinearExpression) {
        let Some(offset) = inv.eval_interval(idx).singleton_value().and_then(|n| n.to_i64()) else {
            return;
        };
        let Some(size) = inv.eval_interval(width).singleton_value().and_then(|n| n.to_i64()) else {
            return;
        };
        if offset < 0 || offset + size > EBPF_TOTAL_STACK_SIZE {
            return;
        }
        self.num_bytes.reset(offset, size);
    }

    /// Are all bytes numeric from the least possible `lb` up to the greatest
    /// possible `ub`?
    pub fn all_num(&self, inv: &NumAbsDomain, lb: &LinearExpression, ub: &LinearExpression) -> bool {
        let min_lb = inv.eval_interval(lb).lb().number().and_then(|n| n.to_i32());
        let max_ub = inv.eval_interval(ub).ub().number().and_then(|n| n.to_i32());
        match (min_lb, max_ub) {
            (Some(lb), Some(ub)) => self.num_bytes.all_num(lb as i64, ub as i64),
            _ => false,
        }
    }

    /// Number of bytes known numeric from `offset` on, for every value the
    /// offset may take.
    pub fn min_all_num_size(&self, inv: &NumAbsDomain, offset: Variable) -> i64 {
        let range = inv.interval(offset);
        let lb = range.lb().number().and_then(|n| n.to_i32());
        let ub = range.ub().number().and_then(|n| n.to_i32());
        match (lb, ub) {
            (Some(lb), Some(ub)) => (self.num_bytes.all_num_width(lb as i64) - (ub as i64 - lb as i64)).max(0),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::VerifierOptions;
    use crate::interval::Interval;
    use crate::platform::ProgramInfo;

    fn at(offset: i64) -> LinearExpression {
        LinearExpression::constant(offset)
    }

    #[test]
    fn test_store_then_load() {
        let ctx = AnalysisContext::default();
        let mut inv = NumAbsDomain::top();
        let mut stack = ArrayDomain::top();
        let x = Variable::reg(DataKind::SValues, 1);
        inv.set(x, &Interval::new(3, 7));
        let cell = stack.store(&ctx, &mut inv, DataKind::SValues, &at(4088), 8, &x.into());
        let cell = cell.expect("constant offset");
        inv.assign(cell, x);
        let loaded = stack.load(&ctx, &inv, DataKind::SValues, &at(4088), 8);
        assert_eq!(loaded, Some(LinearExpression::variable(cell)));
        assert_eq!(inv.interval(cell), Interval::new(3, 7));
    }

    #[test]
    fn test_overlapping_store_kills_cell() {
        let ctx = AnalysisContext::default();
        let mut inv = NumAbsDomain::top();
        let mut stack = ArrayDomain::top();
        let x = Variable::reg(DataKind::SValues, 1);
        inv.set(x, &Interval::new(0, 100));
        let c8 = stack.store(&ctx, &mut inv, DataKind::SValues, &at(4080), 8, &x.into()).unwrap();
        inv.assign(c8, x);
        stack.store(&ctx, &mut inv, DataKind::SValues, &at(4084), 4, &x.into()).unwrap();
        assert!(inv.interval(c8).is_top());
        assert_eq!(stack.cells(DataKind::SValues), vec![Cell::new(4084, 4)]);
    }

    #[test]
    fn test_partial_overwrite_keeps_remainder() {
        let ctx = AnalysisContext::default();
        let mut inv = NumAbsDomain::top();
        let mut stack = ArrayDomain::top();
        let c8 = stack
            .store(&ctx, &mut inv, DataKind::SValues, &at(4088), 8, &at(0x1122_3344_5566_7788))
            .unwrap();
        inv.assign(c8, 0x1122_3344_5566_7788i64);
        let c4 = stack.store(&ctx, &mut inv, DataKind::SValues, &at(4092), 4, &at(0)).unwrap();
        inv.assign(c4, 0i64);

        // Little endian: the low half lives at the lower address.
        let low = stack.load(&ctx, &inv, DataKind::SValues, &at(4088), 4).unwrap();
        assert_eq!(inv.eval_interval(&low), Interval::singleton(0x5566_7788i64));
        let whole = stack.load(&ctx, &inv, DataKind::SValues, &at(4088), 8).unwrap();
        assert_eq!(inv.eval_interval(&whole), Interval::singleton(0x5566_7788i64));
    }

    #[test]
    fn test_big_endian_reconstruction() {
        let options = VerifierOptions {
            big_endian: true,
            ..VerifierOptions::default()
        };
        let ctx = AnalysisContext::new(ProgramInfo::default(), options);
        let mut inv = NumAbsDomain::top();
        let mut stack = ArrayDomain::top();
        let hi = stack.store(&ctx, &mut inv, DataKind::UValues, &at(0), 2, &at(0x0102)).unwrap();
        inv.assign(hi, 0x0102i64);
        let lo = stack.store(&ctx, &mut inv, DataKind::UValues, &at(2), 2, &at(0x0304)).unwrap();
        inv.assign(lo, 0x0304i64);
        let v = stack.load(&ctx, &inv, DataKind::UValues, &at(0), 4).unwrap();
        assert_eq!(inv.eval_interval(&v), Interval::singleton(0x0102_0304i64));
    }

    #[test]
    fn test_symbolic_store_kills_possible_overlaps() {
        let ctx = AnalysisContext::default();
        let mut inv = NumAbsDomain::top();
        let mut stack = ArrayDomain::top();
        for offset in [4000, 4064] {
            let c = stack.store(&ctx, &mut inv, DataKind::SValues, &at(offset), 8, &at(1)).unwrap();
            inv.assign(c, 1i64);
        }
        let i = Variable::reg(DataKind::StackOffsets, 2);
        inv.set(i, &Interval::new(4060, 4070));
        let r = stack.store(&ctx, &mut inv, DataKind::SValues, &i.into(), 4, &at(0));
        assert_eq!(r, None);
        assert_eq!(stack.cells(DataKind::SValues), vec![Cell::new(4000, 8)]);
    }

    #[test]
    fn test_types_and_numeric_bytes() {
        let ctx = AnalysisContext::default();
        let mut inv = NumAbsDomain::top();
        let mut stack = ArrayDomain::top();
        let num = at(TypeEncoding::Number.tag());
        stack.store(&ctx, &mut inv, DataKind::Types, &at(4088), 8, &num).unwrap();
        assert!(stack.all_num(&inv, &at(4088), &at(4096)));
        assert_eq!(stack.load(&ctx, &inv, DataKind::Types, &at(4090), 2), Some(num));

        let ctx_ptr = at(TypeEncoding::Ctx.tag());
        stack.store(&ctx, &mut inv, DataKind::Types, &at(4088), 8, &ctx_ptr).unwrap();
        assert!(!stack.all_num(&inv, &at(4088), &at(4096)));
        // A narrow read of pointer bytes is unknown.
        assert_eq!(stack.load(&ctx, &inv, DataKind::Types, &at(4088), 4), None);
    }

    #[test]
    fn test_min_all_num_size() {
        let mut inv = NumAbsDomain::top();
        let mut stack = ArrayDomain::top();
        stack.store_numbers(&inv, &at(4000), &at(16));
        let off = Variable::reg(DataKind::StackOffsets, 1);
        inv.set(off, &Interval::new(4000, 4004));
        assert_eq!(stack.min_all_num_size(&inv, off), 12);
        // Outside the stack nothing is recorded.
        stack.store_numbers(&inv, &at(4090), &at(16));
        assert!(!stack.all_num(&inv, &at(4090), &at(4096)));
    }

    #[test]
    fn test_havoc_below_stack_reaches_first_bytes() {
        let ctx = AnalysisContext::default();
        let mut inv = NumAbsDomain::top();
        let mut stack = ArrayDomain::top();
        stack.store_numbers(&inv, &at(0), &at(16));
        let off = Variable::reg(DataKind::StackOffsets, 2);
        inv.set(off, &Interval::new(-5, -3));
        stack.havoc(&ctx, &mut inv, DataKind::Types, &LinearExpression::variable(off), 8);
        // [-5, 5) may have been written.
        assert!(!stack.all_num(&inv, &at(0), &at(1)));
        assert!(!stack.all_num(&inv, &at(4), &at(5)));
        assert!(stack.all_num(&inv, &at(5), &at(16)));
    }

    #[test]
    fn test_join_keeps_common_numeric_bytes() {
        let inv = NumAbsDomain::top();
        let mut a = ArrayDomain::top();
        let mut b = ArrayDomain::top();
        a.store_numbers(&inv, &at(0), &at(8));
        b.store_numbers(&inv, &at(4), &at(8));
        let j = a.join(&b);
        assert!(a.le(&j) && b.le(&j));
        assert!(j.all_num(&inv, &at(4), &at(8)));
        assert!(!j.all_num(&inv, &at(0), &at(8)));
    }
}
