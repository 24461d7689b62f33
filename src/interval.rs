//! Interval abstract domain over [`Number`] with infinite bounds.
//!
//! Intervals are the non-relational fallback of the numeric domain: they are
//! used to over-approximate operations the difference graph cannot express
//! (multiplication by non-constants, division, bitwise operators, shifts).

use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

use crate::number::Number;

/// An interval bound: `-∞`, a finite number, or `+∞`.
///
/// Variant order gives the natural total order `-∞ < n < +∞`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bound {
    MinusInfinity,
    Finite(Number),
    PlusInfinity,
}

impl Bound {
    pub fn is_finite(&self) -> bool {
        matches!(self, Bound::Finite(_))
    }

    pub fn is_infinite(&self) -> bool {
        !self.is_finite()
    }

    pub fn number(&self) -> Option<&Number> {
        match self {
            Bound::Finite(n) => Some(n),
            _ => None,
        }
    }

    fn is_zero(&self) -> bool {
        matches!(self, Bound::Finite(n) if n.is_zero())
    }

    fn is_negative(&self) -> bool {
        match self {
            Bound::MinusInfinity => true,
            Bound::Finite(n) => n.is_negative(),
            Bound::PlusInfinity => false,
        }
    }
}

impl From<Number> for Bound {
    fn from(n: Number) -> Self {
        Bound::Finite(n)
    }
}

impl From<i64> for Bound {
    fn from(n: i64) -> Self {
        Bound::Finite(Number::from(n))
    }
}

impl From<i32> for Bound {
    fn from(n: i32) -> Self {
        Bound::Finite(Number::from(n))
    }
}

impl Add for &Bound {
    type Output = Bound;

    /// Adding opposite infinities never happens for well-formed intervals;
    /// it yields `+∞` for upper bounds by convention of the callers.
    fn add(self, rhs: &Bound) -> Bound {
        match (self, rhs) {
            (Bound::Finite(a), Bound::Finite(b)) => Bound::Finite(a + b),
            (Bound::MinusInfinity, Bound::PlusInfinity) | (Bound::PlusInfinity, Bound::MinusInfinity) => {
                Bound::PlusInfinity
            }
            (Bound::MinusInfinity, _) | (_, Bound::MinusInfinity) => Bound::MinusInfinity,
            (Bound::PlusInfinity, _) | (_, Bound::PlusInfinity) => Bound::PlusInfinity,
        }
    }
}

impl Neg for &Bound {
    type Output = Bound;

    fn neg(self) -> Bound {
        match self {
            Bound::MinusInfinity => Bound::PlusInfinity,
            Bound::Finite(n) => Bound::Finite(-n),
            Bound::PlusInfinity => Bound::MinusInfinity,
        }
    }
}

impl Mul for &Bound {
    type Output = Bound;

    /// `0 * ∞ = 0`.
    fn mul(self, rhs: &Bound) -> Bound {
        if self.is_zero() || rhs.is_zero() {
            return Bound::Finite(Number::zero());
        }
        match (self, rhs) {
            (Bound::Finite(a), Bound::Finite(b)) => Bound::Finite(a * b),
            _ => {
                if self.is_negative() == rhs.is_negative() {
                    Bound::PlusInfinity
                } else {
                    Bound::MinusInfinity
                }
            }
        }
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bound::MinusInfinity => write!(f, "-oo"),
            Bound::Finite(n) => write!(f, "{}", n),
            Bound::PlusInfinity => write!(f, "+oo"),
        }
    }
}

/// A closed interval `[lb, ub]`; empty when `lb > ub`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Interval {
    lb: Bound,
    ub: Bound,
}

impl Interval {
    pub fn new(lb: impl Into<Bound>, ub: impl Into<Bound>) -> Self {
        let lb = lb.into();
        let ub = ub.into();
        if lb > ub || lb == Bound::PlusInfinity || ub == Bound::MinusInfinity {
            Self::bottom()
        } else {
            Interval { lb, ub }
        }
    }

    pub fn top() -> Self {
        Interval {
            lb: Bound::MinusInfinity,
            ub: Bound::PlusInfinity,
        }
    }

    pub fn bottom() -> Self {
        Interval {
            lb: Bound::PlusInfinity,
            ub: Bound::MinusInfinity,
        }
    }

    pub fn singleton(n: impl Into<Number>) -> Self {
        let n = n.into();
        Interval {
            lb: Bound::Finite(n.clone()),
            ub: Bound::Finite(n),
        }
    }

    pub fn at_least(lb: impl Into<Number>) -> Self {
        Interval::new(Bound::Finite(lb.into()), Bound::PlusInfinity)
    }

    pub fn at_most(ub: impl Into<Number>) -> Self {
        Interval::new(Bound::MinusInfinity, Bound::Finite(ub.into()))
    }

    /// All values of a signed integer of `width` bits.
    pub fn signed_int(width: u32) -> Self {
        Interval::new(-Number::pow2(width - 1), Number::pow2(width - 1) - 1)
    }

    /// All values of an unsigned integer of `width` bits.
    pub fn unsigned_int(width: u32) -> Self {
        Interval::new(Number::zero(), Number::pow2(width) - 1)
    }

    /// Values that are non-negative both as signed and as unsigned integers.
    pub fn nonnegative_int(width: u32) -> Self {
        Interval::new(Number::zero(), Number::pow2(width - 1) - 1)
    }

    pub fn lb(&self) -> &Bound {
        &self.lb
    }

    pub fn ub(&self) -> &Bound {
        &self.ub
    }

    pub fn is_bottom(&self) -> bool {
        self.lb > self.ub
    }

    pub fn is_top(&self) -> bool {
        self.lb == Bound::MinusInfinity && self.ub == Bound::PlusInfinity
    }

    pub fn singleton_value(&self) -> Option<Number> {
        match (&self.lb, &self.ub) {
            (Bound::Finite(a), Bound::Finite(b)) if a == b => Some(a.clone()),
            _ => None,
        }
    }

    pub fn is_singleton(&self) -> bool {
        self.singleton_value().is_some()
    }

    pub fn contains(&self, n: &Number) -> bool {
        let b = Bound::Finite(n.clone());
        self.lb <= b && b <= self.ub
    }

    /// Number of elements minus one, when finite.
    pub fn finite_size(&self) -> Option<Number> {
        match (&self.lb, &self.ub) {
            (Bound::Finite(a), Bound::Finite(b)) if a <= b => Some(b - a),
            _ => None,
        }
    }

    /// Subset test.
    pub fn le(&self, other: &Interval) -> bool {
        if self.is_bottom() {
            return true;
        }
        if other.is_bottom() {
            return false;
        }
        other.lb <= self.lb && self.ub <= other.ub
    }

    pub fn join(&self, other: &Interval) -> Interval {
        if self.is_bottom() {
            return other.clone();
        }
        if other.is_bottom() {
            return self.clone();
        }
        Interval {
            lb: self.lb.clone().min(other.lb.clone()),
            ub: self.ub.clone().max(other.ub.clone()),
        }
    }

    pub fn meet(&self, other: &Interval) -> Interval {
        if self.is_bottom() || other.is_bottom() {
            return Interval::bottom();
        }
        Interval::new(self.lb.clone().max(other.lb.clone()), self.ub.clone().min(other.ub.clone()))
    }

    /// Standard interval widening: unstable bounds jump to infinity.
    pub fn widen(&self, other: &Interval) -> Interval {
        if self.is_bottom() {
            return other.clone();
        }
        if other.is_bottom() {
            return self.clone();
        }
        let lb = if other.lb < self.lb {
            Bound::MinusInfinity
        } else {
            self.lb.clone()
        };
        let ub = if other.ub > self.ub {
            Bound::PlusInfinity
        } else {
            self.ub.clone()
        };
        Interval { lb, ub }
    }

    /// Both bounds are finite and fit in the given range.
    pub fn is_within(&self, range: &Interval) -> bool {
        !self.is_bottom() && self.le(range)
    }

    fn finite_bounds(&self) -> Option<(&Number, &Number)> {
        match (&self.lb, &self.ub) {
            (Bound::Finite(a), Bound::Finite(b)) => Some((a, b)),
            _ => None,
        }
    }

    /// Smallest interval containing all given bounds.
    fn hull(bounds: &[Bound]) -> Interval {
        let lb = bounds.iter().min().cloned().unwrap_or(Bound::MinusInfinity);
        let ub = bounds.iter().max().cloned().unwrap_or(Bound::PlusInfinity);
        Interval::new(lb, ub)
    }

    /// Signed division with eBPF semantics (`x / 0 = 0`), truncating toward zero.
    pub fn sdiv(&self, other: &Interval) -> Interval {
        if self.is_bottom() || other.is_bottom() {
            return Interval::bottom();
        }
        if let (Some(a), Some(b)) = (self.singleton_value(), other.singleton_value()) {
            return if b.is_zero() {
                Interval::singleton(Number::zero())
            } else {
                Interval::singleton(&a / &b)
            };
        }
        let Some((dl, du)) = other.finite_bounds() else {
            return self.abs_hull();
        };
        let mut result = Interval::bottom();
        if other.contains(&Number::zero()) {
            result = Interval::singleton(Number::zero());
        }
        // Split the divisor around zero; each side has a sign-stable range.
        let parts = [
            Interval::new(dl.clone(), Number::min_of(du, &Number::from(-1))),
            Interval::new(Number::max_of(dl, &Number::one()), du.clone()),
        ];
        for part in parts.iter().filter(|p| !p.is_bottom()) {
            match self.finite_bounds() {
                Some((nl, nu)) => {
                    let Some((pl, pu)) = part.finite_bounds() else {
                        continue;
                    };
                    let corners = [nl / pl, nl / pu, nu / pl, nu / pu].map(Bound::Finite);
                    result = result.join(&Interval::hull(&corners));
                }
                None => result = result.join(&self.abs_hull()),
            }
        }
        result
    }

    /// `[-max|x|, max|x|]`: the range of any quotient of `x`.
    fn abs_hull(&self) -> Interval {
        match self.finite_bounds() {
            Some((l, u)) => {
                let m = Number::max_of(&l.abs(), &u.abs());
                Interval::new(-&m, m)
            }
            None => Interval::top(),
        }
    }

    /// Unsigned division over non-negative operands (`x / 0 = 0`).
    pub fn udiv(&self, other: &Interval) -> Interval {
        if self.is_bottom() || other.is_bottom() {
            return Interval::bottom();
        }
        let zero = Interval::singleton(Number::zero());
        if !self.lb.is_negative() && !other.lb.is_negative() {
            return self.sdiv(other).meet(&Interval::at_least(Number::zero())).join(&if other.contains(&Number::zero()) {
                zero
            } else {
                Interval::bottom()
            });
        }
        Interval::top()
    }

    /// Signed remainder with eBPF semantics (`x % 0 = x`).
    pub fn srem(&self, other: &Interval) -> Interval {
        if self.is_bottom() || other.is_bottom() {
            return Interval::bottom();
        }
        if let (Some(a), Some(b)) = (self.singleton_value(), other.singleton_value()) {
            return if b.is_zero() {
                self.clone()
            } else {
                Interval::singleton(&a % &b)
            };
        }
        let Some((dl, du)) = other.finite_bounds() else {
            return self.join(&self.abs_hull());
        };
        let m = Number::max_of(&dl.abs(), &du.abs()) - 1;
        let mut result = if !self.lb.is_negative() {
            Interval::new(Number::zero(), m)
        } else if self.ub.is_negative() || self.ub.is_zero() {
            Interval::new(-&m, Number::zero())
        } else {
            Interval::new(-&m, m)
        };
        if !self.is_top() {
            // A remainder never exceeds the dividend in magnitude.
            result = result.meet(&self.abs_hull().join(&Interval::singleton(Number::zero())));
        }
        if other.contains(&Number::zero()) {
            result = result.join(self);
        }
        result
    }

    /// Unsigned remainder over non-negative operands (`x % 0 = x`).
    pub fn urem(&self, other: &Interval) -> Interval {
        if self.is_bottom() || other.is_bottom() {
            return Interval::bottom();
        }
        if self.lb.is_negative() || other.lb.is_negative() {
            return Interval::top();
        }
        self.srem(other)
    }

    pub fn and(&self, other: &Interval) -> Interval {
        if self.is_bottom() || other.is_bottom() {
            return Interval::bottom();
        }
        if let (Some(a), Some(b)) = (self.singleton_value(), other.singleton_value()) {
            return Interval::singleton(&a & &b);
        }
        match (self.lb.is_negative(), other.lb.is_negative()) {
            (false, false) => Interval::new(Number::zero(), self.ub.clone().min(other.ub.clone())),
            (false, true) => Interval::new(Bound::Finite(Number::zero()), self.ub.clone()),
            (true, false) => Interval::new(Bound::Finite(Number::zero()), other.ub.clone()),
            (true, true) => Interval::top(),
        }
    }

    pub fn or(&self, other: &Interval) -> Interval {
        if self.is_bottom() || other.is_bottom() {
            return Interval::bottom();
        }
        if let (Some(a), Some(b)) = (self.singleton_value(), other.singleton_value()) {
            return Interval::singleton(&a | &b);
        }
        self.bitwise_upper(other, true)
    }

    pub fn xor(&self, other: &Interval) -> Interval {
        if self.is_bottom() || other.is_bottom() {
            return Interval::bottom();
        }
        if let (Some(a), Some(b)) = (self.singleton_value(), other.singleton_value()) {
            return Interval::singleton(&a ^ &b);
        }
        self.bitwise_upper(other, false)
    }

    /// For non-negative operands, the result fits in the bits of the larger one.
    fn bitwise_upper(&self, other: &Interval, keep_lower: bool) -> Interval {
        match (self.finite_bounds(), other.finite_bounds()) {
            (Some((l1, u1)), Some((l2, u2))) if !l1.is_negative() && !l2.is_negative() => {
                let bits = Number::max_of(u1, u2).bit_length() as u32;
                let lb = if keep_lower {
                    Number::max_of(l1, l2)
                } else {
                    Number::zero()
                };
                Interval::new(lb, Number::pow2(bits) - 1)
            }
            _ => Interval::top(),
        }
    }

    pub fn shl(&self, other: &Interval) -> Interval {
        if self.is_bottom() || other.is_bottom() {
            return Interval::bottom();
        }
        let Some(k) = other.singleton_value().and_then(|k| k.to_i64()) else {
            return Interval::top();
        };
        if !(0..64).contains(&k) {
            return Interval::top();
        }
        let k = k as u32;
        match self.finite_bounds() {
            Some((l, u)) => Interval::new(l << k, u << k),
            None => Interval::top(),
        }
    }

    /// Shift right; arithmetic on the mathematical value, which coincides
    /// with the logical shift for non-negative intervals.
    pub fn shr(&self, other: &Interval) -> Interval {
        if self.is_bottom() || other.is_bottom() {
            return Interval::bottom();
        }
        let Some(k) = other.singleton_value().and_then(|k| k.to_i64()) else {
            return Interval::top();
        };
        if !(0..64).contains(&k) {
            return Interval::top();
        }
        let k = k as u32;
        let lb = match &self.lb {
            Bound::Finite(l) => Bound::Finite(l >> k),
            b => b.clone(),
        };
        let ub = match &self.ub {
            Bound::Finite(u) => Bound::Finite(u >> k),
            b => b.clone(),
        };
        Interval::new(lb, ub)
    }
}

impl Default for Interval {
    fn default() -> Self {
        Interval::top()
    }
}

impl From<Number> for Interval {
    fn from(n: Number) -> Self {
        Interval::singleton(n)
    }
}

impl Add for &Interval {
    type Output = Interval;

    fn add(self, rhs: &Interval) -> Interval {
        if self.is_bottom() || rhs.is_bottom() {
            return Interval::bottom();
        }
        Interval::new(&self.lb + &rhs.lb, &self.ub + &rhs.ub)
    }
}

impl Neg for &Interval {
    type Output = Interval;

    fn neg(self) -> Interval {
        if self.is_bottom() {
            return Interval::bottom();
        }
        Interval::new(-&self.ub, -&self.lb)
    }
}

impl Sub for &Interval {
    type Output = Interval;

    fn sub(self, rhs: &Interval) -> Interval {
        self + &(-rhs)
    }
}

impl Mul for &Interval {
    type Output = Interval;

    fn mul(self, rhs: &Interval) -> Interval {
        if self.is_bottom() || rhs.is_bottom() {
            return Interval::bottom();
        }
        let corners = [
            &self.lb * &rhs.lb,
            &self.lb * &rhs.ub,
            &self.ub * &rhs.lb,
            &self.ub * &rhs.ub,
        ];
        Interval::hull(&corners)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bottom() {
            return write!(f, "_|_");
        }
        match self.singleton_value() {
            Some(n) => write!(f, "{}", n),
            None => write!(f, "[{}, {}]", self.lb, self.ub),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iv(a: i64, b: i64) -> Interval {
        Interval::new(a, b)
    }

    #[test]
    fn test_lattice() {
        let a = iv(0, 5);
        let b = iv(3, 10);
        assert_eq!(a.join(&b), iv(0, 10));
        assert_eq!(a.meet(&b), iv(3, 5));
        assert!(iv(6, 7).meet(&a).is_bottom());
        assert!(Interval::bottom().le(&a));
        assert!(a.le(&Interval::top()));
        assert!(!Interval::top().le(&a));
        assert_eq!(a.widen(&iv(0, 6)), Interval::at_least(0));
        assert_eq!(a.widen(&iv(-1, 5)), Interval::at_most(5));
        assert_eq!(a.widen(&iv(1, 4)), a);
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(&iv(1, 2) + &iv(10, 20), iv(11, 22));
        assert_eq!(&iv(1, 2) - &iv(10, 20), iv(-19, -8));
        assert_eq!(&iv(-2, 3) * &iv(4, 5), iv(-10, 15));
        assert_eq!(&Interval::at_least(1) * &iv(0, 0), iv(0, 0));
        assert_eq!(&Interval::at_least(1) * &iv(-1, -1), Interval::at_most(-1));
    }

    #[test]
    fn test_division() {
        assert_eq!(iv(10, 10).sdiv(&iv(3, 3)), iv(3, 3));
        assert_eq!(iv(10, 10).sdiv(&iv(0, 0)), iv(0, 0));
        assert_eq!(iv(0, 100).sdiv(&iv(2, 4)), iv(0, 50));
        assert!(iv(0, 100).sdiv(&iv(0, 4)).contains(&Number::zero()));
        assert_eq!(iv(7, 7).srem(&iv(0, 0)), iv(7, 7));
        assert_eq!(iv(0, 100).urem(&iv(1, 8)), iv(0, 7));
        assert_eq!(iv(0, 3).urem(&iv(1, 8)), iv(0, 3));
    }

    #[test]
    fn test_bitwise() {
        assert_eq!(iv(12, 12).and(&iv(10, 10)), iv(8, 8));
        assert_eq!(iv(0, 100).and(&iv(0, 15)), iv(0, 15));
        assert_eq!(iv(1, 5).or(&iv(2, 2)), iv(2, 7));
        assert_eq!(iv(3, 3).shl(&iv(2, 2)), iv(12, 12));
        assert_eq!(iv(-8, 16).shr(&iv(2, 2)), iv(-2, 4));
        assert!(iv(3, 3).shl(&iv(0, 2)).is_top());
    }

    #[test]
    fn test_display() {
        assert_eq!(iv(1, 1).to_string(), "1");
        assert_eq!(iv(1, 3).to_string(), "[1, 3]");
        assert_eq!(Interval::top().to_string(), "[-oo, +oo]");
    }
}
