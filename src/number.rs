//! Arbitrary-precision integers used by the numeric domains.
//!
//! Abstract values are computed over mathematical integers; machine-width
//! wrapping is applied explicitly by the transformer through the
//! truncation helpers below.

use std::fmt;
use std::ops::{Add, BitAnd, BitOr, BitXor, Div, Mul, Neg, Rem, Shl, Shr, Sub};

use num_bigint::BigInt;

/// An unbounded signed integer.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Number(BigInt);

impl Number {
    pub fn zero() -> Self {
        Number(BigInt::from(0))
    }

    pub fn one() -> Self {
        Number(BigInt::from(1))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == BigInt::from(0)
    }

    pub fn is_negative(&self) -> bool {
        self.0 < BigInt::from(0)
    }

    /// `2^bits`.
    pub fn pow2(bits: u32) -> Self {
        Number(BigInt::from(1) << bits as usize)
    }

    pub fn abs(&self) -> Self {
        if self.is_negative() {
            -self
        } else {
            self.clone()
        }
    }

    pub fn min_of(a: &Number, b: &Number) -> Number {
        if a <= b {
            a.clone()
        } else {
            b.clone()
        }
    }

    pub fn max_of(a: &Number, b: &Number) -> Number {
        if a >= b {
            a.clone()
        } else {
            b.clone()
        }
    }

    pub fn to_i64(&self) -> Option<i64> {
        i64::try_from(&self.0).ok()
    }

    pub fn to_u64(&self) -> Option<u64> {
        u64::try_from(&self.0).ok()
    }

    pub fn to_i32(&self) -> Option<i32> {
        i32::try_from(&self.0).ok()
    }

    pub fn fits_i64(&self) -> bool {
        self.to_i64().is_some()
    }

    /// Reduces the value modulo `2^width`, yielding a value in `[0, 2^width)`.
    pub fn truncate_to_uint(&self, width: u32) -> Number {
        let modulus = BigInt::from(1) << width as usize;
        let r = &self.0 % &modulus;
        if r < BigInt::from(0) {
            Number(r + modulus)
        } else {
            Number(r)
        }
    }

    /// Reinterprets the low `width` bits as a two's-complement value.
    pub fn truncate_to_sint(&self, width: u32) -> Number {
        let u = self.truncate_to_uint(width);
        let half = Number::pow2(width - 1);
        if u >= half {
            u - Number::pow2(width)
        } else {
            u
        }
    }

    /// The low 64 bits as an unsigned machine word.
    pub fn as_u64_bits(&self) -> u64 {
        self.truncate_to_uint(64).to_u64().unwrap_or(0)
    }

    /// The low 64 bits as a signed machine word.
    pub fn as_i64_bits(&self) -> i64 {
        self.as_u64_bits() as i64
    }

    /// Number of bits needed to represent a non-negative value.
    pub fn bit_length(&self) -> u64 {
        self.0.bits()
    }
}

macro_rules! impl_from_primitive {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Number {
                fn from(value: $t) -> Self {
                    Number(BigInt::from(value))
                }
            }
        )*
    };
}

impl_from_primitive!(i8, i16, i32, i64, u8, u16, u32, u64, usize);

macro_rules! impl_binop {
    ($Trait:ident, $method:ident) => {
        impl $Trait for Number {
            type Output = Number;
            fn $method(self, rhs: Number) -> Number {
                Number($Trait::$method(self.0, rhs.0))
            }
        }

        impl<'a> $Trait<&'a Number> for Number {
            type Output = Number;
            fn $method(self, rhs: &'a Number) -> Number {
                Number($Trait::$method(self.0, &rhs.0))
            }
        }

        impl<'a, 'b> $Trait<&'b Number> for &'a Number {
            type Output = Number;
            fn $method(self, rhs: &'b Number) -> Number {
                Number($Trait::$method(&self.0, &rhs.0))
            }
        }

        impl $Trait<i64> for Number {
            type Output = Number;
            fn $method(self, rhs: i64) -> Number {
                Number($Trait::$method(self.0, BigInt::from(rhs)))
            }
        }

        impl<'a> $Trait<i64> for &'a Number {
            type Output = Number;
            fn $method(self, rhs: i64) -> Number {
                Number($Trait::$method(&self.0, &BigInt::from(rhs)))
            }
        }
    };
}

impl_binop!(Add, add);
impl_binop!(Sub, sub);
impl_binop!(Mul, mul);
impl_binop!(Div, div);
impl_binop!(Rem, rem);
impl_binop!(BitAnd, bitand);
impl_binop!(BitOr, bitor);
impl_binop!(BitXor, bitxor);

impl Neg for Number {
    type Output = Number;
    fn neg(self) -> Number {
        Number(-self.0)
    }
}

impl Neg for &Number {
    type Output = Number;
    fn neg(self) -> Number {
        Number(-&self.0)
    }
}

impl Shl<u32> for &Number {
    type Output = Number;
    fn shl(self, rhs: u32) -> Number {
        Number(&self.0 << rhs as usize)
    }
}

/// Arithmetic shift: rounds toward negative infinity.
impl Shr<u32> for &Number {
    type Output = Number;
    fn shr(self, rhs: u32) -> Number {
        Number(&self.0 >> rhs as usize)
    }
}

impl PartialEq<i64> for Number {
    fn eq(&self, other: &i64) -> bool {
        self.0 == BigInt::from(*other)
    }
}

impl PartialOrd<i64> for Number {
    fn partial_cmp(&self, other: &i64) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(&BigInt::from(*other))
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Number {
    type Err = num_bigint::ParseBigIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<BigInt>().map(Number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncation() {
        let x = Number::from(-1i64);
        assert_eq!(x.truncate_to_uint(8), Number::from(255));
        assert_eq!(x.truncate_to_uint(64), Number::from(u64::MAX));
        assert_eq!(Number::from(255).truncate_to_sint(8), Number::from(-1));
        assert_eq!(Number::from(127).truncate_to_sint(8), Number::from(127));
        assert_eq!(Number::from(0x1_0000_0005u64).truncate_to_uint(32), Number::from(5));
    }

    #[test]
    fn test_machine_words() {
        assert_eq!(Number::from(-2).as_u64_bits(), u64::MAX - 1);
        assert_eq!(Number::from(u64::MAX).as_i64_bits(), -1);
        assert_eq!(Number::from(i64::MAX).to_i64(), Some(i64::MAX));
        assert_eq!((Number::from(i64::MAX) + 1).to_i64(), None);
    }

    #[test]
    fn test_arithmetic() {
        let a = Number::from(7);
        let b = Number::from(-2);
        assert_eq!(&a + &b, Number::from(5));
        assert_eq!(&a * &b, Number::from(-14));
        // Division truncates toward zero.
        assert_eq!(&a / &b, Number::from(-3));
        assert_eq!(&a % &b, Number::from(1));
        assert_eq!(&b >> 1, Number::from(-1));
        assert_eq!(&a << 3, Number::from(56));
        assert!(b < 0);
    }
}
