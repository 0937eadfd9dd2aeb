//! Prime-field arithmetic modulo p = 2^255 - 19.
//!
//! Values are reduced into [0, p) by every constructor and operation.
//! This layer backs Elligator2 and the dirty-point math, where the
//! hardened curve libraries expose no field internals. It is not
//! constant time; the production X25519/Ed25519/AEAD paths do not go
//! through it.

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::sync::LazyLock;

use num_bigint::BigUint;
use num_traits::{One, Zero};

use crate::error::EllipticError;

/// Field prime p = 2^255 - 19.
pub static P: LazyLock<BigUint> =
    LazyLock::new(|| (BigUint::one() << 255u32) - BigUint::from(19u32));

/// (p - 1) / 2, the threshold of the sign convention and the chi exponent.
pub static P2: LazyLock<BigUint> = LazyLock::new(|| (&*P - 1u32) / 2u32);

static P4: LazyLock<BigUint> = LazyLock::new(|| (&*P - 1u32) / 4u32);
static P38: LazyLock<BigUint> = LazyLock::new(|| (&*P + 3u32) / 8u32);
static P58: LazyLock<BigUint> = LazyLock::new(|| (&*P - 5u32) / 8u32);

/// A field element in [0, p).
#[derive(Clone, PartialEq, Eq)]
pub struct Fe {
    val: BigUint,
}

static SQRTM1: LazyLock<Fe> = LazyLock::new(|| {
    // Square root of -1, needed by sqrt() itself so it is fixed up here.
    let r = Fe::from(2u32).pow(&P4).abs();
    debug_assert!(&r * &r == -Fe::one());
    r
});

impl Fe {
    pub fn new(val: BigUint) -> Fe {
        Fe { val: val % &*P }
    }

    pub fn zero() -> Fe {
        Fe { val: BigUint::zero() }
    }

    pub fn one() -> Fe {
        Fe { val: BigUint::one() }
    }

    pub fn minus1() -> Fe {
        Fe { val: &*P - 1u32 }
    }

    /// sqrt(-1) mod p.
    pub fn sqrtm1() -> Fe {
        SQRTM1.clone()
    }

    /// Interpret 32 little-endian bytes, reducing mod p.
    pub fn from_bytes(b: &[u8]) -> Result<Fe, EllipticError> {
        if b.len() != 32 {
            return Err(EllipticError::InvalidLength(32));
        }
        Ok(Fe::new(BigUint::from_bytes_le(b)))
    }

    /// Split 32 bytes into a 255-bit value and the high bit as a sign.
    pub fn from_bytes_masked(b: &[u8]) -> Result<(Fe, bool), EllipticError> {
        if b.len() != 32 {
            return Err(EllipticError::InvalidLength(32));
        }
        let mut v = BigUint::from_bytes_le(b);
        let sign = v.bit(255);
        v.set_bit(255, false);
        Ok((Fe::new(v), sign))
    }

    /// 32-byte little-endian encoding.
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        let raw = self.val.to_bytes_le();
        out[..raw.len()].copy_from_slice(&raw);
        out
    }

    pub fn value(&self) -> &BigUint {
        &self.val
    }

    pub fn is_zero(&self) -> bool {
        self.val.is_zero()
    }

    pub fn bit(&self, n: u64) -> bool {
        self.val.bit(n)
    }

    /// Sign convention: negative means val > (p-1)/2.
    pub fn is_negative(&self) -> bool {
        self.val > *P2
    }

    pub fn abs(&self) -> Fe {
        if self.is_negative() {
            -self
        } else {
            self.clone()
        }
    }

    pub fn pow(&self, e: &BigUint) -> Fe {
        Fe { val: self.val.modpow(e, &P) }
    }

    pub fn sq(&self) -> Fe {
        self * self
    }

    pub fn inv(&self) -> Fe {
        self.pow(&(&*P - 2u32))
    }

    /// Legendre symbol as a field element: 0, 1 or p-1.
    pub fn chi(&self) -> Fe {
        self.pow(&P2)
    }

    pub fn is_square(&self) -> bool {
        self.is_zero() || self.chi() == Fe::one()
    }

    /// The square root in [0, (p-1)/2], or an error if there is none.
    pub fn sqrt(&self) -> Result<Fe, EllipticError> {
        if !self.is_square() {
            return Err(EllipticError::NotSquare);
        }
        // p is congruent to 5 mod 8, so (p+3)/8 is an integer and zero is
        // its own square root.
        let mut root = self.pow(&P38);
        if &root * &root != *self {
            root = &root * &Fe::sqrtm1();
        }
        debug_assert!(&root * &root == *self);
        Ok(root.abs())
    }

    /// Fast inverse square root.
    ///
    /// Returns (sqrt(1/x), true) for a non-zero square,
    /// (sqrt(sqrt(-1)/x), false) for a non-square and (0, false) for zero.
    /// The sign of the root is not guaranteed.
    pub fn invsqrt(&self) -> (Fe, bool) {
        let mut isr = self.pow(&P58);
        let quartic = self * &isr.sq();
        if quartic == Fe::minus1() || quartic == -Fe::sqrtm1() {
            isr = &isr * &Fe::sqrtm1();
        }
        let is_square = quartic == Fe::one() || quartic == Fe::minus1();
        (isr, is_square)
    }
}

impl From<u32> for Fe {
    fn from(x: u32) -> Fe {
        Fe::new(BigUint::from(x))
    }
}

impl fmt::Debug for Fe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fe({})", self.val)
    }
}

impl fmt::Display for Fe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Little-endian hex, matching the byte encoding.
        for b in self.to_bytes() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl Add for &Fe {
    type Output = Fe;
    fn add(self, o: &Fe) -> Fe {
        Fe::new(&self.val + &o.val)
    }
}

impl Sub for &Fe {
    type Output = Fe;
    fn sub(self, o: &Fe) -> Fe {
        // BigUint cannot go negative, lift by p first.
        Fe::new(&self.val + &*P - &o.val)
    }
}

impl Mul for &Fe {
    type Output = Fe;
    fn mul(self, o: &Fe) -> Fe {
        Fe::new(&self.val * &o.val)
    }
}

impl Div for &Fe {
    type Output = Fe;
    fn div(self, o: &Fe) -> Fe {
        self * &o.inv()
    }
}

impl Neg for &Fe {
    type Output = Fe;
    fn neg(self) -> Fe {
        if self.val.is_zero() {
            Fe::zero()
        } else {
            Fe { val: &*P - &self.val }
        }
    }
}

impl Neg for Fe {
    type Output = Fe;
    fn neg(self) -> Fe {
        -&self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqrtm1_squares_to_minus_one() {
        let s = Fe::sqrtm1();
        assert_eq!(&s * &s, Fe::minus1());
    }

    #[test]
    fn sub_wraps_correctly() {
        let a = Fe::from(3u32);
        let b = Fe::from(5u32);
        assert_eq!(&(&a - &b) + &b, a);
    }

    #[test]
    fn sqrt_of_square_roundtrips() {
        for x in [2u32, 3, 9, 486662, 121665] {
            let fx = Fe::from(x);
            let sq = fx.sq();
            let root = sq.sqrt().unwrap();
            assert!(root == fx.abs() || root == (-&fx).abs());
            assert_eq!(&root * &root, sq);
        }
    }

    #[test]
    fn invsqrt_matches_sqrt_for_squares() {
        let x = Fe::from(4u32);
        let (isr, is_square) = x.invsqrt();
        assert!(is_square);
        // isr^2 == 1/x
        assert_eq!(&isr.sq() * &x, Fe::one());
    }

    #[test]
    fn invsqrt_of_zero() {
        let (isr, is_square) = Fe::zero().invsqrt();
        assert!(!is_square);
        assert!(isr.is_zero());
    }

    #[test]
    fn chi_detects_squares() {
        assert_eq!(Fe::from(4u32).chi(), Fe::one());
        // 2 is a non-square mod p
        assert_eq!(Fe::from(2u32).chi(), Fe::minus1());
        assert!(Fe::zero().chi().is_zero());
    }

    #[test]
    fn byte_roundtrip_and_sign_split() {
        let x = Fe::from(123456789u32);
        assert_eq!(Fe::from_bytes(&x.to_bytes()).unwrap(), x);

        let mut b = x.to_bytes();
        b[31] |= 0x80;
        let (val, sign) = Fe::from_bytes_masked(&b).unwrap();
        assert!(sign);
        assert_eq!(val, x);
    }

    #[test]
    fn is_negative_threshold() {
        assert!(!Fe::one().is_negative());
        assert!(Fe::minus1().is_negative());
        assert!(!Fe::new(P2.clone()).is_negative());
        assert!(Fe::new(&*P2 + 1u32).is_negative());
    }
}
