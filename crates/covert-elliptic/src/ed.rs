//! Ed25519 points in extended projective coordinates.
//!
//! Twisted Edwards curve a x^2 + y^2 = 1 + d x^2 y^2 with a = -1.
//! Points are (X, Y, Z, T) with x = X/Z, y = Y/Z, x*y = T/Z. Unlike the
//! hardened libraries this type handles all eight subgroups, which the
//! Elligator2 hiding depends on.

use std::fmt;
use std::ops::{Add, Neg, Sub};
use std::sync::LazyLock;

use num_bigint::BigUint;
use num_traits::Zero;

use crate::error::EllipticError;
use crate::fe::Fe;
use crate::scalar::{Q, Q8};

/// Curve constant d = -121665/121666.
pub static ED_D: LazyLock<Fe> =
    LazyLock::new(|| &(-Fe::from(121665u32)) / &Fe::from(121666u32));

/// The neutral element.
pub static ZERO: LazyLock<EdPoint> = LazyLock::new(|| EdPoint {
    x: Fe::zero(),
    y: Fe::one(),
    z: Fe::one(),
    t: Fe::zero(),
});

/// Prime group generator, y = 4/5.
pub static G: LazyLock<EdPoint> = LazyLock::new(|| {
    EdPoint::from_y(&(&Fe::from(4u32) / &Fe::from(5u32)), false).expect("generator")
});

/// Low order generator.
pub static L: LazyLock<EdPoint> = LazyLock::new(|| {
    let d = &*ED_D;
    let inner = &(&(d + &Fe::one()).sqrt().expect("d+1 square") + &Fe::one()) / d;
    let y = (-&inner).sqrt().expect("low order y");
    EdPoint::from_y(&y, false).expect("low order generator")
});

/// All eight low order points, LO[i] = i * L.
pub static LO: LazyLock<[EdPoint; 8]> = LazyLock::new(|| {
    let mut pts = Vec::with_capacity(8);
    let mut p = ZERO.clone();
    for _ in 0..8 {
        pts.push(p.clone());
        p = &p + &*L;
    }
    pts.try_into().expect("eight low order points")
});

// Subgroup lookup: index of q*P in LO maps back through i * q^-1 mod 8.
// q = 5 mod 8 and 5 is its own inverse, so the table is 5*i mod 8.
static LO_INDEX: [usize; 8] = [0, 5, 2, 7, 4, 1, 6, 3];

/// Dirty generator: randomises subgroups when multiplied by a dirty
/// scalar, while staying compatible with G on the prime component.
pub static D: LazyLock<EdPoint> = LazyLock::new(|| &*G + &LO[1]);

#[derive(Clone)]
pub struct EdPoint {
    x: Fe,
    y: Fe,
    z: Fe,
    t: Fe,
}

impl EdPoint {
    /// Expand affine coordinates to extended projective form.
    pub fn new(x: Fe, y: Fe) -> EdPoint {
        let t = &x * &y;
        EdPoint { x, y, z: Fe::one(), t }
    }

    /// Restore from a y coordinate and an is_negative flag.
    pub fn from_y(y: &Fe, negative: bool) -> Result<EdPoint, EllipticError> {
        let y2 = y.sq();
        let x2 = &(&y2 - &Fe::one()) / &(&(&*ED_D * &y2) + &Fe::one());
        if !x2.is_square() {
            return Err(EllipticError::NotOnCurve);
        }
        let p = EdPoint::new(x2.sqrt()?, y.clone());
        Ok(if p.is_negative() == negative { p } else { -&p })
    }

    /// Read a standard Ed25519 public key.
    pub fn from_bytes(b: &[u8]) -> Result<EdPoint, EllipticError> {
        let (val, sign) = Fe::from_bytes_masked(b)?;
        EdPoint::from_y(&val, sign)
    }

    /// Convert from a Curve25519 u coordinate and an Ed25519 sign.
    pub fn from_mont(u: &Fe, negative: bool) -> Result<EdPoint, EllipticError> {
        if *u == Fe::minus1() {
            // The point at infinity has no birational mapping.
            return Ok(ZERO.clone());
        }
        EdPoint::from_y(&(&(u - &Fe::one()) / &(u + &Fe::one())), negative)
    }

    /// Convert from a Curve25519 pk, taking the high bit as the sign.
    pub fn from_montbytes(b: &[u8]) -> Result<EdPoint, EllipticError> {
        let (u, sign) = Fe::from_bytes_masked(b)?;
        EdPoint::from_mont(&u, sign)
    }

    pub fn x(&self) -> Fe {
        &self.x / &self.z
    }

    pub fn y(&self) -> Fe {
        &self.y / &self.z
    }

    /// Standard 32-byte encoding: y with the parity of x in bit 255.
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = self.y().to_bytes();
        if self.is_negative() {
            out[31] |= 0x80;
        }
        out
    }

    /// The parity of the x coordinate, aka the sign.
    pub fn is_negative(&self) -> bool {
        let x = self.x();
        // x is zero only for ZERO and LO[4]; the latter answers by y.
        if !x.is_zero() {
            x.bit(0)
        } else {
            self.y().is_negative()
        }
    }

    /// The Curve25519 u coordinate (1+y)/(1-y); the sign is not included.
    pub fn mont(&self) -> Fe {
        let y = self.y();
        if y == Fe::one() {
            return Fe::minus1();
        }
        &(&Fe::one() + &y) / &(&Fe::one() - &y)
    }

    /// 32-byte Curve25519 pk with a zero high bit.
    pub fn montbytes(&self) -> [u8; 32] {
        self.mont().to_bytes()
    }

    /// 32-byte Curve25519 compatible pk with the sign on the high bit.
    pub fn montbytes_sign(&self) -> [u8; 32] {
        let mut out = self.montbytes();
        if self.is_negative() {
            out[31] |= 0x80;
        }
        out
    }

    /// An equal point with Z = 1.
    pub fn norm(&self) -> EdPoint {
        let zinv = self.z.inv();
        let x = &self.x * &zinv;
        let y = &self.y * &zinv;
        EdPoint::new(x, y)
    }

    /// The subgroup 0..7 this point lives in; 0 is the prime group.
    pub fn subgroup(&self) -> usize {
        let qp = self.mul(&Q);
        let idx = LO
            .iter()
            .position(|lo| qp == *lo)
            .expect("q*P is always low order");
        LO_INDEX[idx]
    }

    pub fn is_low_order(&self) -> bool {
        LO.iter().any(|lo| *self == *lo)
    }

    pub fn is_prime_group(&self) -> bool {
        !self.is_low_order() && self.subgroup() == 0
    }

    /// Project a dirty point to its corresponding prime group point.
    pub fn undirty(&self) -> EdPoint {
        let sg = self.subgroup();
        if sg == 0 {
            self.norm()
        } else {
            (self - &LO[sg]).norm()
        }
    }

    /// Scalar multiplication, reducing mod 8q to preserve the subgroup.
    pub fn mul(&self, s: &BigUint) -> EdPoint {
        let mut s = s % &*Q8;
        let mut q = ZERO.clone();
        let mut p = self.clone();
        while !s.is_zero() {
            if s.bit(0) {
                q = &q + &p;
            }
            p = &p + &p;
            s >>= 1;
        }
        q.norm()
    }
}

impl Add for &EdPoint {
    type Output = EdPoint;
    fn add(self, o: &EdPoint) -> EdPoint {
        let a = &(&self.y - &self.x) * &(&o.y - &o.x);
        let b = &(&self.y + &self.x) * &(&o.y + &o.x);
        let c = &(&(&Fe::from(2u32) * &self.t) * &o.t) * &*ED_D;
        let d = &(&Fe::from(2u32) * &self.z) * &o.z;
        let (e, f, g, h) = (&b - &a, &d - &c, &d + &c, &b + &a);
        EdPoint {
            x: &e * &f,
            y: &g * &h,
            z: &f * &g,
            t: &e * &h,
        }
    }
}

impl Sub for &EdPoint {
    type Output = EdPoint;
    fn sub(self, o: &EdPoint) -> EdPoint {
        self + &-o
    }
}

impl Neg for &EdPoint {
    type Output = EdPoint;
    fn neg(self) -> EdPoint {
        EdPoint {
            x: -&self.x,
            y: self.y.clone(),
            z: self.z.clone(),
            t: -&self.t,
        }
    }
}

impl PartialEq for EdPoint {
    fn eq(&self, o: &EdPoint) -> bool {
        // x1/z1 == x2/z2  <=>  x1*z2 == x2*z1, and likewise for y.
        &self.x * &o.z == &o.x * &self.z && &self.y * &o.z == &o.y * &self.z
    }
}

impl Eq for EdPoint {}

impl fmt::Debug for EdPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EdPoint({})", self.y())
    }
}
