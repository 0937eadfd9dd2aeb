//! Curve25519 Montgomery ladder on the u coordinate only.
//!
//! The point at infinity is represented by u = -1 because
//! - no established standard exists in other libraries (most use zero,
//!   which is a different low order point),
//! - it is the only value with no birational conversion to Ed25519,
//! - it is not a valid point on the curve (v^2 = 486660 is not square),
//! - the ladder itself misbehaves with this value.

use num_bigint::BigUint;

use crate::error::EllipticError;
use crate::fe::Fe;
use crate::scalar::Q8;

/// Montgomery curve constant: B v^2 = u^3 + A u^2 + u.
pub fn curve_a() -> Fe {
    Fe::from(486662u32)
}

/// The v coordinate for a point, checking point validity as well.
pub fn v(u: &Fe) -> Result<Fe, EllipticError> {
    let v2 = &(&u.pow(&3u32.into()) + &(&curve_a() * &u.sq())) + u;
    if v2.is_square() {
        return v2.sqrt();
    }
    if *u == Fe::minus1() {
        // The point at infinity has no coordinates.
        return Err(EllipticError::NotOnCurve);
    }
    Err(EllipticError::NotOnCurve)
}

/// Multiply the point with u coordinate `u` by scalar `s`.
pub fn scalarmult(s: &BigUint, u: &Fe) -> Fe {
    let s = s % &*Q8;
    // Special care for the two low order points the algorithm mishandles.
    if *u == Fe::minus1() {
        return Fe::minus1(); // infinity absorbs everything
    }
    if u.is_zero() {
        // The order 2 point: odd multiples stay, even ones reach infinity.
        return if s.bit(0) { Fe::zero() } else { Fe::minus1() };
    }
    // Ladder in projective coordinates to avoid divisions: u = X / Z.
    let (mut x2, mut z2) = (Fe::one(), Fe::zero()); // "zero" point
    let (mut x3, mut z3) = (u.clone(), Fe::one()); // "one" point
    let mut swap = false;
    for n in (0..s.bits()).rev() {
        let bit = s.bit(n);
        swap ^= bit;
        if swap {
            std::mem::swap(&mut x2, &mut x3);
            std::mem::swap(&mut z2, &mut z3);
        }
        swap = bit; // anticipates one last swap after the loop

        // Ladder step: (P2, P3) -> (2*P2, P2+P3) by differential addition.
        let a = &x2 + &z2;
        let b = &x2 - &z2;
        let (aa, bb) = (a.sq(), b.sq());
        let da = &a * &(&x3 - &z3);
        let db = &b * &(&x3 + &z3);
        let e = &aa - &bb;
        x3 = (&da + &db).sq();
        z3 = &(&da - &db).sq() * u;
        x2 = &aa * &bb;
        z2 = &(&bb + &(&Fe::from(121666u32) * &e)) * &e;
    }
    if swap {
        std::mem::swap(&mut x2, &mut x3);
        std::mem::swap(&mut z2, &mut z3);
    }
    // Normalise u = X / Z; Z = 0 encodes zero or infinity.
    if !z2.is_zero() {
        &x2 / &z2
    } else if x2.is_zero() {
        Fe::zero()
    } else {
        Fe::minus1()
    }
}
