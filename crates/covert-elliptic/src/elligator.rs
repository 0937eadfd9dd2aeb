//! Elligator2 over Curve25519, and the dirty-key hiding built on it.
//!
//! Maps between curve points and ~254-bit strings that are uniformly
//! random to an observer (section 5 of the Elligator paper). Only about
//! half of all public keys can be mapped; key generation retries until a
//! mappable key is found.
//!
//! Curve coordinates are called (u, v) following established
//! conventions, so the paper's "v" is called "w" here.

use std::sync::LazyLock;

use rand::RngCore;
use sha2::{Digest, Sha512};

use crate::ed::{EdPoint, G, LO};
use crate::error::EllipticError;
use crate::fe::Fe;
use crate::scalar::dirty_scalar;

/// Curve25519 constant A.
static A: LazyLock<Fe> = LazyLock::new(|| Fe::from(486662u32));

/// Arbitrary non-square, typically chosen to minimise computation.
/// 2 and sqrt(-1) both work fairly well; we stick to 2 for compatibility.
static NON_SQUARE: LazyLock<Fe> = LazyLock::new(|| Fe::from(2u32));

static UFACTOR: LazyLock<Fe> =
    LazyLock::new(|| -&(&*NON_SQUARE * &Fe::sqrtm1()));
static VFACTOR: LazyLock<Fe> =
    LazyLock::new(|| UFACTOR.sqrt().expect("ufactor is a square"));

fn curve_a() -> Fe {
    A.clone()
}

fn non_square() -> Fe {
    NON_SQUARE.clone()
}

fn ufactor() -> Fe {
    UFACTOR.clone()
}

fn vfactor() -> Fe {
    VFACTOR.clone()
}

/// Convert a 254-bit hash into a pair of curve coordinates.
pub fn fast_hash_to_curve(r: &Fe) -> (Fe, Fe) {
    let a = curve_a();
    let t1 = &r.sq() * &non_square(); // r1
    let u = &t1 + &Fe::one(); // r2
    let t2 = u.sq();
    let t3 = &(&(&a.sq() * &t1) - &t2) * &a; // numerator
    let denom = &t2 * &u; // denominator
    let (isr, is_square) = (&t3 * &denom).invsqrt();
    let mut u2 = &r.sq() * &ufactor();
    let mut v = r * &vfactor();
    if is_square {
        u2 = Fe::one();
        v = Fe::one();
    }
    v = &v * &(&t3 * &isr);
    u2 = &u2 * &(&(&(&-&a * &t3) * &t2) * &isr.sq());
    if is_square != v.is_negative() {
        v = -v;
    }
    (u2, v)
}

/// Convert a curve point into a pseudorandom 254-bit value.
///
/// Let sq = -non_square * u * (u+A). If sq is not a square, or u = -A,
/// there is no mapping. Otherwise r = sqrt(-(u+A)/u) for positive v and
/// r = sqrt(-u/(u+A)) for negative v, computed via one inverse square
/// root. Zero u aborts too; it never occurs in practice since scalar
/// multiplication with a trimmed scalar never yields zero.
pub fn fast_curve_to_hash(u: &Fe, v_is_negative: bool) -> Result<Fe, EllipticError> {
    let t = u + &curve_a();
    let r = &(&-&non_square() * u) * &t;
    let (isr, is_square) = r.invsqrt();
    if !is_square {
        return Err(EllipticError::NotHashable);
    }
    let chosen = if v_is_negative { &t } else { u };
    Ok((chosen * &isr).abs())
}

/// Reference implementation of S to point, straight from the paper.
pub fn hash_to_curve(r: &Fe) -> Result<(Fe, Fe), EllipticError> {
    let a = curve_a();
    let w = &-&a / &(&Fe::one() + &(&non_square() * &r.sq()));
    let e = (&(&w.pow(&3u32.into()) + &(&a * &w.sq())) + &w).chi();
    let half_a = Fe::new(a.value() / 2u32);
    let u = &(&e * &w) - &(&(&Fe::one() - &e) * &half_a);
    let v = &-&e * &(&(&u.pow(&3u32.into()) + &(&a * &u.sq())) + &u).sqrt()?;
    Ok((u, v))
}

/// Reference implementation of point to S, straight from the paper.
pub fn curve_to_hash(u: &Fe, v_is_negative: bool) -> Result<Fe, EllipticError> {
    if !is_hashable(u) {
        return Err(EllipticError::NotHashable);
    }
    let a = curve_a();
    if v_is_negative {
        (&-&(u + &a) / &(&non_square() * u)).sqrt()
    } else {
        (&-u / &(&non_square() * &(u + &a))).sqrt()
    }
}

/// Test if a point is hashable: u != -A and -2u(u+A) is a square.
pub fn is_hashable(u: &Fe) -> bool {
    *u != -curve_a() && (&(&-&non_square() * u) * &(u + &curve_a())).is_square()
}

/// Test if a 32-byte public key can be mapped.
pub fn is_hashable_bytes(pk: &[u8]) -> Result<bool, EllipticError> {
    Ok(is_hashable(&Fe::from_bytes(pk)?))
}

/// Convert an Ed25519 secret key into a 32-byte pseudorandom string.
///
/// The dirty scalar's low bits pick a low order component, placing the
/// public point in one of the eight subgroups while staying consistent
/// with the normal public key. Two deterministic bits derived from the
/// secret fill in the high bits that the mapping leaves clear.
pub fn eghide(edsk: &[u8]) -> Result<[u8; 32], EllipticError> {
    let s = dirty_scalar(edsk)?;
    let sg_idx = (&s % 8u32)
        .to_u32_digits()
        .first()
        .copied()
        .unwrap_or(0) as usize;
    let sg = num_bigint::BigUint::from(sg_idx as u32);
    let p = &G.mul(&(&s - &sg)) + &LO[sg_idx];
    let r = fast_curve_to_hash(&p.mont(), p.is_negative())?;
    let mut hidden = r.to_bytes();
    let mut tweak_input = b"DirtyElligator2:".to_vec();
    tweak_input.extend_from_slice(&edsk[..32]);
    hidden[31] ^= Sha512::digest(&tweak_input)[31] & 0xC0;
    Ok(hidden)
}

/// Convert a hidden key back into a (dirty) curve point.
///
/// Callers wanting the prime group public key project with `undirty`;
/// scalar multiplication with a clamped secret ignores the dirty
/// component on its own.
pub fn egreveal(hidden: &[u8]) -> Result<EdPoint, EllipticError> {
    if hidden.len() != 32 {
        return Err(EllipticError::InvalidLength(32));
    }
    let mut b: [u8; 32] = hidden.try_into().expect("length checked");
    b[31] &= 0x3F; // the two highest bits are tweak only
    let r = Fe::from_bytes(&b)?;
    let (u, v) = fast_hash_to_curve(&r);
    EdPoint::from_mont(&u, v.is_negative())
}

/// Generate a hideable Ed25519 secret key and its hidden form.
///
/// About half of all keys are hideable, so this loops a couple of times.
pub fn egcreate() -> ([u8; 32], [u8; 32]) {
    loop {
        let mut edsk = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut edsk);
        if let Ok(hidden) = eghide(&edsk) {
            return (edsk, hidden);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalar::secret_scalar;

    #[test]
    fn fast_and_reference_maps_agree() {
        for i in 1u32..40 {
            let r = Fe::from(i * 7919);
            let (u_fast, v_fast) = fast_hash_to_curve(&r);
            let (u_ref, v_ref) = hash_to_curve(&r).unwrap();
            assert_eq!(u_fast, u_ref, "u for r={i}");
            assert_eq!(v_fast, v_ref, "v for r={i}");
        }
    }

    #[test]
    fn curve_to_hash_inverts_hash_to_curve() {
        for i in 1u32..40 {
            let r = Fe::from(i * 104729);
            let r = r.abs();
            let (u, v) = fast_hash_to_curve(&r);
            let r2 = fast_curve_to_hash(&u, v.is_negative()).unwrap();
            // The mapping is bijective up to the sign choice of r.
            assert!(r2 == r.abs());
            let slow = curve_to_hash(&u, v.is_negative()).unwrap();
            assert_eq!(r2, slow);
        }
    }

    #[test]
    fn hidden_keys_reveal_to_the_same_public_key() {
        for _ in 0..8 {
            let (edsk, hidden) = egcreate();
            let revealed = egreveal(&hidden).unwrap();
            let expected = G.mul(&secret_scalar(&edsk).unwrap());
            assert_eq!(revealed.undirty(), expected);
        }
    }

    #[test]
    fn tweak_bits_are_deterministic_and_ignored() {
        let (edsk, hidden) = egcreate();
        assert_eq!(eghide(&edsk).unwrap(), hidden);
        let mut flipped = hidden;
        flipped[31] ^= 0xC0;
        assert_eq!(
            egreveal(&flipped).unwrap().to_bytes(),
            egreveal(&hidden).unwrap().to_bytes()
        );
    }

    #[test]
    fn roughly_half_of_keys_are_hideable() {
        let mut ok = 0;
        for i in 0..64u8 {
            if eghide(&[i.wrapping_mul(17).wrapping_add(1); 32]).is_ok() {
                ok += 1;
            }
        }
        assert!(ok > 16 && ok < 48, "hideable: {ok}/64");
    }

    #[test]
    fn unmappable_point_errors() {
        // u = -A is explicitly excluded from the mapping.
        let u = -curve_a();
        assert!(!is_hashable(&u));
        assert!(matches!(
            curve_to_hash(&u, false),
            Err(EllipticError::NotHashable)
        ));
    }
}
