//! Group scalars and secret-key clamping.
//!
//! Scalars live mod q = 2^252 + 27742317777372353535851937790883648493.
//! Clamped scalars are multiples of 8 so that multiplying a dirty public
//! point never exposes low-order bits; dirty clamping keeps the low bits
//! to deliberately select a low-order component.

use std::sync::LazyLock;

use num_bigint::BigUint;
use num_traits::One;
use sha2::{Digest, Sha512};

use crate::error::EllipticError;

/// Group order q (both Ed25519 and Curve25519).
pub static Q: LazyLock<BigUint> = LazyLock::new(|| {
    (BigUint::one() << 252u32)
        + BigUint::parse_bytes(b"27742317777372353535851937790883648493", 10).unwrap()
});

/// 8 * q, the modulus for scalar multiplication over all eight subgroups.
pub static Q8: LazyLock<BigUint> = LazyLock::new(|| &*Q * 8u32);

/// Ed25519 standard clamping: clear the low 3 bits and bit 255, set bit 254.
pub fn clamp(x: &BigUint) -> BigUint {
    let mut v = x.clone();
    for bit in [0u64, 1, 2, 255] {
        v.set_bit(bit, false);
    }
    v.set_bit(254, true);
    v
}

/// Dirty clamping that keeps the low bits (selects a low-order component).
pub fn clamp_dirty(x: &BigUint) -> BigUint {
    let mut v = x.clone();
    v.set_bit(255, false);
    v.set_bit(254, true);
    v
}

/// SHA-512 as a little-endian 512-bit integer.
pub fn sha512_int(data: &[u8]) -> BigUint {
    BigUint::from_bytes_le(&Sha512::digest(data))
}

/// SHA-512 reduced mod q.
pub fn sha512_modq(data: &[u8]) -> BigUint {
    sha512_int(data) % &*Q
}

/// 32 little-endian bytes as an integer.
pub fn to_int(b: &[u8]) -> Result<BigUint, EllipticError> {
    if b.len() != 32 {
        return Err(EllipticError::InvalidLength(32));
    }
    Ok(BigUint::from_bytes_le(b))
}

/// Split off bit 255 as a sign and return (value, sign).
pub fn to_int_sign(b: &[u8]) -> Result<(BigUint, bool), EllipticError> {
    let mut v = to_int(b)?;
    let sign = v.bit(255);
    v.set_bit(255, false);
    Ok((v, sign))
}

/// 32-byte little-endian encoding; the value must fit.
pub fn to_bytes(x: &BigUint) -> [u8; 32] {
    let raw = x.to_bytes_le();
    debug_assert!(raw.len() <= 32);
    let mut out = [0u8; 32];
    out[..raw.len()].copy_from_slice(&raw);
    out
}

fn seed_scalar(edsk: &[u8]) -> Result<BigUint, EllipticError> {
    // Sodium-style edsk may carry the public key, making it 64 bytes.
    if edsk.len() != 32 && edsk.len() != 64 {
        return Err(EllipticError::InvalidLength(32));
    }
    let h = Sha512::digest(&edsk[..32]);
    Ok(BigUint::from_bytes_le(&h[..32]))
}

/// Ed25519 secret key bytes to a clamped scalar.
///
/// The public key is secret_scalar(edsk) * G for both Edwards and
/// Montgomery; the Curve25519 sk is its 32-byte encoding.
pub fn secret_scalar(edsk: &[u8]) -> Result<BigUint, EllipticError> {
    Ok(clamp(&seed_scalar(edsk)?))
}

/// Ed25519 secret key bytes to a partially clamped scalar.
///
/// dirty_scalar(edsk) * D equals the standard public key plus a low order
/// point selected by the uncleared low bits.
pub fn dirty_scalar(edsk: &[u8]) -> Result<BigUint, EllipticError> {
    Ok(clamp_dirty(&seed_scalar(edsk)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn q_has_known_low_bits() {
        // q = 5 mod 8, used by the subgroup index table.
        assert_eq!(&*Q % 8u32, BigUint::from(5u32));
    }

    #[test]
    fn clamp_forces_bits() {
        let all = (BigUint::one() << 256u32) - 1u32;
        let c = clamp(&all);
        assert!(!c.bit(0) && !c.bit(1) && !c.bit(2));
        assert!(c.bit(254));
        assert!(!c.bit(255));

        let d = clamp_dirty(&all);
        assert!(d.bit(0) && d.bit(1) && d.bit(2));
        assert!(d.bit(254));
        assert!(!d.bit(255));
    }

    #[test]
    fn dirty_minus_remainder_is_clamped() {
        let seed = [7u8; 32];
        let s = dirty_scalar(&seed).unwrap();
        let sg = &s % 8u32;
        assert_eq!(&s - &sg, secret_scalar(&seed).unwrap());
    }

    #[test]
    fn rejects_bad_lengths() {
        assert!(secret_scalar(&[0u8; 31]).is_err());
        assert!(to_int(&[0u8; 33]).is_err());
    }
}
