//! Signal's XEdDSA signature scheme (XEd25519).
//!
//! Signs under a Curve25519 secret key. The math runs on Ed25519 with the
//! keys converted over; public points inside signatures use the Ed25519
//! format. The sign of the public key in Edwards form is stored in the
//! highest bit of s, matching what Signal's implementation does even
//! though their specification does not mention it, so the private scalar
//! is never manipulated.

use num_bigint::BigUint;
use num_traits::One;

use crate::ed::{EdPoint, G};
use crate::error::EllipticError;
use crate::scalar::{clamp, sha512_int, to_bytes, to_int, to_int_sign, Q};

/// The domain-separating hash from the specification, mod q.
///
/// With `n` present the hash is prefixed by 2^256 - 1 - n as 32 bytes.
fn hashn(data: &[u8], n: Option<u32>) -> BigUint {
    let mut buf = Vec::with_capacity(32 + data.len());
    if let Some(n) = n {
        let prefix = (BigUint::one() << 256u32) - 1u32 - n;
        buf.extend_from_slice(&prefix.to_bytes_le());
    }
    buf.extend_from_slice(data);
    sha512_int(&buf) % &*Q
}

pub fn xed_sign(sk: &[u8], message: &[u8], nonce: &[u8]) -> Result<[u8; 64], EllipticError> {
    if nonce.len() != 64 {
        return Err(EllipticError::InvalidNonce);
    }
    // Secret scalars
    let a = clamp(&to_int(sk)?);
    let mut rdata = sk.to_vec();
    rdata.extend_from_slice(message);
    rdata.extend_from_slice(nonce);
    let r = hashn(&rdata, Some(1));
    // Public points
    let biga = G.mul(&a);
    let bigr = G.mul(&r);
    // Calculate a signature
    let mut hdata = bigr.to_bytes().to_vec();
    hdata.extend_from_slice(&biga.to_bytes());
    hdata.extend_from_slice(message);
    let h = hashn(&hdata, None);
    let mut s = (r + h * a) % &*Q;
    if biga.is_negative() {
        // Inject the sign of A into bit 255
        s.set_bit(255, true);
    }
    let mut out = [0u8; 64];
    out[..32].copy_from_slice(&bigr.to_bytes());
    out[32..].copy_from_slice(&to_bytes(&s));
    Ok(out)
}

pub fn xed_verify(pk: &[u8], message: &[u8], signature: &[u8]) -> Result<(), EllipticError> {
    if signature.len() != 64 {
        return Err(EllipticError::InvalidLength(64));
    }
    let mut biga =
        EdPoint::from_montbytes(pk).map_err(|_| EllipticError::InvalidPublicKey)?;
    if biga.is_low_order() {
        return Err(EllipticError::InvalidPublicKey);
    }
    let bigr = EdPoint::from_bytes(&signature[..32]).map_err(|_| EllipticError::InvalidRPoint)?;
    if bigr.is_low_order() {
        return Err(EllipticError::InvalidRPoint);
    }
    // Restore the sign of A from the high bit of s
    let (s, sign) = to_int_sign(&signature[32..])?;
    if sign {
        biga = -&biga;
    }
    if s >= *Q {
        return Err(EllipticError::InvalidSValue);
    }
    let mut hdata = signature[..32].to_vec();
    hdata.extend_from_slice(&biga.to_bytes());
    hdata.extend_from_slice(message);
    let h = hashn(&hdata, None);
    if bigr != &G.mul(&s) - &biga.mul(&h) {
        return Err(EllipticError::SignatureMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mont::scalarmult;
    use crate::fe::Fe;
    use crate::scalar::secret_scalar;

    fn curve_keypair(seed: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
        let a = secret_scalar(seed).unwrap();
        let sk = to_bytes(&a);
        let pk = scalarmult(&a, &Fe::from(9u32)).to_bytes();
        (sk, pk)
    }

    #[test]
    fn sign_verify_roundtrip() {
        let (sk, pk) = curve_keypair(&[3u8; 32]);
        let nonce = [0x5au8; 64];
        let sig = xed_sign(&sk, b"xeddsa message", &nonce).unwrap();
        xed_verify(&pk, b"xeddsa message", &sig).unwrap();
    }

    #[test]
    fn sign_bit_carries_across_keys() {
        // Both sign classes of A must appear and verify over many keys.
        let mut seen = [false; 2];
        for i in 0..16u8 {
            let (sk, pk) = curve_keypair(&[i + 1; 32]);
            let sig = xed_sign(&sk, b"m", &[7u8; 64]).unwrap();
            seen[(sig[63] >> 7) as usize] = true;
            xed_verify(&pk, b"m", &sig).unwrap();
        }
        assert!(seen[0] && seen[1]);
    }

    #[test]
    fn wrong_message_fails() {
        let (sk, pk) = curve_keypair(&[8u8; 32]);
        let sig = xed_sign(&sk, b"original", &[1u8; 64]).unwrap();
        assert!(xed_verify(&pk, b"tampered", &sig).is_err());
    }

    #[test]
    fn short_nonce_rejected() {
        let (sk, _) = curve_keypair(&[9u8; 32]);
        assert!(matches!(
            xed_sign(&sk, b"m", &[0u8; 32]),
            Err(EllipticError::InvalidNonce)
        ));
    }
}
