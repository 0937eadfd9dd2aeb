//! Reference Ed25519 signatures over the extended-coordinate points.
//!
//! The container signs with the hardened library; this implementation
//! exists for the dirty-key machinery and cross-checking, and applies the
//! same strictness rules (low order rejection, canonical s).

use crate::ed::{EdPoint, G};
use crate::error::EllipticError;
use crate::scalar::{secret_scalar, sha512_modq, to_bytes, to_int, Q};
use sha2::{Digest, Sha512};

/// Standard Ed25519 signature.
pub fn ed_sign(edsk: &[u8], msg: &[u8]) -> Result<[u8; 64], EllipticError> {
    let a = secret_scalar(edsk)?;
    let prefix = &Sha512::digest(&edsk[..32])[32..];
    let biga = G.mul(&a);
    let mut rh = prefix.to_vec();
    rh.extend_from_slice(msg);
    let r = sha512_modq(&rh);
    let rs = G.mul(&r).to_bytes();
    let mut hh = rs.to_vec();
    hh.extend_from_slice(&biga.to_bytes());
    hh.extend_from_slice(msg);
    let h = sha512_modq(&hh);
    let s = (r + h * a) % &*Q;
    let mut out = [0u8; 64];
    out[..32].copy_from_slice(&rs);
    out[32..].copy_from_slice(&to_bytes(&s));
    Ok(out)
}

/// Standard Ed25519 signature verification.
pub fn ed_verify(edpk: &[u8], msg: &[u8], signature: &[u8]) -> Result<(), EllipticError> {
    if signature.len() != 64 {
        return Err(EllipticError::InvalidLength(64));
    }
    let biga = EdPoint::from_bytes(edpk).map_err(|_| EllipticError::InvalidPublicKey)?;
    if biga.is_low_order() {
        return Err(EllipticError::InvalidPublicKey);
    }
    let rs = &signature[..32];
    let r = EdPoint::from_bytes(rs).map_err(|_| EllipticError::InvalidRPoint)?;
    if r.is_low_order() {
        return Err(EllipticError::InvalidRPoint);
    }
    let s = to_int(&signature[32..])?;
    if s >= *Q {
        return Err(EllipticError::InvalidSValue);
    }
    let mut hh = rs.to_vec();
    hh.extend_from_slice(edpk);
    hh.extend_from_slice(msg);
    let h = sha512_modq(&hh);
    // Confirm that (r + h * a) * G == R + h * A.
    if G.mul(&s) != &r + &biga.mul(&h) {
        return Err(EllipticError::SignatureMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc8032_test_vector_empty_message() {
        let edsk =
            hex::decode("9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60")
                .unwrap();
        let edpk =
            hex::decode("d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a")
                .unwrap();
        let sig = ed_sign(&edsk, b"").unwrap();
        assert_eq!(
            hex::encode(sig),
            "e5564300c360ac729086e2cc806e828a84877f1eb8e5d974d873e06522490155\
             5fb8821590a33bacc61e39701cf9b46bd25bf5f0595bbe24655141438e7a100b"
        );
        ed_verify(&edpk, b"", &sig).unwrap();
    }

    #[test]
    fn rfc8032_test_vector_one_byte() {
        let edsk =
            hex::decode("4ccd089b28ff96da9db6c346ec114e0f5b8a319f35aba624da8cf6ed4fb8a6fb")
                .unwrap();
        let edpk =
            hex::decode("3d4017c3e843895a92b70aa74d1b7ebc9c982ccf2ec4968cc0cd55f12af4660c")
                .unwrap();
        let sig = ed_sign(&edsk, &[0x72]).unwrap();
        assert_eq!(
            hex::encode(sig),
            "92a009a9f0d4cab8720e820b5f642540a2b27b5416503f8fb3762223ebdb69da\
             085ac1e43e15996e458f3613d0f11d8c387b2eaeb4302aeeb00d291612bb0c00"
        );
        ed_verify(&edpk, &[0x72], &sig).unwrap();
    }

    #[test]
    fn tampered_signature_fails() {
        let edsk = [9u8; 32];
        let pk = G.mul(&secret_scalar(&edsk).unwrap()).to_bytes();
        let mut sig = ed_sign(&edsk, b"covert").unwrap();
        sig[3] ^= 1;
        assert!(ed_verify(&pk, b"covert", &sig).is_err());
    }

    #[test]
    fn high_s_rejected() {
        let edsk = [1u8; 32];
        let pk = G.mul(&secret_scalar(&edsk).unwrap()).to_bytes();
        let mut sig = ed_sign(&edsk, b"m").unwrap();
        // Add q to s: still passes the curve equation but is non-canonical.
        let s = to_int(&sig[32..]).unwrap() + &*Q;
        let raw = s.to_bytes_le();
        sig[32..32 + raw.len()].copy_from_slice(&raw);
        assert!(matches!(
            ed_verify(&pk, b"m", &sig),
            Err(EllipticError::InvalidSValue)
        ));
    }
}
