//! Thin ChaCha20-Poly1305-IETF wrapper.
//!
//! Allocating and in-place variants; the in-place calls work on a single
//! buffer so the caller's ciphertext slab doubles as the plaintext
//! output, matching how block finalization reuses its buffer.

use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::{AeadInPlace, ChaCha20Poly1305, KeyInit};

use crate::error::{CovertError, Result};

/// Poly1305 tag length appended to every ciphertext.
pub const TAGLEN: usize = 16;

fn cipher(key: &[u8; 32]) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(GenericArray::from_slice(key))
}

/// Encrypt into a fresh buffer of `message.len() + 16` bytes.
pub fn encrypt(
    message: &[u8],
    aad: Option<&[u8]>,
    nonce: &[u8; 12],
    key: &[u8; 32],
) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(message.len() + TAGLEN);
    buf.extend_from_slice(message);
    buf.resize(message.len() + TAGLEN, 0);
    encrypt_into(&mut buf, aad, nonce, key)?;
    Ok(buf)
}

/// Decrypt into a fresh buffer of `ciphertext.len() - 16` bytes.
pub fn decrypt(
    ciphertext: &[u8],
    aad: Option<&[u8]>,
    nonce: &[u8; 12],
    key: &[u8; 32],
) -> Result<Vec<u8>> {
    let mut buf = ciphertext.to_vec();
    let n = decrypt_into(&mut buf, aad, nonce, key)?;
    buf.truncate(n);
    Ok(buf)
}

/// Encrypt in place: `buf[..len-16]` holds the plaintext on entry and the
/// ciphertext on return, with the tag written to the final 16 bytes.
pub fn encrypt_into(
    buf: &mut [u8],
    aad: Option<&[u8]>,
    nonce: &[u8; 12],
    key: &[u8; 32],
) -> Result<()> {
    if buf.len() < TAGLEN {
        return Err(CovertError::Value("aead buffer shorter than a tag".into()));
    }
    let (body, tagslot) = buf.split_at_mut(buf.len() - TAGLEN);
    let tag = cipher(key)
        .encrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            aad.unwrap_or(&[]),
            body,
        )
        .map_err(|_| CovertError::Decrypt("encryption failed".into()))?;
    tagslot.copy_from_slice(&tag);
    Ok(())
}

/// Decrypt in place, returning the plaintext length `buf.len() - 16`.
///
/// On failure the buffer contents are unspecified.
pub fn decrypt_into(
    buf: &mut [u8],
    aad: Option<&[u8]>,
    nonce: &[u8; 12],
    key: &[u8; 32],
) -> Result<usize> {
    if buf.len() < TAGLEN {
        return Err(CovertError::Decrypt("ciphertext shorter than a tag".into()));
    }
    let (body, tagslot) = buf.split_at_mut(buf.len() - TAGLEN);
    let tag = *GenericArray::from_slice(tagslot);
    cipher(key)
        .decrypt_in_place_detached(GenericArray::from_slice(nonce), aad.unwrap_or(&[]), body, &tag)
        .map_err(|_| CovertError::Decrypt("decryption failed".into()))?;
    Ok(body.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];
    const NONCE: [u8; 12] = [1u8; 12];

    #[test]
    fn roundtrip_with_and_without_aad() {
        for aad in [None, Some(&b"header"[..])] {
            let ct = encrypt(b"hello blocks", aad, &NONCE, &KEY).unwrap();
            assert_eq!(ct.len(), 12 + TAGLEN);
            let pt = decrypt(&ct, aad, &NONCE, &KEY).unwrap();
            assert_eq!(pt, b"hello blocks");
        }
    }

    #[test]
    fn aad_mismatch_fails() {
        let ct = encrypt(b"data", Some(b"right"), &NONCE, &KEY).unwrap();
        assert!(decrypt(&ct, Some(b"wrong"), &NONCE, &KEY).is_err());
        assert!(decrypt(&ct, None, &NONCE, &KEY).is_err());
    }

    #[test]
    fn in_place_matches_allocating() {
        let mut buf = b"in-place plaintext".to_vec();
        buf.resize(buf.len() + TAGLEN, 0);
        encrypt_into(&mut buf, None, &NONCE, &KEY).unwrap();
        assert_eq!(buf, encrypt(b"in-place plaintext", None, &NONCE, &KEY).unwrap());

        let n = decrypt_into(&mut buf, None, &NONCE, &KEY).unwrap();
        assert_eq!(&buf[..n], b"in-place plaintext");
    }

    #[test]
    fn empty_message_still_authenticated() {
        let ct = encrypt(b"", None, &NONCE, &KEY).unwrap();
        assert_eq!(ct.len(), TAGLEN);
        assert_eq!(decrypt(&ct, None, &NONCE, &KEY).unwrap(), b"");
        let mut bad = ct.clone();
        bad[0] ^= 1;
        assert!(decrypt(&bad, None, &NONCE, &KEY).is_err());
    }

    #[test]
    fn flipping_any_region_fails() {
        let ct = encrypt(b"sensitive", None, &NONCE, &KEY).unwrap();
        for i in 0..ct.len() {
            let mut bad = ct.clone();
            bad[i] ^= 0x80;
            assert!(decrypt(&bad, None, &NONCE, &KEY).is_err(), "byte {i}");
        }
    }
}
