//! Two-stage Argon2id passphrase derivation.
//!
//! Stage 1 (`pwhash`) binds the passphrase alone and is expensive, so a
//! caller may cache it across files. Stage 2 (`authkey`) binds the
//! cached hash to a specific file nonce and is comparatively cheap.

use argon2::{Algorithm, Argon2, Params, Version};

use crate::error::{CovertError, Result};

/// Minimum passphrase length in bytes, not characters.
pub const MIN_PW_BYTES: usize = 8;

/// 256 MiB in KiB, the memory cost of both stages.
const MEM_KIB: u32 = 1 << 18;

fn argon2id(out: &mut [u8], passwd: &[u8], salt: &[u8], ops: u32) -> Result<()> {
    let params = Params::new(MEM_KIB, ops, 1, Some(out.len()))
        .map_err(|e| CovertError::Value(format!("argon2 parameters: {e}")))?;
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(passwd, salt, out)
        .map_err(|e| CovertError::Value(format!("argon2: {e}")))?;
    Ok(())
}

/// Time cost increase factor for short passphrases, up to 16x.
pub fn costfactor(pwd: &[u8]) -> u32 {
    1 << 12usize.saturating_sub(pwd.len()).min(31)
}

/// Stage 1: hash a passphrase into a cacheable 16-byte value.
pub fn pwhash(password: &[u8]) -> Result<[u8; 16]> {
    if password.len() < MIN_PW_BYTES {
        return Err(CovertError::Value("too short password".into()));
    }
    let mut out = [0u8; 16];
    argon2id(&mut out, password, b"covertpassphrase", 8 * costfactor(password))?;
    Ok(out)
}

/// Stage 2: bind a stage-1 hash to a file nonce.
pub fn authkey(pwhash: &[u8; 16], nonce: &[u8; 12]) -> Result<[u8; 32]> {
    let mut out = [0u8; 32];
    argon2id(&mut out, nonce, pwhash, 2)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn costfactor_scales_for_short_passphrases() {
        assert_eq!(costfactor(b"123456789012"), 1);
        assert_eq!(costfactor(b"12345678901"), 2);
        assert_eq!(costfactor(b"12345678"), 16);
        assert_eq!(costfactor(b"1234567890123456"), 1);
    }

    #[test]
    fn short_passphrases_rejected() {
        assert!(pwhash(b"1234567").is_err());
    }

    #[test]
    fn authkey_is_deterministic() {
        let pwh = [0x11u8; 16];
        let nonce = [0x22u8; 12];
        let a = authkey(&pwh, &nonce).unwrap();
        let b = authkey(&pwh, &nonce).unwrap();
        assert_eq!(a, b);
        let c = authkey(&pwh, &[0x23u8; 12]).unwrap();
        assert_ne!(a, c);
    }
}
