//! The unified key object.
//!
//! A `Key` carries whatever subset of Curve25519/Ed25519 material is
//! known, converting between forms on construction and validating that
//! supplied pairs belong together. Freshly generated keys are guaranteed
//! Elligator2-hideable and carry their hidden form in `pkhash`.

use std::fmt;
use std::hash::{Hash, Hasher};

use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::Signer;
use sha2::{Digest, Sha512};
use zeroize::Zeroize;

use covert_elliptic::{egcreate, eghide, egreveal};

use crate::error::{CovertError, Result};

#[derive(Clone, Default)]
pub struct Key {
    /// Curve25519 secret scalar bytes (clamped on use by X25519).
    pub sk: Option<[u8; 32]>,
    /// Curve25519 public key (Montgomery u coordinate).
    pub pk: Option<[u8; 32]>,
    /// Ed25519 secret seed.
    pub edsk: Option<[u8; 32]>,
    /// Ed25519 public key.
    pub edpk: Option<[u8; 32]>,
    /// Elligator2-hidden public key; present on generated keys.
    pub pkhash: Option<[u8; 32]>,
    /// The string this key was parsed from, for UI reporting.
    pub keystr: String,
    pub comment: String,
}

/// Convert an Ed25519 seed to an X25519 secret, like libsodium's
/// `crypto_sign_ed25519_sk_to_curve25519`: SHA-512, first half, clamp.
pub fn ed_to_curve_sk(seed: &[u8; 32]) -> [u8; 32] {
    let h = Sha512::digest(seed);
    let mut sk = [0u8; 32];
    sk.copy_from_slice(&h[..32]);
    sk[0] &= 248;
    sk[31] &= 127;
    sk[31] |= 64;
    sk
}

/// Convert an Ed25519 public key to X25519 via the birational map.
pub fn ed_to_curve_pk(edpk: &[u8; 32]) -> Result<[u8; 32]> {
    let point = CompressedEdwardsY(*edpk)
        .decompress()
        .ok_or_else(|| CovertError::MalformedKey("invalid Ed25519 public key".into()))?;
    Ok(point.to_montgomery().to_bytes())
}

impl Key {
    /// Generate a fresh key, retrying until it is Elligator2-hideable.
    pub fn new() -> Key {
        let (edsk, pkhash) = egcreate();
        let mut key = Key::default();
        key.edsk = Some(edsk);
        key.pkhash = Some(pkhash);
        key.derive_public();
        key
    }

    pub fn from_sk(sk: [u8; 32]) -> Key {
        let mut key = Key::default();
        key.sk = Some(sk);
        key.derive_public();
        key
    }

    pub fn from_pk(pk: [u8; 32]) -> Key {
        let mut key = Key::default();
        key.pk = Some(pk);
        key
    }

    /// Accepts a 32-byte seed or the sodium-style 64-byte seed+pk form.
    pub fn from_edsk(edsk: &[u8]) -> Result<Key> {
        if edsk.len() != 32 && edsk.len() != 64 {
            return Err(CovertError::MalformedKey("invalid edsk length".into()));
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&edsk[..32]);
        let mut key = Key::default();
        key.edsk = Some(seed);
        key.derive_public();
        if edsk.len() == 64 {
            let mut given = [0u8; 32];
            given.copy_from_slice(&edsk[32..]);
            if key.edpk != Some(given) {
                return Err(CovertError::MalformedKey(
                    "edsk does not match the attached edpk".into(),
                ));
            }
        }
        Ok(key)
    }

    pub fn from_edpk(edpk: [u8; 32]) -> Result<Key> {
        let pk = ed_to_curve_pk(&edpk)?;
        let mut key = Key::default();
        key.edpk = Some(edpk);
        key.pk = Some(pk);
        Ok(key)
    }

    /// Restore the public key from its Elligator2-hidden form.
    ///
    /// The revealed point is dirty; clamped secret scalars ignore the low
    /// order component so the dirty u works directly as a pk.
    pub fn from_pkhash(pkhash: &[u8]) -> Result<Key> {
        let point = egreveal(pkhash)?;
        let mut h = [0u8; 32];
        h.copy_from_slice(pkhash);
        let mut key = Key::default();
        key.pkhash = Some(h);
        key.pk = Some(point.montbytes());
        Ok(key)
    }

    pub fn with_keystr(mut self, keystr: &str) -> Key {
        self.keystr = keystr.into();
        self
    }

    pub fn with_comment(mut self, comment: &str) -> Key {
        self.comment = comment.into();
        self
    }

    /// Fill in public halves from whatever secret material is present.
    fn derive_public(&mut self) {
        if let Some(edsk) = &self.edsk {
            let signing = ed25519_dalek::SigningKey::from_bytes(edsk);
            let edpk = signing.verifying_key().to_bytes();
            debug_assert!(self.edpk.is_none() || self.edpk == Some(edpk));
            self.edpk = Some(edpk);
            let sk = ed_to_curve_sk(edsk);
            debug_assert!(self.sk.is_none() || self.sk == Some(sk));
            self.sk = Some(sk);
        }
        if let Some(sk) = &self.sk {
            let pk = x25519_dalek::x25519(*sk, x25519_dalek::X25519_BASEPOINT_BYTES);
            debug_assert!(self.pk.is_none() || self.pk == Some(pk));
            self.pk = Some(pk);
        }
    }

    /// Verify the stated invariants between the stored parts.
    pub fn validate(&self) -> Result<()> {
        if let (Some(sk), Some(pk)) = (&self.sk, &self.pk) {
            if x25519_dalek::x25519(*sk, x25519_dalek::X25519_BASEPOINT_BYTES) != *pk {
                return Err(CovertError::MalformedKey("sk does not match pk".into()));
            }
        }
        if let (Some(edsk), Some(edpk)) = (&self.edsk, &self.edpk) {
            let derived = ed25519_dalek::SigningKey::from_bytes(edsk)
                .verifying_key()
                .to_bytes();
            if derived != *edpk {
                return Err(CovertError::MalformedKey("edsk does not match edpk".into()));
            }
        }
        if let (Some(edsk), Some(pkhash)) = (&self.edsk, &self.pkhash) {
            if eghide(edsk)? != *pkhash {
                return Err(CovertError::MalformedKey("pkhash does not round-trip".into()));
            }
        }
        Ok(())
    }

    pub fn sk(&self) -> Result<[u8; 32]> {
        self.sk
            .ok_or_else(|| CovertError::Value("missing secret key".into()))
    }

    pub fn pk(&self) -> Result<[u8; 32]> {
        self.pk
            .ok_or_else(|| CovertError::Value("missing public key".into()))
    }

    pub fn edpk(&self) -> Result<[u8; 32]> {
        self.edpk
            .ok_or_else(|| CovertError::Value("missing Ed25519 public key".into()))
    }

    /// Ed25519 signature over a message; requires the secret seed.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; 64]> {
        let edsk = self
            .edsk
            .ok_or_else(|| CovertError::Value("missing Ed25519 secret key".into()))?;
        let signing = ed25519_dalek::SigningKey::from_bytes(&edsk);
        Ok(signing.sign(message).to_bytes())
    }

    /// Strict Ed25519 verification (rejects small order components).
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let edpk = self.edpk()?;
        let vk = ed25519_dalek::VerifyingKey::from_bytes(&edpk)
            .map_err(|_| CovertError::MalformedKey("invalid Ed25519 public key".into()))?;
        if signature.len() != 64 {
            return Err(CovertError::Value("invalid signature length".into()));
        }
        let sig = ed25519_dalek::Signature::from_slice(signature)
            .map_err(|_| CovertError::Value("invalid signature".into()))?;
        vk.verify_strict(message, &sig)
            .map_err(|_| CovertError::Value("signature mismatch".into()))
    }
}

impl Drop for Key {
    fn drop(&mut self) {
        if let Some(sk) = &mut self.sk {
            sk.zeroize();
        }
        if let Some(edsk) = &mut self.edsk {
            edsk.zeroize();
        }
    }
}

impl PartialEq for Key {
    /// If the Curve25519 pk matches, everything else matches too.
    fn eq(&self, other: &Key) -> bool {
        self.pk == other.pk
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pk.hash(state);
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = if self.edsk.is_some() {
            "EdSK"
        } else if self.sk.is_some() {
            "SK"
        } else if self.edpk.is_some() {
            "EdPK"
        } else {
            "PK"
        };
        let pk = self
            .pk
            .map(|p| p[..4].iter().map(|b| format!("{b:02x}")).collect::<String>())
            .unwrap_or_else(|| "????????".into());
        write!(f, "Key[{pk}:{t}]")
    }
}

impl fmt::Display for Key {
    /// Short string for UI listings.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = if self.comment.len() >= 4 {
            self.comment.clone()
        } else {
            let base = if self.keystr.is_empty() {
                format!("{self:?}")
            } else {
                self.keystr.clone()
            };
            if self.comment.is_empty() {
                base
            } else {
                format!("{base} {}", self.comment)
            }
        };
        if key.chars().count() > 30 {
            let tail: String = key
                .chars()
                .rev()
                .take(12)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            write!(f, "…{tail}")
        } else {
            write!(f, "{key}")
        }
    }
}

/// Shared key for a recipient: sha512(nonce || X25519(local.sk, remote.pk)).
pub fn derive_symkey(nonce: &[u8], local: &Key, remote: &Key) -> Result<[u8; 32]> {
    let shared = x25519_dalek::x25519(local.sk()?, remote.pk()?);
    if shared == [0u8; 32] {
        return Err(CovertError::Value("low order public key".into()));
    }
    let mut h = Sha512::new();
    h.update(nonce);
    h.update(shared);
    let mut out = [0u8; 32];
    out.copy_from_slice(&h.finalize()[..32]);
    Ok(out)
}
