//! The cryptographic header: auth slots and trial decryption.
//!
//! A Covert file begins with bytes that double as the nonce and,
//! depending on mode, an Elligator2-hidden ephemeral public key followed
//! by XOR auth slots. Nothing in the layout says which; receivers find
//! out by trial decryption of candidate first-block positions within the
//! first kilobyte.

use rand::seq::SliceRandom;

use crate::aead;
use crate::error::{CovertError, Result};
use crate::kdf;
use crate::key::{derive_symkey, Key};
use crate::ratchet::{Ratchet, HEADER_LEN as RATCHET_HEADER_LEN};
use crate::util::{xor32, NonceGen};

/// Auth slots may occupy at most 19 * 32 bytes of the first kilobyte.
const MAX_SLOTS: usize = 19;

/// Hard cap on distinct recipients of one file.
pub const MAX_RECIPIENTS: usize = 20;

/// How a file is locked. The runtime recipient cap is enforced when the
/// header is built.
pub enum Auth<'a> {
    /// No authentication: the file key is all zeros.
    WideOpen,
    /// One passphrase (stage-1 hash); header is the bare 12-byte nonce.
    SinglePassphrase([u8; 16]),
    /// Any mix of passphrases and public keys, one slot each.
    Multi {
        pwhashes: Vec<[u8; 16]>,
        recipients: Vec<Key>,
    },
    /// A forward-secret conversation; the ratchet makes the header.
    Ratchet(&'a mut Ratchet),
}

/// Decrypt-side auth candidate.
pub enum AuthMethod<'a> {
    /// Stage-1 passphrase hash.
    Password([u8; 16]),
    /// A secret key to try against pubkey slots.
    Identity(Key),
    /// A conversation state; mutated when it matches.
    Ratchet(&'a mut Ratchet),
}

/// Result of building the encryption header.
pub struct EncryptedHeader {
    /// Bytes that start the file (nonce, maybe hidden pk and slots).
    pub header: Vec<u8>,
    pub nonce: NonceGen,
    /// The file key for all blocks.
    pub key: [u8; 32],
}

/// Result of authenticating a file for decryption.
pub struct Header {
    pub key: [u8; 32],
    /// Decrypted block 0 plaintext, trailing 3-byte length included.
    pub block0: Vec<u8>,
    /// Ciphertext offset where block 0 starts (= header length).
    pub block0_start: usize,
    /// Ciphertext offset just past block 0.
    pub block0_end: usize,
    /// Which auth method index matched; None for wide-open.
    pub method: Option<usize>,
    /// (slot index, first-block offset / 32) for diagnostics.
    pub slot: Option<(usize, usize)>,
}

/// Build the header for the given auth mode.
pub fn encrypt_header(auth: &mut Auth<'_>) -> Result<EncryptedHeader> {
    match auth {
        Auth::WideOpen => {
            let eph = Key::new();
            let n = first12(&eph.pkhash.expect("generated keys carry pkhash"));
            Ok(EncryptedHeader { header: n.to_vec(), nonce: NonceGen::new(n), key: [0u8; 32] })
        }
        Auth::SinglePassphrase(pwh) => {
            let eph = Key::new();
            let n = first12(&eph.pkhash.expect("generated keys carry pkhash"));
            let key = kdf::authkey(pwh, &n)?;
            Ok(EncryptedHeader { header: n.to_vec(), nonce: NonceGen::new(n), key })
        }
        Auth::Multi { pwhashes, recipients } => {
            if pwhashes.is_empty() && recipients.is_empty() {
                return Err(CovertError::Value(
                    "must have an authentication method defined".into(),
                ));
            }
            // Deduplicate; a repeated recipient gets one slot only.
            let mut pws: Vec<[u8; 16]> = Vec::new();
            for pw in pwhashes.iter() {
                if !pws.contains(pw) {
                    pws.push(*pw);
                }
            }
            let mut rcpt: Vec<&Key> = Vec::new();
            for r in recipients.iter() {
                if !rcpt.iter().any(|k| k.pk == r.pk) {
                    rcpt.push(r);
                }
            }
            if rcpt.is_empty() && pws.len() <= 1 {
                // Degenerates to the short single-passphrase header.
                let mut single = Auth::SinglePassphrase(pws[0]);
                return encrypt_header(&mut single);
            }
            let eph = Key::new();
            let pkhash = eph.pkhash.expect("generated keys carry pkhash");
            let n = first12(&pkhash);
            let mut auths: Vec<[u8; 32]> = Vec::new();
            for pw in &pws {
                push_unique(&mut auths, kdf::authkey(pw, &n)?);
            }
            for r in &rcpt {
                push_unique(&mut auths, derive_symkey(&n, &eph, r)?);
            }
            if auths.len() > MAX_RECIPIENTS {
                return Err(CovertError::Value(
                    "too many recipients specified (max 20)".into(),
                ));
            }
            auths.shuffle(&mut rand::thread_rng());
            // The first value becomes the key; the rest are XOR slots, so
            // the key's position in the shuffle is invisible on the wire.
            let key = auths[0];
            let mut header = pkhash.to_vec();
            for a in &auths[1..] {
                header.extend_from_slice(&xor32(&key, a));
            }
            tracing::debug!(
                "header: {} auth slots in {} byte header",
                auths.len() - 1,
                header.len()
            );
            Ok(EncryptedHeader { header, nonce: NonceGen::new(n), key })
        }
        Auth::Ratchet(ratchet) => {
            let (header, key) = ratchet.send()?;
            let n = first12(&header);
            Ok(EncryptedHeader { header, nonce: NonceGen::new(n), key })
        }
    }
}

/// Authenticate the first kilobyte of a file against the candidates.
///
/// Returns the header and a nonce generator already advanced past the
/// file nonce.
pub fn decrypt_header(
    ct: &[u8],
    methods: &mut [AuthMethod<'_>],
) -> Result<(Header, NonceGen)> {
    if ct.len() < 32 {
        // 12 nonce + 1 data + 3 nextlen + 16 tag
        return Err(CovertError::Value(
            "this file is too small to contain encrypted data".into(),
        ));
    }
    let ct = &ct[..ct.len().min(1024)];
    let mut nonce = NonceGen::new(first12(ct));
    let n = nonce.next_nonce();

    // Wide-open files decrypt with a zero key at offset 12.
    if let Some((block0, end)) = find_block0(ct, &n, &[0u8; 32], 12) {
        tracing::debug!("header: wide-open file");
        return Ok((
            Header {
                key: [0u8; 32],
                block0,
                block0_start: 12,
                block0_end: end,
                method: None,
                slot: None,
            },
            nonce,
        ));
    }

    for (idx, method) in methods.iter_mut().enumerate() {
        match method {
            AuthMethod::Password(pwh) => {
                let authkey = kdf::authkey(pwh, &n)?;
                // Single passphrase: the authkey is the file key.
                if let Some((block0, end)) = find_block0(ct, &n, &authkey, 12) {
                    return Ok((
                        Header {
                            key: authkey,
                            block0,
                            block0_start: 12,
                            block0_end: end,
                            method: Some(idx),
                            slot: None,
                        },
                        nonce,
                    ));
                }
                if let Some(h) = find_slots(ct, &n, &authkey, idx) {
                    return Ok((h, nonce));
                }
            }
            AuthMethod::Identity(idkey) => {
                let Ok(eph) = Key::from_pkhash(&ct[..32]) else {
                    continue;
                };
                let Ok(authkey) = derive_symkey(&n, idkey, &eph) else {
                    continue;
                };
                if let Some(h) = find_slots(ct, &n, &authkey, idx) {
                    return Ok((h, nonce));
                }
            }
            AuthMethod::Ratchet(ratchet) => {
                let Ok(key) = ratchet.receive(ct) else {
                    continue;
                };
                if let Some((block0, end)) = find_block0(ct, &n, &key, RATCHET_HEADER_LEN) {
                    tracing::debug!("header: ratchet conversation matched");
                    return Ok((
                        Header {
                            key,
                            block0,
                            block0_start: RATCHET_HEADER_LEN,
                            block0_end: end,
                            method: Some(idx),
                            slot: None,
                        },
                        nonce,
                    ));
                }
            }
        }
    }
    Err(CovertError::Auth("no key or passphrase matched this file".into()))
}

/// Probe all slot combinations for a given authkey.
fn find_slots(ct: &[u8], n: &[u8; 12], authkey: &[u8; 32], method: usize) -> Option<Header> {
    // Slot 0 is implicit zeros: the authkey itself may be the file key.
    let mut slots: Vec<[u8; 32]> = vec![[0u8; 32]];
    for i in 1..MAX_SLOTS {
        if (i + 1) * 32 + 19 > ct.len() {
            break;
        }
        let mut s = [0u8; 32];
        s.copy_from_slice(&ct[i * 32..(i + 1) * 32]);
        slots.push(s);
    }
    for (i, slot) in slots.iter().enumerate() {
        let key = xor32(slot, authkey);
        // Assuming i+1 or more slots exist, block 0 starts at a
        // multiple of 32 past them.
        for hbegin in (i + 1..=slots.len()).map(|j| j * 32) {
            if let Some((block0, end)) = find_block0(ct, n, &key, hbegin) {
                return Some(Header {
                    key,
                    block0,
                    block0_start: hbegin,
                    block0_end: end,
                    method: Some(method),
                    slot: Some((i, hbegin / 32)),
                });
            }
        }
    }
    None
}

/// Scan candidate block 0 end offsets, longest first, and return the
/// decrypted block and its end on success. The whole prologue is AAD.
fn find_block0(ct: &[u8], n: &[u8; 12], key: &[u8; 32], hbegin: usize) -> Option<(Vec<u8>, usize)> {
    if hbegin + 19 > ct.len() {
        return None;
    }
    for hend in (hbegin + 19..=ct.len()).rev() {
        if let Ok(block0) = aead::decrypt(&ct[hbegin..hend], Some(&ct[..hbegin]), n, key) {
            return Some((block0, hend));
        }
    }
    None
}

fn first12(data: &[u8]) -> [u8; 12] {
    let mut n = [0u8; 12];
    n.copy_from_slice(&data[..12]);
    n
}

/// Identical derived authkeys (duplicate recipients) share one slot.
fn push_unique(auths: &mut Vec<[u8; 32]>, a: [u8; 32]) {
    if !auths.contains(&a) {
        auths.push(a);
    }
}
