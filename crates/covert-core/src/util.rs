//! Small shared utilities: the nonce counter, XOR, NFKC encoding and the
//! random padding amount.

use rand::RngCore;
use unicode_normalization::UnicodeNormalization;

use crate::error::{CovertError, Result};

/// 96-bit little-endian counter nonce.
///
/// Starts at a given value (the file nonce) and yields consecutive
/// nonces, wrapping at 2^96. Single-threaded by design: only the main
/// loop assigns nonces, at job submission time.
#[derive(Clone)]
pub struct NonceGen {
    next: [u8; 12],
}

impl NonceGen {
    pub fn new(start: [u8; 12]) -> NonceGen {
        NonceGen { next: start }
    }

    pub fn random() -> NonceGen {
        let mut n = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut n);
        NonceGen { next: n }
    }

    /// The next nonce in sequence.
    pub fn next_nonce(&mut self) -> [u8; 12] {
        let out = self.next;
        // Overflow safe little-endian increment.
        for b in self.next.iter_mut() {
            let (v, carry) = b.overflowing_add(1);
            *b = v;
            if !carry {
                break;
            }
        }
        out
    }
}

pub fn xor32(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Encode a string as NFKC-normalised UTF-8 (passphrases, filenames).
pub fn encode(s: &str) -> Vec<u8> {
    s.nfkc().collect::<String>().into_bytes()
}

/// Randomize the padding amount for a given total plaintext size.
///
/// fixed padding hides the length of very short messages entirely; the
/// random part scales with a compressed-log effective size so that large
/// files are not blown up proportionally.
pub fn random_padding(total: u64, p: f64) -> Result<u64> {
    if !(0.0..=3.0).contains(&p) {
        return Err(CovertError::Value(format!(
            "invalid padding ratio {p}, expected 0 to 3"
        )));
    }
    if p == 0.0 {
        return Ok(0);
    }
    let fixed_padding = ((p * 500.0).floor() as u64).saturating_sub(total);
    let size = (total + fixed_padding) as f64;
    let eff_size = 200.0 + 1e8 * (1.0 + 1e-8 * size).ln();
    // Inverse CDF sampling of an exponential distribution.
    let u = rand::thread_rng().next_u64();
    let r = (2.0f64.powi(65)).ln() - (1.0 + 2.0 * u as f64).ln();
    Ok(fixed_padding + (r * p * eff_size).round() as u64)
}
