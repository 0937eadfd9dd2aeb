//! Ed25519/Curve25519 math and Elligator2 for the Covert container.
//!
//! Very low level primitives: prime-field arithmetic, extended-coordinate
//! Edwards points over all eight subgroups, the Montgomery ladder with
//! explicit infinity handling, reference EdDSA, Signal's XEd25519, and
//! the Elligator2 dirty-point hiding that makes Covert headers look like
//! random bytes.
//!
//! Not constant time and not zeroing intermediates; the container's bulk
//! crypto (X25519, Ed25519 signing, AEAD, Argon2) goes through hardened
//! libraries and only the Elligator/dirty-key paths come here.

pub mod ed;
pub mod eddsa;
pub mod elligator;
pub mod error;
pub mod fe;
pub mod mont;
pub mod scalar;
pub mod xeddsa;

pub use ed::{EdPoint, D, G, L, LO, ZERO};
pub use eddsa::{ed_sign, ed_verify};
pub use elligator::{
    egcreate, eghide, egreveal, fast_curve_to_hash, fast_hash_to_curve, is_hashable,
    is_hashable_bytes,
};
pub use error::EllipticError;
pub use fe::Fe;
pub use scalar::{clamp, clamp_dirty, dirty_scalar, secret_scalar, Q};
pub use xeddsa::{xed_sign, xed_verify};
