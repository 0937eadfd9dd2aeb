//! Covert: an authenticated file-and-message encryption container built
//! for strong ciphertext anonymity.
//!
//! A correct Covert file is indistinguishable from uniformly random
//! bytes to anyone without a decryption secret: no magic, no version
//! byte, no length fields, no recipient identifiers, no fixed offsets.
//! Passphrase, static public-key and forward-secret conversation
//! recipients can unlock the same file, each through a 32-byte auth slot
//! found by trial decryption.
//!
//! Layers, bottom up:
//! - [`aead`] / [`kdf`] / [`key`]: ChaCha20-Poly1305, the two-stage
//!   Argon2id passphrase pipeline and the unified key object.
//! - [`header`]: the shape-free prologue and its slot probing.
//! - [`blockstream`]: chained variable-length AEAD blocks with worker
//!   pools on both sides, plus trailing signatures.
//! - [`archive`]: the MsgPack file/message container and padding.
//! - [`ratchet`] / [`idstore`]: forward-secret conversations and their
//!   encrypted persistent state.
//! - [`armor`]: quoting-tolerant Base64 for text transports.
//!
//! The elliptic-curve layer (Elligator2, dirty keys, XEdDSA) lives in
//! the `covert-elliptic` crate.

pub mod aead;
pub mod archive;
pub mod armor;
pub mod blockstream;
pub mod container;
pub mod error;
pub mod header;
pub mod idstore;
pub mod kdf;
pub mod key;
pub mod keyfmt;
pub mod ratchet;
pub mod sshkey;
pub mod util;

pub use archive::{Archive, ArchiveDecoder, ArchiveEvent, ArchiveInput, FileRecord, Index};
pub use blockstream::{Block, DecryptStream, EncryptStream, SigResult, BS};
pub use container::{decrypt_archive, encrypt_archive, DecryptedArchive};
pub use error::{CovertError, Result};
pub use header::{Auth, AuthMethod};
pub use idstore::{DataDirs, IdMap, IdRecord, IdStore};
pub use key::{derive_symkey, Key};
pub use ratchet::Ratchet;
