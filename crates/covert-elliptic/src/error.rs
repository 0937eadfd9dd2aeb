/// Errors for the elliptic layer.
///
/// Signature verification reports which check failed so that callers can
/// distinguish malformed keys from forged signatures.
#[derive(Debug, thiserror::Error)]
pub enum EllipticError {
    #[error("not a square")]
    NotSquare,

    #[error("not a curve point on Ed25519")]
    NotOnCurve,

    #[error("the point cannot be mapped through Elligator2")]
    NotHashable,

    #[error("invalid length, expected {0} bytes")]
    InvalidLength(usize),

    #[error("invalid public key provided")]
    InvalidPublicKey,

    #[error("invalid R point on signature")]
    InvalidRPoint,

    #[error("invalid s value on signature")]
    InvalidSValue,

    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("a 64-byte random nonce is required")]
    InvalidNonce,
}
