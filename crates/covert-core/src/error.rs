use covert_elliptic::EllipticError;

/// Container-level errors.
///
/// The block stream recovers internally from block length mis-guesses;
/// every other AEAD failure surfaces here. Header probing is the only
/// place where AEAD failures are expected and swallowed.
#[derive(Debug, thiserror::Error)]
pub enum CovertError {
    /// No auth method matched the header, or a wrong passphrase/key.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Key string or key file unparseable, or unsupported algorithm.
    #[error("malformed key: {0}")]
    MalformedKey(String),

    /// AEAD failure inside the block stream after the length was known.
    #[error("decryption failed: {0}")]
    Decrypt(String),

    /// Malformed index, bad filename, ratio out of range, state errors.
    #[error("{0}")]
    Value(String),

    /// Key incompatible with Elligator2 hiding; regenerate and retry.
    #[error("elliptic error: {0}")]
    Elliptic(#[from] EllipticError),

    #[error("ratchet error: {0}")]
    Ratchet(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl CovertError {
    /// Exit code for the external CLI that drives the core.
    pub fn exit_code(&self) -> i32 {
        match self {
            CovertError::Io(_) => 3,
            CovertError::MalformedKey(_) => 4,
            CovertError::Auth(_) => 11,
            CovertError::Decrypt(_) => 12,
            CovertError::Value(_)
            | CovertError::Elliptic(_)
            | CovertError::Ratchet(_) => 10,
        }
    }
}

pub type Result<T, E = CovertError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_documented_table() {
        assert_eq!(CovertError::Auth("x".into()).exit_code(), 11);
        assert_eq!(CovertError::Decrypt("x".into()).exit_code(), 12);
        assert_eq!(CovertError::MalformedKey("x".into()).exit_code(), 4);
        assert_eq!(CovertError::Value("x".into()).exit_code(), 10);
        let io = CovertError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe"));
        assert_eq!(io.exit_code(), 3);
    }

    #[test]
    fn display_is_lowercase_prefixed() {
        let err = CovertError::Auth("no matching key or passphrase".into());
        assert_eq!(
            err.to_string(),
            "authentication failed: no matching key or passphrase"
        );
    }
}
