use thiserror::Error;

/// The router-wide error taxonomy.
///
/// Errors are handled where they arise; most paths drop the offending
/// message, bump a counter, and continue. Only stream/datagram handles
/// surface errors to client code.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Malformed message: {0}")]
    Malformed(&'static str),

    #[error("Authentication failed: {0}")]
    AuthFailed(&'static str),

    #[error("Decryption check failed")]
    DecryptCheckFailed,

    #[error("Expired")]
    Expired,

    #[error("Duplicate message")]
    Duplicate,

    #[error("Tunnel build failed")]
    BuildFailed,

    #[error("Timeout: {0}")]
    Timeout(&'static str),

    #[error("Peer unreachable")]
    Unreachable,

    #[error("Bandwidth limit exceeded")]
    BandwidthExceeded,

    #[error("Shutting down")]
    Shutdown,

    #[error("Connection reset")]
    ConnectionReset,

    #[error("End of stream")]
    Eof,

    #[error("Cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Crypto(#[from] garliccraft_crypto::CryptoError),
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_error_converts() {
        fn inner() -> Result<()> {
            Err(garliccraft_crypto::CryptoError::DecryptCheckFailed)?
        }
        assert!(matches!(inner(), Err(CoreError::Crypto(_))));
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            CoreError::Malformed("bad length field").to_string(),
            "Malformed message: bad length field"
        );
        assert_eq!(CoreError::Expired.to_string(), "Expired");
        assert_eq!(CoreError::ConnectionReset.to_string(), "Connection reset");
    }
}
