//! Error types for the chopstream transport.

use thiserror::Error;

/// Result type alias for chopstream operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the transport.
#[derive(Error, Debug)]
pub enum Error {
    /// Cryptographic operation failed
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// A received block failed authentication
    #[error("block authentication failed")]
    MacFailure,

    /// Protocol violation on a circuit (bad header, duplicate block, ...)
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A steganography module reported a malformed or untransmittable carrier
    #[error("steganography error: {0}")]
    Steg(String),

    /// The named steganography module is not compiled in
    #[error("unsupported steganography module: {0}")]
    UnknownSteg(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// The process is shutting down; no new circuits may be created
    #[error("shutting down")]
    ShuttingDown,
}

impl Error {
    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new protocol-violation error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new steganography error
    pub fn steg(msg: impl Into<String>) -> Self {
        Error::Steg(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::MacFailure;
        assert_eq!(err.to_string(), "block authentication failed");

        let err = Error::config("missing steganographer");
        assert_eq!(
            err.to_string(),
            "configuration error: missing steganographer"
        );
    }
}
