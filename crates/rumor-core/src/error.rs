//! Error types for rumor-core.

use thiserror::Error;

/// Errors that can occur in membership and gossip operations.
#[derive(Debug, Error)]
pub enum GossipError {
    /// A datagram or stream frame could not be decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The peer speaks a protocol version we do not understand.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The message kind ordinal is not one we know.
    #[error("unknown message kind: {0}")]
    UnknownMessageKind(u8),

    /// A local attribute violates the attribute rules.
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),

    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The transport failed to deliver or exchange a message.
    #[error("transport error: {0}")]
    Transport(String),

    /// An exchange did not complete in time.
    #[error("operation timed out")]
    Timeout,

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for gossip operations.
pub type Result<T> = std::result::Result<T, GossipError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_error_display() {
        let err = GossipError::Codec("truncated snapshot".to_string());
        assert_eq!(err.to_string(), "codec error: truncated snapshot");
    }

    #[test]
    fn version_error_display() {
        let err = GossipError::UnsupportedVersion(9);
        assert_eq!(err.to_string(), "unsupported protocol version: 9");
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "busy");
        let err: GossipError = io.into();
        assert!(matches!(err, GossipError::Io(_)));
    }
}
