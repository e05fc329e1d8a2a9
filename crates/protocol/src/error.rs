//! Error types for the protocol crate.

use thiserror::Error;
use tokio_util::codec::LinesCodecError;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Handshake errors
    /// The handshake could not be completed.
    ///
    /// Always fatal to the connection attempt. `source` carries the error that
    /// caused the failure when there was one (I/O, broken message, bad key).
    #[error("handshake failed: {reason}")]
    HandshakeFailed {
        /// What went wrong, without secret material.
        reason: String,
        /// The originating error, if any.
        #[source]
        source: Option<Box<ProtocolError>>,
    },

    // Cryptographic errors
    /// A single line could not be encrypted or decrypted.
    #[error("broken message: {0}")]
    BrokenMessage(String),

    /// Key material is missing or structurally invalid.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The per-direction line limit for the session key was reached.
    #[error("keystream exhausted: session key already protected {limit} lines")]
    KeystreamExhausted {
        /// Configured maximum number of lines.
        limit: u64,
    },

    // Usage errors
    /// Caller error such as a conflicting marker or an unregistered queue.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Framing errors
    /// A line on the wire exceeded the maximum length.
    #[error("line too long: exceeds maximum of {max} bytes")]
    LineTooLong {
        /// Maximum allowed line length.
        max: usize,
    },

    // Connection errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Any other I/O failure.
    #[error("i/o error: {0}")]
    Io(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Creates a `HandshakeFailed` error without an underlying cause.
    pub fn handshake(reason: impl Into<String>) -> Self {
        ProtocolError::HandshakeFailed {
            reason: reason.into(),
            source: None,
        }
    }

    /// Wraps this error as the cause of a handshake failure.
    ///
    /// Errors that already are `HandshakeFailed` are returned unchanged.
    pub fn into_handshake_failure(self, reason: impl Into<String>) -> Self {
        match self {
            err @ ProtocolError::HandshakeFailed { .. } => err,
            other => ProtocolError::HandshakeFailed {
                reason: reason.into(),
                source: Some(Box::new(other)),
            },
        }
    }

    /// Returns whether this error only affects a single line.
    ///
    /// These are the errors a lenient channel may drop and log.
    pub fn is_broken_message(&self) -> bool {
        matches!(self, ProtocolError::BrokenMessage(_))
    }
}

// Conversions from underlying crate errors

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Io(err.to_string()),
        }
    }
}

impl From<LinesCodecError> for ProtocolError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::MaxLineLengthExceeded => ProtocolError::LineTooLong {
                max: crate::codec::MAX_LINE_LENGTH,
            },
            LinesCodecError::Io(e) => e.into(),
        }
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(err: base64::DecodeError) -> Self {
        ProtocolError::BrokenMessage(format!("invalid base64: {}", err))
    }
}

impl From<std::string::FromUtf8Error> for ProtocolError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        ProtocolError::BrokenMessage(format!("plaintext is not utf-8: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_handshake_failed_error_display() {
        let err = ProtocolError::handshake("unknown user");
        assert_eq!(err.to_string(), "handshake failed: unknown user");
        assert!(err.source().is_none());
    }

    #[test]
    fn test_handshake_failure_keeps_cause() {
        let err = ProtocolError::BrokenMessage("bad padding".to_string())
            .into_handshake_failure("message 1 unreadable");

        assert_eq!(err.to_string(), "handshake failed: message 1 unreadable");
        let source = err.source().unwrap();
        assert_eq!(source.to_string(), "broken message: bad padding");
    }

    #[test]
    fn test_handshake_failure_is_not_rewrapped() {
        let err = ProtocolError::handshake("challenge mismatch").into_handshake_failure("outer");
        assert_eq!(err.to_string(), "handshake failed: challenge mismatch");
    }

    #[test]
    fn test_broken_message_error_display() {
        let err = ProtocolError::BrokenMessage("decryption error".to_string());
        assert_eq!(err.to_string(), "broken message: decryption error");
        assert!(err.is_broken_message());
    }

    #[test]
    fn test_keystream_exhausted_error_display() {
        let err = ProtocolError::KeystreamExhausted { limit: 16 };
        assert_eq!(
            err.to_string(),
            "keystream exhausted: session key already protected 16 lines"
        );
        assert!(!err.is_broken_message());
    }

    #[test]
    fn test_invalid_argument_error_display() {
        let err = ProtocolError::InvalidArgument("marker '!foo' conflicts".to_string());
        assert_eq!(err.to_string(), "invalid argument: marker '!foo' conflicts");
    }

    #[test]
    fn test_from_io_error_timeout() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::Timeout(_)));
    }

    #[test]
    fn test_from_io_error_connection_closed() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::ConnectionClosed(_)));
    }

    #[test]
    fn test_from_io_error_other() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::Io(_)));
    }

    #[test]
    fn test_from_lines_codec_error() {
        let err: ProtocolError = LinesCodecError::MaxLineLengthExceeded.into();
        assert!(matches!(err, ProtocolError::LineTooLong { .. }));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
