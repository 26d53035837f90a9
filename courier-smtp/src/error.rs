//! Error types for the SMTP client.

use std::io;

use thiserror::Error;

/// Errors that can occur while talking to the mail relay.
///
/// Errors are categorized so the pooled sender can decide whether another
/// attempt makes sense:
/// - temporary errors (4xx codes, I/O failures, timeouts) are retried
/// - permanent errors (5xx codes, authentication failures) are not
#[derive(Error, Debug)]
pub enum ClientError {
    /// IO error during network operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The server sent something that is not a valid SMTP response.
    #[error("failed to parse SMTP response: {0}")]
    Parse(String),

    /// The server answered with an error status code.
    #[error("SMTP error: {code} - {message}")]
    Smtp { code: u16, message: String },

    /// The server answered with a code outside the expected ranges.
    #[error("unexpected SMTP status code: {code} - {message}")]
    UnexpectedResponse { code: u16, message: String },

    /// TLS setup or handshake failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Authentication was rejected or could not be negotiated.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// An operation exceeded its deadline.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// The connection was closed while a response was expected.
    #[error("connection closed unexpectedly")]
    ConnectionClosed,

    /// Response bytes were not valid UTF-8.
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

impl ClientError {
    /// Returns `true` if another attempt may succeed.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        match self {
            Self::Smtp { code, .. } => *code >= 400 && *code < 500,
            Self::Io(_) | Self::ConnectionClosed | Self::Timeout(_) => true,
            Self::Parse(_)
            | Self::UnexpectedResponse { .. }
            | Self::Tls(_)
            | Self::Auth(_)
            | Self::Utf8(_) => false,
        }
    }

    /// Returns `true` if retrying is pointless.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        match self {
            Self::Smtp { code, .. } => *code >= 500 && *code < 600,
            Self::Auth(_) | Self::Parse(_) | Self::Utf8(_) => true,
            Self::Io(_)
            | Self::ConnectionClosed
            | Self::Timeout(_)
            | Self::UnexpectedResponse { .. }
            | Self::Tls(_) => false,
        }
    }

    /// The SMTP status code carried by this error, if any.
    #[must_use]
    pub const fn response_code(&self) -> Option<u16> {
        match self {
            Self::Smtp { code, .. } | Self::UnexpectedResponse { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Specialized `Result` type for SMTP client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_xx_codes_are_temporary() {
        let err = ClientError::Smtp {
            code: 421,
            message: "service not available".to_string(),
        };
        assert!(err.is_temporary());
        assert!(!err.is_permanent());
        assert_eq!(err.response_code(), Some(421));
    }

    #[test]
    fn five_xx_codes_are_permanent() {
        let err = ClientError::Smtp {
            code: 550,
            message: "user not found".to_string(),
        };
        assert!(err.is_permanent());
        assert!(!err.is_temporary());
    }

    #[test]
    fn io_and_eof_are_temporary() {
        let err = ClientError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert!(err.is_temporary());

        assert!(ClientError::ConnectionClosed.is_temporary());
        assert!(ClientError::Timeout("send").is_temporary());
    }

    #[test]
    fn auth_failures_are_permanent() {
        let err = ClientError::Auth("535 authentication credentials invalid".to_string());
        assert!(err.is_permanent());
        assert!(!err.is_temporary());
        assert_eq!(err.response_code(), None);
    }
}
