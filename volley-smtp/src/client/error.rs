//! Error types for the SMTP client.

use std::io;

use thiserror::Error;

/// Errors that can occur when using the SMTP client.
#[derive(Error, Debug)]
pub enum ClientError {
    /// IO error occurred during network operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to parse an SMTP response from the server.
    #[error("Failed to parse SMTP response: {0}")]
    ParseError(String),

    /// The server returned an unexpected SMTP status code.
    #[error("Unexpected SMTP status code: {code} - {message}")]
    UnexpectedResponse { code: u16, message: String },

    /// The server returned an error status code (4xx or 5xx).
    #[error("SMTP error: {code} - {message}")]
    SmtpError { code: u16, message: String },

    /// The server rejected our credentials, or offers no usable mechanism.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// TLS/SSL error occurred.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// A step did not complete within its configured timeout.
    #[error("{0} timed out")]
    Timeout(String),

    /// Invalid builder configuration.
    #[error("Invalid builder configuration: {0}")]
    BuilderError(String),

    /// Connection was closed unexpectedly.
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    /// The pool has been closed and hands out no more connections.
    #[error("Connection pool is closed")]
    PoolClosed,

    /// UTF-8 decoding error.
    #[error("UTF-8 error: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),
}

impl ClientError {
    /// Returns `true` if the connection this error came from is unusable.
    ///
    /// SMTP rejections leave the session intact; everything else means the
    /// socket should be dropped.
    #[must_use]
    pub const fn is_connection_lost(&self) -> bool {
        !matches!(
            self,
            Self::SmtpError { .. } | Self::UnexpectedResponse { .. } | Self::BuilderError(_)
        )
    }
}

/// Specialized `Result` type for SMTP client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
