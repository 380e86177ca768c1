//! Typed errors for the dispatch engine.
//!
//! Three layers are kept apart:
//! - [`TransportError`]: one attempt against one relay failed, retryable on
//!   another relay
//! - [`Failure`]: a recipient is permanently done without a successful send
//! - [`SubmitError`] / [`DispatchError`]: problems with a request or a job
//!   handle, reported to the caller and never to a worker

use std::io::ErrorKind;

use thiserror::Error;
use volley_common::address::AddressError;
use volley_smtp::ClientError;

use crate::JobId;

/// A single send attempt through a relay failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("TLS failure: {0}")]
    Tls(String),

    /// 4xx reply
    #[error("Temporary rejection: {code} {message}")]
    Temporary { code: u16, message: String },

    /// 5xx reply
    #[error("Permanent rejection: {code} {message}")]
    Permanent { code: u16, message: String },

    /// The connection went away, including teardown by a cancelled job
    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Short label used in log events.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::ConnectionRefused(_) => "connection refused",
            Self::Timeout(_) => "timeout",
            Self::Authentication(_) => "authentication",
            Self::Tls(_) => "tls",
            Self::Temporary { .. } => "client error (4xx)",
            Self::Permanent { .. } => "server error (5xx)",
            Self::Closed(_) => "connection closed",
            Self::Other(_) => "unknown",
        }
    }
}

impl From<ClientError> for TransportError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::SmtpError { code, message } if (400..500).contains(&code) => {
                Self::Temporary { code, message }
            }
            ClientError::SmtpError { code, message } if (500..600).contains(&code) => {
                Self::Permanent { code, message }
            }
            ClientError::SmtpError { code, message }
            | ClientError::UnexpectedResponse { code, message } => {
                Self::Other(format!("Unexpected SMTP response: {code} {message}"))
            }

            ClientError::Io(e) => match e.kind() {
                ErrorKind::ConnectionRefused => Self::ConnectionRefused(e.to_string()),
                ErrorKind::TimedOut => Self::Timeout(e.to_string()),
                ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::UnexpectedEof => Self::Closed(e.to_string()),
                _ => Self::Other(format!("I/O error: {e}")),
            },

            ClientError::Timeout(step) => Self::Timeout(step),
            ClientError::AuthenticationFailed(reason) => Self::Authentication(reason),
            ClientError::TlsError(reason) => Self::Tls(reason),
            ClientError::ConnectionClosed => {
                Self::Closed("Connection closed unexpectedly".to_string())
            }
            ClientError::PoolClosed => Self::Closed("Relay connections torn down".to_string()),

            ClientError::ParseError(msg) => Self::Other(format!("SMTP protocol parse error: {msg}")),
            ClientError::BuilderError(msg) => Self::Other(format!("Message composition failed: {msg}")),
            ClientError::Utf8Error(e) => Self::Other(format!("UTF-8 decoding error: {e}")),
        }
    }
}

/// Why a recipient was recorded as failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Failure {
    /// Never attempted
    #[error("Invalid recipient address: {0}")]
    InvalidRecipient(#[from] AddressError),

    /// Every relay was disabled, or the attempt budget ran out
    #[error("No relay accepted the message after {attempts} attempts")]
    RelayExhausted { attempts: usize },
}

/// A request was rejected before any worker started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("Request has no recipients")]
    NoRecipients,

    #[error("Request has no relay credentials")]
    NoRelays,

    #[error("Field '{0}' must not be empty")]
    EmptyField(&'static str),

    #[error("Relay credential {index} is invalid: {reason}")]
    InvalidCredential { index: usize, reason: String },

    #[error("Environment variable '{0}' holding a relay secret is not set")]
    MissingSecret(String),
}

/// Errors from operations on a job handle
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Unknown job {0}")]
    UnknownJob(JobId),

    #[error("Job {0} has already finished")]
    AlreadyFinished(JobId),

    #[error("Job {0} is still running")]
    StillRunning(JobId),

    #[error(transparent)]
    Submit(#[from] SubmitError),
}
