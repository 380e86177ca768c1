//! The seam between the engine and the network.
//!
//! A [`TransportFactory`] makes one [`Transport`] per relay when a job's
//! relay pool is built. The SMTP implementation lives in [`smtp`]; tests
//! substitute scripted ones.

pub mod smtp;

use std::sync::Arc;

use async_trait::async_trait;
use volley_smtp::RelayEndpoint;

use crate::error::TransportError;

/// One rendered message for one recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Display name of the author
    pub sender_name: String,
    /// Author and envelope sender, the relay's account name
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Sends messages through one relay
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Opens a connection ahead of the first send.
    async fn warm_up(&self) -> Result<(), TransportError>;

    /// Hands one message to the relay.
    async fn send(&self, message: &OutgoingMessage) -> Result<(), TransportError>;

    /// Tears down every connection. Sends in flight fail with
    /// [`TransportError::Closed`]; later sends fail immediately. Idempotent
    /// and infallible.
    async fn close(&self);
}

/// Makes the transport for each relay of a job
pub trait TransportFactory: Send + Sync {
    fn create(&self, endpoint: &RelayEndpoint) -> Arc<dyn Transport>;
}

pub use smtp::{SmtpTransport, SmtpTransportFactory};
