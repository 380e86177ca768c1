use std::sync::Arc;

use async_trait::async_trait;
use volley_smtp::{
    MessageBuilder, RelayEndpoint, SmtpPool,
    client::tls::{self, ClientConfig},
};

use super::{OutgoingMessage, Transport, TransportFactory};
use crate::{config::SmtpTransportConfig, error::TransportError};

/// Value of the `X-Mailer` header
const MAILER: &str = "Volley";

/// Delivers through a pooled SMTP submission connection
#[derive(Debug)]
pub struct SmtpTransport {
    pool: SmtpPool,
}

impl SmtpTransport {
    #[must_use]
    pub const fn new(pool: SmtpPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn warm_up(&self) -> Result<(), TransportError> {
        Ok(self.pool.warm_up().await?)
    }

    async fn send(&self, message: &OutgoingMessage) -> Result<(), TransportError> {
        let data = MessageBuilder::new()
            .from(Some(message.sender_name.as_str()), &message.from)
            .to(&message.to)
            .subject(&message.subject)
            .header("X-Mailer", MAILER)
            .header("X-Priority", "3")
            .html(&message.html)
            .build()?;

        self.pool.send(&message.from, &message.to, &data).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Builds an [`SmtpTransport`] per relay, all sharing one TLS configuration
pub struct SmtpTransportFactory {
    config: SmtpTransportConfig,
    tls: Arc<ClientConfig>,
}

impl SmtpTransportFactory {
    /// Loads the platform root certificates once for all relays.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Tls` if no usable root store is available.
    pub fn new(config: SmtpTransportConfig) -> Result<Self, TransportError> {
        let tls = tls::client_config(config.accept_invalid_certs)?;
        Ok(Self { config, tls })
    }
}

impl TransportFactory for SmtpTransportFactory {
    fn create(&self, endpoint: &RelayEndpoint) -> Arc<dyn Transport> {
        let pool = SmtpPool::new(endpoint.clone(), self.config.clone())
            .with_tls_config(Arc::clone(&self.tls));
        Arc::new(SmtpTransport::new(pool))
    }
}
