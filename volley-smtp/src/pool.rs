//! Bounded, reusable connections to one relay.
//!
//! Every connection handed out by the pool has already passed the greeting,
//! EHLO, the TLS upgrade and AUTH, so a send is only MAIL/RCPT/DATA. At most
//! `max_connections` are in use at once and each is retired after
//! `max_messages_per_connection` messages.

use std::{future::Future, sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, watch};
use tokio_rustls::rustls::ClientConfig;
use volley_common::internal;

use crate::{
    SmtpTimeouts,
    client::{ClientError, Credentials, Response, Result, SmtpClient, tls},
};

/// Port on which TLS is negotiated before the greeting
const IMPLICIT_TLS_PORT: u16 = 465;

/// Where and as whom to submit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
}

impl RelayEndpoint {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            port,
            credentials,
        }
    }

    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub const fn implicit_tls(&self) -> bool {
        self.port == IMPLICIT_TLS_PORT
    }
}

/// Connection pool knobs, shared by every relay of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Upper bound on simultaneously open connections per relay
    ///
    /// Default: 5
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// A connection is closed after this many messages
    ///
    /// Default: 100
    #[serde(default = "default_max_messages")]
    pub max_messages_per_connection: usize,

    /// Refuse relays that cannot upgrade to TLS
    ///
    /// Default: true
    #[serde(default = "default_require_tls")]
    pub require_tls: bool,

    /// Skip certificate verification. Only meant for test relays.
    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Name announced in EHLO
    #[serde(default = "default_helo_name")]
    pub helo_name: String,

    #[serde(default)]
    pub timeouts: SmtpTimeouts,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_messages_per_connection: default_max_messages(),
            require_tls: default_require_tls(),
            accept_invalid_certs: false,
            helo_name: default_helo_name(),
            timeouts: SmtpTimeouts::default(),
        }
    }
}

const fn default_max_connections() -> usize {
    5
}

const fn default_max_messages() -> usize {
    100
}

const fn default_require_tls() -> bool {
    true
}

fn default_helo_name() -> String {
    "localhost".to_string()
}

struct PooledConnection {
    client: SmtpClient,
    messages_sent: usize,
}

/// Authenticated connections to a single relay
pub struct SmtpPool {
    endpoint: RelayEndpoint,
    config: PoolConfig,
    tls: Mutex<Option<Arc<ClientConfig>>>,
    permits: Semaphore,
    idle: Mutex<Vec<PooledConnection>>,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for SmtpPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpPool")
            .field("endpoint", &self.endpoint)
            .field("idle", &self.idle.lock().len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl SmtpPool {
    /// Creates an empty pool. No connection is opened until [`warm_up`] or
    /// the first [`send`].
    ///
    /// [`warm_up`]: SmtpPool::warm_up
    /// [`send`]: SmtpPool::send
    #[must_use]
    pub fn new(endpoint: RelayEndpoint, config: PoolConfig) -> Self {
        Self {
            permits: Semaphore::new(config.max_connections.max(1)),
            endpoint,
            config,
            tls: Mutex::new(None),
            idle: Mutex::new(Vec::new()),
            closed: watch::Sender::new(false),
        }
    }

    /// Uses `tls` instead of building a configuration on first use, so that
    /// the root store is loaded once for every relay of a job.
    #[must_use]
    pub fn with_tls_config(self, tls: Arc<ClientConfig>) -> Self {
        *self.tls.lock() = Some(tls);
        self
    }

    #[must_use]
    pub const fn endpoint(&self) -> &RelayEndpoint {
        &self.endpoint
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Connections ready for reuse
    #[must_use]
    pub fn idle_connections(&self) -> usize {
        self.idle.lock().len()
    }

    /// Opens and authenticates one connection and parks it for reuse.
    ///
    /// # Errors
    ///
    /// Any failure to connect, upgrade or authenticate.
    pub async fn warm_up(&self) -> Result<()> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ClientError::PoolClosed)?;

        let connection = self.open().await?;
        self.release(connection).await;
        Ok(())
    }

    /// Submits `message` from `from` to `to` over a pooled connection.
    ///
    /// # Errors
    ///
    /// `ClientError::PoolClosed` once [`close`](SmtpPool::close) was called,
    /// including for sends already in flight, otherwise the first connection,
    /// protocol or timeout error.
    #[tracing::instrument(skip(self, message), fields(relay = %self.endpoint.host))]
    pub async fn send(&self, from: &str, to: &str, message: &str) -> Result<Response> {
        if self.is_closed() {
            return Err(ClientError::PoolClosed);
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ClientError::PoolClosed)?;

        let mut connection = self.checkout(from).await?;

        match self.deliver(&mut connection.client, to, message).await {
            Ok(response) => {
                connection.messages_sent += 1;
                self.release(connection).await;
                Ok(response)
            }
            Err(e) if e.is_connection_lost() => Err(e),
            Err(e) => {
                self.reset(connection).await;
                Err(e)
            }
        }
    }

    /// Closes the pool. Idle connections receive QUIT, connections in use
    /// are dropped by the sends holding them. Calling this again does
    /// nothing, and teardown errors are never returned.
    pub async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.permits.close();

        let idle = std::mem::take(&mut *self.idle.lock());
        internal!(
            level = DEBUG,
            "Closing pool for {} ({} idle connections)",
            self.endpoint.host,
            idle.len()
        );

        for connection in idle {
            self.retire(connection).await;
        }
    }

    /// Returns a connection on which MAIL FROM has been accepted.
    ///
    /// A parked connection may have been dropped by the relay while idle;
    /// in that case it is discarded and one fresh connection is tried.
    async fn checkout(&self, from: &str) -> Result<PooledConnection> {
        let parked = self.idle.lock().pop();

        if let Some(mut connection) = parked {
            match self.mail_from(&mut connection.client, from).await {
                Ok(()) => return Ok(connection),
                Err(e) if e.is_connection_lost() && !self.is_closed() => {
                    internal!(
                        level = DEBUG,
                        "Pooled connection to {} went stale: {e}",
                        self.endpoint.host
                    );
                }
                Err(e) if e.is_connection_lost() => return Err(e),
                Err(e) => {
                    self.reset(connection).await;
                    return Err(e);
                }
            }
        }

        let mut connection = self.open().await?;
        match self.mail_from(&mut connection.client, from).await {
            Ok(()) => Ok(connection),
            Err(e) if e.is_connection_lost() => Err(e),
            Err(e) => {
                self.reset(connection).await;
                Err(e)
            }
        }
    }

    async fn open(&self) -> Result<PooledConnection> {
        let timeouts = &self.config.timeouts;
        let address = self.endpoint.address();
        let host = self.endpoint.host.clone();

        let mut client = if self.endpoint.implicit_tls() {
            let tls = self.tls_config()?;
            self.step(
                "connect",
                timeouts.connect(),
                SmtpClient::connect_tls(&address, host, tls),
            )
            .await?
        } else {
            self.step(
                "connect",
                timeouts.connect(),
                SmtpClient::connect(&address, host),
            )
            .await?
        };

        self.step("greeting", timeouts.command(), client.read_greeting())
            .await?
            .into_result()?;
        self.step(
            "EHLO",
            timeouts.command(),
            client.ehlo(&self.config.helo_name),
        )
        .await?
        .into_result()?;

        if !client.is_tls() {
            if client.capabilities().starttls {
                let tls = self.tls_config()?;
                self.step("STARTTLS", timeouts.command(), client.starttls(tls))
                    .await?;
                self.step(
                    "EHLO",
                    timeouts.command(),
                    client.ehlo(&self.config.helo_name),
                )
                .await?
                .into_result()?;
            } else if self.config.require_tls {
                return Err(ClientError::TlsError(format!(
                    "{} does not offer STARTTLS",
                    self.endpoint.host
                )));
            }
        }

        let mechanism = self
            .step(
                "AUTH",
                timeouts.command(),
                client.authenticate(&self.endpoint.credentials),
            )
            .await?;

        internal!(
            level = DEBUG,
            "Opened connection to {} (tls: {}, auth: {})",
            self.endpoint.address(),
            client.is_tls(),
            mechanism.name()
        );

        Ok(PooledConnection {
            client,
            messages_sent: 0,
        })
    }

    async fn mail_from(&self, client: &mut SmtpClient, from: &str) -> Result<()> {
        self.step(
            "MAIL FROM",
            self.config.timeouts.command(),
            client.mail_from(from),
        )
        .await?
        .into_result()?;
        Ok(())
    }

    async fn deliver(&self, client: &mut SmtpClient, to: &str, message: &str) -> Result<Response> {
        let timeouts = &self.config.timeouts;

        self.step("RCPT TO", timeouts.command(), client.rcpt_to(to))
            .await?
            .into_result()?;
        self.step("DATA", timeouts.command(), client.data()).await?;
        self.step("message data", timeouts.data(), client.send_data(message))
            .await?
            .into_result()
    }

    /// Abandons the current transaction after an SMTP rejection so the
    /// connection can be reused.
    async fn reset(&self, mut connection: PooledConnection) {
        let reset = self
            .step(
                "RSET",
                self.config.timeouts.command(),
                connection.client.rset(),
            )
            .await;

        match reset.and_then(Response::into_result) {
            Ok(_) => self.release(connection).await,
            Err(e) => {
                internal!(level = DEBUG, "Dropping connection after failed RSET: {e}");
            }
        }
    }

    async fn release(&self, connection: PooledConnection) {
        let retired = {
            let mut idle = self.idle.lock();
            if self.is_closed()
                || connection.messages_sent >= self.config.max_messages_per_connection
            {
                Some(connection)
            } else {
                idle.push(connection);
                None
            }
        };

        if let Some(connection) = retired {
            self.retire(connection).await;
        }
    }

    async fn retire(&self, mut connection: PooledConnection) {
        match tokio::time::timeout(self.config.timeouts.quit(), connection.client.quit()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => internal!(level = DEBUG, "QUIT to {} failed: {e}", self.endpoint.host),
            Err(_) => internal!(level = DEBUG, "QUIT to {} timed out", self.endpoint.host),
        }
    }

    /// Runs one network step under its timeout, aborting it as soon as the
    /// pool is closed.
    async fn step<T>(
        &self,
        label: &str,
        limit: Duration,
        operation: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let mut closed = self.closed.subscribe();

        tokio::select! {
            result = tokio::time::timeout(limit, operation) => {
                result.map_err(|_| ClientError::Timeout(label.to_string()))?
            }
            _ = closed.wait_for(|closed| *closed) => Err(ClientError::PoolClosed),
        }
    }

    fn tls_config(&self) -> Result<Arc<ClientConfig>> {
        let mut slot = self.tls.lock();
        if let Some(config) = slot.as_ref() {
            return Ok(Arc::clone(config));
        }

        let config = tls::client_config(self.config.accept_invalid_certs)?;
        *slot = Some(Arc::clone(&config));
        Ok(config)
    }
}
