//! SMTP client implementation with support for TLS and STARTTLS.

use std::sync::Arc;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, pki_types::ServerName},
};
use volley_common::{incoming, outgoing};

use super::{
    auth::{self, Credentials, Mechanism},
    error::{ClientError, Result},
    response::{Capabilities, Response},
};

/// Initial size of the read buffer for SMTP responses.
const BUFFER_SIZE: usize = 8192;

/// Maximum size of the read buffer to prevent unbounded growth (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// An SMTP client connection that can be either plain TCP or TLS-wrapped.
enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl ClientConnection {
    /// Sends data over the connection.
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
        }
        Ok(())
    }

    /// Reads data from the connection into the provided buffer.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    /// Wraps a plain connection in TLS.
    async fn upgrade_to_tls(self, domain: &str, config: Arc<ClientConfig>) -> Result<Self> {
        match self {
            Self::Plain(stream) => {
                let connector = TlsConnector::from(config);
                let server_name = ServerName::try_from(domain.to_string())
                    .map_err(|e| ClientError::TlsError(format!("Invalid domain: {e}")))?;

                let tls_stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| ClientError::TlsError(e.to_string()))?;

                Ok(Self::Tls(Box::new(tls_stream)))
            }
            Self::Tls(_) => Err(ClientError::TlsError(
                "Connection is already TLS".to_string(),
            )),
        }
    }

    const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

/// An SMTP client for sending commands and receiving responses.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    server_domain: String,
    capabilities: Capabilities,
}

impl SmtpClient {
    /// Creates a new SMTP client by connecting to the specified address.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn connect(addr: &str, server_domain: impl Into<String>) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(ClientError::Io)?;
        stream.set_nodelay(true)?;

        Ok(Self {
            connection: Some(ClientConnection::Plain(stream)),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            server_domain: server_domain.into(),
            capabilities: Capabilities::default(),
        })
    }

    /// Connects and negotiates TLS before any SMTP traffic (implicit TLS,
    /// conventionally port 465).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the TLS handshake fails.
    pub async fn connect_tls(
        addr: &str,
        server_domain: impl Into<String>,
        config: Arc<ClientConfig>,
    ) -> Result<Self> {
        let mut client = Self::connect(addr, server_domain).await?;
        client.upgrade(config).await?;
        Ok(client)
    }

    /// Returns `true` once the connection is protected by TLS.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(ClientConnection::is_tls)
    }

    /// Extensions advertised by the most recent EHLO.
    #[must_use]
    pub const fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Reads the initial server greeting (220 response).
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the greeting is invalid.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await
    }

    /// Sends a command to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn send_command(&mut self, command: &str) -> Result<()> {
        outgoing!("{command}");
        self.write_line(command).await
    }

    /// Like [`SmtpClient::send_command`], but keeps the line out of the logs.
    async fn send_secret(&mut self, line: &str) -> Result<()> {
        outgoing!("<credentials>");
        self.write_line(line).await
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let data = format!("{line}\r\n");
        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(data.as_bytes())
            .await
    }

    /// Sends a raw command and reads the response.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        self.send_command(command).await?;
        self.read_response().await
    }

    /// Sends EHLO with the specified domain and records the advertised
    /// capabilities.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        let response = self.command(&format!("EHLO {domain}")).await?;
        self.capabilities = if response.is_success() {
            Capabilities::from_ehlo(&response)
        } else {
            Capabilities::default()
        };
        Ok(response)
    }

    /// Sends STARTTLS and upgrades the connection to TLS on success.
    ///
    /// Capabilities are cleared; RFC 3207 requires a fresh EHLO afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if STARTTLS is refused or the TLS upgrade fails.
    pub async fn starttls(&mut self, config: Arc<ClientConfig>) -> Result<Response> {
        let response = self.command("STARTTLS").await?.into_result()?;
        self.upgrade(config).await?;
        self.capabilities = Capabilities::default();
        Ok(response)
    }

    async fn upgrade(&mut self, config: Arc<ClientConfig>) -> Result<()> {
        let old_connection = self.connection.take().ok_or(ClientError::ConnectionClosed)?;
        self.connection = Some(
            old_connection
                .upgrade_to_tls(&self.server_domain, config)
                .await?,
        );
        self.buffer_pos = 0;
        Ok(())
    }

    /// Authenticates with the mechanism negotiated from the last EHLO.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::AuthenticationFailed` if the server rejects the
    /// credentials, or a transport error.
    pub async fn authenticate(&mut self, credentials: &Credentials) -> Result<Mechanism> {
        let mechanism = Mechanism::negotiate(&self.capabilities);

        let outcome = match mechanism {
            Mechanism::Plain => {
                self.send_command("AUTH PLAIN").await?;
                let challenge = self.read_response().await?;
                if challenge.code == 334 {
                    self.send_secret(&auth::plain_initial_response(credentials))
                        .await?;
                    self.read_response().await?
                } else {
                    challenge
                }
            }
            Mechanism::Login => {
                self.command("AUTH LOGIN").await?.into_intermediate()?;
                self.send_secret(&auth::encode(credentials.username()))
                    .await?;
                self.read_response().await?.into_intermediate()?;
                self.send_secret(&auth::encode(credentials.password()))
                    .await?;
                self.read_response().await?
            }
        };

        match outcome.into_result() {
            Ok(_) => Ok(mechanism),
            Err(ClientError::SmtpError { code, message }) => Err(
                ClientError::AuthenticationFailed(format!("{code} {message}")),
            ),
            Err(e) => Err(e),
        }
    }

    /// Sends MAIL FROM command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn mail_from(&mut self, from: &str) -> Result<Response> {
        self.command(&format!("MAIL FROM:<{from}>")).await
    }

    /// Sends RCPT TO command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    /// Sends DATA command, expecting a 354 go-ahead.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or is refused.
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await?.into_intermediate()
    }

    /// Sends the message content followed by the end-of-data marker.
    ///
    /// Lines starting with `.` are dot-stuffed and bare `\n` line endings
    /// are normalised to CRLF.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn send_data(&mut self, data: &str) -> Result<Response> {
        let payload = dot_stuff(data);
        outgoing!("<{} octets of message data>", payload.len());

        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(payload.as_bytes())
            .await?;

        self.read_response().await
    }

    /// Sends QUIT command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    /// Sends RSET command to reset the transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await
    }

    /// Reads a complete SMTP response from the server.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the response is malformed.
    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                incoming!("{} {}", response.code, response.message());
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}

/// Apply SMTP transparency (RFC 5321 §4.5.2), normalise line endings and
/// append the `<CRLF>.<CRLF>` terminator.
fn dot_stuff(data: &str) -> String {
    let mut out = String::with_capacity(data.len() + 16);

    for line in data.split_inclusive('\n') {
        let content = line
            .strip_suffix('\n')
            .map_or(line, |l| l.strip_suffix('\r').unwrap_or(l));
        if content.starts_with('.') {
            out.push('.');
        }
        out.push_str(content);
        out.push_str("\r\n");
    }

    out.push_str(".\r\n");
    out
}
