//! In-process relay for tests.
//!
//! [`MockRelay`] accepts plain connections on a random local port, answers
//! EHLO, AUTH (PLAIN and LOGIN), MAIL, RCPT, DATA, RSET and QUIT with
//! configurable replies, and records everything it receives.
//!
//! ```rust,no_run
//! use volley_smtp::testing::MockRelay;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let relay = MockRelay::builder()
//!     .with_rcpt_to_response(550, "User unknown")
//!     .build()
//!     .await?;
//!
//! // point a pool at relay.addr()
//!
//! relay.shutdown();
//! # Ok(())
//! # }
//! ```

use std::{
    fmt::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};

/// A command received by the mock relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCommand {
    Ehlo(String),
    /// AUTH with the mechanism name
    Auth(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    Quit,
    StartTls,
    Other(String),
}

#[derive(Debug, Clone)]
struct Reply {
    code: u16,
    message: String,
}

impl Reply {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Debug, Clone)]
struct MockConfig {
    greeting: Reply,
    capabilities: Vec<String>,
    auth: Reply,
    mail_from: Reply,
    rcpt_to: Reply,
    data: Reply,
    data_end: Reply,
    data_end_delay: Option<Duration>,
    drop_after_commands: Option<usize>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            greeting: Reply::new(220, "mock.relay.test ESMTP"),
            capabilities: vec![
                "mock.relay.test".to_string(),
                "SIZE 10000000".to_string(),
                "AUTH PLAIN LOGIN".to_string(),
            ],
            auth: Reply::new(235, "Authentication successful"),
            mail_from: Reply::new(250, "OK"),
            rcpt_to: Reply::new(250, "OK"),
            data: Reply::new(354, "End data with <CR><LF>.<CR><LF>"),
            data_end: Reply::new(250, "OK: queued"),
            data_end_delay: None,
            drop_after_commands: None,
        }
    }
}

#[derive(Default)]
struct Recorded {
    commands: RwLock<Vec<MockCommand>>,
    messages: RwLock<Vec<String>>,
    connections: AtomicUsize,
}

/// A running mock relay
pub struct MockRelay {
    addr: SocketAddr,
    recorded: Arc<Recorded>,
    shutdown: Arc<AtomicBool>,
}

impl MockRelay {
    #[must_use]
    pub fn builder() -> MockRelayBuilder {
        MockRelayBuilder {
            config: MockConfig::default(),
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Every command received so far, across all connections
    pub async fn commands(&self) -> Vec<MockCommand> {
        self.recorded.commands.read().await.clone()
    }

    /// Message bodies accepted after DATA, dot-stuffing undone
    pub async fn messages(&self) -> Vec<String> {
        self.recorded.messages.read().await.clone()
    }

    /// Connections accepted so far
    #[must_use]
    pub fn connections(&self) -> usize {
        self.recorded.connections.load(Ordering::Relaxed)
    }

    /// Stops accepting connections. Open sessions run until the peer leaves.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    #[allow(clippy::too_many_lines)]
    async fn handle_client(
        mut stream: TcpStream,
        config: Arc<MockConfig>,
        recorded: Arc<Recorded>,
    ) -> std::io::Result<()> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut handled = 0;

        writer.write_all(&config.greeting.to_bytes()).await?;
        writer.flush().await?;

        loop {
            if config
                .drop_after_commands
                .is_some_and(|limit| handled >= limit)
            {
                return Ok(());
            }

            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            handled += 1;

            let command_line = line.trim_end();
            tracing::trace!("Mock relay received: {command_line}");

            let (verb, argument) = command_line
                .split_once(' ')
                .unwrap_or((command_line, ""));

            let (reply, command) = match verb.to_ascii_uppercase().as_str() {
                "EHLO" => (
                    ehlo_reply(&config.capabilities),
                    MockCommand::Ehlo(argument.to_string()),
                ),
                "AUTH" => {
                    let mechanism = argument
                        .split_whitespace()
                        .next()
                        .unwrap_or_default()
                        .to_ascii_uppercase();
                    recorded
                        .commands
                        .write()
                        .await
                        .push(MockCommand::Auth(mechanism.clone()));

                    let rounds = match mechanism.as_str() {
                        "PLAIN" => 1,
                        "LOGIN" => 2,
                        _ => {
                            writer
                                .write_all(&Reply::new(504, "Unrecognized mechanism").to_bytes())
                                .await?;
                            continue;
                        }
                    };

                    for _ in 0..rounds {
                        writer.write_all(b"334 \r\n").await?;
                        writer.flush().await?;
                        line.clear();
                        if reader.read_line(&mut line).await? == 0 {
                            return Ok(());
                        }
                    }

                    writer.write_all(&config.auth.to_bytes()).await?;
                    writer.flush().await?;
                    continue;
                }
                "MAIL" => (
                    config.mail_from.to_bytes(),
                    MockCommand::MailFrom(path_argument(argument, "FROM:")),
                ),
                "RCPT" => (
                    config.rcpt_to.to_bytes(),
                    MockCommand::RcptTo(path_argument(argument, "TO:")),
                ),
                "DATA" => (config.data.to_bytes(), MockCommand::Data),
                "RSET" => (Reply::new(250, "OK").to_bytes(), MockCommand::Rset),
                "STARTTLS" => (
                    Reply::new(502, "Command not implemented").to_bytes(),
                    MockCommand::StartTls,
                ),
                "QUIT" => {
                    recorded.commands.write().await.push(MockCommand::Quit);
                    writer.write_all(&Reply::new(221, "Bye").to_bytes()).await?;
                    writer.flush().await?;
                    return Ok(());
                }
                _ => (
                    Reply::new(500, "Unknown command").to_bytes(),
                    MockCommand::Other(command_line.to_string()),
                ),
            };

            let is_data = command == MockCommand::Data;
            recorded.commands.write().await.push(command);
            writer.write_all(&reply).await?;
            writer.flush().await?;

            if is_data && config.data.code == 354 {
                let mut message = String::new();
                loop {
                    line.clear();
                    if reader.read_line(&mut line).await? == 0 {
                        return Ok(());
                    }

                    let content = line.trim_end_matches(['\r', '\n']);
                    if content == "." {
                        break;
                    }
                    message.push_str(content.strip_prefix('.').unwrap_or(content));
                    message.push_str("\r\n");
                }

                recorded.messages.write().await.push(message);

                if let Some(delay) = config.data_end_delay {
                    tokio::time::sleep(delay).await;
                }
                writer.write_all(&config.data_end.to_bytes()).await?;
                writer.flush().await?;
            }
        }
    }
}

fn ehlo_reply(capabilities: &[String]) -> Vec<u8> {
    let mut reply = String::new();
    let last = capabilities.len().saturating_sub(1);

    for (i, capability) in capabilities.iter().enumerate() {
        let separator = if i == last { ' ' } else { '-' };
        let _ = write!(reply, "250{separator}{capability}\r\n");
    }

    reply.into_bytes()
}

fn path_argument(argument: &str, prefix: &str) -> String {
    let argument = argument.trim();
    let path = argument
        .get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .map_or(argument, |_| &argument[prefix.len()..]);

    path.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

/// Configures a [`MockRelay`]
pub struct MockRelayBuilder {
    config: MockConfig,
}

impl MockRelayBuilder {
    #[must_use]
    pub fn with_greeting(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.greeting = Reply::new(code, message);
        self
    }

    /// Lines of the EHLO reply, the first one being the greeting line
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.config.capabilities = capabilities;
        self
    }

    /// Final reply to AUTH once the credentials were sent
    #[must_use]
    pub fn with_auth_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.auth = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.mail_from = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.rcpt_to = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_data_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data = Reply::new(code, message);
        self
    }

    /// Reply after the end-of-data marker
    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_end = Reply::new(code, message);
        self
    }

    /// Hold the reply after the end-of-data marker
    #[must_use]
    pub const fn with_data_end_delay(mut self, delay: Duration) -> Self {
        self.config.data_end_delay = Some(delay);
        self
    }

    /// Drop each connection after N commands
    #[must_use]
    pub const fn with_network_error_after_commands(mut self, count: usize) -> Self {
        self.config.drop_after_commands = Some(count);
        self
    }

    /// Binds to a random local port and starts accepting.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn build(self) -> std::io::Result<MockRelay> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Arc::new(self.config);
        let recorded = Arc::new(Recorded::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        {
            let recorded = Arc::clone(&recorded);
            let shutdown = Arc::clone(&shutdown);

            tokio::spawn(async move {
                while !shutdown.load(Ordering::Relaxed) {
                    let Ok(Ok((stream, _peer))) =
                        timeout(Duration::from_millis(50), listener.accept()).await
                    else {
                        continue;
                    };

                    recorded.connections.fetch_add(1, Ordering::Relaxed);
                    let config = Arc::clone(&config);
                    let recorded = Arc::clone(&recorded);

                    tokio::spawn(async move {
                        if let Err(e) = MockRelay::handle_client(stream, config, recorded).await {
                            tracing::debug!("Mock relay client error: {e}");
                        }
                    });
                }
            });
        }

        Ok(MockRelay {
            addr,
            recorded,
            shutdown,
        })
    }
}
