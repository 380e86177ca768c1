//! SASL PLAIN and LOGIN for relay submission (RFC 4954).

use base64::{Engine, engine::general_purpose::STANDARD};

use super::response::Capabilities;

/// Username and password for a relay account
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Supported AUTH mechanisms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Plain,
    Login,
}

impl Mechanism {
    /// Pick a mechanism from what the server advertised.
    ///
    /// PLAIN is preferred. Servers that advertise nothing usable still get
    /// a PLAIN attempt; the reply tells us whether it was accepted.
    #[must_use]
    pub fn negotiate(capabilities: &Capabilities) -> Self {
        if !capabilities.supports_auth("PLAIN") && capabilities.supports_auth("LOGIN") {
            Self::Login
        } else {
            Self::Plain
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }
}

/// Initial response for AUTH PLAIN: `base64(\0username\0password)`
pub(crate) fn plain_initial_response(credentials: &Credentials) -> String {
    STANDARD.encode(format!(
        "\0{}\0{}",
        credentials.username(),
        credentials.password()
    ))
}

pub(crate) fn encode(value: &str) -> String {
    STANDARD.encode(value)
}
