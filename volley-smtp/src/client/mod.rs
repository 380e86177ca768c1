//! SMTP client for relay submission.
//!
//! The client drives one connection at a time:
//!
//! - Plain TCP, implicit TLS (port 465 style) or a STARTTLS upgrade
//! - Capability discovery from the EHLO reply
//! - AUTH PLAIN / AUTH LOGIN
//! - MAIL FROM / RCPT TO / DATA with dot-stuffing
//!
//! # Example
//!
//! ```no_run
//! use volley_smtp::client::{Credentials, SmtpClient, tls};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = tls::client_config(false)?;
//! let mut client = SmtpClient::connect("smtp.example.com:587", "smtp.example.com").await?;
//! client.read_greeting().await?.into_result()?;
//! client.ehlo("client.example.com").await?.into_result()?;
//! client.starttls(config).await?;
//! client.ehlo("client.example.com").await?.into_result()?;
//! client
//!     .authenticate(&Credentials::new("user@example.com", "secret"))
//!     .await?;
//! client.mail_from("user@example.com").await?.into_result()?;
//! client.rcpt_to("friend@example.org").await?.into_result()?;
//! client.data().await?;
//! client.send_data("Subject: Hi\r\n\r\nHello\r\n").await?.into_result()?;
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

mod auth;
mod error;
mod message;
mod response;
mod smtp_client;
pub mod tls;

pub use auth::{Credentials, Mechanism};
pub use error::{ClientError, Result};
pub use message::{MessageBuilder, strip_tags};
pub use response::{Capabilities, Response, ResponseLine};
pub use smtp_client::SmtpClient;
