//! SMTP submission for volley.
//!
//! [`client`] speaks the protocol over a single connection (plain, implicit
//! TLS or STARTTLS, with AUTH PLAIN/LOGIN), and [`pool`] keeps a bounded set
//! of authenticated connections per relay so that consecutive messages reuse
//! them.

pub mod client;
pub mod pool;
mod timeouts;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use client::{ClientError, MessageBuilder, Response, SmtpClient};
pub use pool::{PoolConfig, RelayEndpoint, SmtpPool};
pub use timeouts::SmtpTimeouts;
