//! Shared building blocks for the volley bulk dispatcher.

pub mod address;
pub mod logging;

pub use tracing;
