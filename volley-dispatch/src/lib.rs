//! Bulk dispatch engine
//!
//! This crate provides functionality to:
//! - Validate a bulk send request and split its recipients into shards
//! - Run one worker per shard, rotating over a per-job pool of relays
//! - Pace sends with per-send jitter, burst pauses and a per-relay interval
//! - Render per-recipient placeholders in the subject and body
//! - Publish log, progress and outcome events to an [`EventSink`]
//! - Cancel a job with a hard stop that tears down its relay connections

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod job;
pub mod relay;
pub mod render;
pub mod request;
pub mod throttle;
pub mod transport;
mod worker;

#[cfg(test)]
mod test_support;

// Re-export the types a front end needs
pub use config::DispatchConfig;
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, Failure, SubmitError, TransportError};
pub use events::{BroadcastSink, Event, EventSink, JobEvent, NullSink, Severity, TracingSink};
pub use job::{JobId, JobSnapshot, JobState, shard_bounds};
pub use request::{RelayCredential, SecretRef, SubmitRequest, parse_relays};
