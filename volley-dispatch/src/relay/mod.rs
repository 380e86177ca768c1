//! Per-job relay state
//!
//! A [`RelayPool`] is built when a job starts and torn down when it ends; it
//! is never shared between jobs. Each [`RelayEntry`] tracks how often sends
//! through it failed and when it was last used.

pub mod selector;

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{task::JoinSet, time::Instant};
use volley_common::internal;
use volley_smtp::RelayEndpoint;

use crate::{
    error::TransportError,
    events::{Reporter, Severity},
    transport::{OutgoingMessage, Transport, TransportFactory},
};

/// When relays are given up on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayPolicy {
    /// Failed sends after which a relay is disabled for the rest of the job
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Attempts per recipient are capped at this many times the pool size
    #[serde(default = "default_attempts_per_relay")]
    pub attempts_per_relay: usize,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            attempts_per_relay: default_attempts_per_relay(),
        }
    }
}

impl RelayPolicy {
    /// Attempt budget for one recipient.
    #[must_use]
    pub const fn max_attempts(&self, pool_size: usize) -> usize {
        self.attempts_per_relay.saturating_mul(pool_size)
    }
}

const fn default_failure_threshold() -> u32 {
    3
}

const fn default_attempts_per_relay() -> usize {
    2
}

/// One relay credential and its health within a job
pub struct RelayEntry {
    number: usize,
    endpoint: RelayEndpoint,
    domain: String,
    transport: Arc<dyn Transport>,
    failures: AtomicU32,
    threshold: u32,
    last_used: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for RelayEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayEntry")
            .field("number", &self.number)
            .field("host", &self.endpoint.host)
            .field("port", &self.endpoint.port)
            .field("domain", &self.domain)
            .field("failures", &self.failure_count())
            .finish_non_exhaustive()
    }
}

impl RelayEntry {
    /// `number` is the one-based position shown in logs as `relay#n`.
    #[must_use]
    pub fn new(
        number: usize,
        endpoint: RelayEndpoint,
        transport: Arc<dyn Transport>,
        threshold: u32,
    ) -> Self {
        let domain = endpoint
            .credentials
            .username()
            .rsplit_once('@')
            .map_or_else(|| endpoint.host.clone(), |(_, domain)| domain.to_string());

        Self {
            number,
            endpoint,
            domain,
            transport,
            failures: AtomicU32::new(0),
            threshold,
            last_used: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn number(&self) -> usize {
        self.number
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.endpoint.host
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.endpoint.port
    }

    /// Account name, also used as the envelope sender
    #[must_use]
    pub fn username(&self) -> &str {
        self.endpoint.credentials.username()
    }

    /// Domain of the account name, or the host if the name has none
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.failure_count() >= self.threshold
    }

    /// Counts a failed send. Returns `true` for exactly the call that
    /// brought the count to the threshold.
    pub fn record_failure(&self) -> bool {
        let previous = self.failures.fetch_add(1, Ordering::AcqRel);
        previous.saturating_add(1) == self.threshold
    }

    /// Reserves the next slot at least `interval` after the previous one
    /// and returns how long the caller has to wait for it.
    ///
    /// The reservation happens under the entry's lock, so two workers
    /// asking at the same moment get consecutive slots.
    pub fn reserve_slot(&self, interval: Duration) -> Duration {
        let now = Instant::now();
        let mut last_used = self.last_used.lock();

        let slot = last_used.map_or(now, |previous| (previous + interval).max(now));
        *last_used = Some(slot);

        slot.saturating_duration_since(now)
    }

    /// Sends one message through this relay.
    ///
    /// # Errors
    ///
    /// Whatever the transport reports for this attempt.
    pub async fn send(&self, message: &OutgoingMessage) -> Result<(), TransportError> {
        self.transport.send(message).await
    }

    async fn warm_up(&self) -> Result<(), TransportError> {
        self.transport.warm_up().await
    }

    /// Tears down the relay's connections. Errors are swallowed by the
    /// transport and this may be called any number of times.
    pub async fn close(&self) {
        self.transport.close().await;
    }
}

/// Every relay of one job
#[derive(Debug)]
pub struct RelayPool {
    entries: Vec<Arc<RelayEntry>>,
    reporter: Reporter,
}

impl RelayPool {
    /// Creates one entry per endpoint and eagerly opens a connection to
    /// each, concurrently.
    ///
    /// A relay that cannot be reached at this point stays in the pool; the
    /// warm-up failure is reported as a warning and not counted as a send
    /// failure.
    pub(crate) async fn build(
        endpoints: &[RelayEndpoint],
        factory: &dyn TransportFactory,
        policy: &RelayPolicy,
        reporter: Reporter,
    ) -> Self {
        let entries: Vec<Arc<RelayEntry>> = endpoints
            .iter()
            .enumerate()
            .map(|(i, endpoint)| {
                Arc::new(RelayEntry::new(
                    i + 1,
                    endpoint.clone(),
                    factory.create(endpoint),
                    policy.failure_threshold,
                ))
            })
            .collect();

        let mut warm_ups = JoinSet::new();
        for entry in &entries {
            let entry = Arc::clone(entry);
            warm_ups.spawn(async move {
                let result = entry.warm_up().await;
                (entry, result)
            });
        }

        while let Some(joined) = warm_ups.join_next().await {
            match joined {
                Ok((entry, Ok(()))) => {
                    internal!(level = DEBUG, "relay#{} ({}) ready", entry.number(), entry.host());
                }
                Ok((entry, Err(e))) => reporter.log(
                    Severity::Warning,
                    format!(
                        "relay#{} ({}) could not be reached up front [{}]: {e}",
                        entry.number(),
                        entry.host(),
                        e.category()
                    ),
                ),
                Err(e) => tracing::error!("Relay warm-up task failed: {e}"),
            }
        }

        Self { entries, reporter }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Arc<RelayEntry>> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> impl Iterator<Item = &Arc<RelayEntry>> {
        self.entries.iter()
    }

    /// Relays that are not disabled
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_disabled()).count()
    }

    /// Counts a failed send against `entry` and reports the relay as
    /// disabled the one time its count reaches the threshold.
    pub fn mark_failure(&self, entry: &RelayEntry) {
        if entry.record_failure() {
            self.reporter.log(
                Severity::Warning,
                format!(
                    "relay#{} ({}) disabled after {} failures",
                    entry.number(),
                    entry.host(),
                    entry.failure_count()
                ),
            );
        }
    }

    /// Tears down every relay's connections.
    pub async fn close_all(&self) {
        let mut closing = JoinSet::new();
        for entry in &self.entries {
            let entry = Arc::clone(entry);
            closing.spawn(async move { entry.close().await });
        }

        while let Some(joined) = closing.join_next().await {
            if let Err(e) = joined {
                tracing::debug!("Relay teardown task failed: {e}");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use volley_smtp::client::Credentials;

    use super::*;
    use crate::test_support::Healthy;

    fn entry(username: &str) -> RelayEntry {
        RelayEntry::new(
            1,
            RelayEndpoint::new("smtp.relay.test", 587, Credentials::new(username, "pw")),
            Arc::new(Healthy),
            3,
        )
    }

    #[test]
    fn test_policy_defaults() {
        let policy = RelayPolicy::default();
        assert_eq!(policy.failure_threshold, 3);
        assert_eq!(policy.max_attempts(4), 8);
    }

    #[test]
    fn test_domain_from_username() {
        assert_eq!(entry("sender@mailer.test").domain(), "mailer.test");
        assert_eq!(entry("sender").domain(), "smtp.relay.test");
    }

    #[test]
    fn test_disabled_exactly_once() {
        let entry = entry("a@b.test");

        let crossings: Vec<bool> = (0..6).map(|_| entry.record_failure()).collect();
        assert_eq!(crossings, vec![false, false, true, false, false, false]);
        assert!(entry.is_disabled());
        assert_eq!(entry.failure_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_slot_spaces_attempts() {
        let entry = entry("a@b.test");
        let interval = Duration::from_secs(1);

        assert_eq!(entry.reserve_slot(interval), Duration::ZERO);
        assert_eq!(entry.reserve_slot(interval), Duration::from_secs(1));
        assert_eq!(entry.reserve_slot(interval), Duration::from_secs(2));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(entry.reserve_slot(interval), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_slot_after_partial_wait() {
        let entry = entry("a@b.test");
        let interval = Duration::from_secs(1);

        let _ = entry.reserve_slot(interval);
        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(entry.reserve_slot(interval), Duration::from_millis(600));
    }
}
