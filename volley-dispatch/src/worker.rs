//! One worker per shard.
//!
//! A worker walks its slice of the recipient list in order and reports one
//! [`Report`] per recipient it finishes. Recipients it never gets to because
//! the job was cancelled are not reported and stay in `remaining`.

use std::{ops::Range, sync::Arc, time::Duration};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use volley_common::{address::parse_recipient, internal};

use crate::{
    error::{Failure, TransportError},
    events::{Reporter, Severity},
    job::Report,
    relay::{
        RelayPolicy, RelayPool,
        selector::{Selection, select_for_attempt},
    },
    render::{CatalogKind, render},
    request::JobSpec,
    throttle::Throttle,
    transport::OutgoingMessage,
};

/// How a worker ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerExit {
    /// Every recipient of the shard was reported
    Drained,
    /// Cancelled before the end of the shard
    Stopped,
}

/// Result of delivering to one recipient
enum Delivery {
    Sent,
    Exhausted { attempts: usize },
    Interrupted,
}

pub(crate) struct Worker {
    pub id: usize,
    pub shard: Range<usize>,
    pub spec: Arc<JobSpec>,
    pub pool: Arc<RelayPool>,
    pub throttle: Throttle,
    pub policy: RelayPolicy,
    pub reporter: Reporter,
    pub cancel: CancellationToken,
    pub reports: mpsc::UnboundedSender<Report>,
}

impl Worker {
    #[tracing::instrument(skip(self), fields(worker = self.id))]
    pub(crate) async fn run(self) -> WorkerExit {
        let total = self.spec.recipients.len();
        let max_attempts = self.policy.max_attempts(self.pool.len());
        // Each worker rotates through the relays on its own; workers start
        // on different relays.
        let mut relay_index = self.id % self.pool.len().max(1);
        let mut warned: Vec<CatalogKind> = Vec::new();

        for (offset, position) in self.shard.clone().enumerate() {
            if self.cancel.is_cancelled() {
                return WorkerExit::Stopped;
            }

            let Some(raw) = self.spec.recipients.get(position) else {
                break;
            };

            let mailbox = match parse_recipient(raw) {
                Ok(mailbox) => mailbox,
                Err(e) => {
                    self.reporter
                        .log(Severity::Warning, format!("Skipping invalid recipient {raw}: {e}"));
                    self.report(raw, Err(Failure::InvalidRecipient(e)));
                    continue;
                }
            };
            let recipient = mailbox.to_string();

            let subject = render(&self.spec.subject, &self.spec.catalog);
            let body = render(&self.spec.html_body, &self.spec.catalog);
            for kind in subject.unresolved.iter().chain(&body.unresolved) {
                if !warned.contains(kind) {
                    warned.push(*kind);
                    self.reporter.log(
                        Severity::Warning,
                        format!("No catalog entries for {kind}, placeholder left as is"),
                    );
                }
            }

            let pause = self.throttle.burst_delay(offset);
            if !pause.is_zero() {
                self.reporter.log(
                    Severity::Info,
                    format!(
                        "Worker {} pausing {}ms after {offset} recipients",
                        self.id,
                        pause.as_millis()
                    ),
                );
                if !self.sleep(pause).await {
                    return WorkerExit::Stopped;
                }
            }

            let template = Template {
                recipient: &recipient,
                subject: &subject.text,
                html: &body.text,
                position: position + 1,
                total,
            };

            match self
                .deliver(&template, &mut relay_index, max_attempts)
                .await
            {
                Delivery::Sent => self.report(&recipient, Ok(())),
                Delivery::Exhausted { attempts } => {
                    self.reporter.log(
                        Severity::Error,
                        format!("Giving up on {recipient} after {attempts} attempts"),
                    );
                    self.report(&recipient, Err(Failure::RelayExhausted { attempts }));
                }
                Delivery::Interrupted => return WorkerExit::Stopped,
            }
        }

        internal!(level = DEBUG, "Worker {} drained its shard", self.id);
        WorkerExit::Drained
    }

    async fn deliver(
        &self,
        template: &Template<'_>,
        relay_index: &mut usize,
        max_attempts: usize,
    ) -> Delivery {
        let mut attempts = 0;

        while attempts < max_attempts {
            if !self.sleep(self.throttle.per_send_delay()).await {
                return Delivery::Interrupted;
            }

            // Another worker may disable the relay while this one waits for
            // its slot; such a relay is skipped without spending an attempt.
            let entry = loop {
                let (entry, index) =
                    match select_for_attempt(&self.pool, *relay_index, max_attempts) {
                        Selection::Relay { entry, index } => (entry, index),
                        Selection::Exhausted => return Delivery::Exhausted { attempts },
                    };
                *relay_index = index + 1;

                if !self.sleep(self.throttle.per_relay_delay(&entry)).await {
                    return Delivery::Interrupted;
                }
                if !entry.is_disabled() {
                    break entry;
                }

                internal!(
                    level = DEBUG,
                    "relay#{} was disabled while worker {} waited for it",
                    entry.number(),
                    self.id
                );
            };

            attempts += 1;

            self.reporter.log(
                Severity::Info,
                format!(
                    "Sending {}/{} to {} via relay#{} ({}) from {}",
                    template.position,
                    template.total,
                    template.recipient,
                    entry.number(),
                    entry.host(),
                    entry.username()
                ),
            );

            let message = OutgoingMessage {
                sender_name: self.spec.sender_display_name.clone(),
                from: entry.username().to_string(),
                to: template.recipient.to_string(),
                subject: template.subject.to_string(),
                html: template.html.to_string(),
            };

            match entry.send(&message).await {
                Ok(()) => {
                    self.reporter.log(
                        Severity::Success,
                        format!(
                            "Sent to {} via relay#{} ({})",
                            template.recipient,
                            entry.number(),
                            entry.host()
                        ),
                    );
                    return Delivery::Sent;
                }
                Err(e) if self.cancel.is_cancelled() => {
                    self.interrupted(template.recipient, &e);
                    return Delivery::Interrupted;
                }
                Err(e) => {
                    self.reporter.log(
                        Severity::Error,
                        format!(
                            "[{}] relay#{} ({}) failed for {} (attempt {attempts}/{max_attempts}): {e}",
                            e.category(),
                            entry.number(),
                            entry.host(),
                            template.recipient
                        ),
                    );
                    self.pool.mark_failure(&entry);
                }
            }
        }

        Delivery::Exhausted { attempts }
    }

    fn interrupted(&self, recipient: &str, error: &TransportError) {
        self.reporter.log(
            Severity::Error,
            format!("Send to {recipient} interrupted by stop request: {error}"),
        );
    }

    fn report(&self, recipient: &str, outcome: Result<(), Failure>) {
        // The coordinator outlives every worker; a closed channel only
        // happens while the runtime shuts down.
        if self
            .reports
            .send(Report {
                recipient: recipient.to_string(),
                outcome,
            })
            .is_err()
        {
            tracing::debug!("Coordinator gone, dropping report for {recipient}");
        }
    }

    /// Sleeps unless cancelled first. Returns `false` on cancellation.
    async fn sleep(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.cancel.is_cancelled();
        }

        tokio::select! {
            () = tokio::time::sleep(duration) => true,
            () = self.cancel.cancelled() => false,
        }
    }
}

/// Per-recipient values shared by every attempt
struct Template<'a> {
    recipient: &'a str,
    subject: &'a str,
    html: &'a str,
    position: usize,
    total: usize,
}
