//! User-facing job events.
//!
//! These are not diagnostics: they are what a front end shows to the person
//! who submitted the job. The engine publishes them to an [`EventSink`] and
//! does not know who, if anyone, is listening. Publishing never fails from
//! the engine's point of view.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    pub message: String,
    pub severity: Severity,
}

/// Counter snapshot sent after every recipient outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub sent: usize,
    pub failed: usize,
    pub remaining: usize,
    pub total: usize,
    pub active_relay_count: usize,
}

/// Per-recipient result addressed to the job's owner, for audit views
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutcomeEvent {
    pub job_owner_id: Option<String>,
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    Log(LogEvent),
    Progress(ProgressEvent),
    Outcome(OutcomeEvent),
}

/// An event together with the job that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobEvent {
    pub job: JobId,
    #[serde(flatten)]
    pub event: Event,
}

/// Destination for job events
pub trait EventSink: Send + Sync {
    fn publish(&self, event: JobEvent);
}

/// Drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: JobEvent) {}
}

/// Fans events out to any number of subscribers.
///
/// Slow subscribers lose the oldest events; with no subscriber at all the
/// events are dropped.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<JobEvent>,
}

impl BroadcastSink {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }
}

/// Writes events to the diagnostic log, for headless runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, JobEvent { job, event }: JobEvent) {
        match event {
            Event::Log(LogEvent { message, severity })
            | Event::Outcome(OutcomeEvent {
                message, severity, ..
            }) => match severity {
                Severity::Info | Severity::Success => tracing::info!(%job, "{message}"),
                Severity::Warning => tracing::warn!(%job, "{message}"),
                Severity::Error => tracing::error!(%job, "{message}"),
            },
            Event::Progress(progress) => tracing::debug!(
                %job,
                sent = progress.sent,
                failed = progress.failed,
                remaining = progress.remaining,
                total = progress.total,
                active_relays = progress.active_relay_count,
                "Progress"
            ),
        }
    }
}

/// Publishes the events of one job
#[derive(Clone)]
pub(crate) struct Reporter {
    job: JobId,
    owner: Option<String>,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("job", &self.job)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl Reporter {
    pub(crate) fn new(job: JobId, owner: Option<String>, sink: Arc<dyn EventSink>) -> Self {
        Self { job, owner, sink }
    }

    fn publish(&self, event: Event) {
        self.sink.publish(JobEvent {
            job: self.job,
            event,
        });
    }

    pub(crate) fn log(&self, severity: Severity, message: impl Into<String>) {
        self.publish(Event::Log(LogEvent {
            message: message.into(),
            severity,
        }));
    }

    pub(crate) fn progress(&self, progress: ProgressEvent) {
        self.publish(Event::Progress(progress));
    }

    pub(crate) fn outcome(&self, severity: Severity, message: impl Into<String>) {
        self.publish(Event::Outcome(OutcomeEvent {
            job_owner_id: self.owner.clone(),
            message: message.into(),
            severity,
        }));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_broadcast_without_subscribers_is_silent() {
        let sink = BroadcastSink::new(4);
        let reporter = Reporter::new(JobId::new(), None, Arc::new(sink));
        reporter.log(Severity::Info, "nobody listens");
    }

    #[test]
    fn test_broadcast_delivers_in_order() {
        let sink = BroadcastSink::new(16);
        let mut receiver = sink.subscribe();
        let job = JobId::new();
        let reporter = Reporter::new(job, Some("owner-1".to_string()), Arc::new(sink));

        reporter.log(Severity::Info, "first");
        reporter.outcome(Severity::Success, "second");

        assert_eq!(
            receiver.try_recv().unwrap(),
            JobEvent {
                job,
                event: Event::Log(LogEvent {
                    message: "first".to_string(),
                    severity: Severity::Info
                })
            }
        );
        assert_eq!(
            receiver.try_recv().unwrap().event,
            Event::Outcome(OutcomeEvent {
                job_owner_id: Some("owner-1".to_string()),
                message: "second".to_string(),
                severity: Severity::Success
            })
        );
    }

    #[test]
    fn test_severity_display() {
        assert_eq!(Severity::Warning.to_string(), "warning");
    }
}
