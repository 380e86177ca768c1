//! Job identity, counters and the coordinator task.
//!
//! The coordinator is the only writer of a job's counters. Workers report
//! each recipient outcome over a channel; the coordinator applies it,
//! publishes a progress event and updates the snapshot that `status` and
//! `wait` read.

use std::{ops::Range, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;
use volley_common::internal;

use crate::{
    config::DispatchConfig,
    error::Failure,
    events::{ProgressEvent, Reporter, Severity},
    relay::RelayPool,
    request::JobSpec,
    throttle::Throttle,
    transport::TransportFactory,
    worker::{Worker, WorkerExit},
};

/// Opaque job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Ulid);

impl JobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for JobId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Submitted,
    Running,
    /// Every recipient was accounted for
    Completed,
    /// Cancelled before every recipient was processed
    Aborted,
}

impl JobState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

/// Counters of a job at one point in time.
///
/// `sent + failed + remaining == total` holds for every snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub state: JobState,
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub remaining: usize,
    pub active_relays: usize,
}

impl JobSnapshot {
    pub(crate) const fn submitted(id: JobId, total: usize, relays: usize) -> Self {
        Self {
            id,
            state: JobState::Submitted,
            total,
            sent: 0,
            failed: 0,
            remaining: total,
            active_relays: relays,
        }
    }

    const fn record(&mut self, outcome: &Result<(), Failure>) {
        if self.remaining == 0 {
            return;
        }
        self.remaining -= 1;
        match outcome {
            Ok(()) => self.sent += 1,
            Err(_) => self.failed += 1,
        }
    }

    const fn progress(&self) -> ProgressEvent {
        ProgressEvent {
            sent: self.sent,
            failed: self.failed,
            remaining: self.remaining,
            total: self.total,
            active_relay_count: self.active_relays,
        }
    }
}

/// Contiguous shard ranges of `ceil(total / workers)` recipients each; the
/// last one may be shorter and there may be fewer shards than workers.
#[must_use]
pub fn shard_bounds(total: usize, workers: usize) -> Vec<Range<usize>> {
    if total == 0 {
        return Vec::new();
    }

    let size = total.div_ceil(workers.max(1));
    (0..total)
        .step_by(size)
        .map(|start| start..(start + size).min(total))
        .collect()
}

const DELIVERABILITY_TIPS: &str = "Deliverability tips: 1) Use dedicated IPs, 2) Set up DKIM/SPF/DMARC, 3) Warm up new IPs gradually";

/// `host` is the account domain itself or one of its subdomains
fn is_aligned(host: &str, domain: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let domain = domain.to_ascii_lowercase();

    host == domain
        || host
            .strip_suffix(&domain)
            .is_some_and(|rest| rest.ends_with('.'))
}

/// What a worker reports for one recipient
#[derive(Debug)]
pub(crate) struct Report {
    pub recipient: String,
    pub outcome: Result<(), Failure>,
}

/// Runs one job from start to terminal state
pub(crate) struct Coordinator {
    pub spec: Arc<JobSpec>,
    pub config: Arc<DispatchConfig>,
    pub factory: Arc<dyn TransportFactory>,
    pub reporter: Reporter,
    pub cancel: CancellationToken,
    pub snapshot: watch::Sender<JobSnapshot>,
}

impl Coordinator {
    #[tracing::instrument(skip(self), fields(job = %self.snapshot.borrow().id))]
    pub(crate) async fn run(self) {
        let total = self.spec.recipients.len();
        self.snapshot.send_modify(|s| s.state = JobState::Running);

        self.reporter.log(
            Severity::Info,
            format!(
                "Starting dispatch with {} workers over {} relays, total {total}",
                self.spec.worker_count,
                self.spec.relays.len()
            ),
        );

        let build = RelayPool::build(
            &self.spec.relays,
            self.factory.as_ref(),
            &self.config.relays,
            self.reporter.clone(),
        );
        let pool = tokio::select! {
            pool = build => Arc::new(pool),
            () = self.cancel.cancelled() => {
                self.finish();
                return;
            }
        };
        self.snapshot
            .send_modify(|s| s.active_relays = pool.active_count());
        self.warn_alignment(&pool);

        let (reports, mut incoming) = mpsc::unbounded_channel();
        let mut workers = JoinSet::new();
        let throttle = Throttle::new(self.config.throttle.clone());

        for (id, range) in shard_bounds(total, self.spec.worker_count)
            .into_iter()
            .enumerate()
        {
            internal!(
                level = DEBUG,
                "Worker {id} takes recipients {}..{}",
                range.start,
                range.end
            );

            let worker = Worker {
                id,
                shard: range,
                spec: Arc::clone(&self.spec),
                pool: Arc::clone(&pool),
                throttle: throttle.clone(),
                policy: self.config.relays.clone(),
                reporter: self.reporter.clone(),
                cancel: self.cancel.clone(),
                reports: reports.clone(),
            };
            workers.spawn(worker.run());
        }
        drop(reports);

        let mut torn_down = false;
        loop {
            tokio::select! {
                report = incoming.recv() => match report {
                    Some(report) => self.apply(&report, &pool),
                    None => break,
                },
                () = self.cancel.cancelled(), if !torn_down => {
                    torn_down = true;
                    self.reporter.log(Severity::Warning, "Stop requested, closing relay connections");
                    pool.close_all().await;
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(WorkerExit::Drained) => {}
                Ok(WorkerExit::Stopped) => internal!(level = DEBUG, "Worker stopped early"),
                Err(e) => tracing::error!("Worker task failed: {e}"),
            }
        }

        pool.close_all().await;
        self.finish();
    }

    /// Mail leaves as the relay account, so receivers check SPF/DKIM
    /// against the account's domain, not the relay host.
    fn warn_alignment(&self, pool: &RelayPool) {
        self.reporter.log(
            Severity::Warning,
            "Ensure SPF/DKIM alignment for best deliverability. Sender domain should match SMTP domain.",
        );

        for entry in pool.entries().filter(|e| !is_aligned(e.host(), e.domain())) {
            self.reporter.log(
                Severity::Warning,
                format!(
                    "relay#{} ({}) sends as {}; SPF/DKIM for {} must cover this relay",
                    entry.number(),
                    entry.host(),
                    entry.domain(),
                    entry.domain()
                ),
            );
        }
    }

    fn apply(&self, report: &Report, pool: &RelayPool) {
        self.snapshot.send_modify(|s| {
            s.record(&report.outcome);
            s.active_relays = pool.active_count();
        });
        let progress = self.snapshot.borrow().progress();
        self.reporter.progress(progress);

        match &report.outcome {
            Ok(()) => self
                .reporter
                .outcome(Severity::Success, format!("Sent to {}", report.recipient)),
            Err(failure) => self.reporter.outcome(
                Severity::Error,
                format!("Failed to send to {}: {failure}", report.recipient),
            ),
        }
    }

    fn finish(&self) {
        self.snapshot.send_modify(|s| {
            s.state = if s.remaining == 0 {
                JobState::Completed
            } else {
                JobState::Aborted
            };
        });

        let snapshot = *self.snapshot.borrow();
        match snapshot.state {
            JobState::Completed => {
                self.reporter.log(
                    Severity::Success,
                    format!(
                        "Dispatch completed. Sent: {}, Failed: {}",
                        snapshot.sent, snapshot.failed
                    ),
                );
                self.reporter.log(Severity::Info, DELIVERABILITY_TIPS);
            }
            _ => self.reporter.log(
                Severity::Warning,
                format!(
                    "Dispatch stopped by user. Sent: {}, Failed: {}, Not processed: {}",
                    snapshot.sent, snapshot.failed, snapshot.remaining
                ),
            ),
        }

        internal!(
            level = INFO,
            "Job {} finished as {:?} ({} sent, {} failed, {} remaining)",
            snapshot.id,
            snapshot.state,
            snapshot.sent,
            snapshot.failed,
            snapshot.remaining
        );
    }
}
