//! The public face of the engine: submit, cancel and observe jobs.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use volley_common::internal;

use crate::{
    config::DispatchConfig,
    error::{DispatchError, SubmitError, TransportError},
    events::{EventSink, Reporter},
    job::{Coordinator, JobId, JobSnapshot},
    request::SubmitRequest,
    transport::{SmtpTransportFactory, TransportFactory},
};

struct JobHandle {
    cancel: CancellationToken,
    snapshot: watch::Receiver<JobSnapshot>,
}

/// Runs bulk sends. Every job gets its own relay pool, workers and
/// counters; jobs never share state with each other.
pub struct Dispatcher {
    config: Arc<DispatchConfig>,
    factory: Arc<dyn TransportFactory>,
    sink: Arc<dyn EventSink>,
    jobs: DashMap<JobId, JobHandle>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("jobs", &self.jobs.len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        config: DispatchConfig,
        factory: Arc<dyn TransportFactory>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            factory,
            sink,
            jobs: DashMap::new(),
        }
    }

    /// A dispatcher that delivers over SMTP using `config.smtp`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Tls` if the TLS client configuration cannot
    /// be built.
    pub fn smtp(config: DispatchConfig, sink: Arc<dyn EventSink>) -> Result<Self, TransportError> {
        let factory = SmtpTransportFactory::new(config.smtp.clone())?;
        Ok(Self::new(config, Arc::new(factory), sink))
    }

    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Validates `request` and starts it in the background.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// The request is rejected as a whole if it is malformed; no worker is
    /// started in that case.
    pub fn submit(&self, request: SubmitRequest) -> Result<JobId, SubmitError> {
        let spec = Arc::new(request.validate()?);
        let id = JobId::new();

        let (snapshot, receiver) = watch::channel(JobSnapshot::submitted(
            id,
            spec.recipients.len(),
            spec.relays.len(),
        ));
        let cancel = CancellationToken::new();

        internal!(
            level = INFO,
            "Accepted job {id}: {} recipients, {} relays, {} workers",
            spec.recipients.len(),
            spec.relays.len(),
            spec.worker_count
        );

        let coordinator = Coordinator {
            reporter: Reporter::new(id, spec.owner.clone(), Arc::clone(&self.sink)),
            spec,
            config: Arc::clone(&self.config),
            factory: Arc::clone(&self.factory),
            cancel: cancel.clone(),
            snapshot,
        };

        self.jobs.insert(
            id,
            JobHandle {
                cancel,
                snapshot: receiver,
            },
        );
        tokio::spawn(coordinator.run());

        Ok(id)
    }

    /// Requests a hard stop: workers stop at their next check and every
    /// relay connection of the job is torn down, failing sends in flight.
    ///
    /// # Errors
    ///
    /// `UnknownJob` for an id never issued or already forgotten,
    /// `AlreadyFinished` if the job is terminal.
    pub fn cancel(&self, id: JobId) -> Result<(), DispatchError> {
        let handle = self.jobs.get(&id).ok_or(DispatchError::UnknownJob(id))?;
        if handle.snapshot.borrow().state.is_terminal() {
            return Err(DispatchError::AlreadyFinished(id));
        }

        internal!(level = INFO, "Cancelling job {id}");
        handle.cancel.cancel();
        Ok(())
    }

    /// Current counters of a running or finished job.
    ///
    /// # Errors
    ///
    /// `UnknownJob` for an id never issued or already forgotten.
    pub fn status(&self, id: JobId) -> Result<JobSnapshot, DispatchError> {
        self.jobs
            .get(&id)
            .map(|handle| *handle.snapshot.borrow())
            .ok_or(DispatchError::UnknownJob(id))
    }

    /// Resolves with the terminal snapshot once the job has finished.
    ///
    /// # Errors
    ///
    /// `UnknownJob` for an id never issued or already forgotten.
    pub async fn wait(&self, id: JobId) -> Result<JobSnapshot, DispatchError> {
        let mut receiver = self
            .jobs
            .get(&id)
            .map(|handle| handle.snapshot.clone())
            .ok_or(DispatchError::UnknownJob(id))?;

        let result = receiver
            .wait_for(|snapshot| snapshot.state.is_terminal())
            .await
            .map(|snapshot| *snapshot);

        match result {
            Ok(snapshot) => Ok(snapshot),
            // The coordinator dropped its sender; the last value is final.
            Err(_) => Ok(*receiver.borrow()),
        }
    }

    /// Drops a finished job from the registry.
    ///
    /// # Errors
    ///
    /// `UnknownJob` for an id never issued or already forgotten,
    /// `StillRunning` if the job is not terminal yet.
    pub fn forget(&self, id: JobId) -> Result<JobSnapshot, DispatchError> {
        let removed = self
            .jobs
            .remove_if(&id, |_, handle| handle.snapshot.borrow().state.is_terminal());

        match removed {
            Some((_, handle)) => Ok(*handle.snapshot.borrow()),
            None if self.jobs.contains_key(&id) => Err(DispatchError::StillRunning(id)),
            None => Err(DispatchError::UnknownJob(id)),
        }
    }

    /// Snapshots of every job still registered, ordered by id.
    #[must_use]
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        let mut snapshots: Vec<JobSnapshot> = self
            .jobs
            .iter()
            .map(|entry| *entry.value().snapshot.borrow())
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.id);
        snapshots
    }

    /// Cancels every job that is still running.
    pub fn shutdown(&self) {
        for entry in self.jobs.iter() {
            if !entry.value().snapshot.borrow().state.is_terminal() {
                tracing::debug!("Cancelling job {} on shutdown", entry.key());
                entry.value().cancel.cancel();
            }
        }
    }
}
