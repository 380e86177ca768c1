//! In-memory transport whose behaviour is scripted per relay host
#![allow(dead_code)] // Test utility module - not all methods used in every test

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use volley_dispatch::{
    TransportError,
    transport::{OutgoingMessage, Transport, TransportFactory},
};
use volley_smtp::RelayEndpoint;

/// What a scripted relay does with each send
#[derive(Debug, Clone)]
pub enum Behaviour {
    Accept,
    Reject(TransportError),
    /// Rejects the first `n` sends, accepts the rest
    FailFirst(usize),
    /// Never answers; the send fails once the transport is closed
    HangUntilClosed,
}

/// One send as seen by a scripted relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub host: String,
    pub message: OutgoingMessage,
    pub accepted: bool,
    /// When the send reached the relay
    pub at: Instant,
}

#[derive(Debug)]
pub struct ScriptedTransport {
    host: String,
    behaviour: Behaviour,
    sends: AtomicUsize,
    closes: AtomicUsize,
    closed: CancellationToken,
    attempts: Arc<Mutex<Vec<Attempt>>>,
}

impl ScriptedTransport {
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn record(&self, message: &OutgoingMessage, accepted: bool) {
        self.attempts.lock().push(Attempt {
            host: self.host.clone(),
            message: message.clone(),
            accepted,
            at: Instant::now(),
        });
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn warm_up(&self) -> Result<(), TransportError> {
        match &self.behaviour {
            Behaviour::Reject(error) => Err(error.clone()),
            _ => Ok(()),
        }
    }

    async fn send(&self, message: &OutgoingMessage) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed("transport closed".to_string()));
        }

        let n = self.sends.fetch_add(1, Ordering::SeqCst);
        let result = match &self.behaviour {
            Behaviour::Accept => Ok(()),
            Behaviour::Reject(error) => Err(error.clone()),
            Behaviour::FailFirst(limit) if n < *limit => Err(TransportError::Temporary {
                code: 451,
                message: "try again later".to_string(),
            }),
            Behaviour::FailFirst(_) => Ok(()),
            Behaviour::HangUntilClosed => {
                self.closed.cancelled().await;
                Err(TransportError::Closed("torn down mid-send".to_string()))
            }
        };

        self.record(message, result.is_ok());
        result
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
    }
}

/// Hands out [`ScriptedTransport`]s; hosts without a script accept
#[derive(Default)]
pub struct ScriptedFactory {
    scripts: HashMap<String, Behaviour>,
    attempts: Arc<Mutex<Vec<Attempt>>>,
    created: Mutex<Vec<Arc<ScriptedTransport>>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, host: &str, behaviour: Behaviour) -> Self {
        self.scripts.insert(host.to_string(), behaviour);
        self
    }

    /// Every send attempt so far, in the order they completed
    pub fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().clone()
    }

    pub fn attempts_on(&self, host: &str) -> usize {
        self.attempts.lock().iter().filter(|a| a.host == host).count()
    }

    pub fn delivered(&self) -> Vec<OutgoingMessage> {
        self.attempts
            .lock()
            .iter()
            .filter(|a| a.accepted)
            .map(|a| a.message.clone())
            .collect()
    }

    pub fn transports(&self) -> Vec<Arc<ScriptedTransport>> {
        self.created.lock().clone()
    }
}

impl TransportFactory for ScriptedFactory {
    fn create(&self, endpoint: &RelayEndpoint) -> Arc<dyn Transport> {
        let transport = Arc::new(ScriptedTransport {
            host: endpoint.host.clone(),
            behaviour: self
                .scripts
                .get(&endpoint.host)
                .cloned()
                .unwrap_or(Behaviour::Accept),
            sends: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            closed: CancellationToken::new(),
            attempts: Arc::clone(&self.attempts),
        });

        self.created.lock().push(Arc::clone(&transport));
        transport
    }
}
