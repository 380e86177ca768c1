//! Test support utilities for dispatch integration tests
#![allow(dead_code)] // Test utility module - not all methods used in every test

pub mod scripted;

use std::sync::Arc;

use tokio::sync::broadcast;
use volley_dispatch::{
    BroadcastSink, DispatchConfig, Dispatcher, Event, JobEvent, RelayCredential, SecretRef,
    Severity, SubmitRequest, events::ProgressEvent,
};

pub use scripted::{Attempt, Behaviour, ScriptedFactory};

pub fn relay(host: &str) -> RelayCredential {
    RelayCredential {
        host: host.to_string(),
        port: 587,
        username: format!("sender@{host}"),
        secret: SecretRef::Inline("pw".to_string()),
    }
}

pub fn recipients(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("user{i}@example.com")).collect()
}

pub fn request(recipients: Vec<String>, relays: Vec<RelayCredential>, workers: i64) -> SubmitRequest {
    SubmitRequest {
        owner: Some("owner-1".to_string()),
        sender_display_name: "Acme Mailer".to_string(),
        subject: "Hello".to_string(),
        html_body: "<p>Hello there</p>".to_string(),
        recipients,
        relay_credentials: relays,
        worker_count: workers,
        template_catalog: Vec::new(),
        link_catalog: Vec::new(),
    }
}

/// A dispatcher over `factory` whose events can be collected
pub struct Harness {
    pub dispatcher: Dispatcher,
    pub factory: Arc<ScriptedFactory>,
    pub events: broadcast::Receiver<JobEvent>,
}

impl Harness {
    pub fn new(factory: ScriptedFactory) -> Self {
        Self::with_config(factory, DispatchConfig::default())
    }

    pub fn with_config(factory: ScriptedFactory, config: DispatchConfig) -> Self {
        let sink = BroadcastSink::new(16 * 1024);
        let events = sink.subscribe();
        let factory = Arc::new(factory);
        let dispatcher = Dispatcher::new(config, factory.clone(), Arc::new(sink));

        Self {
            dispatcher,
            factory,
            events,
        }
    }

    /// Every event published so far
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event.event);
        }
        events
    }
}

pub fn logs(events: &[Event]) -> Vec<(Severity, String)> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Log(log) => Some((log.severity, log.message.clone())),
            _ => None,
        })
        .collect()
}

pub fn progress(events: &[Event]) -> Vec<ProgressEvent> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Progress(progress) => Some(*progress),
            _ => None,
        })
        .collect()
}

pub fn outcomes(events: &[Event]) -> Vec<(Severity, String)> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Outcome(outcome) => Some((outcome.severity, outcome.message.clone())),
            _ => None,
        })
        .collect()
}
