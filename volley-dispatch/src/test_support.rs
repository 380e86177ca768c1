use std::sync::Arc;

use async_trait::async_trait;
use volley_smtp::{RelayEndpoint, client::Credentials};

use crate::{
    JobId,
    error::TransportError,
    events::{NullSink, Reporter},
    relay::{RelayPolicy, RelayPool, selector::Selection},
    transport::{OutgoingMessage, Transport, TransportFactory},
};

#[derive(Debug)]
pub struct Healthy;

#[async_trait]
impl Transport for Healthy {
    async fn warm_up(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send(&self, _message: &OutgoingMessage) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) {}
}

pub struct HealthyFactory;

impl TransportFactory for HealthyFactory {
    fn create(&self, _endpoint: &RelayEndpoint) -> Arc<dyn Transport> {
        Arc::new(Healthy)
    }
}

/// A pool of `size` relays that accept everything
pub async fn pool_of(size: usize) -> RelayPool {
    let endpoints: Vec<RelayEndpoint> = (0..size)
        .map(|i| {
            RelayEndpoint::new(
                format!("smtp{i}.relay.test"),
                587,
                Credentials::new(format!("sender{i}@relay.test"), "pw"),
            )
        })
        .collect();

    RelayPool::build(
        &endpoints,
        &HealthyFactory,
        &RelayPolicy::default(),
        Reporter::new(JobId::new(), None, Arc::new(NullSink)),
    )
    .await
}

pub const fn selected_index(selection: &Selection) -> Option<usize> {
    match selection {
        Selection::Relay { index, .. } => Some(*index),
        Selection::Exhausted => None,
    }
}
