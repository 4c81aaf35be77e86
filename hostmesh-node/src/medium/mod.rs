//! Pub/sub media: named channels carrying opaque payloads.

mod memory;
mod udp;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::ConfigError;
use crate::error::MediumError;

pub use memory::{MemoryBroker, MemoryMedium};
pub use udp::UdpMulticastMedium;

/// One payload received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediumMessage {
    pub channel: String,
    pub payload: Bytes,
}

#[async_trait]
pub trait PubSubMedium: Send + Sync {
    /// Connect. Messages on subscribed channels arrive on the returned receiver until
    /// `close` or a connection failure ends it.
    async fn open(&self) -> Result<mpsc::UnboundedReceiver<MediumMessage>, MediumError>;

    async fn close(&self);

    async fn subscribe(&self, channel: &str) -> Result<(), MediumError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), MediumError>;

    /// Publishers receive their own messages when subscribed.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), MediumError>;

    /// Largest payload one publish can carry, if bounded.
    fn max_payload(&self) -> Option<usize> {
        None
    }
}

/// Build a medium from a connection string: `memory` or `udp://group:port`.
pub fn from_uri(uri: &str) -> Result<Arc<dyn PubSubMedium>, ConfigError> {
    if uri == "memory" {
        return Ok(Arc::new(MemoryBroker::new().connect()));
    }
    match uri.strip_prefix("udp://") {
        Some(addr) => {
            let group = addr
                .parse()
                .map_err(|_| ConfigError::Medium(uri.to_string()))?;
            Ok(Arc::new(UdpMulticastMedium::new(group)))
        }
        None => Err(ConfigError::Medium(uri.to_string())),
    }
}
