//! In-process pub/sub broker. Connections share one channel table; faults can be injected
//! per connection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{MediumMessage, PubSubMedium};
use crate::error::MediumError;

#[derive(Default)]
struct Connection {
    inbox: Option<mpsc::UnboundedSender<MediumMessage>>,
    channels: HashSet<String>,
}

#[derive(Default)]
struct BrokerState {
    connections: HashMap<u64, Connection>,
}

/// Shared broker; every `connect` is an independent participant.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self) -> MemoryMedium {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().connections.insert(id, Connection::default());
        MemoryMedium {
            id,
            broker: self.clone(),
            faults: Mutex::new(VecDeque::new()),
        }
    }

    /// Subscribers of `channel` across all open connections.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock()
            .connections
            .values()
            .filter(|c| c.inbox.is_some() && c.channels.contains(channel))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct MemoryMedium {
    id: u64,
    broker: MemoryBroker,
    faults: Mutex<VecDeque<MediumError>>,
}

impl MemoryMedium {
    /// Fail the next `times` publishes with `error`.
    pub fn inject_fault(&self, error: MediumError, times: usize) {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        faults.extend(std::iter::repeat(error).take(times));
    }

    /// Drop the connection as a broker outage would: the inbound receiver ends.
    pub fn sever(&self) {
        if let Some(conn) = self.broker.lock().connections.get_mut(&self.id) {
            conn.inbox = None;
        }
    }

    fn with_connection<R>(
        &self,
        f: impl FnOnce(&mut Connection) -> R,
    ) -> Result<R, MediumError> {
        let mut state = self.broker.lock();
        match state.connections.get_mut(&self.id) {
            Some(conn) if conn.inbox.is_some() => Ok(f(conn)),
            _ => Err(MediumError::NotConnected),
        }
    }
}

#[async_trait]
impl PubSubMedium for MemoryMedium {
    async fn open(&self) -> Result<mpsc::UnboundedReceiver<MediumMessage>, MediumError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.broker.lock();
        let conn = state.connections.entry(self.id).or_default();
        conn.inbox = Some(tx);
        conn.channels.clear();
        Ok(rx)
    }

    async fn close(&self) {
        if let Some(conn) = self.broker.lock().connections.get_mut(&self.id) {
            conn.inbox = None;
            conn.channels.clear();
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<(), MediumError> {
        self.with_connection(|c| {
            c.channels.insert(channel.to_string());
        })
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), MediumError> {
        self.with_connection(|c| {
            c.channels.remove(channel);
        })
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), MediumError> {
        let fault = self
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(error) = fault {
            return Err(error);
        }
        let mut state = self.broker.lock();
        if !state
            .connections
            .get(&self.id)
            .is_some_and(|c| c.inbox.is_some())
        {
            return Err(MediumError::NotConnected);
        }
        for conn in state.connections.values_mut() {
            if !conn.channels.contains(channel) {
                continue;
            }
            let delivered = conn.inbox.as_ref().map(|tx| {
                tx.send(MediumMessage {
                    channel: channel.to_string(),
                    payload: payload.clone(),
                })
                .is_ok()
            });
            if delivered == Some(false) {
                conn.inbox = None;
            }
        }
        Ok(())
    }
}

impl Drop for MemoryMedium {
    fn drop(&mut self) {
        self.broker.lock().connections.remove(&self.id);
    }
}
