//! Per-adapter event bus: discovery, removal, connection errors, lifecycle.

use hostmesh_core::{Assignments, HostId, PresenceEvent, SettingId};
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::MediumError;

/// Events buffered per subscriber before it starts lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    /// A remote client was discovered or its virtual hosts changed.
    ClientUpdated {
        id: HostId,
        setting_id: SettingId,
        assignments: Assignments,
    },
    /// A remote client shut down or expired.
    ClientRemoved { id: HostId },
    ConnectionError {
        error: MediumError,
        fatal: bool,
        retried: bool,
    },
    Started,
    Stopped,
}

impl From<PresenceEvent> for AdapterEvent {
    fn from(e: PresenceEvent) -> Self {
        match e {
            PresenceEvent::ClientUpdated {
                id,
                setting_id,
                assignments,
            } => AdapterEvent::ClientUpdated {
                id,
                setting_id,
                assignments,
            },
            PresenceEvent::ClientRemoved { id } => AdapterEvent::ClientRemoved { id },
            PresenceEvent::Started => AdapterEvent::Started,
            PresenceEvent::Stopped => AdapterEvent::Stopped,
        }
    }
}

/// Broadcast bus owned by one adapter instance.
pub struct EventBus {
    sender: broadcast::Sender<AdapterEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish to current subscribers. Returns how many received it.
    pub fn publish(&self, event: AdapterEvent) -> usize {
        match self.sender.send(event) {
            Ok(n) => n,
            Err(e) => {
                trace!(event = ?e.0, "event dropped (no subscribers)");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
