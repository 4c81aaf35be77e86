//! hostmesh node: pub/sub and byte-stream adapters for the presence protocol, the switch
//! that relays between them, and configuration for the relay daemon.

pub mod adapter;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod medium;
pub mod pubsub;
pub mod stream;
pub mod switch;

pub use adapter::{Adapter, AdapterSettings, DEFAULT_RETRY_LIMIT};
pub use config::{ConfigError, NodeConfig};
pub use dispatch::{handler, CallbackDispatcher, HandlerId, MessageHandler};
pub use error::{AdapterError, MediumError};
pub use events::AdapterEvent;
pub use medium::{MemoryBroker, MemoryMedium, PubSubMedium, UdpMulticastMedium};
pub use pubsub::PubSubAdapter;
pub use stream::{StopMode, StreamAdapter};
pub use switch::{AdapterCleanup, AdapterId, Switch};
