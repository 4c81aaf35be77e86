//! hostmesh presence protocol.
//! Host-driven: no I/O; adapters pass inbound messages and ticks, and perform the returned sends.

pub mod binary;
pub mod directory;
pub mod identity;
pub mod presence;
pub mod protocol;
pub mod selector;
pub mod text;

pub use binary::{decode_datagram, encode_datagram, BinaryFrameError, Datagram};
pub use directory::{DirectoryError, HostDirectory, HostEntry};
pub use identity::{address_token, token_address, HostId, SettingId, VirtualHostId};
pub use presence::{
    EngineState, PresenceEngine, PresenceError, PresenceEvent, Reaction, StopPolicy,
    DEFAULT_GUARD_SKEW,
};
pub use protocol::{
    validate_assignments, Announce, Assignments, InvalidWeight, PresenceMessage,
    VirtualHostWeight, PROTOCOL_VERSION,
};
pub use selector::{SelectorError, WeightedSelector};
pub use text::{decode_text, encode_text, TextFrameError};
