//! Presence protocol: message types, virtual-host assignments, version.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::identity::{HostId, SettingId, VirtualHostId};

/// Protocol version tag carried by text frames (`v1`).
pub const PROTOCOL_VERSION: u8 = 1;

/// Priority and weight of one host within a virtual host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VirtualHostWeight {
    pub priority: i32,
    pub weight: i32,
}

impl VirtualHostWeight {
    pub fn new(priority: i32, weight: i32) -> Self {
        Self { priority, weight }
    }
}

/// A host's complete virtual-host assignment set, ordered by virtual-host id.
pub type Assignments = BTreeMap<VirtualHostId, VirtualHostWeight>;

/// Check that every weight in `assignments` is positive.
pub fn validate_assignments(assignments: &Assignments) -> Result<(), InvalidWeight> {
    match assignments.iter().find(|(_, w)| w.weight <= 0) {
        Some((vhost, w)) => Err(InvalidWeight {
            virtual_host: *vhost,
            weight: w.weight,
        }),
        None => Ok(()),
    }
}

/// A virtual-host assignment carried a weight ≤ 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("virtual host {virtual_host} has non-positive weight {weight}")]
pub struct InvalidWeight {
    pub virtual_host: VirtualHostId,
    pub weight: i32,
}

/// Announcement fields shared by `Refresh` and `RefreshFull`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    pub host_id: HostId,
    pub ttl_secs: u16,
    pub address: String,
    pub setting_id: SettingId,
}

/// All presence messages exchanged on the shared medium.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceMessage {
    /// A process joined; everyone re-announces in full.
    Hello,
    /// Lightweight heartbeat: no assignment payload.
    Refresh(Announce),
    /// Heartbeat with the complete assignment list.
    RefreshFull(Announce, Assignments),
    /// Ask the addressed host for a `RefreshFull`.
    NeedRefreshFull(HostId),
    /// Host is leaving.
    Shutdown(HostId),
}

impl PresenceMessage {
    /// Host the message is about, if any.
    pub fn host_id(&self) -> Option<HostId> {
        match self {
            PresenceMessage::Hello => None,
            PresenceMessage::Refresh(a) | PresenceMessage::RefreshFull(a, _) => Some(a.host_id),
            PresenceMessage::NeedRefreshFull(id) | PresenceMessage::Shutdown(id) => Some(*id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PresenceMessage::Hello => "Hello",
            PresenceMessage::Refresh(_) => "Refresh",
            PresenceMessage::RefreshFull(..) => "RefreshFull",
            PresenceMessage::NeedRefreshFull(_) => "NeedRefreshFull",
            PresenceMessage::Shutdown(_) => "Shutdown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_zero_and_negative() {
        let mut a = Assignments::new();
        a.insert(VirtualHostId::new_random(), VirtualHostWeight::new(0, 1));
        assert!(validate_assignments(&a).is_ok());
        let bad = VirtualHostId::new_random();
        a.insert(bad, VirtualHostWeight::new(0, 0));
        let err = validate_assignments(&a).unwrap_err();
        assert_eq!(err.virtual_host, bad);
        a.insert(bad, VirtualHostWeight::new(3, -2));
        assert_eq!(validate_assignments(&a).unwrap_err().weight, -2);
    }

    #[test]
    fn host_id_of_messages() {
        let id = HostId::new_random();
        assert_eq!(PresenceMessage::Hello.host_id(), None);
        assert_eq!(PresenceMessage::Shutdown(id).host_id(), Some(id));
        assert_eq!(PresenceMessage::NeedRefreshFull(id).kind(), "NeedRefreshFull");
    }
}
