//! Presence protocol engine. Host-driven: the adapter feeds it inbound messages and timer
//! ticks, and performs the returned sends and event notifications itself.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::directory::{DirectoryError, HostDirectory};
use crate::identity::{HostId, SettingId};
use crate::protocol::{
    validate_assignments, Announce, Assignments, InvalidWeight, PresenceMessage,
};

/// Default guard subtracted from each refresh wait.
pub const DEFAULT_GUARD_SKEW: Duration = Duration::from_millis(200);

/// Shortest refresh interval regardless of TTL and skew.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
}

/// What happens to local registrations on stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopPolicy {
    /// Keep local clients; they are announced again on the next start.
    RetainClients,
    /// Forget local clients.
    ClearClients,
}

/// Discovery and lifecycle notifications produced by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    ClientUpdated {
        id: HostId,
        setting_id: SettingId,
        assignments: Assignments,
    },
    ClientRemoved {
        id: HostId,
    },
    Started,
    Stopped,
}

/// Result of feeding the engine one input.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reaction {
    /// Messages to broadcast, in order.
    pub outbound: Vec<PresenceMessage>,
    /// Notifications for listeners.
    pub events: Vec<PresenceEvent>,
    /// The periodic loop should run a cycle now instead of waiting.
    pub wake: bool,
}

impl Reaction {
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.events.is_empty() && !self.wake
    }

    fn event(mut self, event: PresenceEvent) -> Self {
        self.events.push(event);
        self
    }
}

#[derive(Debug, Clone)]
struct LocalClient {
    address: String,
    setting_id: SettingId,
    assignments: Assignments,
    /// Assignments changed since the last full broadcast.
    dirty: bool,
}

/// Heartbeat/refresh/shutdown state machine for one adapter.
pub struct PresenceEngine {
    state: EngineState,
    ttl_secs: u16,
    directory: Arc<HostDirectory>,
    local: BTreeMap<HostId, LocalClient>,
    force_full: bool,
}

impl PresenceEngine {
    pub fn new(ttl_secs: u16, directory: Arc<HostDirectory>) -> Self {
        Self {
            state: EngineState::Stopped,
            ttl_secs: ttl_secs.max(1),
            directory,
            local: BTreeMap::new(),
            force_full: false,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.state != EngineState::Stopped
    }

    pub fn ttl_secs(&self) -> u16 {
        self.ttl_secs
    }

    pub fn directory(&self) -> &Arc<HostDirectory> {
        &self.directory
    }

    /// Wait between periodic cycles: half the TTL minus the guard skew.
    pub fn refresh_interval(&self, skew: Duration) -> Duration {
        let half = Duration::from_millis(u64::from(self.ttl_secs) * 500);
        half.saturating_sub(skew).max(MIN_REFRESH_INTERVAL)
    }

    /// Enter Starting: re-enter local clients into the directory and announce Hello.
    pub fn start(&mut self, now: Instant) -> Result<Reaction, PresenceError> {
        if self.state != EngineState::Stopped {
            return Err(PresenceError::AlreadyStarted);
        }
        for (id, client) in &self.local {
            enter_local(&self.directory, self.ttl_secs, *id, client, now)?;
        }
        self.state = EngineState::Starting;
        self.force_full = true;
        Ok(Reaction {
            outbound: vec![PresenceMessage::Hello],
            events: Vec::new(),
            wake: true,
        })
    }

    /// Starting -> Running. No-op in any other state.
    pub fn mark_running(&mut self) -> Reaction {
        if self.state != EngineState::Starting {
            return Reaction::default();
        }
        self.state = EngineState::Running;
        Reaction::default().event(PresenceEvent::Started)
    }

    /// Announce every local client shutting down, drop remote state, enter Stopped.
    pub fn stop(&mut self, policy: StopPolicy) -> Reaction {
        if self.state == EngineState::Stopped {
            return Reaction::default();
        }
        let outbound = self
            .local
            .keys()
            .map(|id| PresenceMessage::Shutdown(*id))
            .collect();
        self.enter_stopped(policy);
        Reaction {
            outbound,
            events: vec![PresenceEvent::Stopped],
            wake: false,
        }
    }

    /// Stop after a fatal transport error: nothing can be sent any more.
    pub fn halt(&mut self) -> Reaction {
        if self.state == EngineState::Stopped {
            return Reaction::default();
        }
        self.enter_stopped(StopPolicy::RetainClients);
        Reaction::default().event(PresenceEvent::Stopped)
    }

    fn enter_stopped(&mut self, policy: StopPolicy) {
        self.state = EngineState::Stopped;
        self.force_full = false;
        self.directory.clear();
        if policy == StopPolicy::ClearClients {
            self.local.clear();
        }
    }

    /// One periodic cycle: announce local clients, sweep expired remote hosts.
    pub fn tick(&mut self, now: Instant) -> Reaction {
        if self.state == EngineState::Stopped {
            return Reaction::default();
        }
        let force = std::mem::take(&mut self.force_full);
        let mut outbound = Vec::with_capacity(self.local.len());
        for (id, client) in self.local.iter_mut() {
            self.directory.upsert(*id, self.ttl_secs, &client.address, now);
            if force || client.dirty {
                client.dirty = false;
                outbound.push(full_message(self.ttl_secs, *id, client));
            } else {
                outbound.push(PresenceMessage::Refresh(announce(self.ttl_secs, *id, client)));
            }
        }
        let events = self
            .directory
            .sweep_expired(now)
            .into_iter()
            .filter(|id| !self.local.contains_key(id))
            .map(|id| PresenceEvent::ClientRemoved { id })
            .collect();
        Reaction {
            outbound,
            events,
            wake: false,
        }
    }

    /// Process one inbound presence message.
    pub fn handle(&mut self, msg: PresenceMessage, now: Instant) -> Reaction {
        if self.state == EngineState::Stopped {
            return Reaction::default();
        }
        match msg {
            PresenceMessage::Hello => {
                self.force_full = true;
                let mut reaction = self.mark_running();
                reaction.wake = true;
                reaction
            }
            PresenceMessage::Refresh(a) => self.on_refresh(a, now),
            PresenceMessage::RefreshFull(a, assignments) => self.on_refresh_full(a, assignments, now),
            PresenceMessage::NeedRefreshFull(id) => match self.local.get_mut(&id) {
                Some(client) => {
                    client.dirty = false;
                    Reaction {
                        outbound: vec![full_message(self.ttl_secs, id, client)],
                        ..Reaction::default()
                    }
                }
                None => Reaction::default(),
            },
            PresenceMessage::Shutdown(id) => {
                if !self.local.contains_key(&id) && self.directory.remove(id) {
                    Reaction::default().event(PresenceEvent::ClientRemoved { id })
                } else {
                    Reaction::default()
                }
            }
        }
    }

    fn on_refresh(&mut self, a: Announce, now: Instant) -> Reaction {
        let id = a.host_id;
        if self.local.contains_key(&id) {
            return Reaction::default();
        }
        let (cached, is_new) = self.directory.upsert(id, a.ttl_secs, &a.address, now);
        let mut reaction = Reaction::default();
        if a.setting_id != cached {
            if a.setting_id.is_empty() {
                self.directory.clear_virtual_hosts(id);
                return reaction.event(updated(id, SettingId::EMPTY, Assignments::new()));
            }
            reaction.outbound.push(PresenceMessage::NeedRefreshFull(id));
        }
        if is_new {
            let assignments = self.directory.assignments(id).unwrap_or_default();
            reaction.events.push(updated(id, cached, assignments));
        }
        reaction
    }

    fn on_refresh_full(&mut self, a: Announce, assignments: Assignments, now: Instant) -> Reaction {
        let id = a.host_id;
        if self.local.contains_key(&id) || validate_assignments(&assignments).is_err() {
            return Reaction::default();
        }
        let (cached, is_new) = self.directory.upsert(id, a.ttl_secs, &a.address, now);
        if a.setting_id == cached && !is_new {
            return Reaction::default();
        }
        if a.setting_id != cached {
            let applied = if a.setting_id.is_empty() {
                self.directory.clear_virtual_hosts(id);
                Ok(true)
            } else {
                self.directory
                    .apply_virtual_hosts(id, a.setting_id, assignments.clone())
            };
            if applied.is_err() {
                return Reaction::default();
            }
        }
        let current = self.directory.assignments(id).unwrap_or_default();
        Reaction::default().event(updated(id, a.setting_id, current))
    }

    /// Register a locally hosted client. Returns an empty reaction if it is already local.
    pub fn add_client(&mut self, id: HostId, address: &str, now: Instant) -> Result<Reaction, PresenceError> {
        if self.local.contains_key(&id) {
            return Ok(Reaction::default());
        }
        let client = LocalClient {
            address: address.to_string(),
            setting_id: SettingId::EMPTY,
            assignments: Assignments::new(),
            dirty: true,
        };
        let started = self.is_started();
        if started {
            enter_local(&self.directory, self.ttl_secs, id, &client, now)?;
        }
        self.local.insert(id, client);
        Ok(Reaction {
            wake: started,
            ..Reaction::default()
        })
    }

    /// Unregister a local client; peers are told it shut down.
    pub fn remove_client(&mut self, id: HostId) -> Reaction {
        if self.local.remove(&id).is_none() {
            return Reaction::default();
        }
        self.directory.remove(id);
        if !self.is_started() {
            return Reaction::default();
        }
        Reaction {
            outbound: vec![PresenceMessage::Shutdown(id)],
            ..Reaction::default()
        }
    }

    /// Replace a local client's virtual-host assignments and schedule a full broadcast of
    /// all local clients. Rejects weights ≤ 0.
    pub fn apply_virtual_hosts(
        &mut self,
        id: HostId,
        assignments: Assignments,
        now: Instant,
    ) -> Result<Reaction, PresenceError> {
        validate_assignments(&assignments)?;
        let started = self.is_started();
        let client = self
            .local
            .get_mut(&id)
            .ok_or(PresenceError::UnknownClient(id))?;
        if client.assignments == assignments {
            return Ok(Reaction::default());
        }
        client.setting_id = if assignments.is_empty() {
            SettingId::EMPTY
        } else {
            SettingId::new_random()
        };
        client.assignments = assignments;
        client.dirty = true;
        if started {
            enter_local(&self.directory, self.ttl_secs, id, client, now)?;
            // Any local change re-announces every local client in full.
            self.force_full = true;
        }
        Ok(Reaction {
            wake: started,
            ..Reaction::default()
        })
    }

    pub fn is_local(&self, id: HostId) -> bool {
        self.local.contains_key(&id)
    }

    pub fn local_clients(&self) -> Vec<HostId> {
        self.local.keys().copied().collect()
    }

    pub fn local_address(&self, id: HostId) -> Option<&str> {
        self.local.get(&id).map(|c| c.address.as_str())
    }

    /// Local client whose private address is `address`.
    pub fn local_by_address(&self, address: &str) -> Option<HostId> {
        self.local
            .iter()
            .find(|(_, c)| c.address == address)
            .map(|(id, _)| *id)
    }

    pub fn local_setting(&self, id: HostId) -> Option<(SettingId, Assignments)> {
        self.local
            .get(&id)
            .map(|c| (c.setting_id, c.assignments.clone()))
    }

    /// Remote hosts currently in the directory.
    pub fn remote_clients(&self) -> Vec<HostId> {
        self.directory
            .hosts()
            .into_iter()
            .filter(|id| !self.local.contains_key(id))
            .collect()
    }
}

fn updated(id: HostId, setting_id: SettingId, assignments: Assignments) -> PresenceEvent {
    PresenceEvent::ClientUpdated {
        id,
        setting_id,
        assignments,
    }
}

fn announce(ttl_secs: u16, id: HostId, client: &LocalClient) -> Announce {
    Announce {
        host_id: id,
        ttl_secs,
        address: client.address.clone(),
        setting_id: client.setting_id,
    }
}

fn full_message(ttl_secs: u16, id: HostId, client: &LocalClient) -> PresenceMessage {
    PresenceMessage::RefreshFull(announce(ttl_secs, id, client), client.assignments.clone())
}

fn enter_local(
    directory: &HostDirectory,
    ttl_secs: u16,
    id: HostId,
    client: &LocalClient,
    now: Instant,
) -> Result<(), DirectoryError> {
    directory.upsert(id, ttl_secs, &client.address, now);
    if client.assignments.is_empty() {
        directory.clear_virtual_hosts(id);
    } else {
        directory.apply_virtual_hosts(id, client.setting_id, client.assignments.clone())?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PresenceError {
    #[error("already started")]
    AlreadyStarted,
    #[error("{0} is not a local client")]
    UnknownClient(HostId),
    #[error(transparent)]
    InvalidWeight(#[from] InvalidWeight),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::VirtualHostId;
    use crate::protocol::VirtualHostWeight;

    fn engine() -> PresenceEngine {
        PresenceEngine::new(10, Arc::new(HostDirectory::new()))
    }

    fn running(now: Instant) -> PresenceEngine {
        let mut e = engine();
        e.start(now).unwrap();
        e.mark_running();
        e
    }

    fn remote(setting_id: SettingId) -> Announce {
        Announce {
            host_id: HostId::new_random(),
            ttl_secs: 10,
            address: "hostmesh.host.remote".into(),
            setting_id,
        }
    }

    fn one(v: VirtualHostId, priority: i32, weight: i32) -> Assignments {
        Assignments::from([(v, VirtualHostWeight::new(priority, weight))])
    }

    #[test]
    fn start_sends_hello_and_hello_completes_start() {
        let now = Instant::now();
        let mut e = engine();
        let r = e.start(now).unwrap();
        assert_eq!(r.outbound, vec![PresenceMessage::Hello]);
        assert_eq!(e.state(), EngineState::Starting);
        assert_eq!(e.start(now), Err(PresenceError::AlreadyStarted));
        let r = e.handle(PresenceMessage::Hello, now);
        assert!(r.wake);
        assert_eq!(r.events, vec![PresenceEvent::Started]);
        assert_eq!(e.state(), EngineState::Running);
    }

    #[test]
    fn first_tick_after_start_is_full_then_light() {
        let now = Instant::now();
        let mut e = engine();
        let id = HostId::new_random();
        e.add_client(id, "hostmesh.host.me", now).unwrap();
        e.start(now).unwrap();
        let r = e.tick(now);
        assert!(matches!(r.outbound.as_slice(), [PresenceMessage::RefreshFull(a, _)] if a.host_id == id));
        let r = e.tick(now);
        assert!(matches!(r.outbound.as_slice(), [PresenceMessage::Refresh(_)]));
    }

    #[test]
    fn hello_forces_full_broadcast() {
        let now = Instant::now();
        let mut e = running(now);
        e.add_client(HostId::new_random(), "a", now).unwrap();
        e.tick(now);
        e.tick(now);
        e.handle(PresenceMessage::Hello, now);
        assert!(matches!(e.tick(now).outbound.as_slice(), [PresenceMessage::RefreshFull(..)]));
    }

    #[test]
    fn local_assignment_change_forces_full_and_wakes() {
        let now = Instant::now();
        let mut e = running(now);
        let id = HostId::new_random();
        e.add_client(id, "a", now).unwrap();
        e.tick(now);
        let v = VirtualHostId::new_random();
        let r = e.apply_virtual_hosts(id, one(v, 0, 2), now).unwrap();
        assert!(r.wake);
        assert_eq!(e.directory().resolve(v, now), Some(id));
        match e.tick(now).outbound.as_slice() {
            [PresenceMessage::RefreshFull(a, list)] => {
                assert!(!a.setting_id.is_empty());
                assert_eq!(list, &one(v, 0, 2));
            }
            other => panic!("expected RefreshFull, got {other:?}"),
        }
        let again = e.apply_virtual_hosts(id, one(v, 0, 2), now).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn assignment_change_rebroadcasts_every_local_client_in_full() {
        let now = Instant::now();
        let mut e = running(now);
        let changed = HostId::new_random();
        let untouched = HostId::new_random();
        e.add_client(changed, "a", now).unwrap();
        e.add_client(untouched, "b", now).unwrap();
        e.tick(now);
        assert!(e
            .tick(now)
            .outbound
            .iter()
            .all(|m| matches!(m, PresenceMessage::Refresh(_))));

        let v = VirtualHostId::new_random();
        e.apply_virtual_hosts(changed, one(v, 0, 1), now).unwrap();
        let r = e.tick(now);
        assert_eq!(r.outbound.len(), 2);
        assert!(r
            .outbound
            .iter()
            .all(|m| matches!(m, PresenceMessage::RefreshFull(..))));
        assert!(matches!(e.tick(now).outbound.as_slice(), [PresenceMessage::Refresh(_), PresenceMessage::Refresh(_)]));
    }

    #[test]
    fn invalid_local_weight_rejected() {
        let now = Instant::now();
        let mut e = running(now);
        let id = HostId::new_random();
        e.add_client(id, "a", now).unwrap();
        let err = e
            .apply_virtual_hosts(id, one(VirtualHostId::new_random(), 0, 0), now)
            .unwrap_err();
        assert!(matches!(err, PresenceError::InvalidWeight(_)));
        assert!(matches!(
            e.apply_virtual_hosts(HostId::new_random(), Assignments::new(), now),
            Err(PresenceError::UnknownClient(_))
        ));
    }

    #[test]
    fn refresh_with_unknown_setting_requests_full() {
        let now = Instant::now();
        let mut e = running(now);
        let a = remote(SettingId::new_random());
        let id = a.host_id;
        let r = e.handle(PresenceMessage::Refresh(a), now);
        assert_eq!(r.outbound, vec![PresenceMessage::NeedRefreshFull(id)]);
        assert!(matches!(r.events.as_slice(), [PresenceEvent::ClientUpdated { id: got, .. }] if *got == id));
    }

    #[test]
    fn refresh_with_empty_setting_applies_directly() {
        let now = Instant::now();
        let mut e = running(now);
        let setting = SettingId::new_random();
        let v = VirtualHostId::new_random();
        let a = remote(setting);
        let id = a.host_id;
        e.handle(PresenceMessage::RefreshFull(a.clone(), one(v, 0, 1)), now);
        assert_eq!(e.directory().resolve(v, now), Some(id));
        let cleared = Announce {
            setting_id: SettingId::EMPTY,
            ..a
        };
        let r = e.handle(PresenceMessage::Refresh(cleared), now);
        assert!(r.outbound.is_empty());
        assert_eq!(e.directory().resolve(v, now), None);
        assert_eq!(r.events.len(), 1);
    }

    #[test]
    fn refresh_full_applies_and_is_idempotent() {
        let now = Instant::now();
        let mut e = running(now);
        let v = VirtualHostId::new_random();
        let a = remote(SettingId::new_random());
        let r = e.handle(PresenceMessage::RefreshFull(a.clone(), one(v, 1, 4)), now);
        assert_eq!(r.events.len(), 1);
        let r = e.handle(PresenceMessage::RefreshFull(a.clone(), one(v, 1, 4)), now);
        assert!(r.events.is_empty());
        let r = e.handle(PresenceMessage::Refresh(a), now);
        assert!(r.is_empty());
    }

    #[test]
    fn need_refresh_full_answers_only_for_local() {
        let now = Instant::now();
        let mut e = running(now);
        let id = HostId::new_random();
        e.add_client(id, "a", now).unwrap();
        let r = e.handle(PresenceMessage::NeedRefreshFull(id), now);
        assert!(matches!(r.outbound.as_slice(), [PresenceMessage::RefreshFull(a, _)] if a.host_id == id));
        let r = e.handle(PresenceMessage::NeedRefreshFull(HostId::new_random()), now);
        assert!(r.outbound.is_empty());
    }

    #[test]
    fn shutdown_then_expiry_reports_removal_once() {
        let now = Instant::now();
        let mut e = running(now);
        let a = remote(SettingId::EMPTY);
        let id = a.host_id;
        e.handle(PresenceMessage::Refresh(a), now);
        let r = e.handle(PresenceMessage::Shutdown(id), now);
        assert_eq!(r.events, vec![PresenceEvent::ClientRemoved { id }]);
        let r = e.handle(PresenceMessage::Shutdown(id), now);
        assert!(r.events.is_empty());
        let r = e.tick(now + Duration::from_secs(60));
        assert!(r.events.is_empty());
    }

    #[test]
    fn expired_remote_removed_on_tick() {
        let now = Instant::now();
        let mut e = running(now);
        let local = HostId::new_random();
        e.add_client(local, "me", now).unwrap();
        let a = remote(SettingId::EMPTY);
        let id = a.host_id;
        e.handle(PresenceMessage::Refresh(a), now);
        assert_eq!(e.remote_clients(), vec![id]);
        let later = now + Duration::from_secs(11);
        let r = e.tick(later);
        assert_eq!(r.events, vec![PresenceEvent::ClientRemoved { id }]);
        assert!(e.directory().contains(local));
    }

    #[test]
    fn own_announcements_ignored() {
        let now = Instant::now();
        let mut e = running(now);
        let id = HostId::new_random();
        e.add_client(id, "me", now).unwrap();
        let r = e.handle(
            PresenceMessage::Refresh(Announce {
                host_id: id,
                ttl_secs: 10,
                address: "me".into(),
                setting_id: SettingId::new_random(),
            }),
            now,
        );
        assert!(r.is_empty());
        assert!(e.handle(PresenceMessage::Shutdown(id), now).is_empty());
    }

    #[test]
    fn stop_announces_shutdown_per_client_once() {
        let now = Instant::now();
        let mut e = running(now);
        let a = HostId::new_random();
        let b = HostId::new_random();
        e.add_client(a, "a", now).unwrap();
        e.add_client(b, "b", now).unwrap();
        let r = e.stop(StopPolicy::RetainClients);
        assert_eq!(r.outbound.len(), 2);
        assert!(r.outbound.contains(&PresenceMessage::Shutdown(a)));
        assert_eq!(r.events, vec![PresenceEvent::Stopped]);
        assert!(e.stop(StopPolicy::RetainClients).is_empty());
        assert_eq!(e.local_clients().len(), 2);
        assert!(e.directory().is_empty());
    }

    #[test]
    fn stop_clear_policy_drops_clients() {
        let now = Instant::now();
        let mut e = running(now);
        e.add_client(HostId::new_random(), "a", now).unwrap();
        e.stop(StopPolicy::ClearClients);
        assert!(e.local_clients().is_empty());
    }

    #[test]
    fn restart_reenters_local_virtual_hosts() {
        let now = Instant::now();
        let mut e = running(now);
        let id = HostId::new_random();
        let v = VirtualHostId::new_random();
        e.add_client(id, "a", now).unwrap();
        e.apply_virtual_hosts(id, one(v, 0, 1), now).unwrap();
        e.stop(StopPolicy::RetainClients);
        assert_eq!(e.directory().resolve(v, now), None);
        e.start(now).unwrap();
        assert_eq!(e.directory().resolve(v, now), Some(id));
    }

    #[test]
    fn stopped_engine_ignores_input() {
        let now = Instant::now();
        let mut e = engine();
        assert!(e.handle(PresenceMessage::Refresh(remote(SettingId::EMPTY)), now).is_empty());
        assert!(e.tick(now).is_empty());
        assert!(e.halt().is_empty());
    }

    #[test]
    fn refresh_interval_is_half_ttl_minus_skew() {
        let e = engine();
        assert_eq!(e.refresh_interval(DEFAULT_GUARD_SKEW), Duration::from_millis(4800));
        let short = PresenceEngine::new(1, Arc::new(HostDirectory::new()));
        assert_eq!(
            short.refresh_interval(Duration::from_secs(1)),
            MIN_REFRESH_INTERVAL
        );
    }
}
