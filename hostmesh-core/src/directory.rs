//! Host directory: host id -> private address, TTL expiry, virtual-host assignments.
//! Owns the derived virtual-host index (one `WeightedSelector` per virtual host).

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::identity::{HostId, SettingId, VirtualHostId};
use crate::protocol::{validate_assignments, Assignments, InvalidWeight};
use crate::selector::WeightedSelector;

/// One known host, local or remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub address: String,
    pub expires_at: Instant,
    pub setting_id: SettingId,
    pub assignments: Assignments,
}

impl HostEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Default)]
struct DirectoryState {
    hosts: HashMap<HostId, HostEntry>,
    index: HashMap<VirtualHostId, WeightedSelector>,
    /// Hosts removed by lazy expiry in `get`, reported by the next sweep.
    evicted: Vec<HostId>,
}

impl DirectoryState {
    /// Rebuild the selector of one virtual host from the top priority tier.
    fn recompute(&mut self, vhost: VirtualHostId) {
        let mut candidates: Vec<(HostId, i32, i32)> = self
            .hosts
            .iter()
            .filter_map(|(id, e)| e.assignments.get(&vhost).map(|w| (*id, w.priority, w.weight)))
            .collect();
        let Some(top) = candidates.iter().map(|(_, p, _)| *p).max() else {
            self.index.remove(&vhost);
            return;
        };
        candidates.retain(|(_, p, _)| *p == top);
        candidates.sort_by_key(|(id, _, _)| *id);
        match WeightedSelector::build(candidates.into_iter().map(|(id, _, w)| (id, w))) {
            Ok(selector) => {
                self.index.insert(vhost, selector);
            }
            Err(_) => {
                self.index.remove(&vhost);
            }
        }
    }

    fn remove_host(&mut self, host: &HostId) -> Option<HostEntry> {
        let entry = self.hosts.remove(host)?;
        for vhost in entry.assignments.keys() {
            self.recompute(*vhost);
        }
        Some(entry)
    }
}

/// Thread-safe host table with TTL expiry. Callers pass the current instant.
#[derive(Default)]
pub struct HostDirectory {
    state: RwLock<DirectoryState>,
}

impl HostDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, DirectoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, DirectoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or refresh a host. Returns its current setting id and whether it was created.
    /// Virtual-host data is left untouched.
    pub fn upsert(&self, host: HostId, ttl_secs: u16, address: &str, now: Instant) -> (SettingId, bool) {
        let expires_at = now + Duration::from_secs(u64::from(ttl_secs));
        let mut state = self.write();
        match state.hosts.get_mut(&host) {
            Some(entry) => {
                entry.expires_at = expires_at;
                if entry.address != address {
                    entry.address = address.to_string();
                }
                (entry.setting_id, false)
            }
            None => {
                state.evicted.retain(|h| *h != host);
                state.hosts.insert(
                    host,
                    HostEntry {
                        address: address.to_string(),
                        expires_at,
                        setting_id: SettingId::EMPTY,
                        assignments: Assignments::new(),
                    },
                );
                (SettingId::EMPTY, true)
            }
        }
    }

    /// Replace a host's assignments. Only the virtual hosts that were added, changed or
    /// removed get their selectors rebuilt. Returns false when nothing changed.
    pub fn apply_virtual_hosts(
        &self,
        host: HostId,
        setting_id: SettingId,
        assignments: Assignments,
    ) -> Result<bool, DirectoryError> {
        validate_assignments(&assignments)?;
        let mut state = self.write();
        let entry = state
            .hosts
            .get_mut(&host)
            .ok_or(DirectoryError::UnknownHost(host))?;
        if entry.setting_id == setting_id && entry.assignments == assignments {
            return Ok(false);
        }
        let affected = changed_virtual_hosts(&entry.assignments, &assignments);
        entry.setting_id = setting_id;
        entry.assignments = assignments;
        for vhost in affected {
            state.recompute(vhost);
        }
        Ok(true)
    }

    /// Drop all assignments of a host (it announced "no virtual hosts").
    /// Returns false when the host had none or is unknown.
    pub fn clear_virtual_hosts(&self, host: HostId) -> bool {
        let mut state = self.write();
        let Some(entry) = state.hosts.get_mut(&host) else {
            return false;
        };
        if entry.setting_id.is_empty() && entry.assignments.is_empty() {
            return false;
        }
        entry.setting_id = SettingId::EMPTY;
        let old = std::mem::take(&mut entry.assignments);
        for vhost in old.keys() {
            state.recompute(*vhost);
        }
        true
    }

    /// Delete a host. Returns true if it was present.
    pub fn remove(&self, host: HostId) -> bool {
        self.write().remove_host(&host).is_some()
    }

    /// Pick a host for a virtual host, or None when nobody advertises it. Expired hosts
    /// carrying `vhost` are evicted first, as `get` does, and reported by the next sweep.
    pub fn resolve(&self, vhost: VirtualHostId, now: Instant) -> Option<HostId> {
        {
            let state = self.read();
            let selector = state.index.get(&vhost)?;
            let stale = selector
                .hosts()
                .any(|h| state.hosts.get(&h).map_or(true, |e| e.is_expired(now)));
            if !stale {
                return Some(selector.pick());
            }
        }
        let mut state = self.write();
        let expired: Vec<HostId> = state
            .hosts
            .iter()
            .filter(|(_, e)| e.is_expired(now) && e.assignments.contains_key(&vhost))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            state.remove_host(&id);
            state.evicted.push(id);
        }
        state.index.get(&vhost).map(WeightedSelector::pick)
    }

    /// Selector currently built for a virtual host.
    pub fn selector(&self, vhost: VirtualHostId) -> Option<WeightedSelector> {
        self.read().index.get(&vhost).cloned()
    }

    /// Private address of a host. An expired entry is removed and reported as missing.
    pub fn get(&self, host: HostId, now: Instant) -> Option<String> {
        {
            let state = self.read();
            match state.hosts.get(&host) {
                None => return None,
                Some(e) if !e.is_expired(now) => return Some(e.address.clone()),
                Some(_) => {}
            }
        }
        let mut state = self.write();
        if state.hosts.get(&host).is_some_and(|e| e.is_expired(now)) {
            state.remove_host(&host);
            state.evicted.push(host);
            return None;
        }
        state.hosts.get(&host).map(|e| e.address.clone())
    }

    /// Remove every expired host and return the removed ids, including those evicted lazily
    /// by `get` since the previous sweep.
    pub fn sweep_expired(&self, now: Instant) -> Vec<HostId> {
        let mut state = self.write();
        let expired: Vec<HostId> = state
            .hosts
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            state.remove_host(id);
        }
        let mut removed = std::mem::take(&mut state.evicted);
        removed.extend(expired);
        removed
    }

    pub fn contains(&self, host: HostId) -> bool {
        self.read().hosts.contains_key(&host)
    }

    pub fn entry(&self, host: HostId) -> Option<HostEntry> {
        self.read().hosts.get(&host).cloned()
    }

    pub fn setting_id(&self, host: HostId) -> Option<SettingId> {
        self.read().hosts.get(&host).map(|e| e.setting_id)
    }

    pub fn assignments(&self, host: HostId) -> Option<Assignments> {
        self.read().hosts.get(&host).map(|e| e.assignments.clone())
    }

    pub fn hosts(&self) -> Vec<HostId> {
        self.read().hosts.keys().copied().collect()
    }

    /// Host whose private address equals `address`.
    pub fn host_by_address(&self, address: &str) -> Option<HostId> {
        self.read()
            .hosts
            .iter()
            .find(|(_, e)| e.address == address)
            .map(|(id, _)| *id)
    }

    pub fn len(&self) -> usize {
        self.read().hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().hosts.is_empty()
    }

    /// Remove every host except those in `keep`. Returns the removed ids.
    pub fn retain_only(&self, keep: &BTreeSet<HostId>) -> Vec<HostId> {
        let mut state = self.write();
        let gone: Vec<HostId> = state
            .hosts
            .keys()
            .filter(|id| !keep.contains(id))
            .copied()
            .collect();
        for id in &gone {
            state.remove_host(id);
        }
        state.evicted.clear();
        gone
    }

    pub fn clear(&self) {
        let mut state = self.write();
        state.hosts.clear();
        state.index.clear();
        state.evicted.clear();
    }
}

/// Virtual hosts whose membership or weight differs between two assignment sets.
fn changed_virtual_hosts(old: &Assignments, new: &Assignments) -> BTreeSet<VirtualHostId> {
    let mut out = BTreeSet::new();
    for (vhost, w) in old {
        if new.get(vhost) != Some(w) {
            out.insert(*vhost);
        }
    }
    for (vhost, w) in new {
        if old.get(vhost) != Some(w) {
            out.insert(*vhost);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("unknown host {0}")]
    UnknownHost(HostId),
    #[error(transparent)]
    InvalidWeight(#[from] InvalidWeight),
}
