//! Relay joining several adapters into one routing domain.
//!
//! Every remote client is owned by the adapter that discovered it most recently. The switch
//! makes each client reachable from every other adapter by hosting it there as a local
//! proxy, and forwards private messages addressed to a proxy to the owning adapter.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use hostmesh_core::HostId;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::Adapter;
use crate::dispatch::{handler, HandlerId};
use crate::error::AdapterError;
use crate::events::AdapterEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AdapterId(u64);

impl std::fmt::Display for AdapterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What `remove_adapter` does with the adapter after detaching it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterCleanup {
    /// Stop the adapter.
    Stop,
    /// Leave it running but withdraw the proxies the switch added to it.
    Forget,
}

struct Attached {
    adapter: Arc<dyn Adapter>,
    handler: HandlerId,
    listener: JoinHandle<()>,
    /// Remote clients this adapter discovered and currently owns.
    owned: HashSet<HostId>,
    /// Clients the switch hosts on this adapter as proxies.
    proxied: HashSet<HostId>,
}

#[derive(Default)]
struct SwitchState {
    adapters: BTreeMap<AdapterId, Attached>,
    routes: HashMap<HostId, AdapterId>,
}

enum Command {
    Add(Arc<dyn Adapter>, HostId),
    Remove(Arc<dyn Adapter>, HostId),
}

#[derive(Default)]
struct Shared {
    state: Mutex<SwitchState>,
    next_id: AtomicU64,
}

#[derive(Default)]
pub struct Switch {
    shared: Arc<Shared>,
}

impl Switch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach and start an adapter. Its known remote clients are imported and every client
    /// the switch already routes is proxied onto it.
    pub async fn add_adapter(&self, adapter: Arc<dyn Adapter>) -> Result<AdapterId, AdapterError> {
        let id = AdapterId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let weak = Arc::downgrade(&self.shared);
        let handler = adapter.register_handler(forwarder(weak.clone(), id));
        {
            let mut state = self.shared.lock();
            let listener = tokio::spawn(listen(weak, id, adapter.subscribe()));
            state.adapters.insert(
                id,
                Attached {
                    adapter: adapter.clone(),
                    handler,
                    listener,
                    owned: HashSet::new(),
                    proxied: HashSet::new(),
                },
            );
        }
        info!(adapter = %id, name = adapter.name(), "adapter attached");

        let mut commands = Vec::new();
        for client in adapter.remote_clients() {
            commands.extend(self.shared.on_discovered(id, client));
        }
        commands.extend(self.shared.push_known(id));
        run(commands).await;

        if !adapter.is_started() {
            if let Err(e) = adapter.start().await {
                warn!(adapter = %id, error = %e, "adapter failed to start, detaching");
                self.remove_adapter(id, AdapterCleanup::Forget).await?;
                return Err(e);
            }
        }
        Ok(id)
    }

    /// Detach an adapter: its clients are withdrawn from every other adapter. Returns false
    /// if the id is not attached.
    pub async fn remove_adapter(
        &self,
        id: AdapterId,
        cleanup: AdapterCleanup,
    ) -> Result<bool, AdapterError> {
        let (attached, commands) = {
            let mut state = self.shared.lock();
            let Some(mut attached) = state.adapters.remove(&id) else {
                return Ok(false);
            };
            let mut commands = Vec::new();
            for client in std::mem::take(&mut attached.owned) {
                if state.routes.get(&client) == Some(&id) {
                    state.routes.remove(&client);
                }
                commands.extend(withdraw(&mut state, client));
            }
            (attached, commands)
        };
        attached.listener.abort();
        attached.adapter.unregister_handler(attached.handler);
        run(commands).await;
        match cleanup {
            AdapterCleanup::Stop => attached.adapter.stop().await?,
            AdapterCleanup::Forget => {
                for client in attached.proxied {
                    if let Err(e) = attached.adapter.remove_client(client).await {
                        debug!(adapter = %id, %client, error = %e, "proxy not withdrawn");
                    }
                }
            }
        }
        info!(adapter = %id, ?cleanup, "adapter detached");
        Ok(true)
    }

    /// Detach and stop every adapter.
    pub async fn shutdown(&self) {
        let ids: Vec<AdapterId> = self.shared.lock().adapters.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.remove_adapter(id, AdapterCleanup::Stop).await {
                warn!(adapter = %id, error = %e, "adapter did not stop cleanly");
            }
        }
    }

    /// Remote clients currently owned by `adapter`.
    pub fn active_remote_clients_of(&self, adapter: AdapterId) -> Vec<HostId> {
        let state = self.shared.lock();
        let mut clients: Vec<HostId> = state
            .adapters
            .get(&adapter)
            .map(|a| a.owned.iter().copied().collect())
            .unwrap_or_default();
        clients.sort();
        clients
    }

    pub fn route_of(&self, client: HostId) -> Option<AdapterId> {
        self.shared.lock().routes.get(&client).copied()
    }

    pub fn adapter(&self, id: AdapterId) -> Option<Arc<dyn Adapter>> {
        self.shared.lock().adapters.get(&id).map(|a| a.adapter.clone())
    }

    pub fn adapter_ids(&self) -> Vec<AdapterId> {
        self.shared.lock().adapters.keys().copied().collect()
    }

    /// Apply one adapter event to the routing table. Events normally arrive through each
    /// adapter's subscription.
    pub async fn handle_event(&self, from: AdapterId, event: AdapterEvent) {
        self.shared.handle_event(from, event).await;
    }

    /// Forward a private message to the owner of `target`. Returns false when dropped.
    pub async fn forward(&self, from: AdapterId, target: HostId, payload: Bytes) -> bool {
        self.shared.forward(from, target, payload).await
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SwitchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn handle_event(&self, from: AdapterId, event: AdapterEvent) {
        let commands = match event {
            AdapterEvent::ClientUpdated { id, .. } => self.on_discovered(from, id),
            AdapterEvent::ClientRemoved { id } => self.on_removed(from, id),
            AdapterEvent::Stopped => {
                let commands = self.revoke_all(from);
                self.forget_dropped_proxies(from);
                commands
            }
            AdapterEvent::Started => self.push_known(from),
            AdapterEvent::ConnectionError { .. } => Vec::new(),
        };
        run(commands).await;
    }

    fn on_discovered(&self, from: AdapterId, client: HostId) -> Vec<Command> {
        let mut state = self.lock();
        if !state.adapters.contains_key(&from) {
            return Vec::new();
        }
        let previous = state.routes.insert(client, from);
        if previous == Some(from) {
            return Vec::new();
        }
        if let Some(prev) = previous.and_then(|p| state.adapters.get_mut(&p)) {
            prev.owned.remove(&client);
        }
        debug!(%client, owner = %from, ?previous, "client attributed");
        let mut commands = Vec::new();
        for (id, attached) in state.adapters.iter_mut() {
            if *id == from {
                attached.owned.insert(client);
                if attached.proxied.remove(&client) {
                    commands.push(Command::Remove(attached.adapter.clone(), client));
                }
            } else if attached.proxied.insert(client) {
                commands.push(Command::Add(attached.adapter.clone(), client));
            }
        }
        commands
    }

    fn on_removed(&self, from: AdapterId, client: HostId) -> Vec<Command> {
        let mut state = self.lock();
        if state.routes.get(&client) != Some(&from) {
            return Vec::new();
        }
        state.routes.remove(&client);
        if let Some(attached) = state.adapters.get_mut(&from) {
            attached.owned.remove(&client);
        }
        debug!(%client, owner = %from, "client gone");
        withdraw(&mut state, client)
    }

    fn revoke_all(&self, from: AdapterId) -> Vec<Command> {
        let owned: Vec<HostId> = match self.lock().adapters.get(&from) {
            Some(a) => a.owned.iter().copied().collect(),
            None => return Vec::new(),
        };
        owned
            .into_iter()
            .flat_map(|client| self.on_removed(from, client))
            .collect()
    }

    /// A stopped adapter may have dropped its local clients. Forget the proxies it no
    /// longer hosts so that `push_known` re-adds them when it starts again.
    fn forget_dropped_proxies(&self, from: AdapterId) {
        let Some(adapter) = self.lock().adapters.get(&from).map(|a| a.adapter.clone()) else {
            return;
        };
        let hosted: HashSet<HostId> = adapter.local_clients().into_iter().collect();
        if let Some(attached) = self.lock().adapters.get_mut(&from) {
            attached.proxied.retain(|client| hosted.contains(client));
        }
    }

    /// After a lagged subscription: reconcile ownership with what the adapter reports.
    fn resync(&self, from: AdapterId) -> Vec<Command> {
        let Some(adapter) = self.lock().adapters.get(&from).map(|a| a.adapter.clone()) else {
            return Vec::new();
        };
        let remote: HashSet<HostId> = adapter.remote_clients().into_iter().collect();
        let stale: Vec<HostId> = match self.lock().adapters.get(&from) {
            Some(a) => a.owned.difference(&remote).copied().collect(),
            None => return Vec::new(),
        };
        let mut commands: Vec<Command> = stale
            .into_iter()
            .flat_map(|client| self.on_removed(from, client))
            .collect();
        for client in remote {
            commands.extend(self.on_discovered(from, client));
        }
        commands
    }

    /// Proxy every routed client onto an attached or restarted adapter.
    fn push_known(&self, to: AdapterId) -> Vec<Command> {
        let mut state = self.lock();
        let known: Vec<HostId> = state
            .routes
            .iter()
            .filter(|(_, owner)| **owner != to)
            .map(|(client, _)| *client)
            .collect();
        let Some(attached) = state.adapters.get_mut(&to) else {
            return Vec::new();
        };
        let mut commands = Vec::new();
        for client in known {
            if attached.proxied.insert(client) {
                commands.push(Command::Add(attached.adapter.clone(), client));
            }
        }
        commands
    }

    async fn forward(&self, from: AdapterId, target: HostId, payload: Bytes) -> bool {
        let owner = {
            let state = self.lock();
            match state.routes.get(&target) {
                Some(owner) if *owner == from => None,
                Some(owner) => state.adapters.get(owner).map(|a| (*owner, a.adapter.clone())),
                None => None,
            }
        };
        let Some((owner, adapter)) = owner else {
            debug!(%target, %from, "no route for message, dropped");
            return false;
        };
        match adapter.send_message(target, payload).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(%target, %owner, "owner could not deliver message");
                false
            }
            Err(e) => {
                warn!(%target, %owner, error = %e, "forwarding failed");
                false
            }
        }
    }
}

/// Remove `client` from every adapter that hosts it as a proxy.
fn withdraw(state: &mut SwitchState, client: HostId) -> Vec<Command> {
    let mut commands = Vec::new();
    for attached in state.adapters.values_mut() {
        if attached.proxied.remove(&client) {
            commands.push(Command::Remove(attached.adapter.clone(), client));
        }
    }
    commands
}

async fn run(commands: Vec<Command>) {
    for command in commands {
        let (adapter, client, result) = match command {
            Command::Add(adapter, client) => {
                let r = adapter.add_client(client).await;
                (adapter, client, r)
            }
            Command::Remove(adapter, client) => {
                let r = adapter.remove_client(client).await;
                (adapter, client, r)
            }
        };
        if let Err(e) = result {
            warn!(name = adapter.name(), %client, error = %e, "proxy update failed");
        }
    }
}

fn forwarder(shared: Weak<Shared>, from: AdapterId) -> crate::dispatch::MessageHandler {
    handler(move |target, payload| {
        let shared = shared.clone();
        async move {
            if let Some(shared) = shared.upgrade() {
                shared.forward(from, target, payload).await;
            }
        }
    })
}

async fn listen(shared: Weak<Shared>, from: AdapterId, mut events: broadcast::Receiver<AdapterEvent>) {
    loop {
        let received = match events.recv().await {
            Ok(event) => Ok(event),
            Err(RecvError::Lagged(skipped)) => Err(skipped),
            Err(RecvError::Closed) => break,
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match received {
            Ok(event) => shared.handle_event(from, event).await,
            Err(skipped) => {
                warn!(adapter = %from, skipped, "switch lagged behind adapter events, resyncing");
                run(shared.resync(from)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{CallbackDispatcher, MessageHandler};
    use crate::events::EventBus;
    use async_trait::async_trait;
    use hostmesh_core::{Assignments, SettingId, VirtualHostId};
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct MockAdapter {
        started: AtomicBool,
        local: Mutex<Vec<HostId>>,
        remote: Mutex<Vec<HostId>>,
        sent: Mutex<Vec<(HostId, Bytes)>>,
        events: EventBus,
        dispatcher: CallbackDispatcher,
    }

    impl MockAdapter {
        fn local(&self) -> Vec<HostId> {
            let mut v = self.local.lock().unwrap().clone();
            v.sort();
            v
        }
    }

    #[async_trait]
    impl Adapter for MockAdapter {
        fn name(&self) -> &str {
            "mock"
        }

        async fn start(&self) -> Result<(), AdapterError> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), AdapterError> {
            self.started.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_started(&self) -> bool {
            self.started.load(Ordering::SeqCst)
        }

        async fn add_client(&self, id: HostId) -> Result<(), AdapterError> {
            let mut local = self.local.lock().unwrap();
            if !local.contains(&id) {
                local.push(id);
            }
            Ok(())
        }

        async fn remove_client(&self, id: HostId) -> Result<(), AdapterError> {
            self.local.lock().unwrap().retain(|c| *c != id);
            Ok(())
        }

        async fn apply_virtual_hosts(&self, _: HostId, _: Assignments) -> Result<(), AdapterError> {
            Ok(())
        }

        fn resolve_virtual_host(&self, _: VirtualHostId) -> Option<HostId> {
            None
        }

        async fn send_message(&self, target: HostId, payload: Bytes) -> Result<bool, AdapterError> {
            self.sent.lock().unwrap().push((target, payload));
            Ok(true)
        }

        async fn send_to_address(&self, _: &str, _: Bytes) -> Result<bool, AdapterError> {
            Ok(false)
        }

        fn register_handler(&self, handler: MessageHandler) -> HandlerId {
            self.dispatcher.add(handler)
        }

        fn unregister_handler(&self, id: HandlerId) -> bool {
            self.dispatcher.remove(id)
        }

        fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
            self.events.subscribe()
        }

        fn remote_clients(&self) -> Vec<HostId> {
            self.remote.lock().unwrap().clone()
        }

        fn local_clients(&self) -> Vec<HostId> {
            self.local()
        }
    }

    fn discovered(id: HostId) -> AdapterEvent {
        AdapterEvent::ClientUpdated {
            id,
            setting_id: SettingId::EMPTY,
            assignments: Assignments::new(),
        }
    }

    async fn attach(switch: &Switch) -> (Arc<MockAdapter>, AdapterId) {
        let mock = Arc::new(MockAdapter::default());
        let id = switch.add_adapter(mock.clone()).await.unwrap();
        (mock, id)
    }

    #[tokio::test]
    async fn add_adapter_starts_and_imports() {
        let switch = Switch::new();
        let x = HostId::new_random();
        let a = Arc::new(MockAdapter::default());
        a.remote.lock().unwrap().push(x);
        let a_id = switch.add_adapter(a.clone()).await.unwrap();
        assert!(a.is_started());
        assert_eq!(switch.route_of(x), Some(a_id));

        let (b, _) = attach(&switch).await;
        assert_eq!(b.local(), vec![x]);
        assert!(a.local().is_empty());
    }

    #[tokio::test]
    async fn discovery_moves_ownership() {
        let switch = Switch::new();
        let (a, a_id) = attach(&switch).await;
        let (b, b_id) = attach(&switch).await;
        let (c, c_id) = attach(&switch).await;
        let x = HostId::new_random();

        switch.handle_event(a_id, discovered(x)).await;
        assert_eq!(switch.active_remote_clients_of(a_id), vec![x]);
        assert_eq!(b.local(), vec![x]);
        assert_eq!(c.local(), vec![x]);

        switch.handle_event(b_id, discovered(x)).await;
        assert_eq!(switch.route_of(x), Some(b_id));
        assert!(switch.active_remote_clients_of(a_id).is_empty());
        assert_eq!(switch.active_remote_clients_of(b_id), vec![x]);
        assert!(b.local().is_empty());
        assert_eq!(a.local(), vec![x]);
        assert_eq!(c.local(), vec![x]);

        assert!(switch.forward(c_id, x, Bytes::from_static(b"m")).await);
        assert_eq!(b.sent.lock().unwrap().len(), 1);
        assert!(a.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn removal_only_from_owner() {
        let switch = Switch::new();
        let (_a, a_id) = attach(&switch).await;
        let (b, b_id) = attach(&switch).await;
        let x = HostId::new_random();
        switch.handle_event(a_id, discovered(x)).await;

        switch
            .handle_event(b_id, AdapterEvent::ClientRemoved { id: x })
            .await;
        assert_eq!(switch.route_of(x), Some(a_id));

        switch
            .handle_event(a_id, AdapterEvent::ClientRemoved { id: x })
            .await;
        assert_eq!(switch.route_of(x), None);
        assert!(b.local().is_empty());
    }

    #[tokio::test]
    async fn stopped_adapter_loses_its_clients() {
        let switch = Switch::new();
        let (_a, a_id) = attach(&switch).await;
        let (b, _) = attach(&switch).await;
        let x = HostId::new_random();
        let y = HostId::new_random();
        switch.handle_event(a_id, discovered(x)).await;
        switch.handle_event(a_id, discovered(y)).await;
        assert_eq!(b.local().len(), 2);
        switch.handle_event(a_id, AdapterEvent::Stopped).await;
        assert!(b.local().is_empty());
        assert!(switch.active_remote_clients_of(a_id).is_empty());
    }

    #[tokio::test]
    async fn restarted_adapter_gets_its_proxies_back() {
        let switch = Switch::new();
        let (_a, a_id) = attach(&switch).await;
        let (b, b_id) = attach(&switch).await;
        let x = HostId::new_random();
        switch.handle_event(a_id, discovered(x)).await;
        assert_eq!(b.local(), vec![x]);

        b.local.lock().unwrap().clear();
        switch.handle_event(b_id, AdapterEvent::Stopped).await;
        assert!(b.local().is_empty());
        switch.handle_event(b_id, AdapterEvent::Started).await;
        assert_eq!(b.local(), vec![x]);
        assert_eq!(switch.route_of(x), Some(a_id));
    }

    #[tokio::test]
    async fn forward_drops_unknown_and_self_routes() {
        let switch = Switch::new();
        let (a, a_id) = attach(&switch).await;
        let x = HostId::new_random();
        assert!(!switch.forward(a_id, x, Bytes::new()).await);
        switch.handle_event(a_id, discovered(x)).await;
        assert!(!switch.forward(a_id, x, Bytes::new()).await);
        assert!(a.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn proxied_message_reaches_owner_through_handler() {
        let switch = Switch::new();
        let (a, a_id) = attach(&switch).await;
        let (b, _) = attach(&switch).await;
        let x = HostId::new_random();
        switch.handle_event(a_id, discovered(x)).await;
        let n = b
            .dispatcher
            .dispatch_and_wait(x, Bytes::from_static(b"relay me"))
            .await;
        assert_eq!(n, 1);
        assert_eq!(
            a.sent.lock().unwrap().as_slice(),
            &[(x, Bytes::from_static(b"relay me"))]
        );
    }

    #[tokio::test]
    async fn remove_adapter_cleanup_modes() {
        let switch = Switch::new();
        let (a, a_id) = attach(&switch).await;
        let (b, b_id) = attach(&switch).await;
        let x = HostId::new_random();
        let y = HostId::new_random();
        switch.handle_event(a_id, discovered(x)).await;
        switch.handle_event(b_id, discovered(y)).await;
        assert_eq!(a.local(), vec![y]);

        assert!(switch.remove_adapter(a_id, AdapterCleanup::Forget).await.unwrap());
        assert!(a.is_started());
        assert!(a.local().is_empty());
        assert!(b.local().is_empty());
        assert_eq!(switch.route_of(x), None);
        assert!(a.dispatcher.is_empty());

        assert!(switch.remove_adapter(b_id, AdapterCleanup::Stop).await.unwrap());
        assert!(!b.is_started());
        assert!(!switch.remove_adapter(b_id, AdapterCleanup::Stop).await.unwrap());
    }

    #[tokio::test]
    async fn events_flow_through_subscription() {
        let switch = Switch::new();
        let (a, a_id) = attach(&switch).await;
        let (b, _) = attach(&switch).await;
        let x = HostId::new_random();
        a.events.publish(discovered(x));
        for _ in 0..100 {
            if switch.route_of(x).is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(switch.route_of(x), Some(a_id));
        assert_eq!(b.local(), vec![x]);
    }
}
