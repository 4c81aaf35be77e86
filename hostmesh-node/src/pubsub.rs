//! Presence and private messaging over a pub/sub medium.
//!
//! Presence frames travel as text on one shared broadcast channel. Each local client
//! listens on its own private channel, `prefix + id`, which is also its announced address.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use hostmesh_core::{
    decode_text, encode_text, Assignments, HostId, PresenceMessage, StopPolicy, TextFrameError,
    VirtualHostId,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{
    deliver, now, spawn_loop, with_retry, Adapter, AdapterSettings, Presence, PresenceSink,
};
use crate::dispatch::{HandlerId, MessageHandler};
use crate::error::{AdapterError, MediumError};
use crate::events::AdapterEvent;
use crate::medium::{MediumMessage, PubSubMedium};

pub struct PubSubAdapter {
    inner: Arc<Inner>,
}

struct Inner {
    presence: Presence,
    medium: Arc<dyn PubSubMedium>,
    inbound: Mutex<Option<JoinHandle<()>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl PubSubAdapter {
    /// Fails if the channel prefix contains the frame separator.
    pub fn new(settings: AdapterSettings, medium: Arc<dyn PubSubMedium>) -> Result<Self, AdapterError> {
        if settings.channel_prefix.contains(':') {
            return Err(TextFrameError::AddressHasSeparator(settings.channel_prefix.clone()).into());
        }
        Ok(Self {
            inner: Arc::new(Inner {
                presence: Presence::new(settings),
                medium,
                inbound: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Private channel of `id`.
    pub fn address_of(&self, id: HostId) -> String {
        self.inner.address_of(id)
    }
}

impl Inner {
    fn address_of(&self, id: HostId) -> String {
        format!("{}{}", self.presence.settings.channel_prefix, id)
    }

    fn abort_inbound(&self) {
        if let Some(task) = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    async fn publish_private(&self, channel: &str, payload: Bytes) -> Result<(), AdapterError> {
        if self
            .medium
            .max_payload()
            .is_some_and(|max| payload.len() > max)
        {
            return Err(AdapterError::PayloadTooLarge);
        }
        with_retry(&self.presence, || self.medium.publish(channel, payload.clone())).await?;
        Ok(())
    }

    async fn on_broadcast(&self, payload: &[u8]) {
        let frame = match std::str::from_utf8(payload) {
            Ok(s) => s,
            Err(_) => {
                debug!(adapter = %self.presence.name(), "dropping non-utf8 presence frame");
                return;
            }
        };
        let msg = match decode_text(frame) {
            Ok(m) => m,
            Err(e) => {
                debug!(adapter = %self.presence.name(), error = %e, frame, "dropping malformed presence frame");
                return;
            }
        };
        let reaction = self.presence.react(|e| e.handle(msg, now()));
        if let Err(e) = deliver(self, reaction).await {
            debug!(adapter = %self.presence.name(), error = %e, "presence reply not sent");
        }
    }

    fn on_private(&self, msg: MediumMessage) {
        match self.presence.react(|e| e.local_by_address(&msg.channel)) {
            Some(id) => {
                self.presence.dispatcher.dispatch(id, msg.payload);
            }
            None => debug!(adapter = %self.presence.name(), channel = %msg.channel, "no local client for channel"),
        }
    }
}

async fn inbound_loop(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<MediumMessage>) {
    while let Some(msg) = rx.recv().await {
        if msg.channel == inner.presence.settings.broadcast_channel {
            inner.on_broadcast(&msg.payload).await;
        } else if inner.presence.is_started() {
            inner.on_private(msg);
        }
    }
    if inner.presence.is_started() {
        inner
            .presence
            .fail(MediumError::Disconnected("medium closed the subscription".into()));
    }
}

#[async_trait]
impl PresenceSink for Inner {
    fn presence(&self) -> &Presence {
        &self.presence
    }

    async fn send_presence(&self, msg: &PresenceMessage) -> Result<(), MediumError> {
        let frame = match encode_text(msg) {
            Ok(f) => f,
            Err(e) => {
                warn!(adapter = %self.presence.name(), error = %e, kind = msg.kind(), "cannot encode presence frame");
                return Ok(());
            }
        };
        self.medium
            .publish(&self.presence.settings.broadcast_channel, Bytes::from(frame))
            .await
    }
}

#[async_trait]
impl Adapter for PubSubAdapter {
    fn name(&self) -> &str {
        self.inner.presence.name()
    }

    async fn start(&self) -> Result<(), AdapterError> {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;
        if inner.presence.is_started() {
            return Err(AdapterError::AlreadyStarted);
        }
        inner.presence.stop_loop().await;
        inner.abort_inbound();

        let rx = inner.medium.open().await?;
        inner
            .medium
            .subscribe(&inner.presence.settings.broadcast_channel)
            .await?;
        for id in inner.presence.react(|e| e.local_clients()) {
            inner.medium.subscribe(&inner.address_of(id)).await?;
        }
        let task = tokio::spawn(inbound_loop(inner.clone(), rx));
        *inner.inbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        let mut events = inner.presence.events.subscribe();
        let reaction = inner.presence.start_engine()?;
        deliver(&**inner, reaction).await?;

        let observed = tokio::time::timeout(inner.presence.settings.start_timeout, async {
            loop {
                match events.recv().await {
                    Ok(AdapterEvent::Started) | Err(broadcast::error::RecvError::Closed) => break,
                    _ => {}
                }
            }
        })
        .await;
        if observed.is_err() {
            debug!(adapter = %inner.presence.name(), "own hello not observed, running anyway");
            let reaction = inner.presence.react(|e| e.mark_running());
            deliver(&**inner, reaction).await?;
        }
        inner.presence.require_started()?;
        spawn_loop(inner.clone());
        info!(adapter = %inner.presence.name(), "pub/sub adapter started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;
        inner.presence.stop_loop().await;
        let was_started = inner.presence.is_started();
        let reaction = inner.presence.react(|e| e.stop(StopPolicy::RetainClients));
        if let Err(e) = deliver(&**inner, reaction).await {
            debug!(adapter = %inner.presence.name(), error = %e, "shutdown frames not sent");
        }
        inner.abort_inbound();
        inner.medium.close().await;
        if was_started {
            info!(adapter = %inner.presence.name(), "pub/sub adapter stopped");
        }
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.inner.presence.is_started()
    }

    async fn add_client(&self, id: HostId) -> Result<(), AdapterError> {
        let inner = &self.inner;
        let address = inner.address_of(id);
        let reaction = inner
            .presence
            .react(|e| e.add_client(id, &address, now()))?;
        if inner.presence.is_started() {
            inner.medium.subscribe(&address).await?;
        }
        deliver(&**inner, reaction).await
    }

    async fn remove_client(&self, id: HostId) -> Result<(), AdapterError> {
        let inner = &self.inner;
        let reaction = inner.presence.react(|e| e.remove_client(id));
        if inner.presence.is_started() {
            inner.medium.unsubscribe(&inner.address_of(id)).await?;
        }
        deliver(&**inner, reaction).await
    }

    async fn apply_virtual_hosts(
        &self,
        id: HostId,
        assignments: Assignments,
    ) -> Result<(), AdapterError> {
        let reaction = self
            .inner
            .presence
            .react(|e| e.apply_virtual_hosts(id, assignments, now()))?;
        deliver(&*self.inner, reaction).await
    }

    fn resolve_virtual_host(&self, vhost: VirtualHostId) -> Option<HostId> {
        self.inner.presence.directory.resolve(vhost, now())
    }

    async fn send_message(&self, target: HostId, payload: Bytes) -> Result<bool, AdapterError> {
        let inner = &self.inner;
        inner.presence.require_started()?;
        if inner.presence.react(|e| e.is_local(target)) {
            inner.presence.dispatcher.dispatch(target, payload);
            return Ok(true);
        }
        let Some(address) = inner.presence.directory.get(target, now()) else {
            debug!(adapter = %inner.presence.name(), %target, "no route to host");
            return Ok(false);
        };
        inner.publish_private(&address, payload).await?;
        Ok(true)
    }

    async fn send_to_address(&self, address: &str, payload: Bytes) -> Result<bool, AdapterError> {
        let inner = &self.inner;
        inner.presence.require_started()?;
        if let Some(local) = inner.presence.react(|e| e.local_by_address(address)) {
            inner.presence.dispatcher.dispatch(local, payload);
            return Ok(true);
        }
        inner.publish_private(address, payload).await?;
        Ok(true)
    }

    fn register_handler(&self, handler: MessageHandler) -> HandlerId {
        self.inner.presence.dispatcher.add(handler)
    }

    fn unregister_handler(&self, id: HandlerId) -> bool {
        self.inner.presence.dispatcher.remove(id)
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.inner.presence.events.subscribe()
    }

    fn remote_clients(&self) -> Vec<HostId> {
        self.inner.presence.react(|e| e.remote_clients())
    }

    fn local_clients(&self) -> Vec<HostId> {
        self.inner.presence.react(|e| e.local_clients())
    }
}

impl Drop for PubSubAdapter {
    fn drop(&mut self) {
        self.inner.presence.cancel_loop();
        self.inner.abort_inbound();
    }
}
