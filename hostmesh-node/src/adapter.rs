//! The `Adapter` contract and the presence machinery both adapters share: the
//! announcement loop, forced wake, retry of transient transport errors and fatal halt.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use hostmesh_core::{
    Assignments, HostDirectory, HostId, PresenceEngine, PresenceError, PresenceMessage, Reaction,
    VirtualHostId, DEFAULT_GUARD_SKEW,
};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::{CallbackDispatcher, HandlerId, MessageHandler};
use crate::error::{AdapterError, MediumError};
use crate::events::{AdapterEvent, EventBus};

/// Default number of retries for a timed-out send.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Settings handed to an adapter at construction.
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    /// Label used in logs.
    pub name: String,
    pub ttl_secs: u16,
    /// Subtracted from TTL/2 so refreshes land before peers expire us.
    pub guard_skew: Duration,
    /// Pub/sub channel carrying presence frames.
    pub broadcast_channel: String,
    /// Prefix of per-host private channels.
    pub channel_prefix: String,
    pub retry_limit: u32,
    /// How long start waits to observe its own Hello before running anyway.
    pub start_timeout: Duration,
    /// Per-write deadline on byte streams.
    pub write_timeout: Duration,
}

impl AdapterSettings {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            name: "adapter".into(),
            ttl_secs: 10,
            guard_skew: DEFAULT_GUARD_SKEW,
            broadcast_channel: "hostmesh.presence".into(),
            channel_prefix: "hostmesh.host.".into(),
            retry_limit: DEFAULT_RETRY_LIMIT,
            start_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Transport binding of the presence protocol plus private message delivery.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<(), AdapterError>;

    /// Announce shutdown for every local client and release the transport. No-op when stopped.
    async fn stop(&self) -> Result<(), AdapterError>;

    fn is_started(&self) -> bool;

    /// Host `id` locally: it is announced and receives private messages through the handlers.
    async fn add_client(&self, id: HostId) -> Result<(), AdapterError>;

    async fn remove_client(&self, id: HostId) -> Result<(), AdapterError>;

    /// Replace the virtual hosts advertised by a local client. Weights must be positive.
    async fn apply_virtual_hosts(
        &self,
        id: HostId,
        assignments: Assignments,
    ) -> Result<(), AdapterError>;

    fn resolve_virtual_host(&self, vhost: VirtualHostId) -> Option<HostId>;

    /// Returns `Ok(false)` when the target is unknown.
    async fn send_message(&self, target: HostId, payload: Bytes) -> Result<bool, AdapterError>;

    /// Send to a transport address directly, bypassing id lookup.
    async fn send_to_address(&self, address: &str, payload: Bytes) -> Result<bool, AdapterError>;

    fn register_handler(&self, handler: MessageHandler) -> HandlerId;

    fn unregister_handler(&self, id: HandlerId) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent>;

    fn remote_clients(&self) -> Vec<HostId>;

    fn local_clients(&self) -> Vec<HostId>;
}

/// Current instant on the tokio clock, so paused-time tests drive expiry too.
pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

struct Runner {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Engine, directory, dispatcher and event bus of one adapter.
pub(crate) struct Presence {
    pub(crate) settings: AdapterSettings,
    engine: Mutex<PresenceEngine>,
    pub(crate) directory: Arc<HostDirectory>,
    pub(crate) dispatcher: CallbackDispatcher,
    pub(crate) events: EventBus,
    wake: Notify,
    runner: Mutex<Option<Runner>>,
}

impl Presence {
    pub(crate) fn new(settings: AdapterSettings) -> Self {
        let directory = Arc::new(HostDirectory::new());
        Self {
            engine: Mutex::new(PresenceEngine::new(settings.ttl_secs, directory.clone())),
            directory,
            settings,
            dispatcher: CallbackDispatcher::new(),
            events: EventBus::new(),
            wake: Notify::new(),
            runner: Mutex::new(None),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.settings.name
    }

    /// Run `f` on the engine. The lock is released before returning.
    pub(crate) fn react<R>(&self, f: impl FnOnce(&mut PresenceEngine) -> R) -> R {
        let mut engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut engine)
    }

    pub(crate) fn is_started(&self) -> bool {
        self.react(|e| e.is_started())
    }

    pub(crate) fn require_started(&self) -> Result<(), AdapterError> {
        if self.is_started() {
            Ok(())
        } else {
            Err(AdapterError::NotStarted)
        }
    }

    pub(crate) fn start_engine(&self) -> Result<Reaction, AdapterError> {
        self.react(|e| e.start(now())).map_err(|e| match e {
            PresenceError::AlreadyStarted => AdapterError::AlreadyStarted,
            other => AdapterError::Presence(other),
        })
    }

    fn publish_all(&self, reaction: &mut Reaction) {
        for event in reaction.events.drain(..) {
            self.events.publish(event.into());
        }
        if reaction.wake {
            self.wake.notify_one();
        }
    }

    /// Fatal transport error: halt the engine, stop the loop, report it. Sends fail until
    /// the adapter is started again.
    pub(crate) fn fail(&self, error: MediumError) {
        let mut reaction = self.react(|e| e.halt());
        if let Some(runner) = self
            .runner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            let _ = runner.shutdown.send(true);
        }
        warn!(adapter = %self.name(), %error, "transport failed, adapter halted");
        self.events.publish(AdapterEvent::ConnectionError {
            error,
            fatal: true,
            retried: false,
        });
        self.publish_all(&mut reaction);
    }

    /// Signal the announcement loop without waiting for it.
    pub(crate) fn cancel_loop(&self) {
        let runner = self
            .runner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runner) = runner {
            let _ = runner.shutdown.send(true);
        }
    }

    /// Signal the announcement loop and wait for it to exit.
    pub(crate) async fn stop_loop(&self) {
        let runner = self
            .runner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runner) = runner {
            let _ = runner.shutdown.send(true);
            if let Err(e) = runner.task.await {
                debug!(adapter = %self.name(), error = %e, "announcement loop ended abnormally");
            }
        }
    }
}

/// Adapter half that can put presence messages on the wire.
#[async_trait]
pub(crate) trait PresenceSink: Send + Sync + 'static {
    fn presence(&self) -> &Presence;

    async fn send_presence(&self, msg: &PresenceMessage) -> Result<(), MediumError>;
}

/// Run `op`, retrying timeouts up to the configured limit. Exhausted retries are reported
/// as a non-fatal connection error; any other error halts the adapter.
pub(crate) async fn with_retry<F, Fut>(presence: &Presence, mut op: F) -> Result<(), MediumError>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<(), MediumError>> + Send,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < presence.settings.retry_limit => {
                attempt += 1;
                debug!(adapter = %presence.name(), attempt, "send timed out, retrying");
            }
            Err(e) if e.is_transient() => {
                warn!(adapter = %presence.name(), attempts = attempt + 1, "send timed out, giving up");
                presence.events.publish(AdapterEvent::ConnectionError {
                    error: e.clone(),
                    fatal: false,
                    retried: attempt > 0,
                });
                return Err(e);
            }
            Err(e) if e.is_fatal() => {
                presence.fail(e.clone());
                return Err(e);
            }
            Err(e) => {
                debug!(adapter = %presence.name(), error = %e, "message refused by medium");
                return Err(e);
            }
        }
    }
}

/// Publish a reaction's events, honor its wake request, then send its messages in order.
/// Stops at the first fatal error; a message whose retries ran out is skipped.
pub(crate) async fn deliver<S: PresenceSink + ?Sized>(
    sink: &S,
    mut reaction: Reaction,
) -> Result<(), AdapterError> {
    let presence = sink.presence();
    presence.publish_all(&mut reaction);
    for msg in &reaction.outbound {
        match with_retry(presence, || sink.send_presence(msg)).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(_) => {}
        }
    }
    Ok(())
}

/// Spawn the announcement loop: tick, deliver, then wait for the interval, a wake or
/// shutdown.
pub(crate) fn spawn_loop<S: PresenceSink>(sink: Arc<S>) {
    let (shutdown, mut signal) = watch::channel(false);
    let task_sink = sink.clone();
    let task = tokio::spawn(async move {
        let presence = task_sink.presence();
        let interval = presence.react(|e| e.refresh_interval(presence.settings.guard_skew));
        loop {
            if *signal.borrow() {
                break;
            }
            let reaction = presence.react(|e| e.tick(now()));
            if deliver(&*task_sink, reaction).await.is_err() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = presence.wake.notified() => {}
                changed = signal.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(adapter = %presence.name(), "announcement loop exited");
    });
    let presence = sink.presence();
    info!(adapter = %presence.name(), ttl = presence.settings.ttl_secs, "announcement loop started");
    *presence.runner.lock().unwrap_or_else(PoisonError::into_inner) = Some(Runner { shutdown, task });
}
