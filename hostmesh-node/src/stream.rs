//! Presence and private messaging over one duplex byte stream, framed as binary datagrams.
//!
//! A stream has no loop-back, so the adapter counts as running as soon as its Hello is
//! written. Streams can be swapped while the adapter is stopped.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use hostmesh_core::binary::MAX_PAYLOAD_LEN;
use hostmesh_core::{
    address_token, decode_datagram, encode_datagram, token_address, Assignments, BinaryFrameError,
    Datagram, HostId, PresenceMessage, StopPolicy, VirtualHostId,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{
    deliver, now, spawn_loop, with_retry, Adapter, AdapterSettings, Presence, PresenceSink,
};
use crate::dispatch::{HandlerId, MessageHandler};
use crate::error::{AdapterError, MediumError};
use crate::events::AdapterEvent;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

const READ_CHUNK: usize = 8 * 1024;

/// What happens to the streams on stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopMode {
    /// Abort reading and drop both halves.
    #[default]
    Close,
    /// Close the write half and keep reading until the peer ends the stream.
    Drain,
    /// Stop reading but keep both halves, buffered bytes included, for the next start.
    LeaveOpen,
}

/// Read half plus bytes received but not yet decoded.
struct ReadSide {
    stream: BoxReader,
    buf: BytesMut,
}

struct ReadTask {
    cancel: watch::Sender<bool>,
    task: JoinHandle<Option<ReadSide>>,
}

pub struct StreamAdapter {
    inner: Arc<Inner>,
}

struct Inner {
    presence: Presence,
    reader: Mutex<Option<ReadSide>>,
    writer: tokio::sync::Mutex<Option<BoxWriter>>,
    read_task: Mutex<Option<ReadTask>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl StreamAdapter {
    /// Adapter without streams; attach them with `set_streams` before starting.
    pub fn new(settings: AdapterSettings) -> Self {
        Self::build(settings, None, None)
    }

    pub fn with_streams(settings: AdapterSettings, reader: BoxReader, writer: BoxWriter) -> Self {
        Self::build(settings, Some(ReadSide::new(reader)), Some(writer))
    }

    fn build(settings: AdapterSettings, reader: Option<ReadSide>, writer: Option<BoxWriter>) -> Self {
        Self {
            inner: Arc::new(Inner {
                presence: Presence::new(settings),
                reader: Mutex::new(reader),
                writer: tokio::sync::Mutex::new(writer),
                read_task: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Split one duplex stream into the two halves.
    pub fn from_stream<S>(settings: AdapterSettings, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        Self::with_streams(settings, Box::new(r), Box::new(w))
    }

    /// Replace the streams. Only allowed while stopped.
    pub async fn set_streams(&self, reader: BoxReader, writer: BoxWriter) -> Result<(), AdapterError> {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;
        if inner.presence.is_started() {
            return Err(AdapterError::AlreadyStarted);
        }
        *inner.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(ReadSide::new(reader));
        *inner.writer.lock().await = Some(writer);
        Ok(())
    }

    /// Address announced for `id`: the hex token of its private channel name.
    pub fn address_of(&self, id: HostId) -> String {
        self.inner.address_of(id)
    }

    pub async fn stop_with(&self, mode: StopMode) -> Result<(), AdapterError> {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;
        inner.presence.stop_loop().await;
        let was_started = inner.presence.is_started();
        let reaction = inner.presence.react(|e| e.stop(StopPolicy::ClearClients));
        if let Err(e) = deliver(&**inner, reaction).await {
            debug!(adapter = %inner.presence.name(), error = %e, "shutdown frames not sent");
        }
        let read_task = inner
            .read_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if !was_started && read_task.is_none() {
            return Ok(());
        }
        match mode {
            StopMode::Close => {
                if let Some(t) = read_task {
                    let _ = t.cancel.send(true);
                    let _ = t.task.await;
                }
                inner.writer.lock().await.take();
                inner.reader.lock().unwrap_or_else(PoisonError::into_inner).take();
            }
            StopMode::Drain => {
                if let Some(mut w) = inner.writer.lock().await.take() {
                    if let Err(e) = w.shutdown().await {
                        debug!(adapter = %inner.presence.name(), error = %e, "write half already closed");
                    }
                }
                if let Some(t) = read_task {
                    let _ = t.task.await;
                }
                inner.reader.lock().unwrap_or_else(PoisonError::into_inner).take();
            }
            StopMode::LeaveOpen => {
                if let Some(t) = read_task {
                    let _ = t.cancel.send(true);
                    if let Ok(Some(side)) = t.task.await {
                        *inner.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(side);
                    }
                }
            }
        }
        if was_started {
            info!(adapter = %inner.presence.name(), ?mode, "stream adapter stopped");
        }
        Ok(())
    }
}

impl ReadSide {
    fn new(stream: BoxReader) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }
}

impl Inner {
    fn address_of(&self, id: HostId) -> String {
        let channel = format!("{}{}", self.presence.settings.channel_prefix, id);
        token_address(&address_token(&channel))
    }

    async fn write_datagram(&self, datagram: &[u8]) -> Result<(), MediumError> {
        let mut slot = self.writer.lock().await;
        let writer = slot.as_mut().ok_or(MediumError::NotConnected)?;
        let write = async {
            writer.write_all(datagram).await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.presence.settings.write_timeout, write).await {
            Err(_) => Err(MediumError::Timeout),
            Ok(Err(e)) => Err(MediumError::from_io(&e)),
            Ok(Ok(())) => Ok(()),
        }
    }

    async fn send_datagram(&self, datagram: &Datagram) -> Result<(), AdapterError> {
        let bytes = encode_datagram(datagram).map_err(|e| match e {
            BinaryFrameError::TooLarge => AdapterError::PayloadTooLarge,
            other => AdapterError::Medium(MediumError::Disconnected(other.to_string())),
        })?;
        with_retry(&self.presence, || self.write_datagram(&bytes)).await?;
        Ok(())
    }

    async fn on_datagram(&self, datagram: Datagram) {
        match datagram {
            Datagram::Presence(msg) => {
                let reaction = self.presence.react(|e| e.handle(msg, now()));
                if let Err(e) = deliver(self, reaction).await {
                    debug!(adapter = %self.presence.name(), error = %e, "presence reply not sent");
                }
            }
            Datagram::Message { target, payload } => {
                if self.presence.react(|e| e.is_local(target)) {
                    self.presence.dispatcher.dispatch(target, Bytes::from(payload));
                } else {
                    debug!(adapter = %self.presence.name(), %target, "message for unknown local client dropped");
                }
            }
        }
    }
}

/// Decode datagrams until cancelled or the stream ends. Returns the read side when
/// cancelled so it can be reused.
async fn read_loop(
    inner: Arc<Inner>,
    mut side: ReadSide,
    mut cancel: watch::Receiver<bool>,
) -> Option<ReadSide> {
    loop {
        if *cancel.borrow() {
            return Some(side);
        }
        loop {
            match decode_datagram(&side.buf) {
                Ok((datagram, used)) => {
                    side.buf.advance(used);
                    inner.on_datagram(datagram).await;
                }
                Err(BinaryFrameError::NeedMore) => break,
                Err(BinaryFrameError::Rejected { len, reason }) => {
                    debug!(adapter = %inner.presence.name(), %reason, "dropping invalid datagram");
                    side.buf.advance(len);
                }
                Err(e) => {
                    lost(&inner, MediumError::Disconnected(format!("framing lost: {e}")));
                    return None;
                }
            }
        }
        if side.buf.capacity() - side.buf.len() < READ_CHUNK {
            side.buf.reserve(READ_CHUNK);
        }
        tokio::select! {
            biased;
            _ = cancel.changed() => return Some(side),
            read = side.stream.read_buf(&mut side.buf) => match read {
                Ok(0) => {
                    lost(&inner, MediumError::Disconnected("end of stream".into()));
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    lost(&inner, MediumError::from_io(&e));
                    return None;
                }
            },
        }
    }
}

/// The read side is gone. Fatal while running; expected while draining.
fn lost(inner: &Inner, error: MediumError) {
    if inner.presence.is_started() {
        inner.presence.fail(error);
    } else {
        debug!(adapter = %inner.presence.name(), %error, "read side closed");
    }
}

#[async_trait]
impl PresenceSink for Inner {
    fn presence(&self) -> &Presence {
        &self.presence
    }

    async fn send_presence(&self, msg: &PresenceMessage) -> Result<(), MediumError> {
        let bytes = match encode_datagram(&Datagram::Presence(msg.clone())) {
            Ok(b) => b,
            Err(e) => {
                warn!(adapter = %self.presence.name(), error = %e, kind = msg.kind(), "cannot encode presence datagram");
                return Ok(());
            }
        };
        self.write_datagram(&bytes).await
    }
}

#[async_trait]
impl Adapter for StreamAdapter {
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
        if inner.writer.lock().await.is_none() {
            return Err(AdapterError::StreamsMissing);
        }
        let side = inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(AdapterError::StreamsMissing)?;

        let reaction = match inner.presence.start_engine() {
            Ok(r) => r,
            Err(e) => {
                *inner.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(side);
                return Err(e);
            }
        };
        let (cancel, signal) = watch::channel(false);
        let task = tokio::spawn(read_loop(inner.clone(), side, signal));
        *inner.read_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(ReadTask { cancel, task });

        deliver(&**inner, reaction).await?;
        let reaction = inner.presence.react(|e| e.mark_running());
        deliver(&**inner, reaction).await?;
        inner.presence.require_started()?;
        spawn_loop(inner.clone());
        info!(adapter = %inner.presence.name(), "stream adapter started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        self.stop_with(StopMode::Close).await
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
        deliver(&**inner, reaction).await
    }

    async fn remove_client(&self, id: HostId) -> Result<(), AdapterError> {
        let reaction = self.inner.presence.react(|e| e.remove_client(id));
        deliver(&*self.inner, reaction).await
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
        if payload.len() > MAX_PAYLOAD_LEN as usize {
            return Err(AdapterError::PayloadTooLarge);
        }
        if inner.presence.react(|e| e.is_local(target)) {
            inner.presence.dispatcher.dispatch(target, payload);
            return Ok(true);
        }
        if inner.presence.directory.get(target, now()).is_none() {
            debug!(adapter = %inner.presence.name(), %target, "no route to host");
            return Ok(false);
        }
        inner
            .send_datagram(&Datagram::Message {
                target,
                payload: payload.to_vec(),
            })
            .await?;
        Ok(true)
    }

    async fn send_to_address(&self, address: &str, payload: Bytes) -> Result<bool, AdapterError> {
        let inner = &self.inner;
        inner.presence.require_started()?;
        let target = inner
            .presence
            .react(|e| e.local_by_address(address))
            .or_else(|| inner.presence.directory.host_by_address(address));
        match target {
            Some(id) => self.send_message(id, payload).await,
            None => Ok(false),
        }
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

impl Drop for StreamAdapter {
    fn drop(&mut self) {
        self.inner.presence.cancel_loop();
        if let Some(t) = self
            .inner
            .read_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            t.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::handler;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    fn pair() -> (StreamAdapter, StreamAdapter) {
        let (x, y) = tokio::io::duplex(64 * 1024);
        (
            StreamAdapter::from_stream(AdapterSettings::named("left"), x),
            StreamAdapter::from_stream(AdapterSettings::named("right"), y),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_without_streams_fails() {
        let a = StreamAdapter::new(AdapterSettings::named("bare"));
        assert_eq!(a.start().await, Err(AdapterError::StreamsMissing));
        assert!(!a.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn streams_swappable_only_while_stopped() {
        let (x, _y) = tokio::io::duplex(1024);
        let a = StreamAdapter::from_stream(AdapterSettings::named("a"), x);
        a.start().await.unwrap();
        let (r, w) = tokio::io::split(tokio::io::duplex(16).0);
        assert_eq!(
            a.set_streams(Box::new(r), Box::new(w)).await,
            Err(AdapterError::AlreadyStarted)
        );
        a.stop().await.unwrap();
        let (r, w) = tokio::io::split(tokio::io::duplex(16).0);
        a.set_streams(Box::new(r), Box::new(w)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn peers_exchange_presence_and_messages() {
        let (a, b) = pair();
        let ca = HostId::new_random();
        let cb = HostId::new_random();
        a.add_client(ca).await.unwrap();
        b.add_client(cb).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.register_handler(handler(move |id, payload| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((id, payload));
            }
        }));
        a.start().await.unwrap();
        b.start().await.unwrap();
        settle().await;
        assert_eq!(a.remote_clients(), vec![cb]);
        assert_eq!(b.remote_clients(), vec![ca]);

        assert!(a.send_message(cb, Bytes::from_static(b"over the wire")).await.unwrap());
        let (id, payload) = rx.recv().await.unwrap();
        assert_eq!(id, cb);
        assert_eq!(&payload[..], b"over the wire");

        let address = b.address_of(cb);
        assert_eq!(address.len(), 32);
        assert!(a.send_to_address(&address, Bytes::from_static(b"direct")).await.unwrap());
        assert_eq!(&rx.recv().await.unwrap().1[..], b"direct");
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_target_not_delivered() {
        let (a, b) = pair();
        a.start().await.unwrap();
        b.start().await.unwrap();
        assert!(!a
            .send_message(HostId::new_random(), Bytes::from_static(b"?"))
            .await
            .unwrap());
        assert!(!a.send_to_address("nowhere", Bytes::new()).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn peer_stop_reports_removal_then_eof_halts() {
        let (a, b) = pair();
        let cb = HostId::new_random();
        b.add_client(cb).await.unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();
        settle().await;
        let mut events = a.subscribe();
        b.stop().await.unwrap();
        settle().await;
        assert_eq!(
            events.recv().await.unwrap(),
            AdapterEvent::ClientRemoved { id: cb }
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            AdapterEvent::ConnectionError { fatal: true, .. }
        ));
        assert_eq!(events.recv().await.unwrap(), AdapterEvent::Stopped);
        assert!(!a.is_started());
        assert!(b.local_clients().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn leave_open_keeps_stream_for_restart() {
        let (a, b) = pair();
        let cb = HostId::new_random();
        b.add_client(cb).await.unwrap();
        a.start().await.unwrap();
        a.stop_with(StopMode::LeaveOpen).await.unwrap();
        b.start().await.unwrap();
        settle().await;
        a.start().await.unwrap();
        settle().await;
        assert_eq!(a.remote_clients(), vec![cb]);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_reads_until_peer_closes() {
        let (a, b) = pair();
        let ca = HostId::new_random();
        a.add_client(ca).await.unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();
        settle().await;
        let mut events = b.subscribe();
        let drained = tokio::spawn(async move {
            a.stop_with(StopMode::Drain).await.unwrap();
            a
        });
        settle().await;
        assert_eq!(
            events.recv().await.unwrap(),
            AdapterEvent::ClientRemoved { id: ca }
        );
        b.stop().await.unwrap();
        let a = drained.await.unwrap();
        assert!(!a.is_started());
        assert_eq!(a.start().await, Err(AdapterError::StreamsMissing));
    }

    #[tokio::test(start_paused = true)]
    async fn garbage_on_stream_is_fatal() {
        let (x, mut y): (DuplexStream, DuplexStream) = tokio::io::duplex(1024);
        let a = StreamAdapter::from_stream(AdapterSettings::named("a"), x);
        a.start().await.unwrap();
        let mut events = a.subscribe();
        y.write_all(&[0xEE; 32]).await.unwrap();
        settle().await;
        assert!(matches!(
            events.recv().await.unwrap(),
            AdapterEvent::ConnectionError { fatal: true, .. }
        ));
        assert!(!a.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn oversize_payload_rejected() {
        let (a, _b) = pair();
        a.start().await.unwrap();
        let big = Bytes::from(vec![0u8; MAX_PAYLOAD_LEN as usize + 1]);
        assert_eq!(
            a.send_message(HostId::new_random(), big).await,
            Err(AdapterError::PayloadTooLarge)
        );
    }
}
