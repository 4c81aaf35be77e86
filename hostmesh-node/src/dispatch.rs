//! Fan-out of received private messages to registered handlers.
//!
//! The handler set is an immutable slice swapped on add/remove, so delivery works on a
//! snapshot and never waits for registration changes.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use hostmesh_core::HostId;

pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Called with the addressed client id and the opaque payload.
pub type MessageHandler = Arc<dyn Fn(HostId, Bytes) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a `MessageHandler`.
pub fn handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(HostId, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |id, payload| Box::pin(f(id, payload)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type HandlerSet = Arc<[(HandlerId, MessageHandler)]>;

pub struct CallbackDispatcher {
    handlers: RwLock<HandlerSet>,
    next_id: AtomicU64,
}

impl CallbackDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Arc::from(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    fn snapshot(&self) -> HandlerSet {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn add(&self, handler: MessageHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut slot = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let mut next: Vec<(HandlerId, MessageHandler)> = slot.iter().cloned().collect();
        next.push((id, handler));
        *slot = Arc::from(next);
        id
    }

    /// Returns false if the handler was not registered.
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut slot = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if !slot.iter().any(|(h, _)| *h == id) {
            return false;
        }
        let next: Vec<(HandlerId, MessageHandler)> =
            slot.iter().filter(|(h, _)| *h != id).cloned().collect();
        *slot = Arc::from(next);
        true
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Fire-and-forget: spawn every handler and return how many were invoked.
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, target: HostId, payload: Bytes) -> usize {
        let handlers = self.snapshot();
        match handlers.as_ref() {
            [] => 0,
            [(_, only)] => {
                tokio::spawn(only(target, payload));
                1
            }
            many => {
                for (_, h) in many {
                    tokio::spawn(h(target, payload.clone()));
                }
                many.len()
            }
        }
    }

    /// Run every handler and wait for all of them to finish.
    pub async fn dispatch_and_wait(&self, target: HostId, payload: Bytes) -> usize {
        let handlers = self.snapshot();
        let futures: Vec<HandlerFuture> = handlers
            .iter()
            .map(|(_, h)| h(target, payload.clone()))
            .collect();
        let n = futures.len();
        futures::future::join_all(futures).await;
        n
    }
}

impl Default for CallbackDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(counter: Arc<AtomicUsize>) -> MessageHandler {
        handler(move |_, payload: Bytes| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(payload.len(), Ordering::SeqCst);
            }
        })
    }

    #[tokio::test]
    async fn no_handlers_dispatches_nothing() {
        let d = CallbackDispatcher::new();
        assert_eq!(d.dispatch(HostId::new_random(), Bytes::from_static(b"x")), 0);
        assert!(d.is_empty());
    }

    #[tokio::test]
    async fn wait_variant_runs_all_handlers() {
        let d = CallbackDispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        d.add(counting(counter.clone()));
        d.add(counting(counter.clone()));
        let n = d
            .dispatch_and_wait(HostId::new_random(), Bytes::from_static(b"abc"))
            .await;
        assert_eq!(n, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn handler_receives_target_and_payload() {
        let d = CallbackDispatcher::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        d.add(handler(move |id, payload| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((id, payload));
            }
        }));
        let target = HostId::new_random();
        assert_eq!(d.dispatch(target, Bytes::from_static(b"ping")), 1);
        let (id, payload) = rx.recv().await.unwrap();
        assert_eq!(id, target);
        assert_eq!(&payload[..], b"ping");
    }

    #[tokio::test]
    async fn removed_handler_not_called() {
        let d = CallbackDispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let a = d.add(counting(counter.clone()));
        assert!(d.remove(a));
        assert!(!d.remove(a));
        d.dispatch_and_wait(HostId::new_random(), Bytes::from_static(b"abc"))
            .await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn snapshot_survives_concurrent_removal() {
        let d = Arc::new(CallbackDispatcher::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let d2 = d.clone();
        let slot: Arc<std::sync::Mutex<Option<HandlerId>>> = Arc::default();
        let slot2 = slot.clone();
        let c2 = counter.clone();
        let id = d.add(handler(move |_, _| {
            let d2 = d2.clone();
            let slot2 = slot2.clone();
            let c2 = c2.clone();
            async move {
                if let Some(me) = *slot2.lock().unwrap() {
                    d2.remove(me);
                }
                c2.fetch_add(1, Ordering::SeqCst);
            }
        }));
        *slot.lock().unwrap() = Some(id);
        d.add(counting(counter.clone()));
        d.dispatch_and_wait(HostId::new_random(), Bytes::from_static(b"z"))
            .await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(d.len(), 1);
    }
}
