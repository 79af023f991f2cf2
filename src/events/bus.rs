// SPDX-License-Identifier: MPL-2.0

use crate::backend::{Backend, ChangeMessage, ChangeSink, SubscriptionHandle, SubscriptionSpec};
use crate::events::{ChangeEvent, SubscriptionError};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

type Handler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct BusInner {
    next_handle: u64,
    next_handler: u64,
    active: BTreeMap<SubscriptionHandle, SubscriptionSpec>,
    handlers: Vec<(HandlerId, Handler)>,
}

/// Fans the backend's change streams into one ordered queue of
/// normalized events.
///
/// Events are dispatched exactly once, in the order the transport
/// delivered them, with no buffering beyond the queue itself. Events that
/// arrive for a handle that has been torn down are dropped.
pub struct ChangeEventBus {
    backend: Arc<dyn Backend>,
    tx: UnboundedSender<ChangeMessage>,
    rx: tokio::sync::Mutex<UnboundedReceiver<ChangeMessage>>,
    inner: Mutex<BusInner>,
}

impl ChangeEventBus {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            backend,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            inner: Mutex::new(BusInner {
                next_handle: 1,
                ..BusInner::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe to changes matching `spec`.
    ///
    /// While an identical subscription is live its handle is returned
    /// instead of opening a second one, so callers cannot double-deliver.
    pub fn subscribe(&self, spec: SubscriptionSpec) -> Result<SubscriptionHandle, SubscriptionError> {
        let mut inner = self.lock();
        if let Some((handle, _)) = inner.active.iter().find(|(_, live)| **live == spec) {
            return Ok(*handle);
        }

        let handle = SubscriptionHandle(inner.next_handle);
        inner.next_handle += 1;
        self.backend
            .subscribe_changes(&spec, ChangeSink::new(handle, self.tx.clone()))?;

        debug!(%handle, table = %spec.table, filter = ?spec.filter.as_ref().map(ToString::to_string), "subscribed");
        inner.active.insert(handle, spec);
        Ok(handle)
    }

    /// Register a callback run for every dispatched event.
    pub fn on_event(&self, handler: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> HandlerId {
        let mut inner = self.lock();
        let id = HandlerId(inner.next_handler);
        inner.next_handler += 1;
        inner.handlers.push((id, Arc::new(handler)));
        id
    }

    pub fn remove_handler(&self, id: HandlerId) {
        self.lock().handlers.retain(|(h, _)| *h != id);
    }

    pub fn unsubscribe_all(&self, handles: &[SubscriptionHandle]) {
        let mut inner = self.lock();
        for handle in handles {
            if inner.active.remove(handle).is_some() {
                self.backend.unsubscribe(*handle);
                debug!(%handle, "unsubscribed");
            }
        }
    }

    /// Tear down every live subscription and return what they watched.
    pub fn teardown(&self) -> Vec<SubscriptionSpec> {
        let mut inner = self.lock();
        let active = std::mem::take(&mut inner.active);
        active
            .into_iter()
            .map(|(handle, spec)| {
                self.backend.unsubscribe(handle);
                spec
            })
            .collect()
    }

    pub fn active_handles(&self) -> Vec<SubscriptionHandle> {
        self.lock().active.keys().copied().collect()
    }

    pub fn is_active(&self, handle: SubscriptionHandle) -> bool {
        self.lock().active.contains_key(&handle)
    }

    /// Wait for the next event and dispatch it to the registered handlers.
    pub async fn next_event(&self) -> Result<ChangeEvent, SubscriptionError> {
        let mut rx = self.rx.lock().await;
        loop {
            let message = rx.recv().await.ok_or(SubscriptionError::Closed)?;
            if let Some(result) = self.accept(message) {
                return result;
            }
        }
    }

    /// Like [`next_event`](Self::next_event) but returns `None` when
    /// nothing is queued.
    pub fn try_next_event(&self) -> Option<Result<ChangeEvent, SubscriptionError>> {
        let mut rx = self.rx.try_lock().ok()?;
        loop {
            let message = rx.try_recv().ok()?;
            if let Some(result) = self.accept(message) {
                return Some(result);
            }
        }
    }

    fn accept(&self, message: ChangeMessage) -> Option<Result<ChangeEvent, SubscriptionError>> {
        match message {
            ChangeMessage::Change { handle, payload } => {
                let Some(spec) = self.lock().active.get(&handle).cloned() else {
                    debug!(%handle, "dropping event for torn-down subscription");
                    return None;
                };
                match ChangeEvent::normalize(&payload, spec.table, handle) {
                    Ok(event) if event.table == spec.table && spec.accepts(event.kind) => {
                        self.dispatch(&event);
                        Some(Ok(event))
                    }
                    Ok(event) => {
                        debug!(%handle, kind = event.kind.as_str(), table = %event.table, "event outside subscription");
                        None
                    }
                    Err(e) => {
                        warn!(%handle, error = %e, "skipping malformed change payload");
                        None
                    }
                }
            }
            ChangeMessage::Disconnected { handle, reason } => {
                let spec = self.lock().active.get(&handle).cloned()?;
                warn!(%handle, table = %spec.table, %reason, "subscription disconnected");
                Some(Err(SubscriptionError::Disconnected {
                    handle,
                    table: spec.table,
                    reason,
                }))
            }
        }
    }

    fn dispatch(&self, event: &ChangeEvent) {
        let handlers: Vec<Handler> = self.lock().handlers.iter().map(|(_, h)| h.clone()).collect();
        for handler in handlers {
            handler(event);
        }
    }
}
