//! Publish/subscribe of named lifecycle events to registered listeners.
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identity of one registered listener, used for selective removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Mints the next id from a shared counter.
    ///
    /// Ids come from a counter owned by the client handle rather than the
    /// bus itself, so a handle can return the id synchronously while the
    /// registration travels to the owning task.
    pub(crate) fn next(counter: &Arc<AtomicU64>) -> Self {
        ListenerId(counter.fetch_add(1, Ordering::Relaxed))
    }
}

type Listeners<E> = Vec<(ListenerId, Arc<dyn Fn(&E) + Send + Sync>)>;

/// Minimal name-keyed event bus.
///
/// Listeners for a name fire in registration order. Emission dispatches over
/// a snapshot of the list, so listeners registered while an emission is in
/// progress do not fire in that emission.
pub(crate) struct EventBus<E> {
    listeners: HashMap<&'static str, Listeners<E>>,
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            listeners: HashMap::new(),
        }
    }

    /// Registers a listener under `event` with a caller-supplied identity.
    pub fn on(&mut self, event: &'static str, id: ListenerId, f: Arc<dyn Fn(&E) + Send + Sync>) {
        self.listeners.entry(event).or_default().push((id, f));
    }

    /// Fires every listener registered under `event`, in registration order.
    pub fn emit(&mut self, event: &'static str, payload: &E) {
        let snapshot: Listeners<E> = match self.listeners.get(event) {
            Some(listeners) => listeners.clone(),
            None => return,
        };
        for (_, listener) in snapshot {
            listener(payload);
        }
    }

    /// Removes one listener by identity. Returns whether it was present.
    pub fn remove(&mut self, event: &'static str, id: ListenerId) -> bool {
        match self.listeners.get_mut(event) {
            Some(listeners) => {
                let before = listeners.len();
                listeners.retain(|(lid, _)| *lid != id);
                before != listeners.len()
            }
            None => false,
        }
    }

    /// Removes every listener registered under `event`.
    pub fn remove_all(&mut self, event: &'static str) {
        self.listeners.remove(event);
    }
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<_, _> = self
            .listeners
            .iter()
            .map(|(name, listeners)| (*name, listeners.len()))
            .collect();
        f.debug_struct("EventBus").field("listeners", &counts).finish()
    }
}

/// Lifecycle and pub/sub events surfaced by the clients.
///
/// [`Event::name`] yields the stable string used for listener registration.
#[derive(Debug, Clone)]
pub enum Event {
    Connected,
    Reconnected,
    Disconnected,
    ReconnectFailed(u32),
    Failed,
    Message {
        channel: String,
        payload: Bytes,
    },
    PMessage {
        pattern: String,
        channel: String,
        payload: Bytes,
    },
    Subscribed {
        channel: String,
        count: u64,
    },
    Unsubscribed {
        channel: String,
        count: u64,
    },
    PSubscribed {
        pattern: String,
        count: u64,
    },
    PUnsubscribed {
        pattern: String,
        count: u64,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Connected => "connected",
            Event::Reconnected => "reconnected",
            Event::Disconnected => "disconnected",
            Event::ReconnectFailed(_) => "reconnect_failed",
            Event::Failed => "failed",
            Event::Message { .. } => "message",
            Event::PMessage { .. } => "pmessage",
            Event::Subscribed { .. } => "subscribe",
            Event::Unsubscribed { .. } => "unsubscribe",
            Event::PSubscribed { .. } => "psubscribe",
            Event::PUnsubscribed { .. } => "punsubscribe",
        }
    }
}
