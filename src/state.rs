//! Declarative state machine with permitted-transition checking.
use crate::events::{EventBus, ListenerId};
use crate::{Error, Result};
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// A state usable in a [`StateMachine`]: a small copyable value with a
/// stable name for event emission and diagnostics.
pub(crate) trait State: Copy + Eq + Hash + std::fmt::Debug {
    fn name(&self) -> &'static str;
}

/// A set of named states plus the declared set of permitted transitions.
///
/// `update` moves along a declared edge and emits an event named after the
/// entered state, carrying the previous state; moving along an undeclared
/// edge is a programmer error and fails.
#[derive(Debug)]
pub(crate) struct StateMachine<S: State> {
    current: S,
    edges: HashSet<(S, S)>,
    bus: EventBus<S>,
    listener_ids: Arc<AtomicU64>,
}

impl<S: State> StateMachine<S> {
    pub fn new(initial: S) -> Self {
        Self {
            current: initial,
            edges: HashSet::new(),
            bus: EventBus::new(),
            listener_ids: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Declares a permitted `from -> to` edge. Declaring the same edge twice
    /// is rejected.
    pub fn edge(mut self, from: S, to: S) -> Result<Self> {
        if !self.edges.insert((from, to)) {
            return Err(Error::DuplicateTransition {
                from: from.name(),
                to: to.name(),
            });
        }
        Ok(self)
    }

    pub fn current(&self) -> S {
        self.current
    }

    /// Registers a listener fired whenever `state` is entered, with the
    /// previous state as payload.
    pub fn on_enter(
        &mut self,
        state: S,
        f: impl Fn(&S) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId::next(&self.listener_ids);
        self.bus.on(state.name(), id, Arc::new(f));
        id
    }

    /// Moves to `to`, which must be reachable from the current state along a
    /// declared edge. Returns the previous state.
    pub fn update(&mut self, to: S) -> Result<S> {
        let from = self.current;
        if !self.edges.contains(&(from, to)) {
            return Err(Error::InvalidTransition {
                from: from.name(),
                to: to.name(),
            });
        }
        self.current = to;
        self.bus.emit(to.name(), &from);
        Ok(from)
    }
}
