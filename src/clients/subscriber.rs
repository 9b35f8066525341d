//! The pub/sub client persona.
use crate::endpoint::Endpoint;
use crate::events::{Event, EventBus, ListenerId};
use crate::frame::Frame;
use crate::pubsub::{PubSubConnection, PubSubEvent, SubCommand, PROBE_CHANNEL};
use crate::request::ProbeConfig;
use crate::supervisor::{Lifecycle, Retry, RetryPolicy, Supervisor};
use crate::ticket::Ticket;
use crate::{Error, Result};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

type EventFn = Arc<dyn Fn(&Event) + Send + Sync>;
type ChannelFn = Box<dyn Fn(Bytes) + Send>;
type PatternFn = Box<dyn Fn(&str, Bytes) + Send>;

/// Identity of one registered message callback, used for selective
/// unsubscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// A resilient pub/sub client for a Redis-compatible server.
///
/// The registry of channels, patterns and their callbacks is the ground
/// truth for what should be subscribed on the wire: it survives reconnection,
/// and every fresh connection resubscribes to each registered name before it
/// starts serving.
///
/// Message callbacks fire on the client's actor task; keep them short.
#[derive(Debug, Clone)]
pub struct PubSubClient {
    ops: mpsc::UnboundedSender<Op>,
    listener_ids: Arc<AtomicU64>,
    callback_ids: Arc<AtomicU64>,
}

enum Op {
    Connect {
        ticket: Ticket,
    },
    Reconnect {
        endpoint: Option<Endpoint>,
    },
    Subscribe {
        channel: String,
        id: CallbackId,
        callback: ChannelFn,
        ticket: Ticket,
    },
    PSubscribe {
        pattern: String,
        id: CallbackId,
        callback: PatternFn,
        ticket: Ticket,
    },
    Unsubscribe {
        channel: String,
        ticket: Ticket,
    },
    PUnsubscribe {
        pattern: String,
        ticket: Ticket,
    },
    RemoveCallback {
        channel: String,
        id: CallbackId,
        ticket: Ticket,
    },
    PRemoveCallback {
        pattern: String,
        id: CallbackId,
        ticket: Ticket,
    },
    Listen {
        event: &'static str,
        id: ListenerId,
        callback: EventFn,
    },
    Unlisten {
        event: &'static str,
        id: ListenerId,
    },
    UnlistenAll {
        event: &'static str,
    },
    State {
        reply: oneshot::Sender<Lifecycle>,
    },
}

impl PubSubClient {
    /// Creates a client for `endpoint` with the default retry policy. No
    /// connection is attempted until [`connect`](PubSubClient::connect).
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_policy(endpoint, RetryPolicy::default())
    }

    pub fn with_policy(endpoint: Endpoint, policy: RetryPolicy) -> Self {
        let (ops, rx) = mpsc::unbounded_channel();
        let actor = Actor::new(endpoint, policy, rx);
        tokio::spawn(async move {
            if let Err(err) = actor.run().await {
                error!(cause = %err, "pub/sub client stopped");
            }
        });
        Self {
            ops,
            listener_ids: Arc::new(AtomicU64::new(0)),
            callback_ids: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn from_uri(uri: &str) -> Result<Self> {
        Ok(Self::new(Endpoint::from_uri(uri)?))
    }

    /// Starts connecting; the ticket tracks first-successful-readiness.
    pub fn connect(&self) -> Ticket {
        let ticket = Ticket::new();
        self.submit(
            Op::Connect {
                ticket: ticket.clone(),
            },
            &ticket,
        );
        ticket
    }

    /// Forces a fresh connection, optionally against a new endpoint.
    pub fn reconnect(&self, endpoint: Option<Endpoint>) {
        let _ = self.ops.send(Op::Reconnect { endpoint });
    }

    /// Registers `f` for messages published on `channel`.
    ///
    /// If the channel is already registered the callback is appended with no
    /// wire traffic; otherwise a `subscribe` goes out and the ticket resolves
    /// with the server's subscription count once acknowledged.
    pub fn subscribe(
        &self,
        channel: &str,
        f: impl Fn(Bytes) + Send + 'static,
    ) -> (CallbackId, Ticket) {
        let id = self.next_callback_id();
        let ticket = Ticket::new();
        self.submit(
            Op::Subscribe {
                channel: channel.to_string(),
                id,
                callback: Box::new(f),
                ticket: ticket.clone(),
            },
            &ticket,
        );
        (id, ticket)
    }

    /// Registers `f` for messages delivered through `pattern`; the callback
    /// receives the concrete channel along with the payload.
    pub fn psubscribe(
        &self,
        pattern: &str,
        f: impl Fn(&str, Bytes) + Send + 'static,
    ) -> (CallbackId, Ticket) {
        let id = self.next_callback_id();
        let ticket = Ticket::new();
        self.submit(
            Op::PSubscribe {
                pattern: pattern.to_string(),
                id,
                callback: Box::new(f),
                ticket: ticket.clone(),
            },
            &ticket,
        );
        (id, ticket)
    }

    /// Drops every callback for `channel` and unsubscribes on the wire. When
    /// connected, the ticket resolves with the server's remaining-count.
    pub fn unsubscribe(&self, channel: &str) -> Ticket {
        let ticket = Ticket::new();
        self.submit(
            Op::Unsubscribe {
                channel: channel.to_string(),
                ticket: ticket.clone(),
            },
            &ticket,
        );
        ticket
    }

    pub fn punsubscribe(&self, pattern: &str) -> Ticket {
        let ticket = Ticket::new();
        self.submit(
            Op::PUnsubscribe {
                pattern: pattern.to_string(),
                ticket: ticket.clone(),
            },
            &ticket,
        );
        ticket
    }

    /// Removes a single callback by identity. Removing the last callback for
    /// a channel triggers the wire `unsubscribe`; removing an unknown
    /// callback fails the ticket.
    pub fn unsubscribe_callback(&self, channel: &str, id: CallbackId) -> Ticket {
        let ticket = Ticket::new();
        self.submit(
            Op::RemoveCallback {
                channel: channel.to_string(),
                id,
                ticket: ticket.clone(),
            },
            &ticket,
        );
        ticket
    }

    pub fn punsubscribe_callback(&self, pattern: &str, id: CallbackId) -> Ticket {
        let ticket = Ticket::new();
        self.submit(
            Op::PRemoveCallback {
                pattern: pattern.to_string(),
                id,
                ticket: ticket.clone(),
            },
            &ticket,
        );
        ticket
    }

    /// Registers a listener for a lifecycle or pub/sub event (`"message"`,
    /// `"pmessage"`, `"subscribe"`, `"unsubscribe"`, `"psubscribe"`,
    /// `"punsubscribe"`, plus the lifecycle names).
    pub fn on(&self, event: &'static str, f: impl Fn(&Event) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId::next(&self.listener_ids);
        let _ = self.ops.send(Op::Listen {
            event,
            id,
            callback: Arc::new(f),
        });
        id
    }

    pub fn off(&self, event: &'static str, id: ListenerId) {
        let _ = self.ops.send(Op::Unlisten { event, id });
    }

    pub fn remove_listeners(&self, event: &'static str) {
        let _ = self.ops.send(Op::UnlistenAll { event });
    }

    /// The current lifecycle state.
    pub async fn state(&self) -> Result<Lifecycle> {
        let (tx, rx) = oneshot::channel();
        self.ops
            .send(Op::State { reply: tx })
            .map_err(|_| Error::ConnectionLost)?;
        rx.await.map_err(|_| Error::ConnectionLost)
    }

    fn next_callback_id(&self) -> CallbackId {
        CallbackId(
            self.callback_ids
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        )
    }

    fn submit(&self, op: Op, ticket: &Ticket) {
        if self.ops.send(op).is_err() {
            ticket.fail(Error::ConnectionLost);
        }
    }
}

enum Flow {
    Continue,
    CloseConnection,
}

/// Outcome of removing one callback from a registry map.
enum Removal {
    NotFound,
    Remaining,
    Last,
}

fn remove_from<T>(
    map: &mut HashMap<String, Vec<(CallbackId, T)>>,
    name: &str,
    id: CallbackId,
) -> Removal {
    let Some(callbacks) = map.get_mut(name) else {
        return Removal::NotFound;
    };
    let before = callbacks.len();
    callbacks.retain(|(cid, _)| *cid != id);
    if callbacks.len() == before {
        return Removal::NotFound;
    }
    if callbacks.is_empty() {
        map.remove(name);
        Removal::Last
    } else {
        Removal::Remaining
    }
}

struct Actor {
    rx: mpsc::UnboundedReceiver<Op>,
    endpoint: Endpoint,
    supervisor: Supervisor,
    bus: EventBus<Event>,
    /// Ground truth: name -> callbacks currently subscribed (or wished).
    channels: HashMap<String, Vec<(CallbackId, ChannelFn)>>,
    patterns: HashMap<String, Vec<(CallbackId, PatternFn)>>,
    /// Callbacks whose `subscribe` is on the wire but not yet acknowledged.
    parked_channels: HashMap<String, Vec<(CallbackId, ChannelFn)>>,
    parked_patterns: HashMap<String, Vec<(CallbackId, PatternFn)>>,
    /// Subscription ops deferred while a connection is being chased.
    pending: VecDeque<Op>,
    /// `connect()` tickets awaiting first readiness.
    ready: Vec<Ticket>,
    next_delay: Duration,
}

impl Actor {
    fn new(endpoint: Endpoint, policy: RetryPolicy, rx: mpsc::UnboundedReceiver<Op>) -> Self {
        Self {
            rx,
            endpoint,
            supervisor: Supervisor::new(policy),
            bus: EventBus::new(),
            channels: HashMap::new(),
            patterns: HashMap::new(),
            parked_channels: HashMap::new(),
            parked_patterns: HashMap::new(),
            pending: VecDeque::new(),
            ready: Vec::new(),
            next_delay: Duration::ZERO,
        }
    }

    async fn run(mut self) -> Result<()> {
        let mut conn = None;
        let result = self.drive(&mut conn).await;
        self.shutdown(conn.take());
        result
    }

    async fn drive(&mut self, conn: &mut Option<PubSubConnection<TcpStream>>) -> Result<()> {
        loop {
            match self.supervisor.state() {
                Lifecycle::Initial | Lifecycle::Failed => match self.rx.recv().await {
                    Some(op) => self.offline_op(op)?,
                    None => return Ok(()),
                },

                Lifecycle::Connecting => {
                    // What the factory must restore: every registered name.
                    let resubscribe: Vec<(SubCommand, String)> = self
                        .channels
                        .keys()
                        .map(|name| (SubCommand::Subscribe, name.clone()))
                        .chain(
                            self.patterns
                                .keys()
                                .map(|name| (SubCommand::PSubscribe, name.clone())),
                        )
                        .collect();
                    let attempt = connect_endpoint(self.endpoint.clone(), resubscribe);
                    tokio::pin!(attempt);
                    loop {
                        tokio::select! {
                            res = &mut attempt => {
                                *conn = self.attempt_done(res).await?;
                                break;
                            }
                            op = self.rx.recv() => match op {
                                None => return Ok(()),
                                Some(Op::Reconnect { endpoint }) => {
                                    if let Some(endpoint) = endpoint {
                                        self.endpoint = endpoint;
                                    }
                                    debug!("reconnect requested, restarting attempt");
                                    break;
                                }
                                Some(op) => self.waiting_op(op),
                            }
                        }
                    }
                }

                Lifecycle::Connected => {
                    let mut active = match conn.take() {
                        Some(active) => active,
                        None => return Err(Error::ConnectionLost),
                    };
                    loop {
                        tokio::select! {
                            event = active.next_event() => match event {
                                PubSubEvent::Ack { kind, name, count } => {
                                    self.on_ack(kind, name, count);
                                }
                                PubSubEvent::Message { channel, payload } => {
                                    self.on_message(channel, payload);
                                }
                                PubSubEvent::PMessage { pattern, channel, payload } => {
                                    self.on_pmessage(pattern, channel, payload);
                                }
                                PubSubEvent::Closed { error } => {
                                    if let Some(err) = error {
                                        warn!(cause = %err, "connection lost");
                                    }
                                    self.connection_lost(&mut active)?;
                                    break;
                                }
                                PubSubEvent::TimedOut => {
                                    warn!("connection timed out");
                                    self.connection_lost(&mut active)?;
                                    break;
                                }
                            },
                            op = self.rx.recv() => match op {
                                None => {
                                    *conn = Some(active);
                                    return Ok(());
                                }
                                Some(op) => match self.connected_op(op, &mut active).await? {
                                    Flow::Continue => {}
                                    Flow::CloseConnection => {
                                        self.connection_lost(&mut active)?;
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }

                Lifecycle::Disconnected => {
                    let delay = std::mem::replace(&mut self.next_delay, Duration::ZERO);
                    let timer = tokio::time::sleep(delay);
                    tokio::pin!(timer);
                    loop {
                        tokio::select! {
                            _ = &mut timer => {
                                self.supervisor.start_connecting()?;
                                break;
                            }
                            op = self.rx.recv() => match op {
                                None => return Ok(()),
                                Some(Op::Reconnect { endpoint }) => {
                                    if let Some(endpoint) = endpoint {
                                        self.endpoint = endpoint;
                                    }
                                    self.supervisor.start_connecting()?;
                                    break;
                                }
                                Some(op) => self.waiting_op(op),
                            }
                        }
                    }
                }
            }
        }
    }

    async fn attempt_done(
        &mut self,
        res: Result<PubSubConnection<TcpStream>>,
    ) -> Result<Option<PubSubConnection<TcpStream>>> {
        match res {
            Ok(mut active) => {
                let was_retry = self.supervisor.connected()?;
                self.emit(Event::Connected);
                if was_retry {
                    self.emit(Event::Reconnected);
                }
                for ticket in self.ready.drain(..) {
                    ticket.resolve(Frame::Simple("OK".to_string()));
                }
                // replay the subscription ops deferred during the chase
                while let Some(op) = self.pending.pop_front() {
                    match self.connected_op(op, &mut active).await? {
                        Flow::Continue => {}
                        Flow::CloseConnection => {
                            self.connection_lost(&mut active)?;
                            return Ok(None);
                        }
                    }
                }
                Ok(Some(active))
            }
            Err(err) => {
                warn!(cause = %err, "connection attempt failed");
                match self.supervisor.attempt_failed()? {
                    Retry::Delayed { attempt, delay } => {
                        self.emit(Event::ReconnectFailed(attempt));
                        self.next_delay = delay;
                    }
                    Retry::GiveUp { attempt } => {
                        self.emit(Event::ReconnectFailed(attempt));
                        self.enter_failed()?;
                    }
                    Retry::Immediate => unreachable!("a failed attempt is never immediate"),
                }
                Ok(None)
            }
        }
    }

    /// Tears down a live connection. Unacknowledged callbacks migrate into
    /// the registry so the next connection restores their subscriptions.
    fn connection_lost(&mut self, active: &mut PubSubConnection<TcpStream>) -> Result<()> {
        active.fail_in_flight(Error::ConnectionLost);
        for (name, callbacks) in self.parked_channels.drain() {
            self.channels.entry(name).or_default().extend(callbacks);
        }
        for (name, callbacks) in self.parked_patterns.drain() {
            self.patterns.entry(name).or_default().extend(callbacks);
        }
        self.supervisor.connection_lost()?;
        self.emit(Event::Disconnected);
        self.next_delay = Duration::ZERO;
        Ok(())
    }

    fn enter_failed(&mut self) -> Result<()> {
        self.emit(Event::Failed);
        for ticket in self.ready.drain(..) {
            ticket.fail(Error::FailedState);
        }
        // deferred subscription ops fall back to registry-only handling
        let pending: Vec<Op> = self.pending.drain(..).collect();
        for op in pending {
            self.offline_op(op)?;
        }
        Ok(())
    }

    async fn connected_op(
        &mut self,
        op: Op,
        active: &mut PubSubConnection<TcpStream>,
    ) -> Result<Flow> {
        match op {
            Op::Connect { ticket } => ticket.resolve(Frame::Simple("OK".to_string())),
            Op::Reconnect { endpoint } => {
                if let Some(endpoint) = endpoint {
                    self.endpoint = endpoint;
                }
                debug!("reconnect requested, closing the current connection");
                return Ok(Flow::CloseConnection);
            }
            Op::Subscribe {
                channel,
                id,
                callback,
                ticket,
            } => {
                if let Some(callbacks) = self.channels.get_mut(&channel) {
                    callbacks.push((id, callback));
                    ticket.resolve(Frame::NullBulk);
                } else if let Some(parked) = self.parked_channels.get_mut(&channel) {
                    // a subscribe for this channel is already on the wire
                    parked.push((id, callback));
                    ticket.resolve(Frame::NullBulk);
                } else {
                    self.parked_channels
                        .insert(channel.clone(), vec![(id, callback)]);
                    if active
                        .send(ticket, SubCommand::Subscribe, &channel)
                        .await
                        .is_err()
                    {
                        return Ok(Flow::CloseConnection);
                    }
                }
            }
            Op::PSubscribe {
                pattern,
                id,
                callback,
                ticket,
            } => {
                if let Some(callbacks) = self.patterns.get_mut(&pattern) {
                    callbacks.push((id, callback));
                    ticket.resolve(Frame::NullBulk);
                } else if let Some(parked) = self.parked_patterns.get_mut(&pattern) {
                    parked.push((id, callback));
                    ticket.resolve(Frame::NullBulk);
                } else {
                    self.parked_patterns
                        .insert(pattern.clone(), vec![(id, callback)]);
                    if active
                        .send(ticket, SubCommand::PSubscribe, &pattern)
                        .await
                        .is_err()
                    {
                        return Ok(Flow::CloseConnection);
                    }
                }
            }
            Op::Unsubscribe { channel, ticket } => {
                // the server acks an unsubscribe whether or not anything
                // was subscribed
                self.channels.remove(&channel);
                self.parked_channels.remove(&channel);
                if active
                    .send(ticket, SubCommand::Unsubscribe, &channel)
                    .await
                    .is_err()
                {
                    return Ok(Flow::CloseConnection);
                }
            }
            Op::PUnsubscribe { pattern, ticket } => {
                self.patterns.remove(&pattern);
                self.parked_patterns.remove(&pattern);
                if active
                    .send(ticket, SubCommand::PUnsubscribe, &pattern)
                    .await
                    .is_err()
                {
                    return Ok(Flow::CloseConnection);
                }
            }
            Op::RemoveCallback {
                channel,
                id,
                ticket,
            } => {
                let removal = match remove_from(&mut self.channels, &channel, id) {
                    Removal::NotFound => remove_from(&mut self.parked_channels, &channel, id),
                    removal => removal,
                };
                match removal {
                    Removal::NotFound => ticket.fail(unknown_callback(&channel)),
                    Removal::Remaining => ticket.resolve(Frame::NullBulk),
                    Removal::Last => {
                        if active
                            .send(ticket, SubCommand::Unsubscribe, &channel)
                            .await
                            .is_err()
                        {
                            return Ok(Flow::CloseConnection);
                        }
                    }
                }
            }
            Op::PRemoveCallback {
                pattern,
                id,
                ticket,
            } => {
                let removal = match remove_from(&mut self.patterns, &pattern, id) {
                    Removal::NotFound => remove_from(&mut self.parked_patterns, &pattern, id),
                    removal => removal,
                };
                match removal {
                    Removal::NotFound => ticket.fail(unknown_callback(&pattern)),
                    Removal::Remaining => ticket.resolve(Frame::NullBulk),
                    Removal::Last => {
                        if active
                            .send(ticket, SubCommand::PUnsubscribe, &pattern)
                            .await
                            .is_err()
                        {
                            return Ok(Flow::CloseConnection);
                        }
                    }
                }
            }
            op => self.common_op(op),
        }
        Ok(Flow::Continue)
    }

    /// Ops arriving while a connection is being chased: subscription changes
    /// are deferred and replayed once the connection is up.
    fn waiting_op(&mut self, op: Op) {
        match op {
            Op::Connect { ticket } => self.ready.push(ticket),
            Op::Reconnect { endpoint } => {
                if let Some(endpoint) = endpoint {
                    self.endpoint = endpoint;
                }
            }
            op @ (Op::Subscribe { .. }
            | Op::PSubscribe { .. }
            | Op::Unsubscribe { .. }
            | Op::PUnsubscribe { .. }
            | Op::RemoveCallback { .. }
            | Op::PRemoveCallback { .. }) => self.pending.push_back(op),
            op => self.common_op(op),
        }
    }

    /// Ops arriving while Initial or Failed: pure registry mutations, no
    /// wire traffic; the next connection restores the registry wholesale.
    fn offline_op(&mut self, op: Op) -> Result<()> {
        match op {
            Op::Connect { ticket } => {
                self.ready.push(ticket);
                self.supervisor.start_connecting()?;
            }
            Op::Reconnect { endpoint } => {
                if let Some(endpoint) = endpoint {
                    self.endpoint = endpoint;
                }
                self.supervisor.start_connecting()?;
            }
            Op::Subscribe {
                channel,
                id,
                callback,
                ticket,
            } => {
                self.channels.entry(channel).or_default().push((id, callback));
                ticket.resolve(Frame::NullBulk);
            }
            Op::PSubscribe {
                pattern,
                id,
                callback,
                ticket,
            } => {
                self.patterns.entry(pattern).or_default().push((id, callback));
                ticket.resolve(Frame::NullBulk);
            }
            Op::Unsubscribe { channel, ticket } => {
                self.channels.remove(&channel);
                ticket.resolve(Frame::NullBulk);
            }
            Op::PUnsubscribe { pattern, ticket } => {
                self.patterns.remove(&pattern);
                ticket.resolve(Frame::NullBulk);
            }
            Op::RemoveCallback {
                channel,
                id,
                ticket,
            } => match remove_from(&mut self.channels, &channel, id) {
                Removal::NotFound => ticket.fail(unknown_callback(&channel)),
                _ => ticket.resolve(Frame::NullBulk),
            },
            Op::PRemoveCallback {
                pattern,
                id,
                ticket,
            } => match remove_from(&mut self.patterns, &pattern, id) {
                Removal::NotFound => ticket.fail(unknown_callback(&pattern)),
                _ => ticket.resolve(Frame::NullBulk),
            },
            op => self.common_op(op),
        }
        Ok(())
    }

    fn common_op(&mut self, op: Op) {
        match op {
            Op::Listen {
                event,
                id,
                callback,
            } => self.bus.on(event, id, callback),
            Op::Unlisten { event, id } => {
                self.bus.remove(event, id);
            }
            Op::UnlistenAll { event } => self.bus.remove_all(event),
            Op::State { reply } => {
                let _ = reply.send(self.supervisor.state());
            }
            // every stateful op is handled before reaching here
            _ => unreachable!("stateful op routed to common_op"),
        }
    }

    fn on_ack(&mut self, kind: SubCommand, name: String, count: u64) {
        // probe traffic is internal to the connection
        if name == PROBE_CHANNEL {
            return;
        }
        match kind {
            SubCommand::Subscribe => {
                if let Some(parked) = self.parked_channels.remove(&name) {
                    self.channels.entry(name.clone()).or_default().extend(parked);
                }
                self.emit(Event::Subscribed {
                    channel: name,
                    count,
                });
            }
            SubCommand::Unsubscribe => self.emit(Event::Unsubscribed {
                channel: name,
                count,
            }),
            SubCommand::PSubscribe => {
                if let Some(parked) = self.parked_patterns.remove(&name) {
                    self.patterns.entry(name.clone()).or_default().extend(parked);
                }
                self.emit(Event::PSubscribed {
                    pattern: name,
                    count,
                });
            }
            SubCommand::PUnsubscribe => self.emit(Event::PUnsubscribed {
                pattern: name,
                count,
            }),
        }
    }

    fn on_message(&mut self, channel: String, payload: Bytes) {
        self.emit(Event::Message {
            channel: channel.clone(),
            payload: payload.clone(),
        });
        if let Some(callbacks) = self.channels.get(&channel) {
            for (_, callback) in callbacks {
                callback(payload.clone());
            }
        }
    }

    fn on_pmessage(&mut self, pattern: String, channel: String, payload: Bytes) {
        self.emit(Event::PMessage {
            pattern: pattern.clone(),
            channel: channel.clone(),
            payload: payload.clone(),
        });
        if let Some(callbacks) = self.patterns.get(&pattern) {
            for (_, callback) in callbacks {
                callback(&channel, payload.clone());
            }
        }
    }

    fn emit(&mut self, event: Event) {
        self.bus.emit(event.name(), &event);
    }

    fn shutdown(&mut self, conn: Option<PubSubConnection<TcpStream>>) {
        if let Some(mut active) = conn {
            active.fail_in_flight(Error::ConnectionLost);
        }
        for op in self.pending.drain(..) {
            match op {
                Op::Subscribe { ticket, .. }
                | Op::PSubscribe { ticket, .. }
                | Op::Unsubscribe { ticket, .. }
                | Op::PUnsubscribe { ticket, .. }
                | Op::RemoveCallback { ticket, .. }
                | Op::PRemoveCallback { ticket, .. } => ticket.fail(Error::ConnectionLost),
                _ => {}
            }
        }
        for ticket in self.ready.drain(..) {
            ticket.fail(Error::ConnectionLost);
        }
    }
}

fn unknown_callback(name: &str) -> Error {
    Error::InvalidArgument(format!("no callback registered under `{name}`"))
}

/// Opens and prepares one pub/sub connection: TCP, `auth` if a password is
/// cached, then one subscribe per registered name before anything else may
/// use the connection.
async fn connect_endpoint(
    endpoint: Endpoint,
    resubscribe: Vec<(SubCommand, String)>,
) -> Result<PubSubConnection<TcpStream>> {
    debug!(addr = %endpoint.addr(), "connecting");
    let stream = TcpStream::connect(endpoint.addr())
        .await
        .map_err(|err| Error::ConnectFailed(err.to_string()))?;
    let probe = endpoint
        .inactivity()
        .map(|(trigger, response)| ProbeConfig { trigger, response });
    let mut conn = PubSubConnection::new(stream, probe);

    if let Some(password) = endpoint.password() {
        conn.authenticate(password).await?;
    }
    for (kind, name) in resubscribe {
        conn.send(Ticket::new(), kind, &name)
            .await
            .map_err(|err| Error::ConnectFailed(err.to_string()))?;
    }
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::testing::TestServer;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::timeout;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            reconnect_delay: Duration::from_millis(10),
        }
    }

    async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
        timeout(Duration::from_secs(5), fut).await.expect("test timed out")
    }

    async fn connected_client(server: &TestServer) -> (PubSubClient, crate::clients::testing::Peer) {
        let client = PubSubClient::with_policy(server.endpoint(), fast_policy());
        let ready = client.connect();
        let peer = server.accept().await;
        within(ready).await.unwrap();
        (client, peer)
    }

    #[tokio::test]
    async fn test_subscribe_and_receive_messages() {
        let server = TestServer::bind().await;
        let (client, mut peer) = connected_client(&server).await;

        let (tx, mut rx) = unbounded_channel();
        let (_, ticket) = client.subscribe("news", move |payload| {
            let _ = tx.send(payload);
        });
        assert_eq!(within(peer.expect_command()).await, vec!["subscribe", "news"]);
        peer.reply(b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n").await;
        assert_eq!(within(ticket).await.unwrap(), Frame::Integer(1));

        peer.reply(b"*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$5\r\nhello\r\n")
            .await;
        assert_eq!(within(rx.recv()).await.unwrap(), Bytes::from("hello"));
    }

    #[tokio::test]
    async fn test_second_subscriber_stays_off_the_wire() {
        let server = TestServer::bind().await;
        let (client, mut peer) = connected_client(&server).await;

        let (_, first) = client.subscribe("news", |_| {});
        assert_eq!(within(peer.expect_command()).await, vec!["subscribe", "news"]);
        peer.reply(b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n").await;
        within(first).await.unwrap();

        let (tx, mut rx) = unbounded_channel();
        let (_, second) = client.subscribe("news", move |payload| {
            let _ = tx.send(payload);
        });
        // resolves immediately, nothing on the wire
        assert_eq!(within(second).await.unwrap(), Frame::NullBulk);

        peer.reply(b"*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$2\r\nhi\r\n")
            .await;
        assert_eq!(within(rx.recv()).await.unwrap(), Bytes::from("hi"));
    }

    #[tokio::test]
    async fn test_selective_unsubscription() {
        let server = TestServer::bind().await;
        let (client, mut peer) = connected_client(&server).await;
        let (tx, mut rx) = unbounded_channel();

        // sentinel channel proves later that `c` fires nothing
        let sentinel_tx = tx.clone();
        let (_, sentinel) = client.subscribe("z", move |payload| {
            let _ = sentinel_tx.send(("z", payload));
        });
        assert_eq!(within(peer.expect_command()).await, vec!["subscribe", "z"]);
        peer.reply(b"*3\r\n$9\r\nsubscribe\r\n$1\r\nz\r\n:1\r\n").await;
        within(sentinel).await.unwrap();

        let a_tx = tx.clone();
        let (id_a, first) = client.subscribe("c", move |payload| {
            let _ = a_tx.send(("a", payload));
        });
        assert_eq!(within(peer.expect_command()).await, vec!["subscribe", "c"]);
        peer.reply(b"*3\r\n$9\r\nsubscribe\r\n$1\r\nc\r\n:2\r\n").await;
        assert_eq!(within(first).await.unwrap(), Frame::Integer(2));

        let b_tx = tx.clone();
        let (id_b, second) = client.subscribe("c", move |payload| {
            let _ = b_tx.send(("b", payload));
        });
        within(second).await.unwrap();

        // removing A keeps the subscription alive; only B fires
        within(client.unsubscribe_callback("c", id_a)).await.unwrap();
        peer.reply(b"*3\r\n$7\r\nmessage\r\n$1\r\nc\r\n$2\r\nhi\r\n").await;
        assert_eq!(within(rx.recv()).await.unwrap(), ("b", Bytes::from("hi")));

        // removing B, the last callback, unsubscribes on the wire
        let last = client.unsubscribe_callback("c", id_b);
        assert_eq!(within(peer.expect_command()).await, vec!["unsubscribe", "c"]);
        peer.reply(b"*3\r\n$11\r\nunsubscribe\r\n$1\r\nc\r\n:1\r\n").await;
        assert_eq!(within(last).await.unwrap(), Frame::Integer(1));

        // a stray publish on `c` reaches nobody; the sentinel proves order
        peer.reply(b"*3\r\n$7\r\nmessage\r\n$1\r\nc\r\n$4\r\nlost\r\n")
            .await;
        peer.reply(b"*3\r\n$7\r\nmessage\r\n$1\r\nz\r\n$4\r\nlast\r\n")
            .await;
        assert_eq!(within(rx.recv()).await.unwrap(), ("z", Bytes::from("last")));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_removing_an_unknown_callback_fails() {
        let server = TestServer::bind().await;
        let (client, mut peer) = connected_client(&server).await;

        let (id, ticket) = client.subscribe("c", |_| {});
        assert_eq!(within(peer.expect_command()).await, vec!["subscribe", "c"]);
        peer.reply(b"*3\r\n$9\r\nsubscribe\r\n$1\r\nc\r\n:1\r\n").await;
        within(ticket).await.unwrap();

        assert!(matches!(
            within(client.unsubscribe_callback("nope", id)).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_resubscription_after_socket_loss() {
        let server = TestServer::bind().await;
        let (client, mut peer) = connected_client(&server).await;
        let (tx, mut rx) = unbounded_channel();

        for name in ["c1", "c2"] {
            let tx = tx.clone();
            let owned = name.to_string();
            let (_, ticket) = client.subscribe(name, move |payload| {
                let _ = tx.send((owned.clone(), payload));
            });
            assert_eq!(
                within(peer.expect_command()).await,
                vec!["subscribe".to_string(), name.to_string()]
            );
            peer.reply(
                format!("*3\r\n$9\r\nsubscribe\r\n$2\r\n{name}\r\n:1\r\n").as_bytes(),
            )
            .await;
            within(ticket).await.unwrap();
        }

        drop(peer);

        // the fresh connection resubscribes to every registered name
        let mut peer = server.accept().await;
        let mut seen = vec![
            within(peer.expect_command()).await,
            within(peer.expect_command()).await,
        ];
        seen.sort();
        assert_eq!(
            seen,
            vec![
                vec!["subscribe".to_string(), "c1".to_string()],
                vec!["subscribe".to_string(), "c2".to_string()],
            ]
        );
        peer.reply(b"*3\r\n$9\r\nsubscribe\r\n$2\r\nc1\r\n:1\r\n").await;
        peer.reply(b"*3\r\n$9\r\nsubscribe\r\n$2\r\nc2\r\n:2\r\n").await;

        // callbacks survived the reconnect
        peer.reply(b"*3\r\n$7\r\nmessage\r\n$2\r\nc1\r\n$3\r\none\r\n")
            .await;
        peer.reply(b"*3\r\n$7\r\nmessage\r\n$2\r\nc2\r\n$3\r\ntwo\r\n")
            .await;
        assert_eq!(
            within(rx.recv()).await.unwrap(),
            ("c1".to_string(), Bytes::from("one"))
        );
        assert_eq!(
            within(rx.recv()).await.unwrap(),
            ("c2".to_string(), Bytes::from("two"))
        );
    }

    #[tokio::test]
    async fn test_subscriptions_made_offline_reach_the_wire_on_connect() {
        let server = TestServer::bind().await;
        let client = PubSubClient::with_policy(server.endpoint(), fast_policy());

        let (tx, mut rx) = unbounded_channel();
        let (_, ticket) = client.subscribe("early", move |payload| {
            let _ = tx.send(payload);
        });
        // registry-only for now
        assert_eq!(within(ticket).await.unwrap(), Frame::NullBulk);

        client.connect();
        let mut peer = server.accept().await;
        assert_eq!(
            within(peer.expect_command()).await,
            vec!["subscribe", "early"]
        );
        peer.reply(b"*3\r\n$9\r\nsubscribe\r\n$5\r\nearly\r\n:1\r\n").await;

        peer.reply(b"*3\r\n$7\r\nmessage\r\n$5\r\nearly\r\n$2\r\nok\r\n")
            .await;
        assert_eq!(within(rx.recv()).await.unwrap(), Bytes::from("ok"));
    }

    #[tokio::test]
    async fn test_pattern_subscription_delivers_channel_and_payload() {
        let server = TestServer::bind().await;
        let (client, mut peer) = connected_client(&server).await;

        let (tx, mut rx) = unbounded_channel();
        let (_, ticket) = client.psubscribe("news.*", move |channel, payload| {
            let _ = tx.send((channel.to_string(), payload));
        });
        assert_eq!(
            within(peer.expect_command()).await,
            vec!["psubscribe", "news.*"]
        );
        peer.reply(b"*3\r\n$10\r\npsubscribe\r\n$6\r\nnews.*\r\n:1\r\n")
            .await;
        assert_eq!(within(ticket).await.unwrap(), Frame::Integer(1));

        peer.reply(b"*4\r\n$8\r\npmessage\r\n$6\r\nnews.*\r\n$7\r\nnews.uk\r\n$5\r\nhello\r\n")
            .await;
        assert_eq!(
            within(rx.recv()).await.unwrap(),
            ("news.uk".to_string(), Bytes::from("hello"))
        );
    }

    #[tokio::test]
    async fn test_subscription_events_carry_counts() {
        let server = TestServer::bind().await;
        let (client, mut peer) = connected_client(&server).await;

        let (tx, mut rx) = unbounded_channel();
        client.on("subscribe", move |event| {
            if let Event::Subscribed { channel, count } = event {
                let _ = tx.send((channel.clone(), *count));
            }
        });

        let (_, ticket) = client.subscribe("news", |_| {});
        assert_eq!(within(peer.expect_command()).await, vec!["subscribe", "news"]);
        peer.reply(b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:7\r\n").await;
        within(ticket).await.unwrap();

        assert_eq!(
            within(rx.recv()).await.unwrap(),
            ("news".to_string(), 7)
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_all_resolves_with_remaining_count() {
        let server = TestServer::bind().await;
        let (client, mut peer) = connected_client(&server).await;

        let (_, ticket) = client.subscribe("a", |_| {});
        assert_eq!(within(peer.expect_command()).await, vec!["subscribe", "a"]);
        peer.reply(b"*3\r\n$9\r\nsubscribe\r\n$1\r\na\r\n:1\r\n").await;
        within(ticket).await.unwrap();

        let gone = client.unsubscribe("a");
        assert_eq!(within(peer.expect_command()).await, vec!["unsubscribe", "a"]);
        peer.reply(b"*3\r\n$11\r\nunsubscribe\r\n$1\r\na\r\n:0\r\n").await;
        assert_eq!(within(gone).await.unwrap(), Frame::Integer(0));

        // unsubscribing a channel nothing is subscribed to still goes on
        // the wire and resolves from the server's ack
        let ghost = client.unsubscribe("ghost");
        assert_eq!(
            within(peer.expect_command()).await,
            vec!["unsubscribe", "ghost"]
        );
        peer.reply(b"*3\r\n$11\r\nunsubscribe\r\n$5\r\nghost\r\n:0\r\n")
            .await;
        assert_eq!(within(ghost).await.unwrap(), Frame::Integer(0));
    }
}
