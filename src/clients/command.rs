//! The request/response client persona.
use crate::endpoint::Endpoint;
use crate::events::{Event, EventBus, ListenerId};
use crate::frame::{Command, Frame};
use crate::request::{ConnEvent, ProbeConfig, RequestConnection};
use crate::supervisor::{Lifecycle, Retry, RetryPolicy, Supervisor};
use crate::ticket::Ticket;
use crate::{Error, Result};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

type EventFn = Arc<dyn Fn(&Event) + Send + Sync>;

/// A resilient request/response client for a Redis-compatible server.
///
/// The handle is cheap to clone; all state lives in an actor task owned by
/// the client. Every operation returns immediately, handing back a
/// [`Ticket`] that settles when the server replies.
///
/// Commands issued while the connection is down are queued and flushed, in
/// issue order, once a connection is up; after the retry budget is exhausted
/// they fail instead, until [`reconnect`](CommandClient::reconnect) is
/// called.
#[derive(Debug, Clone)]
pub struct CommandClient {
    ops: mpsc::UnboundedSender<Op>,
    listener_ids: Arc<AtomicU64>,
}

enum Op {
    Dispatch {
        command: Command,
        ticket: Ticket,
    },
    Connect {
        ticket: Ticket,
    },
    Reconnect {
        endpoint: Option<Endpoint>,
    },
    Select {
        db: u32,
        ticket: Ticket,
    },
    Auth {
        password: String,
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

impl CommandClient {
    /// Creates a client for `endpoint` with the default retry policy. No
    /// connection is attempted until [`connect`](CommandClient::connect).
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
                error!(cause = %err, "command client stopped");
            }
        });
        Self {
            ops,
            listener_ids: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn from_uri(uri: &str) -> Result<Self> {
        Ok(Self::new(Endpoint::from_uri(uri)?))
    }

    /// Starts connecting. The ticket tracks first-successful-readiness: it
    /// resolves when a connection is first established and fails with
    /// [`Error::FailedState`] if the retry budget runs out before then.
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

    /// Forces a fresh connection: cancels an in-flight attempt, closes an
    /// established connection, or leaves the Failed state. An `endpoint`
    /// replaces the cached one before the next attempt.
    pub fn reconnect(&self, endpoint: Option<Endpoint>) {
        let _ = self.ops.send(Op::Reconnect { endpoint });
    }

    /// Issues an arbitrary command. This is the generic dispatch: any verb,
    /// arguments passed through untouched.
    pub fn call(&self, command: Command) -> Ticket {
        let ticket = Ticket::new();
        self.submit(
            Op::Dispatch {
                command,
                ticket: ticket.clone(),
            },
            &ticket,
        );
        ticket
    }

    /// Selects the logical database, and caches it so every subsequent
    /// reconnect selects it again.
    pub fn select(&self, db: u32) -> Ticket {
        let ticket = Ticket::new();
        self.submit(
            Op::Select {
                db,
                ticket: ticket.clone(),
            },
            &ticket,
        );
        ticket
    }

    /// Authenticates, and caches the password so every subsequent reconnect
    /// authenticates again.
    pub fn auth(&self, password: impl Into<String>) -> Ticket {
        let ticket = Ticket::new();
        self.submit(
            Op::Auth {
                password: password.into(),
                ticket: ticket.clone(),
            },
            &ticket,
        );
        ticket
    }

    pub fn get(&self, key: &str) -> Ticket {
        self.call(Command::new("get").arg(key.to_string()))
    }

    pub fn set(&self, key: &str, value: impl Into<Bytes>) -> Ticket {
        self.call(Command::new("set").arg(key.to_string()).arg(value))
    }

    pub fn ping(&self) -> Ticket {
        self.call(Command::new("ping"))
    }

    pub fn publish(&self, channel: &str, payload: impl Into<Bytes>) -> Ticket {
        self.call(Command::new("publish").arg(channel.to_string()).arg(payload))
    }

    /// Registers a listener for a lifecycle event (`"connected"`,
    /// `"reconnected"`, `"disconnected"`, `"reconnect_failed"`, `"failed"`).
    pub fn on(&self, event: &'static str, f: impl Fn(&Event) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId::next(&self.listener_ids);
        let _ = self.ops.send(Op::Listen {
            event,
            id,
            callback: Arc::new(f),
        });
        id
    }

    /// Removes one listener by identity.
    pub fn off(&self, event: &'static str, id: ListenerId) {
        let _ = self.ops.send(Op::Unlisten { event, id });
    }

    /// Removes every listener for an event.
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

    fn submit(&self, op: Op, ticket: &Ticket) {
        if self.ops.send(op).is_err() {
            ticket.fail(Error::ConnectionLost);
        }
    }
}

/// Whether the connection survives handling an op.
enum Flow {
    Continue,
    CloseConnection,
}

struct Actor {
    rx: mpsc::UnboundedReceiver<Op>,
    endpoint: Endpoint,
    supervisor: Supervisor,
    bus: EventBus<Event>,
    /// Commands awaiting a connection, drained FIFO once one is up.
    queue: VecDeque<(Command, Ticket)>,
    /// `connect()` tickets awaiting first readiness.
    ready: Vec<Ticket>,
    /// Delay to apply before the next attempt while Disconnected.
    next_delay: Duration,
}

impl Actor {
    fn new(endpoint: Endpoint, policy: RetryPolicy, rx: mpsc::UnboundedReceiver<Op>) -> Self {
        Self {
            rx,
            endpoint,
            supervisor: Supervisor::new(policy),
            bus: EventBus::new(),
            queue: VecDeque::new(),
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

    async fn drive(&mut self, conn: &mut Option<RequestConnection<TcpStream>>) -> Result<()> {
        loop {
            match self.supervisor.state() {
                Lifecycle::Initial | Lifecycle::Failed => match self.rx.recv().await {
                    Some(op) => self.idle_op(op)?,
                    None => return Ok(()),
                },

                Lifecycle::Connecting => {
                    let attempt = connect_endpoint(self.endpoint.clone());
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
                                    // drop the in-flight attempt and start over
                                    if let Some(endpoint) = endpoint {
                                        self.endpoint = endpoint;
                                    }
                                    debug!("reconnect requested, restarting attempt");
                                    break;
                                }
                                Some(op) => self.waiting_op(op)?,
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
                            event = active.next_event() => {
                                match event {
                                    ConnEvent::Closed { error: Some(err) } => {
                                        warn!(cause = %err, "connection lost");
                                    }
                                    ConnEvent::Closed { error: None } => debug!("connection closed"),
                                    ConnEvent::OutOfSync => {
                                        error!("replies out of sync, closing connection");
                                    }
                                    ConnEvent::TimedOut => warn!("connection timed out"),
                                }
                                self.connection_lost(&mut active)?;
                                break;
                            }
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
                                    // a listener asked for it; skip the timer
                                    if let Some(endpoint) = endpoint {
                                        self.endpoint = endpoint;
                                    }
                                    self.supervisor.start_connecting()?;
                                    break;
                                }
                                Some(op) => self.waiting_op(op)?,
                            }
                        }
                    }
                }
            }
        }
    }

    /// A fresh attempt resolved: either wire up the connection or charge the
    /// failure against the retry budget.
    async fn attempt_done(
        &mut self,
        res: Result<RequestConnection<TcpStream>>,
    ) -> Result<Option<RequestConnection<TcpStream>>> {
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
                // `connected` has fired; now flush the queue in issue order.
                while let Some((command, ticket)) = self.queue.pop_front() {
                    if active.send(ticket, command).await.is_err() {
                        self.connection_lost(&mut active)?;
                        return Ok(None);
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
                        self.enter_failed();
                    }
                    Retry::Immediate => unreachable!("a failed attempt is never immediate"),
                }
                Ok(None)
            }
        }
    }

    /// Tears down a live connection: every in-flight ticket fails with
    /// `ConnectionLost` before `disconnected` reaches listeners, and an
    /// immediate retry is scheduled.
    fn connection_lost(&mut self, active: &mut RequestConnection<TcpStream>) -> Result<()> {
        active.fail_in_flight(Error::ConnectionLost);
        self.supervisor.connection_lost()?;
        self.emit(Event::Disconnected);
        self.next_delay = Duration::ZERO;
        Ok(())
    }

    fn enter_failed(&mut self) {
        self.emit(Event::Failed);
        for ticket in self.ready.drain(..) {
            ticket.fail(Error::FailedState);
        }
        for (_, ticket) in self.queue.drain(..) {
            ticket.fail(Error::FailedState);
        }
    }

    async fn connected_op(
        &mut self,
        op: Op,
        active: &mut RequestConnection<TcpStream>,
    ) -> Result<Flow> {
        match op {
            Op::Dispatch { command, ticket } => {
                if active.send(ticket, command).await.is_err() {
                    return Ok(Flow::CloseConnection);
                }
            }
            Op::Connect { ticket } => ticket.resolve(Frame::Simple("OK".to_string())),
            Op::Reconnect { endpoint } => {
                if let Some(endpoint) = endpoint {
                    self.endpoint = endpoint;
                }
                debug!("reconnect requested, closing the current connection");
                return Ok(Flow::CloseConnection);
            }
            Op::Select { db, ticket } => {
                self.endpoint.set_db(db);
                let command = Command::new("select").arg(db.to_string());
                if active.send(ticket, command).await.is_err() {
                    return Ok(Flow::CloseConnection);
                }
            }
            Op::Auth { password, ticket } => {
                self.endpoint.set_password(password.clone());
                let command = Command::new("auth").arg(password);
                if active.send(ticket, command).await.is_err() {
                    return Ok(Flow::CloseConnection);
                }
            }
            op => self.common_op(op),
        }
        Ok(Flow::Continue)
    }

    /// Ops arriving while a connection is being chased: commands queue up,
    /// readiness tickets pile onto the waiters.
    fn waiting_op(&mut self, op: Op) -> Result<()> {
        match op {
            Op::Dispatch { command, ticket } => self.queue.push_back((command, ticket)),
            Op::Connect { ticket } => self.ready.push(ticket),
            Op::Reconnect { endpoint } => {
                if let Some(endpoint) = endpoint {
                    self.endpoint = endpoint;
                }
            }
            Op::Select { db, ticket } => {
                self.endpoint.set_db(db);
                self.queue
                    .push_back((Command::new("select").arg(db.to_string()), ticket));
            }
            Op::Auth { password, ticket } => {
                self.endpoint.set_password(password.clone());
                self.queue
                    .push_back((Command::new("auth").arg(password), ticket));
            }
            op => self.common_op(op),
        }
        Ok(())
    }

    /// Ops arriving while Initial or Failed.
    fn idle_op(&mut self, op: Op) -> Result<()> {
        let failed = self.supervisor.state() == Lifecycle::Failed;
        match op {
            Op::Dispatch { command, ticket } => {
                if failed {
                    ticket.fail(Error::FailedState);
                } else {
                    self.queue.push_back((command, ticket));
                }
            }
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
            Op::Select { db, ticket } => {
                self.endpoint.set_db(db);
                if failed {
                    ticket.fail(Error::FailedState);
                } else {
                    self.queue
                        .push_back((Command::new("select").arg(db.to_string()), ticket));
                }
            }
            Op::Auth { password, ticket } => {
                self.endpoint.set_password(password.clone());
                if failed {
                    ticket.fail(Error::FailedState);
                } else {
                    self.queue
                        .push_back((Command::new("auth").arg(password), ticket));
                }
            }
            op => self.common_op(op),
        }
        Ok(())
    }

    /// Ops with the same meaning in every lifecycle state.
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

    fn emit(&mut self, event: Event) {
        self.bus.emit(event.name(), &event);
    }

    fn shutdown(&mut self, conn: Option<RequestConnection<TcpStream>>) {
        if let Some(mut active) = conn {
            active.fail_in_flight(Error::ConnectionLost);
        }
        for (_, ticket) in self.queue.drain(..) {
            ticket.fail(Error::ConnectionLost);
        }
        for ticket in self.ready.drain(..) {
            ticket.fail(Error::ConnectionLost);
        }
    }
}

/// Opens and prepares one connection: TCP, then `auth` if a password is
/// cached, then `select` if the database index is non-zero.
async fn connect_endpoint(endpoint: Endpoint) -> Result<RequestConnection<TcpStream>> {
    debug!(addr = %endpoint.addr(), "connecting");
    let stream = TcpStream::connect(endpoint.addr())
        .await
        .map_err(|err| Error::ConnectFailed(err.to_string()))?;
    let probe = endpoint
        .inactivity()
        .map(|(trigger, response)| ProbeConfig { trigger, response });
    let mut conn = RequestConnection::new(stream, probe);

    if let Some(password) = endpoint.password() {
        conn.handshake(Command::new("auth").arg(password.to_string()))
            .await?;
    }
    if endpoint.db() != 0 {
        conn.handshake(Command::new("select").arg(endpoint.db().to_string()))
            .await?;
    }
    Ok(conn)
}
