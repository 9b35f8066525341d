//! The pub/sub flavor of a session: per-channel acknowledgement queues and
//! message dispatch instead of one global reply queue.
use crate::frame::{Command, Frame};
use crate::parse::Parse;
use crate::request::ProbeConfig;
use crate::ticket::Ticket;
use crate::transport::{Transport, TransportStream};
use crate::{Error, Result};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, warn};

/// Reserved channel the inactivity probe subscribes to and immediately
/// unsubscribes from: a pub/sub connection cannot issue `ping`.
pub(crate) const PROBE_CHANNEL: &str = "__internal-ping";

/// The only verbs a pub/sub connection will carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubCommand {
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
}

impl SubCommand {
    pub fn verb(self) -> &'static str {
        match self {
            SubCommand::Subscribe => "subscribe",
            SubCommand::Unsubscribe => "unsubscribe",
            SubCommand::PSubscribe => "psubscribe",
            SubCommand::PUnsubscribe => "punsubscribe",
        }
    }

    /// Maps a verb back to a command; anything outside the pub/sub command
    /// set is rejected.
    pub fn from_verb(verb: &str) -> Result<Self> {
        match verb {
            "subscribe" => Ok(SubCommand::Subscribe),
            "unsubscribe" => Ok(SubCommand::Unsubscribe),
            "psubscribe" => Ok(SubCommand::PSubscribe),
            "punsubscribe" => Ok(SubCommand::PUnsubscribe),
            other => Err(Error::InvalidArgument(format!(
                "`{other}` cannot be issued on a pub/sub connection"
            ))),
        }
    }
}

/// What a pub/sub session surfaces to its owner.
#[derive(Debug)]
pub(crate) enum PubSubEvent {
    /// A subscribe/unsubscribe acknowledgement was paired with its ticket.
    Ack {
        kind: SubCommand,
        name: String,
        count: u64,
    },
    /// A published message on a directly subscribed channel.
    Message { channel: String, payload: Bytes },
    /// A published message delivered through a pattern subscription.
    PMessage {
        pattern: String,
        channel: String,
        payload: Bytes,
    },
    /// The socket closed, cleanly (`error: None`) or not.
    Closed { error: Option<Error> },
    /// The inactivity probe went unanswered.
    TimedOut,
}

#[derive(Debug)]
struct Probe {
    config: ProbeConfig,
    probe_sent: bool,
}

/// A pub/sub session over one socket.
///
/// Redis acknowledges `subscribe`/`unsubscribe` once *per channel*, so
/// instead of a global FIFO this connection keeps one acknowledgement queue
/// per channel or pattern name. Acks settle the head of their name's queue
/// with the server-reported subscription count.
#[derive(Debug)]
pub(crate) struct PubSubConnection<S> {
    transport: Transport<S>,
    acks: HashMap<String, VecDeque<Ticket>>,
    probe: Option<Probe>,
}

impl<S: TransportStream> PubSubConnection<S> {
    pub fn new(stream: S, probe: Option<ProbeConfig>) -> Self {
        Self {
            transport: Transport::new(stream),
            acks: HashMap::new(),
            probe: probe.map(|config| Probe {
                config,
                probe_sent: false,
            }),
        }
    }

    /// Issues one subscribe/unsubscribe for exactly one channel or pattern.
    ///
    /// The ticket joins the name's acknowledgement queue before any bytes
    /// leave the socket.
    pub async fn send(&mut self, ticket: Ticket, kind: SubCommand, name: &str) -> Result<()> {
        self.acks
            .entry(name.to_string())
            .or_default()
            .push_back(ticket);
        self.transport
            .send_command(Command::new(kind.verb()).arg(name.to_string()))
            .await
    }

    /// Authenticates on a freshly opened socket.
    ///
    /// This happens before any subscription is issued, so the auth reply is
    /// the only frame that can arrive and the acknowledgement queues are
    /// untouched. A pub/sub connection carries no other general command.
    pub async fn authenticate(&mut self, password: &str) -> Result<()> {
        self.transport
            .send_command(Command::new("auth").arg(password.to_string()))
            .await
            .map_err(|err| Error::ConnectFailed(format!("auth write failed: {err}")))?;
        match self.transport.recv_frame().await {
            Ok(Some(Frame::Error(msg))) => {
                Err(Error::ConnectFailed(format!("auth rejected: {msg}")))
            }
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(Error::ConnectFailed("connection closed during auth".into())),
            Err(err) => Err(Error::ConnectFailed(format!(
                "read failed during auth: {err}"
            ))),
        }
    }

    /// Drives the read half and the inactivity probe until a message, an
    /// acknowledgement or something connection-terminating arrives.
    pub async fn next_event(&mut self) -> PubSubEvent {
        loop {
            let deadline = self.probe_deadline();
            let idle = async {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                res = self.transport.recv_frame() => match res {
                    Ok(Some(frame)) => {
                        if let Some(probe) = &mut self.probe {
                            probe.probe_sent = false;
                        }
                        match self.dispatch(frame) {
                            Ok(event) => return event,
                            Err(err) => {
                                error!(%err, "cannot interpret pub/sub frame");
                                return PubSubEvent::Closed { error: Some(err) };
                            }
                        }
                    }
                    Ok(None) => return PubSubEvent::Closed { error: None },
                    Err(err) => return PubSubEvent::Closed { error: Some(err) },
                },
                _ = idle => {
                    if let Err(event) = self.probe_idle().await {
                        return event;
                    }
                }
            }
        }
    }

    /// Fails every pending acknowledgement ticket.
    pub fn fail_in_flight(&mut self, err: Error) {
        for (_, queue) in self.acks.drain() {
            for ticket in queue {
                ticket.fail(err.clone());
            }
        }
    }

    fn dispatch(&mut self, frame: Frame) -> Result<PubSubEvent> {
        let mut parse = Parse::new(frame)?;
        let kind = parse.next_string()?;

        match kind.as_str() {
            "message" => {
                let channel = parse.next_string()?;
                let payload = parse.next_bytes()?;
                parse.finish()?;
                debug!(channel, "message received");
                Ok(PubSubEvent::Message { channel, payload })
            }
            "pmessage" => {
                let pattern = parse.next_string()?;
                let channel = parse.next_string()?;
                let payload = parse.next_bytes()?;
                parse.finish()?;
                debug!(pattern, channel, "pmessage received");
                Ok(PubSubEvent::PMessage {
                    pattern,
                    channel,
                    payload,
                })
            }
            verb => {
                let kind = SubCommand::from_verb(verb)
                    .map_err(|_| Error::Protocol(format!("unexpected pub/sub frame `{verb}`")))?;
                let name = parse.next_string()?;
                let count = parse.next_u64()?;
                parse.finish()?;
                self.acknowledge(kind, name, count)
            }
        }
    }

    fn acknowledge(&mut self, kind: SubCommand, name: String, count: u64) -> Result<PubSubEvent> {
        let Some(queue) = self.acks.get_mut(&name) else {
            error!(verb = kind.verb(), channel = %name, "acknowledgement with nothing pending");
            return Err(Error::OutOfSync);
        };
        // The queue is created on send, so it cannot be empty here.
        let ticket = queue.pop_front().ok_or(Error::OutOfSync)?;
        if queue.is_empty() {
            self.acks.remove(&name);
        }
        ticket.resolve(Frame::Integer(count as i64));
        Ok(PubSubEvent::Ack { kind, name, count })
    }

    fn probe_deadline(&self) -> Option<Instant> {
        let probe = self.probe.as_ref()?;
        let base = self.transport.last_activity() + probe.config.trigger;
        Some(if probe.probe_sent {
            base + probe.config.response
        } else {
            base
        })
    }

    async fn probe_idle(&mut self) -> std::result::Result<(), PubSubEvent> {
        let probe_sent = match &self.probe {
            Some(probe) => probe.probe_sent,
            None => return Ok(()),
        };
        if probe_sent {
            warn!("inactivity probe went unanswered, closing connection");
            return Err(PubSubEvent::TimedOut);
        }
        if let Some(probe) = &mut self.probe {
            probe.probe_sent = true;
        }
        debug!("connection idle, probing via {PROBE_CHANNEL}");
        // Subscribe and immediately unsubscribe; the acks reset the
        // inactivity clock by arriving.
        for kind in [SubCommand::Subscribe, SubCommand::Unsubscribe] {
            if let Err(err) = self.send(Ticket::new(), kind, PROBE_CHANNEL).await {
                return Err(PubSubEvent::Closed { error: Some(err) });
            }
        }
        Ok(())
    }
}
