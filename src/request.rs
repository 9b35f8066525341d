//! One TCP session speaking pipelined request/response.
use crate::frame::{Command, Frame};
use crate::ticket::Ticket;
use crate::transport::{Transport, TransportStream};
use crate::{Error, Result};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, warn};

/// Inactivity-probe knobs: probe after `trigger` of silence, give up after
/// `trigger + response` of total silence.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProbeConfig {
    pub trigger: Duration,
    pub response: Duration,
}

#[derive(Debug)]
struct Probe {
    config: ProbeConfig,
    probe_sent: bool,
}

/// A connection-terminating occurrence, reported upward by return value; the
/// owning client maps these onto its lifecycle events.
#[derive(Debug)]
pub(crate) enum ConnEvent {
    /// The socket closed, cleanly (`error: None`) or not.
    Closed { error: Option<Error> },
    /// A reply arrived with an empty reply queue. Fatal.
    OutOfSync,
    /// The inactivity probe went unanswered.
    TimedOut,
}

/// A pipelined request/response session over one socket.
///
/// Replies are paired with in-flight commands strictly FIFO: the completion
/// ticket is queued before any bytes leave the socket, and every inbound
/// reply settles the queue head. A reply with nothing queued means the
/// framing has desynchronized and the connection is unusable.
#[derive(Debug)]
pub(crate) struct RequestConnection<S> {
    transport: Transport<S>,
    replies: VecDeque<Ticket>,
    probe: Option<Probe>,
}

impl<S: TransportStream> RequestConnection<S> {
    pub fn new(stream: S, probe: Option<ProbeConfig>) -> Self {
        Self {
            transport: Transport::new(stream),
            replies: VecDeque::new(),
            probe: probe.map(|config| Probe {
                config,
                probe_sent: false,
            }),
        }
    }

    /// Issues a command: queues the ticket, then encodes and writes.
    ///
    /// On a write error the ticket stays queued; the owner tears the
    /// connection down and [`fail_in_flight`](Self::fail_in_flight) settles
    /// it along with everything else.
    pub async fn send(&mut self, ticket: Ticket, command: Command) -> Result<()> {
        self.replies.push_back(ticket);
        self.transport.send_command(command).await
    }

    /// Number of commands awaiting a reply.
    pub fn in_flight(&self) -> usize {
        self.replies.len()
    }

    /// Drives the read half and the inactivity probe until something
    /// connection-terminating happens. Ordinary replies are settled
    /// internally and do not surface.
    pub async fn next_event(&mut self) -> ConnEvent {
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
                        if let Err(event) = self.dispatch(frame) {
                            return event;
                        }
                    }
                    Ok(None) => return ConnEvent::Closed { error: None },
                    Err(err) => return ConnEvent::Closed { error: Some(err) },
                },
                _ = idle => {
                    if let Err(event) = self.probe_idle().await {
                        return event;
                    }
                }
            }
        }
    }

    /// Issues a command and waits inline for its reply.
    ///
    /// Only used while a fresh connection is being prepared (`auth`,
    /// `select`), before the connection is handed to its owner; every
    /// failure mode is therefore a connect failure.
    pub async fn handshake(&mut self, command: Command) -> Result<Frame> {
        let verb = command.verb().to_string();
        let ticket = Ticket::new();
        self.send(ticket.clone(), command)
            .await
            .map_err(|err| Error::ConnectFailed(format!("{verb} write failed: {err}")))?;
        loop {
            if let Some(outcome) = ticket.outcome() {
                return outcome
                    .map_err(|err| Error::ConnectFailed(format!("{verb} rejected: {err}")));
            }
            match self.transport.recv_frame().await {
                Ok(Some(frame)) => {
                    if self.dispatch(frame).is_err() {
                        return Err(Error::ConnectFailed(format!(
                            "replies out of sync during {verb}"
                        )));
                    }
                }
                Ok(None) => {
                    return Err(Error::ConnectFailed(format!(
                        "connection closed during {verb}"
                    )))
                }
                Err(err) => {
                    return Err(Error::ConnectFailed(format!(
                        "read failed during {verb}: {err}"
                    )))
                }
            }
        }
    }

    /// Fails every queued ticket, in FIFO order.
    pub fn fail_in_flight(&mut self, err: Error) {
        for ticket in self.replies.drain(..) {
            ticket.fail(err.clone());
        }
    }

    fn dispatch(&mut self, frame: Frame) -> std::result::Result<(), ConnEvent> {
        let Some(ticket) = self.replies.pop_front() else {
            error!(?frame, "reply received with no command in flight");
            return Err(ConnEvent::OutOfSync);
        };
        match frame {
            Frame::Error(msg) => ticket.fail(Error::Server(msg)),
            frame => ticket.resolve(frame),
        }
        Ok(())
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

    async fn probe_idle(&mut self) -> std::result::Result<(), ConnEvent> {
        let Some(probe) = &mut self.probe else {
            return Ok(());
        };
        if probe.probe_sent {
            warn!("inactivity probe went unanswered, closing connection");
            return Err(ConnEvent::TimedOut);
        }
        probe.probe_sent = true;
        debug!("connection idle, probing with ping");
        // The probe occupies the reply queue like any other command; its
        // reply resets the inactivity clock by arriving.
        self.send(Ticket::new(), Command::new("ping"))
            .await
            .map_err(|err| ConnEvent::Closed { error: Some(err) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_replies_resolve_in_issue_order() {
        let stream = tokio_test::io::Builder::new()
            .write(b"*2\r\n$3\r\nget\r\n$1\r\na\r\n")
            .write(b"*2\r\n$3\r\nget\r\n$1\r\nb\r\n")
            .read(b"$1\r\nA\r\n$1\r\nB\r\n")
            .build();
        let mut conn = RequestConnection::new(stream, None);

        let first = Ticket::new();
        let second = Ticket::new();
        conn.send(first.clone(), Command::new("get").arg("a"))
            .await
            .unwrap();
        conn.send(second.clone(), Command::new("get").arg("b"))
            .await
            .unwrap();
        assert_eq!(conn.in_flight(), 2);

        // EOF after both replies have been dispatched
        assert!(matches!(
            conn.next_event().await,
            ConnEvent::Closed { error: None }
        ));
        assert_eq!(first.outcome().unwrap().unwrap(), Frame::Bulk(Bytes::from("A")));
        assert_eq!(
            second.outcome().unwrap().unwrap(),
            Frame::Bulk(Bytes::from("B"))
        );
        assert_eq!(conn.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_error_reply_fails_only_its_ticket() {
        let stream = tokio_test::io::Builder::new()
            .write(b"*1\r\n$4\r\nincr\r\n")
            .write(b"*1\r\n$4\r\nping\r\n")
            .read(b"-ERR wrong number of arguments\r\n+PONG\r\n")
            .build();
        let mut conn = RequestConnection::new(stream, None);

        let bad = Ticket::new();
        let good = Ticket::new();
        conn.send(bad.clone(), Command::new("incr")).await.unwrap();
        conn.send(good.clone(), Command::new("ping")).await.unwrap();
        conn.next_event().await;

        match bad.outcome().unwrap() {
            Err(Error::Server(msg)) => assert_eq!(msg, "ERR wrong number of arguments"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(
            good.outcome().unwrap().unwrap(),
            Frame::Simple("PONG".to_string())
        );
    }

    #[tokio::test]
    async fn test_unexpected_reply_is_out_of_sync() {
        let stream = tokio_test::io::Builder::new().read(b"+OK\r\n").build();
        let mut conn = RequestConnection::new(stream, None);
        assert!(matches!(conn.next_event().await, ConnEvent::OutOfSync));
    }

    #[tokio::test]
    async fn test_socket_loss_fails_queued_tickets() {
        let stream = tokio_test::io::Builder::new()
            .write(b"*1\r\n$4\r\nping\r\n")
            .build();
        let mut conn = RequestConnection::new(stream, None);

        let ticket = Ticket::new();
        conn.send(ticket.clone(), Command::new("ping")).await.unwrap();
        assert!(matches!(
            conn.next_event().await,
            ConnEvent::Closed { error: None }
        ));

        conn.fail_in_flight(Error::ConnectionLost);
        assert!(matches!(ticket.outcome(), Some(Err(Error::ConnectionLost))));
    }

    #[tokio::test]
    async fn test_handshake_returns_the_reply() {
        let stream = tokio_test::io::Builder::new()
            .write(b"*2\r\n$6\r\nselect\r\n$1\r\n9\r\n")
            .read(b"+OK\r\n")
            .build();
        let mut conn = RequestConnection::new(stream, None);
        assert_eq!(
            conn.handshake(Command::new("select").arg("9")).await.unwrap(),
            Frame::Simple("OK".to_string())
        );
    }

    #[tokio::test]
    async fn test_handshake_maps_rejection_to_connect_failure() {
        let stream = tokio_test::io::Builder::new()
            .write(b"*2\r\n$4\r\nauth\r\n$5\r\nwrong\r\n")
            .read(b"-ERR invalid password\r\n")
            .build();
        let mut conn = RequestConnection::new(stream, None);
        assert!(matches!(
            conn.handshake(Command::new("auth").arg("wrong")).await,
            Err(Error::ConnectFailed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_probe_pings_then_times_out() {
        let stream = tokio_test::io::Builder::new()
            .write(b"*1\r\n$4\r\nping\r\n")
            // keep the read half open while the response timeout runs down
            .wait(Duration::from_secs(600))
            .build();
        let probe = ProbeConfig {
            trigger: Duration::from_secs(2),
            response: Duration::from_secs(1),
        };
        let mut conn = RequestConnection::new(stream, Some(probe));

        let started = Instant::now();
        assert!(matches!(conn.next_event().await, ConnEvent::TimedOut));
        // the ping went out at ~2s and the teardown at ~3s of total silence
        assert!(Instant::now() - started >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_probe_keeps_the_connection() {
        let stream = tokio_test::io::Builder::new()
            .write(b"*1\r\n$4\r\nping\r\n")
            .read(b"+PONG\r\n")
            .build();
        let probe = ProbeConfig {
            trigger: Duration::from_secs(2),
            response: Duration::from_secs(1),
        };
        let mut conn = RequestConnection::new(stream, Some(probe));

        // EOF arrives only after the ping reply has been consumed
        assert!(matches!(
            conn.next_event().await,
            ConnEvent::Closed { error: None }
        ));
        assert_eq!(conn.in_flight(), 0);
    }
}
