//! Connection lifecycle: the states, the permitted transitions and the
//! bounded retry policy shared by both client personas.
use crate::state::{State, StateMachine};
use crate::Result;
use std::time::Duration;
use tracing::debug;

/// Where a client currently stands in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// Never asked to connect.
    Initial,
    /// A connection attempt is in flight.
    Connecting,
    /// A connection is up and commands flow.
    Connected,
    /// The connection is gone; a retry is scheduled or in flight.
    Disconnected,
    /// The retry budget is exhausted; only a manual `reconnect` leaves this.
    Failed,
}

impl State for Lifecycle {
    fn name(&self) -> &'static str {
        match self {
            Lifecycle::Initial => "initial",
            Lifecycle::Connecting => "connecting",
            Lifecycle::Connected => "connected",
            Lifecycle::Disconnected => "disconnected",
            Lifecycle::Failed => "failed",
        }
    }
}

/// How stubbornly to chase a connection.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Consecutive failed attempts tolerated before giving up.
    pub max_attempts: u32,
    /// Pause between attempts that failed while connecting. A loss after a
    /// clean connection retries immediately.
    pub reconnect_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            reconnect_delay: Duration::from_millis(500),
        }
    }
}

/// What to do after losing a connection or failing an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retry {
    /// Retry with no delay (the previous connection was cleanly up).
    Immediate,
    /// Retry after the policy delay; `attempt` is the failure ordinal.
    Delayed { attempt: u32, delay: Duration },
    /// Budget exhausted; the lifecycle has moved to Failed.
    GiveUp { attempt: u32 },
}

/// Drives the lifecycle state machine and the attempt counter.
///
/// The supervisor is deliberately I/O-free: the owning client actor opens
/// sockets, runs timers and emits user-facing events, and reports what
/// happened here so the state and the retry bookkeeping stay in one place.
#[derive(Debug)]
pub(crate) struct Supervisor {
    machine: StateMachine<Lifecycle>,
    policy: RetryPolicy,
    attempts: u32,
}

impl Supervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        use Lifecycle as L;

        let mut machine = StateMachine::new(L::Initial)
            .edge(L::Initial, L::Connecting)
            .and_then(|m| m.edge(L::Connecting, L::Connected))
            .and_then(|m| m.edge(L::Connecting, L::Disconnected))
            .and_then(|m| m.edge(L::Connected, L::Disconnected))
            .and_then(|m| m.edge(L::Disconnected, L::Connecting))
            .and_then(|m| m.edge(L::Disconnected, L::Failed))
            .and_then(|m| m.edge(L::Failed, L::Connecting))
            // The edge set is fixed and duplicate-free.
            .expect("lifecycle transition table is statically valid");

        for state in [
            L::Initial,
            L::Connecting,
            L::Connected,
            L::Disconnected,
            L::Failed,
        ] {
            machine.on_enter(state, move |prev| {
                debug!(from = prev.name(), to = state.name(), "lifecycle transition");
            });
        }

        Self {
            machine,
            policy,
            attempts: 0,
        }
    }

    pub fn state(&self) -> Lifecycle {
        self.machine.current()
    }

    /// Enters Connecting, legal from Initial, Disconnected and Failed.
    pub fn start_connecting(&mut self) -> Result<()> {
        self.machine.update(Lifecycle::Connecting)?;
        Ok(())
    }

    /// Records a successful attempt. Returns whether this was a retry, which
    /// the owner surfaces as an extra `reconnected` event.
    pub fn connected(&mut self) -> Result<bool> {
        self.machine.update(Lifecycle::Connected)?;
        let was_retry = self.attempts > 0;
        self.attempts = 0;
        Ok(was_retry)
    }

    /// Records a failed connection attempt (Connecting -> Disconnected) and
    /// charges it against the retry budget.
    pub fn attempt_failed(&mut self) -> Result<Retry> {
        self.machine.update(Lifecycle::Disconnected)?;
        self.attempts += 1;
        if self.attempts >= self.policy.max_attempts {
            self.machine.update(Lifecycle::Failed)?;
            Ok(Retry::GiveUp {
                attempt: self.attempts,
            })
        } else {
            Ok(Retry::Delayed {
                attempt: self.attempts,
                delay: self.policy.reconnect_delay,
            })
        }
    }

    /// Records the loss of an established connection. A clean loss is not
    /// charged against the budget and retries immediately.
    pub fn connection_lost(&mut self) -> Result<Retry> {
        self.machine.update(Lifecycle::Disconnected)?;
        Ok(Retry::Immediate)
    }
}
