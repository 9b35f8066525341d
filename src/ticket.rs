//! Completion handles pairing issued commands with their eventual replies.
use crate::{Error, Frame};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use tracing::debug;

/// The stored terminal result of a [`Ticket`].
pub type Outcome = std::result::Result<Frame, Error>;

type Listener = Box<dyn FnOnce(&Outcome) + Send>;

/// A single-resolution handle to the eventual outcome of one issued command.
///
/// A `Ticket` is shared between the issuer and the connection that will pair
/// it with a reply: it is cheap to clone, and every clone observes the same
/// outcome. It can be consumed two ways:
///
/// - awaited, since it implements [`Future`];
/// - observed through [`on_outcome`](Ticket::on_outcome) /
///   [`on_success`](Ticket::on_success) / [`on_failure`](Ticket::on_failure);
///   listeners registered after resolution fire immediately with the stored
///   outcome.
///
/// Resolution is terminal: exactly one transition, a second attempt is
/// ignored.
#[derive(Clone)]
pub struct Ticket {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    outcome: Option<Outcome>,
    wakers: Vec<Waker>,
    listeners: Vec<Listener>,
}

impl Ticket {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                outcome: None,
                wakers: Vec::new(),
                listeners: Vec::new(),
            })),
        }
    }

    /// Registers a listener for the outcome, whichever way it lands.
    ///
    /// Listeners registered before resolution run exactly once when the
    /// ticket settles, in registration order. Registering on an
    /// already-settled ticket runs the listener immediately.
    pub fn on_outcome(&self, f: impl FnOnce(&Outcome) + Send + 'static) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(outcome) = inner.outcome.clone() {
            // Run outside the lock so the listener may touch the ticket.
            drop(inner);
            f(&outcome);
        } else {
            inner.listeners.push(Box::new(f));
        }
    }

    /// Registers a listener that runs only on success.
    pub fn on_success(&self, f: impl FnOnce(&Frame) + Send + 'static) {
        self.on_outcome(move |outcome| {
            if let Ok(frame) = outcome {
                f(frame);
            }
        });
    }

    /// Registers a listener that runs only on failure.
    pub fn on_failure(&self, f: impl FnOnce(&Error) + Send + 'static) {
        self.on_outcome(move |outcome| {
            if let Err(err) = outcome {
                f(err);
            }
        });
    }

    /// Peeks at the stored outcome, if the ticket has settled.
    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.lock().unwrap().outcome.clone()
    }

    pub(crate) fn resolve(&self, value: Frame) {
        self.settle(Ok(value));
    }

    pub(crate) fn fail(&self, err: Error) {
        self.settle(Err(err));
    }

    fn settle(&self, outcome: Outcome) {
        let (outcome, listeners, wakers) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.outcome.is_some() {
                // Terminal transitions happen once; drop the straggler.
                debug!("ticket already settled, ignoring second resolution");
                return;
            }
            inner.outcome = Some(outcome.clone());
            (
                outcome,
                std::mem::take(&mut inner.listeners),
                std::mem::take(&mut inner.wakers),
            )
        };

        for listener in listeners {
            listener(&outcome);
        }
        for waker in wakers {
            waker.wake();
        }
    }
}

impl Future for Ticket {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.lock().unwrap();
        match &inner.outcome {
            Some(outcome) => Poll::Ready(outcome.clone()),
            None => {
                if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    inner.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("Ticket")
            .field("settled", &inner.outcome.is_some())
            .finish()
    }
}
