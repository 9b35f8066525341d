//! A resilient asynchronous client library for Redis-compatible servers.
//!
//! Two client personas share one reconnecting transport:
//!
//! - [`CommandClient`] — pipelined request/response for general commands;
//! - [`PubSubClient`] — channel- and pattern-based message delivery with a
//!   subscription registry that survives reconnection transparently.
//!
//! Both queue work while a connection is being (re)established, retry with a
//! bounded budget, and surface lifecycle events (`connected`, `reconnected`,
//! `disconnected`, `reconnect_failed`, `failed`) to registered listeners.
//! Every operation returns a [`Ticket`], a completion handle that can be
//! awaited or observed through listeners.
//!
//! ```no_run
//! use rebound::{CommandClient, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = CommandClient::from_uri("redis://localhost/0")?;
//!     client.connect();
//!     client.set("greeting", "hello").await?;
//!     let value = client.get("greeting").await?;
//!     println!("{value:?}");
//!     Ok(())
//! }
//! ```

pub mod clients;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod frame;
mod parse;
mod pubsub;
mod request;
mod state;
pub mod supervisor;
mod ticket;
mod transport;

pub use clients::{CallbackId, CommandClient, PubSubClient};
pub use endpoint::Endpoint;
pub use error::Error;
pub use events::{Event, ListenerId};
pub use frame::{Command, Frame};
pub use supervisor::{Lifecycle, RetryPolicy};
pub use ticket::{Outcome, Ticket};

pub const DEFAULT_PORT: u16 = 6379;

pub type Result<T> = std::result::Result<T, Error>;
