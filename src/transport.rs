//! Frame-level transport over a byte stream, usually a [`TcpStream`](tokio::net::TcpStream).
use crate::frame::{Command, Frame};
use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, error};

const INITIAL_BUFFER_SIZE: usize = 4 * 1024;

/// A trait for types that can back a [`Transport`].
pub(crate) trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types that implement `AsyncRead + AsyncWrite + Unpin + Send`.
impl<T: AsyncRead + AsyncWrite + Unpin + Send> TransportStream for T {}

/// Frame-level view of a byte stream.
///
/// Inbound bytes accumulate in one buffer until [`Frame::decode`] can carve
/// a whole frame off its front; whatever follows stays buffered, so parsing
/// is restartable across partial arrivals. Outbound frames are rendered into
/// a scratch buffer and pushed with a single `write_all`, so a frame never
/// reaches the socket in pieces.
#[derive(Debug)]
pub(crate) struct Transport<S> {
    stream: S,
    inbound: BytesMut,
    scratch: BytesMut,
    /// When inbound bytes last arrived. Feeds the inactivity probe: any
    /// inbound byte counts, not only whole frames.
    last_rx: Instant,
}

impl<S: TransportStream> Transport<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            inbound: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            scratch: BytesMut::new(),
            last_rx: Instant::now(),
        }
    }

    /// When inbound bytes last arrived on this transport.
    pub fn last_activity(&self) -> Instant {
        self.last_rx
    }

    /// Receives the next whole frame.
    ///
    /// Returns `None` when the peer closes the stream on a frame boundary;
    /// closing with a frame half-delivered is an error.
    #[tracing::instrument(skip_all)]
    pub async fn recv_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match Frame::decode(&self.inbound[..]) {
                Ok((frame, used)) => {
                    self.inbound.advance(used);
                    debug!(?frame, "frame received");
                    return Ok(Some(frame));
                }
                // a partial frame just waits for more bytes
                Err(Error::IncompleteFrame) => {}
                Err(err) => return Err(err),
            }

            if 0 == self.stream.read_buf(&mut self.inbound).await? {
                if self.inbound.is_empty() {
                    debug!("peer closed the stream");
                    return Ok(None);
                }
                error!("peer closed the stream inside a frame");
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            self.last_rx = Instant::now();
        }
    }

    /// Sends a command in its request-array form.
    pub async fn send_command(&mut self, command: Command) -> Result<()> {
        debug!(verb = command.verb(), "sending command");
        self.send_frame(&command.into_frame()).await
    }

    /// Renders `frame` and writes it out in one piece.
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        self.scratch.clear();
        frame.encode(&mut self.scratch);
        self.stream.write_all(&self.scratch).await?;
        Ok(())
    }
}
