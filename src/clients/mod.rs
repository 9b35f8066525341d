//! The two client personas: request/response and pub/sub.
pub mod command;
pub mod subscriber;

pub use command::CommandClient;
pub use subscriber::{CallbackId, PubSubClient};

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted in-process server: accept a socket, assert the inbound
    //! command arrays, write canned reply bytes, drop the socket on cue.
    use crate::frame::Frame;
    use crate::{Endpoint, Error};
    use bytes::{Buf, BytesMut};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    pub(crate) struct TestServer {
        listener: TcpListener,
        port: u16,
    }

    impl TestServer {
        pub async fn bind() -> Self {
            Self::bind_on(0).await
        }

        pub async fn bind_on(port: u16) -> Self {
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            let port = listener.local_addr().unwrap().port();
            Self { listener, port }
        }

        pub fn endpoint(&self) -> Endpoint {
            Endpoint::new("127.0.0.1", self.port)
        }

        pub async fn accept(&self) -> Peer {
            let (stream, _) = self.listener.accept().await.unwrap();
            Peer {
                stream,
                buffer: BytesMut::new(),
            }
        }
    }

    pub(crate) struct Peer {
        stream: TcpStream,
        buffer: BytesMut,
    }

    impl Peer {
        /// Reads one inbound request and returns it as a list of strings.
        pub async fn expect_command(&mut self) -> Vec<String> {
            loop {
                match Frame::decode(&self.buffer[..]) {
                    Ok((frame, used)) => {
                        self.buffer.advance(used);
                        let Frame::Array(parts) = frame else {
                            panic!("expected a request array, got {frame:?}");
                        };
                        return parts
                            .into_iter()
                            .map(|part| match part {
                                Frame::Bulk(data) => String::from_utf8(data.to_vec()).unwrap(),
                                other => panic!("expected a bulk string, got {other:?}"),
                            })
                            .collect();
                    }
                    Err(Error::IncompleteFrame) => {
                        if 0 == self.stream.read_buf(&mut self.buffer).await.unwrap() {
                            panic!("peer closed while a command was expected");
                        }
                    }
                    Err(err) => panic!("bad inbound bytes: {err}"),
                }
            }
        }

        pub async fn reply(&mut self, bytes: &[u8]) {
            self.stream.write_all(bytes).await.unwrap();
            self.stream.flush().await.unwrap();
        }
    }
}
