use crate::{Error, Result};
use bytes::{Bytes, BytesMut};

/// A reply frame in the Redis Serialization Protocol (RESP2).
///
/// See: <https://redis.io/docs/latest/develop/reference/protocol-spec/>
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    NullBulk,
    Array(Vec<Frame>),
    NullArray,
}

impl Frame {
    /// Decodes one frame from the front of `buf`, returning it together with
    /// the number of bytes it occupied.
    ///
    /// [`Error::IncompleteFrame`] means `buf` ends before the frame does;
    /// the caller buffers more input and retries from the same position.
    pub fn decode(buf: &[u8]) -> Result<(Frame, usize)> {
        let mut pos = 0;
        let frame = decode_at(buf, &mut pos)?;
        Ok((frame, pos))
    }

    /// Appends the frame to `dst` in wire form.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Frame::Simple(text) => put_line(dst, b'+', text.as_bytes()),
            Frame::Error(text) => put_line(dst, b'-', text.as_bytes()),
            Frame::Integer(value) => put_line(dst, b':', value.to_string().as_bytes()),
            Frame::Bulk(payload) => {
                put_line(dst, b'$', payload.len().to_string().as_bytes());
                dst.extend_from_slice(payload);
                dst.extend_from_slice(b"\r\n");
            }
            Frame::NullBulk => dst.extend_from_slice(b"$-1\r\n"),
            Frame::Array(items) => {
                put_line(dst, b'*', items.len().to_string().as_bytes());
                for item in items {
                    item.encode(dst);
                }
            }
            Frame::NullArray => dst.extend_from_slice(b"*-1\r\n"),
        }
    }
}

/// A client request: a verb plus its arguments, rendered on the wire as an
/// array of bulk strings (`*N`, then `$len` items).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    verb: String,
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            args: Vec::new(),
        }
    }

    /// Appends an argument. Lengths on the wire are byte lengths, so any
    /// payload that can become `Bytes` is accepted as-is.
    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Renders the command in its request-array form.
    pub fn into_frame(self) -> Frame {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(Frame::Bulk(Bytes::from(self.verb.into_bytes())));
        parts.extend(self.args.into_iter().map(Frame::Bulk));
        Frame::Array(parts)
    }
}

fn put_line(dst: &mut BytesMut, tag: u8, body: &[u8]) {
    dst.extend_from_slice(&[tag]);
    dst.extend_from_slice(body);
    dst.extend_from_slice(b"\r\n");
}

/// Every frame opens with a tagged header line; the tag decides whether a
/// payload or nested frames follow.
fn decode_at(buf: &[u8], pos: &mut usize) -> Result<Frame> {
    let header = take_line(buf, pos)?;
    let (&tag, body) = header
        .split_first()
        .ok_or_else(|| Error::Protocol("empty frame header".to_string()))?;

    match tag {
        b'+' => Ok(Frame::Simple(utf8(body)?)),
        b'-' => Ok(Frame::Error(utf8(body)?)),
        b':' => Ok(Frame::Integer(header_int(body)?)),
        b'$' => match header_int(body)? {
            -1 => Ok(Frame::NullBulk),
            len if len < 0 => Err(Error::Protocol(format!("bad bulk length {len}"))),
            len => {
                let payload = Bytes::copy_from_slice(take_bytes(buf, pos, len as usize)?);
                let terminator = take_bytes(buf, pos, 2)?;
                if terminator != b"\r\n" {
                    return Err(Error::Protocol(
                        "bulk payload missing its CRLF terminator".to_string(),
                    ));
                }
                Ok(Frame::Bulk(payload))
            }
        },
        b'*' => match header_int(body)? {
            -1 => Ok(Frame::NullArray),
            len if len < 0 => Err(Error::Protocol(format!("bad array length {len}"))),
            len => {
                let mut items = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    items.push(decode_at(buf, pos)?);
                }
                Ok(Frame::Array(items))
            }
        },
        other => Err(Error::Protocol(format!(
            "unknown frame tag `{}`",
            other as char
        ))),
    }
}

/// Yields the next CRLF-terminated line, without its terminator.
fn take_line<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a [u8]> {
    let rest = &buf[*pos..];
    match rest.windows(2).position(|sep| sep == b"\r\n") {
        Some(at) => {
            *pos += at + 2;
            Ok(&rest[..at])
        }
        None => Err(Error::IncompleteFrame),
    }
}

/// Yields exactly `n` raw bytes.
fn take_bytes<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    let rest = &buf[*pos..];
    if rest.len() < n {
        return Err(Error::IncompleteFrame);
    }
    *pos += n;
    Ok(&rest[..n])
}

fn utf8(line: &[u8]) -> Result<String> {
    Ok(String::from_utf8(line.to_vec())?)
}

fn header_int(line: &[u8]) -> Result<i64> {
    atoi::atoi(line).ok_or_else(|| Error::Protocol("malformed header line".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Frame {
        let (frame, used) = Frame::decode(bytes).unwrap();
        assert_eq!(used, bytes.len(), "frame should span the whole input");
        frame
    }

    #[test]
    fn test_decode_simple_and_error() {
        assert_eq!(decode_all(b"+PONG\r\n"), Frame::Simple("PONG".to_string()));
        assert_eq!(
            decode_all(b"-WRONGTYPE value is not an integer\r\n"),
            Frame::Error("WRONGTYPE value is not an integer".to_string())
        );
    }

    #[test]
    fn test_decode_integers() {
        for (bytes, want) in [
            (b":0\r\n".as_slice(), 0),
            (b":42\r\n", 42),
            (b":-7\r\n", -7),
            (b":+317\r\n", 317),
            (b":9000000000\r\n", 9_000_000_000),
        ] {
            assert_eq!(decode_all(bytes), Frame::Integer(want));
        }
    }

    #[test]
    fn test_decode_bulk_forms() {
        assert_eq!(
            decode_all(b"$5\r\nhello\r\n"),
            Frame::Bulk(Bytes::from("hello"))
        );
        assert_eq!(decode_all(b"$0\r\n\r\n"), Frame::Bulk(Bytes::new()));
        assert_eq!(decode_all(b"$-1\r\n"), Frame::NullBulk);
    }

    #[test]
    fn test_decode_arrays() {
        assert_eq!(
            decode_all(b"*3\r\n$7\r\nmessage\r\n$6\r\nalerts\r\n:12\r\n"),
            Frame::Array(vec![
                Frame::Bulk(Bytes::from("message")),
                Frame::Bulk(Bytes::from("alerts")),
                Frame::Integer(12),
            ])
        );
        assert_eq!(decode_all(b"*0\r\n"), Frame::Array(Vec::new()));
        assert_eq!(decode_all(b"*-1\r\n"), Frame::NullArray);
        assert_eq!(
            decode_all(b"*2\r\n*1\r\n+QUEUED\r\n:1\r\n"),
            Frame::Array(vec![
                Frame::Array(vec![Frame::Simple("QUEUED".to_string())]),
                Frame::Integer(1),
            ])
        );
    }

    #[test]
    fn test_decode_reports_consumed_length() {
        // only the first frame is consumed; the rest stays for the caller
        let (frame, used) = Frame::decode(b"+OK\r\n:5\r\n").unwrap();
        assert_eq!(frame, Frame::Simple("OK".to_string()));
        assert_eq!(used, 5);
    }

    #[test]
    fn test_partial_input_is_incomplete() {
        for bytes in [
            b"".as_slice(),
            b"+PON",
            b":12",
            b"$5\r\nhel",
            b"$5\r\nhello", // payload there, terminator missing
            b"*2\r\n:1\r\n",
        ] {
            assert!(
                matches!(Frame::decode(bytes), Err(Error::IncompleteFrame)),
                "{bytes:?} should be incomplete"
            );
        }
    }

    #[test]
    fn test_malformed_input_is_rejected() {
        assert!(matches!(Frame::decode(b"hello\r\n"), Err(Error::Protocol(_))));
        assert!(matches!(Frame::decode(b"$-2\r\n"), Err(Error::Protocol(_))));
        assert!(matches!(
            Frame::decode(b"$3\r\nabcXY"),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(Frame::decode(b"*x\r\n"), Err(Error::Protocol(_))));
        assert!(matches!(Frame::decode(b"\r\n"), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let frames = [
            Frame::Simple("OK".to_string()),
            Frame::Error("ERR no such key".to_string()),
            Frame::Integer(-42),
            Frame::Bulk(Bytes::from("payload")),
            Frame::Bulk(Bytes::new()),
            Frame::NullBulk,
            Frame::NullArray,
            Frame::Array(Vec::new()),
            Frame::Array(vec![
                Frame::Bulk(Bytes::from("subscribe")),
                Frame::Bulk(Bytes::from("alerts")),
                Frame::Integer(3),
                Frame::Array(vec![Frame::Simple("nested".to_string())]),
            ]),
        ];
        for frame in frames {
            let mut wire = BytesMut::new();
            frame.encode(&mut wire);
            let (back, used) = Frame::decode(&wire[..]).unwrap();
            assert_eq!(used, wire.len());
            assert_eq!(back, frame);
        }
    }

    #[test]
    fn test_command_into_frame() {
        let frame = Command::new("publish").arg("alerts").arg("fire").into_frame();
        assert_eq!(
            frame,
            Frame::Array(vec![
                Frame::Bulk(Bytes::from("publish")),
                Frame::Bulk(Bytes::from("alerts")),
                Frame::Bulk(Bytes::from("fire")),
            ])
        );
    }
}
