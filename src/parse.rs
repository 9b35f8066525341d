use crate::{Error, Frame, Result};
use bytes::Bytes;

/// Walks the fields of a decoded array reply, one at a time.
#[derive(Debug)]
pub(crate) struct Parse {
    parts: std::vec::IntoIter<Frame>,
}

impl Parse {
    pub(crate) fn new(frame: Frame) -> Result<Parse> {
        let array = match frame {
            Frame::Array(array) => array,
            frame => return Err(Error::Protocol(format!("expected array, got {frame:?}"))),
        };

        Ok(Parse {
            parts: array.into_iter(),
        })
    }

    fn next(&mut self) -> Result<Frame> {
        self.parts
            .next()
            .ok_or_else(|| Error::Protocol("reply array ended early".to_string()))
    }

    pub(crate) fn next_string(&mut self) -> Result<String> {
        match self.next()? {
            Frame::Simple(s) => Ok(s),
            Frame::Bulk(data) => std::str::from_utf8(&data[..])
                .map(|s| s.to_string())
                .map_err(|e| Error::Protocol(e.to_string())),
            frame => Err(Error::Protocol(format!(
                "expected simple or bulk frame, got {frame:?}"
            ))),
        }
    }

    pub(crate) fn next_bytes(&mut self) -> Result<Bytes> {
        match self.next()? {
            Frame::Simple(s) => Ok(Bytes::from(s.into_bytes())),
            Frame::Bulk(data) => Ok(data),
            frame => Err(Error::Protocol(format!(
                "expected simple or bulk frame, got {frame:?}"
            ))),
        }
    }

    pub(crate) fn next_u64(&mut self) -> Result<u64> {
        use atoi::atoi;
        let invalid_number_err = || Error::Protocol("invalid number".to_string());

        match self.next()? {
            Frame::Integer(v) => u64::try_from(v).map_err(Error::from),
            Frame::Simple(data) => atoi::<u64>(data.as_bytes()).ok_or_else(invalid_number_err),
            Frame::Bulk(data) => atoi::<u64>(&data).ok_or_else(invalid_number_err),
            frame => Err(Error::Protocol(format!(
                "expected integer frame, got {frame:?}"
            ))),
        }
    }

    pub(crate) fn finish(&mut self) -> Result<()> {
        if self.parts.next().is_none() {
            Ok(())
        } else {
            Err(Error::Protocol("expected end of reply array".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walks_a_message_frame() {
        let frame = Frame::Array(vec![
            Frame::Bulk(Bytes::from("message")),
            Frame::Bulk(Bytes::from("news")),
            Frame::Bulk(Bytes::from("hello")),
        ]);
        let mut parse = Parse::new(frame).unwrap();
        assert_eq!(parse.next_string().unwrap(), "message");
        assert_eq!(parse.next_string().unwrap(), "news");
        assert_eq!(parse.next_bytes().unwrap(), Bytes::from("hello"));
        assert!(parse.finish().is_ok());
    }

    #[test]
    fn test_count_from_integer_frame() {
        let frame = Frame::Array(vec![
            Frame::Bulk(Bytes::from("subscribe")),
            Frame::Bulk(Bytes::from("news")),
            Frame::Integer(2),
        ]);
        let mut parse = Parse::new(frame).unwrap();
        parse.next_string().unwrap();
        parse.next_string().unwrap();
        assert_eq!(parse.next_u64().unwrap(), 2);
    }

    #[test]
    fn test_rejects_non_array() {
        assert!(Parse::new(Frame::Integer(1)).is_err());
    }

    #[test]
    fn test_finish_rejects_leftovers() {
        let frame = Frame::Array(vec![Frame::Integer(1), Frame::Integer(2)]);
        let mut parse = Parse::new(frame).unwrap();
        parse.next_u64().unwrap();
        assert!(parse.finish().is_err());
    }
}
