//! Newline framing as a tokio-util codec

use super::{decode_bytes, encode_line, Message, WireError};
use bytes::{BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Line terminator
pub const EOL: &[u8] = b"\n";

/// Longest accepted line; a longer unterminated line is unrecoverable garbage
pub const MAX_LINE_LENGTH: usize = 1 << 20;

/// Line codec producing one decoded message per line
///
/// Per-line decode failures are yielded as items so the connection can
/// answer them; only an overlong line is a stream error.
#[derive(Debug, Clone, Default)]
pub struct SecopCodec {
    // bytes already scanned for a terminator
    scanned: usize,
}

impl SecopCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for SecopCodec {
    type Item = Result<Message, WireError>;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, io::Error> {
        let newline = buf[self.scanned..].iter().position(|&b| b == b'\n');
        match newline {
            Some(offset) => {
                let end = self.scanned + offset;
                self.scanned = 0;
                let line = buf.split_to(end + 1);
                Ok(Some(decode_bytes(&line[..end])))
            }
            None if buf.len() > MAX_LINE_LENGTH => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line exceeds {MAX_LINE_LENGTH} bytes"),
            )),
            None => {
                self.scanned = buf.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, io::Error> {
        match self.decode(buf)? {
            Some(item) => Ok(Some(item)),
            None if buf.is_empty() => Ok(None),
            None => {
                // unterminated last line
                self.scanned = 0;
                let line = buf.split_to(buf.len());
                Ok(Some(decode_bytes(&line)))
            }
        }
    }
}

impl Encoder<Message> for SecopCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), io::Error> {
        let line = encode_line(&msg);
        dst.reserve(line.len() + EOL.len());
        dst.put_slice(line.as_bytes());
        dst.put_slice(EOL);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_lines_are_buffered() {
        let mut codec = SecopCodec::new();
        let mut buf = BytesMut::from(&b"read T:va"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"lue\nping 1\n");
        let first = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(first.action, "read");
        assert_eq!(first.specifier.as_deref(), Some("T:value"));

        let second = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(second.action, "ping");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_crlf_is_accepted() {
        let mut codec = SecopCodec::new();
        let mut buf = BytesMut::from(&b"describe\r\n"[..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(msg.action, "describe");
    }

    #[test]
    fn test_bad_line_does_not_poison_stream() {
        let mut codec = SecopCodec::new();
        let mut buf = BytesMut::from(&b"change a:b [1,\nread a:b\n"[..]);
        assert!(codec.decode(&mut buf).unwrap().unwrap().is_err());
        let ok = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(ok.action, "read");
    }

    #[test]
    fn test_overlong_line_is_fatal() {
        let mut codec = SecopCodec::new();
        let mut buf = BytesMut::from(vec![b'x'; MAX_LINE_LENGTH + 1].as_slice());
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_encoder_appends_terminator() {
        let mut codec = SecopCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Message::new("update", Some("m:p".into()), Some(json!([1, {}]))), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"update m:p [1,{}]\n");
    }
}
