//! Line framing
//!
//! Turns the modem's byte stream into lines. CR bytes are dropped, LF ends a line, and empty
//! lines are skipped. Binary payloads announced by `+RECV` are not line framed: the caller
//! switches the codec into raw mode with [`LineCodec::expect_raw`] and the next frame is exactly
//! that many bytes, terminators included.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use super::{AtError, MAX_LINE_LENGTH};

const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// A unit produced by the line reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A non-empty line without its terminators
    Line(Bytes),
    /// Raw bytes requested through [`LineCodec::expect_raw`]
    Raw(Bytes),
}

/// Stateful line decoder for AT traffic
#[derive(Debug)]
pub struct LineCodec {
    line: BytesMut,
    raw_pending: Option<usize>,
    max_line_length: usize,
    discarding: bool,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(MAX_LINE_LENGTH)
    }
}

impl LineCodec {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            line: BytesMut::new(),
            raw_pending: None,
            max_line_length,
            discarding: false,
        }
    }

    /// Deliver the next `len` bytes as a single [`Frame::Raw`], bypassing line framing
    pub fn expect_raw(&mut self, len: usize) {
        self.raw_pending = Some(len);
    }

    fn decode_raw(&mut self, len: usize, src: &mut BytesMut) -> Option<Frame> {
        if src.len() < len {
            src.reserve(len - src.len());
            return None;
        }
        self.raw_pending = None;
        Some(Frame::Raw(src.split_to(len).freeze()))
    }
}

impl Decoder for LineCodec {
    type Item = Frame;
    type Error = AtError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, AtError> {
        if let Some(len) = self.raw_pending {
            return Ok(self.decode_raw(len, src));
        }

        let mut consumed = 0;
        while consumed < src.len() {
            let byte = src[consumed];
            consumed += 1;

            match byte {
                CR => {}
                LF if self.discarding => {
                    self.discarding = false;
                    self.line.clear();
                }
                LF if self.line.is_empty() => {}
                LF => {
                    src.advance(consumed);
                    return Ok(Some(Frame::Line(self.line.split().freeze())));
                }
                _ if self.discarding => {}
                _ => {
                    if self.line.len() >= self.max_line_length {
                        tracing::warn!(
                            max = self.max_line_length,
                            "line too long, discarding until next terminator"
                        );
                        self.discarding = true;
                        self.line.clear();
                    } else {
                        self.line.extend_from_slice(&[byte]);
                    }
                }
            }
        }

        src.advance(consumed);
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, AtError> {
        if let Some(len) = self.raw_pending {
            if src.len() < len {
                return Err(AtError::Transport(format!(
                    "short read: expected {} payload bytes, link closed after {}",
                    len,
                    src.len()
                )));
            }
        }

        let frame = self.decode(src)?;
        if frame.is_none() && !self.line.is_empty() {
            tracing::debug!(
                pending = self.line.len(),
                "discarding unterminated line at end of stream"
            );
            self.line.clear();
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn line(s: &str) -> Frame {
        Frame::Line(Bytes::copy_from_slice(s.as_bytes()))
    }

    fn decode_all(codec: &mut LineCodec, buf: &mut BytesMut) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_crlf_lines() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"+OK\r\n+EVENT=0,0\r\n"[..]);
        assert_eq!(
            decode_all(&mut codec, &mut buf),
            vec![line("+OK"), line("+EVENT=0,0")]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_stray_terminators_are_skipped() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"\r\n\n\r\r+OK\n\n"[..]);
        assert_eq!(decode_all(&mut codec, &mut buf), vec![line("+OK")]);
    }

    #[test]
    fn test_line_split_across_reads() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"+OK=1.2"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b".3\r");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(line("+OK=1.2.3")));
    }

    #[test]
    fn test_raw_mode_keeps_terminators() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"+RECV=2,4\r\n\r\n\r\nab+OK\r\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(line("+RECV=2,4")));

        codec.expect_raw(6);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Raw(Bytes::from_static(b"\r\n\r\nab")))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(line("+OK")));
    }

    #[test]
    fn test_raw_mode_waits_for_all_bytes() {
        let mut codec = LineCodec::default();
        codec.expect_raw(4);
        let mut buf = BytesMut::from(&b"\r\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"xy");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Raw(Bytes::from_static(b"\r\nxy")))
        );
    }

    #[test]
    fn test_short_raw_read_at_eof_is_fatal() {
        let mut codec = LineCodec::default();
        codec.expect_raw(8);
        let mut buf = BytesMut::from(&b"\r\nabc"[..]);
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn test_overlong_line_is_discarded() {
        let mut codec = LineCodec::new(4);
        let mut buf = BytesMut::from(&b"abcdefgh\r\n+OK\r\n"[..]);
        assert_eq!(decode_all(&mut codec, &mut buf), vec![line("+OK")]);
    }

    #[test]
    fn test_unterminated_line_at_eof() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"+OK"[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }
}
