//! Response channel
//!
//! Lines that are not notifications are handed from the reader task to the command currently in
//! flight. The channel only accepts lines while a command slot is open; a line that arrives with
//! nobody waiting for it is logged and dropped instead of being mistaken for the reply to the
//! next command.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{AtError, DeviceError};

const OK: &[u8] = b"+OK";
const OK_VALUE: &[u8] = b"+OK=";
const ERR: &[u8] = b"+ERR=";
const HOST_OK: &[u8] = b"OK";
const HOST_ERROR: &[u8] = b"ERROR";

/// A successful reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Bare `+OK`
    Ok,
    /// `+OK=<value>`
    Value(String),
    /// Lines of a multi-line reply, without the terminating `+OK`
    Body(Vec<String>),
}

impl Reply {
    /// The value of a `+OK=<value>` reply
    pub fn value(&self) -> Option<&str> {
        match self {
            Reply::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Take the value of a `+OK=<value>` reply
    pub fn into_value(self) -> Option<String> {
        match self {
            Reply::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Body lines of a multi-line reply, empty for inline replies
    pub fn lines(&self) -> &[String] {
        match self {
            Reply::Body(lines) => lines,
            _ => &[],
        }
    }
}

/// Create a connected sink/channel pair
pub(crate) fn channel() -> (ResponseSink, ResponseChannel) {
    let (tx, rx) = mpsc::unbounded_channel();
    let open = Arc::new(Mutex::new(false));
    (
        ResponseSink {
            tx,
            open: open.clone(),
        },
        ResponseChannel { rx, open },
    )
}

/// Writer side, owned by the demultiplexer
#[derive(Debug)]
pub(crate) struct ResponseSink {
    tx: mpsc::UnboundedSender<Bytes>,
    open: Arc<Mutex<bool>>,
}

impl ResponseSink {
    /// Queue a line for the command in flight. Returns false if it was dropped.
    pub fn push(&self, line: Bytes) -> bool {
        let open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if !*open {
            tracing::warn!(
                line = %String::from_utf8_lossy(&line),
                "dropping response line with no command in flight"
            );
            return false;
        }
        self.tx.send(line).is_ok()
    }
}

/// Reader side, owned by whoever holds the exchange lock
#[derive(Debug)]
pub struct ResponseChannel {
    rx: mpsc::UnboundedReceiver<Bytes>,
    open: Arc<Mutex<bool>>,
}

impl ResponseChannel {
    /// Start accepting lines for a new command, discarding anything stale
    pub(crate) fn open_slot(&mut self) {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        while let Ok(stale) = self.rx.try_recv() {
            tracing::warn!(
                line = %String::from_utf8_lossy(&stale),
                "discarding stale response line"
            );
        }
        *open = true;
    }

    pub(crate) fn close_slot(&mut self) {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    async fn next_line(&mut self, timeout: Duration, what: &'static str) -> Result<Bytes, AtError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(line)) => Ok(line),
            Ok(None) => Err(AtError::Transport("reader stopped".to_string())),
            Err(_) => Err(AtError::Timeout(what)),
        }
    }

    /// Read a single-line reply
    pub async fn read_inline(&mut self, timeout: Duration) -> Result<Reply, AtError> {
        let line = self.next_line(timeout, "no response received").await?;
        parse_inline(&line)
    }

    /// Read lines up to the terminating `+OK`
    pub async fn read_multiline(&mut self, timeout: Duration) -> Result<Reply, AtError> {
        let mut body = Vec::new();
        loop {
            let line = self
                .next_line(timeout, "incomplete response received")
                .await?;

            if body.is_empty() && line.starts_with(ERR) {
                return Err(parse_error(&line));
            }
            if line.as_ref() == OK {
                return Ok(Reply::Body(body));
            }
            body.push(String::from_utf8_lossy(&line).into_owned());
        }
    }

    /// Read a host firmware reply: any lines up to `OK`, or `ERROR`
    pub async fn read_host(&mut self, timeout: Duration) -> Result<Vec<String>, AtError> {
        let mut body = Vec::new();
        loop {
            let line = self
                .next_line(timeout, "incomplete host response received")
                .await?;
            match &line[..] {
                HOST_OK => return Ok(body),
                HOST_ERROR => {
                    return Err(AtError::Host(format!(
                        "ERROR after {} lines",
                        body.len()
                    )))
                }
                _ => body.push(String::from_utf8_lossy(&line).into_owned()),
            }
        }
    }
}

fn parse_inline(line: &[u8]) -> Result<Reply, AtError> {
    if line.starts_with(ERR) && line.len() > ERR.len() {
        Err(parse_error(line))
    } else if line == OK {
        Ok(Reply::Ok)
    } else if line.starts_with(OK_VALUE) && line.len() > OK_VALUE.len() {
        Ok(Reply::Value(
            String::from_utf8_lossy(&line[OK_VALUE.len()..]).into_owned(),
        ))
    } else {
        Err(AtError::Protocol(format!(
            "invalid response {:?}",
            String::from_utf8_lossy(line)
        )))
    }
}

fn parse_error(line: &[u8]) -> AtError {
    let code = std::str::from_utf8(&line[ERR.len()..])
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok());
    match code {
        Some(code) => AtError::Device(DeviceError::new(code)),
        None => AtError::Protocol(format!(
            "malformed error reply {:?}",
            String::from_utf8_lossy(line)
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DeviceErrorKind;
    use pretty_assertions::assert_eq;

    const TIMEOUT: Duration = Duration::from_millis(50);

    fn open_pair() -> (ResponseSink, ResponseChannel) {
        let (sink, mut channel) = channel();
        channel.open_slot();
        (sink, channel)
    }

    fn feed(sink: &ResponseSink, lines: &[&str]) {
        for line in lines {
            assert!(sink.push(Bytes::copy_from_slice(line.as_bytes())));
        }
    }

    #[tokio::test]
    async fn test_inline_ok_and_value() {
        let (sink, mut channel) = open_pair();
        feed(&sink, &["+OK", "+OK=5"]);
        assert_eq!(channel.read_inline(TIMEOUT).await.unwrap(), Reply::Ok);
        assert_eq!(
            channel.read_inline(TIMEOUT).await.unwrap(),
            Reply::Value("5".to_string())
        );
    }

    #[tokio::test]
    async fn test_inline_device_error() {
        let (sink, mut channel) = open_pair();
        feed(&sink, &["+ERR=-5"]);
        let err = channel.read_inline(TIMEOUT).await.unwrap_err();
        let device = err.device_error().copied().unwrap();
        assert_eq!(device.code(), -5);
        assert_eq!(device.kind(), DeviceErrorKind::NotJoined);
        assert!(channel.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_inline_invalid() {
        let (sink, mut channel) = open_pair();
        feed(&sink, &["hello", "+OK=", "+ERR=x"]);
        for _ in 0..3 {
            let err = channel.read_inline(TIMEOUT).await.unwrap_err();
            assert!(matches!(err, AtError::Protocol(_)), "{err:?}");
        }
    }

    #[tokio::test]
    async fn test_multiline_body() {
        let (sink, mut channel) = open_pair();
        feed(&sink, &["1.1.06", "Aug 24 2020", "+ERR=-3", "+OK"]);
        let reply = channel.read_multiline(TIMEOUT).await.unwrap();
        assert_eq!(reply.lines(), ["1.1.06", "Aug 24 2020", "+ERR=-3"]);
    }

    #[tokio::test]
    async fn test_multiline_first_line_error() {
        let (sink, mut channel) = open_pair();
        feed(&sink, &["+ERR=-1"]);
        let err = channel.read_multiline(TIMEOUT).await.unwrap_err();
        assert_eq!(
            err.device_error().map(|e| e.kind()),
            Some(DeviceErrorKind::UnknownCommand)
        );
    }

    #[tokio::test]
    async fn test_multiline_timeout_on_missing_terminator() {
        let (sink, mut channel) = open_pair();
        feed(&sink, &["partial"]);
        let err = channel.read_multiline(TIMEOUT).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_host_reply() {
        let (sink, mut channel) = open_pair();
        feed(&sink, &["$LORA>ATCI=1", "OK", "ERROR"]);
        assert_eq!(
            channel.read_host(TIMEOUT).await.unwrap(),
            vec!["$LORA>ATCI=1".to_string()]
        );
        let err = channel.read_host(TIMEOUT).await.unwrap_err();
        assert!(matches!(err, AtError::Host(_)));
        assert!(channel.read_host(TIMEOUT).await.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_closed_slot_drops_lines() {
        let (sink, mut channel) = channel();
        assert!(!sink.push(Bytes::from_static(b"+OK")));
        channel.open_slot();
        assert!(channel.read_inline(TIMEOUT).await.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_open_slot_discards_stale_lines() {
        let (sink, mut channel) = open_pair();
        feed(&sink, &["+OK=stale"]);
        channel.close_slot();
        channel.open_slot();
        feed(&sink, &["+OK=fresh"]);
        assert_eq!(
            channel.read_inline(TIMEOUT).await.unwrap(),
            Reply::Value("fresh".to_string())
        );
    }

    #[tokio::test]
    async fn test_sender_gone_is_transport_failure() {
        let (sink, mut channel) = open_pair();
        drop(sink);
        assert!(channel.read_inline(TIMEOUT).await.unwrap_err().is_transport());
    }
}
