//! Line demultiplexer
//!
//! Every line read from the modem is either an asynchronous notification or part of a command
//! reply. Notifications are recognized by prefix, checked in this order:
//!
//! | prefix    | published as                                          |
//! |-----------|-------------------------------------------------------|
//! | `+EVENT`  | `event`, `event=<subsystem>`, `event=<subsystem>,<code>` |
//! | `+ANS`    | `answer` with the integer parameters                  |
//! | `+ACK`    | `ack` with `true`                                     |
//! | `+NOACK`  | `ack` with `false`                                    |
//! | `+RECV`   | `message` with the port and the binary payload        |
//!
//! Anything else goes to the response channel.
//!
//! Behind a host firmware tunnel only lines carrying the tunnel prefix come from the modem. The
//! prefix is stripped before classification and all other lines go to the host channel.

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;

use super::framing::{Frame, LineCodec};
use super::redact::Redactor;
use super::response::ResponseSink;
use super::AtError;
use crate::events::{names, Arg, EventBus};

const EVENT: &[u8] = b"+EVENT";
const ANSWER: &[u8] = b"+ANS";
const ACK: &[u8] = b"+ACK";
const NOACK: &[u8] = b"+NOACK";
const RECEIVE: &[u8] = b"+RECV";

/// The modem sends an empty line between `+RECV` and the payload
pub const RECEIVE_PADDING: usize = 2;

/// An asynchronous notification line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// `+EVENT` with either no parameters or `(subsystem, code)`
    Event(Option<(i64, i64)>),
    /// `+ANS` with its integer parameters
    Answer(Vec<i64>),
    /// `+ACK` (true) or `+NOACK` (false)
    Ack(bool),
    /// `+RECV=<port>,<size>`; `size` payload bytes follow after the padding
    Receive {
        /// LoRaWAN port
        port: i64,
        /// Payload length
        size: usize,
    },
}

/// Result of classifying a line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    /// Goes to the event bus
    Notification(Notification),
    /// Goes to the command in flight
    Response,
}

/// Classify a line by prefix.
///
/// A `+RECV` announcing more than `max_payload` bytes is a protocol violation.
pub fn classify(line: &[u8], max_payload: usize) -> Result<Classified, AtError> {
    let notification = if let Some(rest) = line.strip_prefix(EVENT) {
        let params = parse_params(rest)?;
        match params.as_slice() {
            [] => Notification::Event(None),
            [subsystem, code] => Notification::Event(Some((*subsystem, *code))),
            _ => {
                return Err(AtError::Protocol(format!(
                    "event with {} parameters",
                    params.len()
                )))
            }
        }
    } else if let Some(rest) = line.strip_prefix(ANSWER) {
        let params = parse_params(rest)?;
        if params.is_empty() {
            return Err(AtError::Protocol("answer without parameters".to_string()));
        }
        Notification::Answer(params)
    } else if line.starts_with(ACK) {
        Notification::Ack(true)
    } else if line.starts_with(NOACK) {
        Notification::Ack(false)
    } else if let Some(rest) = line.strip_prefix(RECEIVE) {
        match parse_params(rest)?.as_slice() {
            [port, size] if *size >= 0 => {
                let size = usize::try_from(*size)
                    .ok()
                    .filter(|size| *size <= max_payload)
                    .ok_or_else(|| {
                        AtError::Protocol(format!(
                            "receive of {size} bytes exceeds the {max_payload} byte limit"
                        ))
                    })?;
                Notification::Receive { port: *port, size }
            }
            _ => {
                return Err(AtError::Protocol(format!(
                    "malformed receive notification {:?}",
                    String::from_utf8_lossy(line)
                )))
            }
        }
    } else {
        return Ok(Classified::Response);
    };

    Ok(Classified::Notification(notification))
}

/// Parse `=a,b,c` (the leading `=` is optional) into integers
fn parse_params(rest: &[u8]) -> Result<Vec<i64>, AtError> {
    let rest = rest.strip_prefix(b"=").unwrap_or(rest);
    if rest.is_empty() {
        return Ok(Vec::new());
    }

    let text = std::str::from_utf8(rest)
        .map_err(|_| AtError::Protocol("non-ASCII notification parameters".to_string()))?;
    text.split(',')
        .map(|p| {
            p.trim()
                .parse::<i64>()
                .map_err(|_| AtError::Protocol(format!("invalid parameter {p:?}")))
        })
        .collect()
}

/// A `+RECV` whose payload still has to be read from the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingReceive {
    /// LoRaWAN port
    pub port: i64,
    /// Payload length, without the padding
    pub size: usize,
}

#[derive(Debug)]
struct Tunnel {
    prefix: Bytes,
    host: ResponseSink,
}

/// Routes lines to the event bus or the response channel
#[derive(Debug)]
pub(crate) struct Demultiplexer {
    events: EventBus,
    responses: ResponseSink,
    redactor: Redactor,
    max_payload: usize,
    tunnel: Option<Tunnel>,
}

impl Demultiplexer {
    pub fn new(
        events: EventBus,
        responses: ResponseSink,
        redactor: Redactor,
        max_payload: usize,
    ) -> Self {
        Self {
            events,
            responses,
            redactor,
            max_payload,
            tunnel: None,
        }
    }

    /// Only accept modem lines carrying `prefix`; hand the rest to `host`
    pub fn with_tunnel(mut self, prefix: &str, host: ResponseSink) -> Self {
        self.tunnel = Some(Tunnel {
            prefix: Bytes::copy_from_slice(prefix.as_bytes()),
            host,
        });
        self
    }

    /// Act on one line. Returns the pending receive if payload bytes must be read next.
    pub fn dispatch(&self, line: Bytes) -> Result<Option<PendingReceive>, AtError> {
        let line = match &self.tunnel {
            Some(tunnel) if line.starts_with(&tunnel.prefix) => line.slice(tunnel.prefix.len()..),
            Some(tunnel) => {
                tunnel.host.push(line);
                return Ok(None);
            }
            None => line,
        };

        let notification = match classify(&line, self.max_payload)? {
            Classified::Response => {
                self.responses.push(line);
                return Ok(None);
            }
            Classified::Notification(n) => n,
        };

        match notification {
            Notification::Event(None) => {
                self.events.publish(names::EVENT, &[]);
            }
            Notification::Event(Some((subsystem, code))) => {
                self.events
                    .publish(names::EVENT, &[Arg::Int(subsystem), Arg::Int(code)]);
                self.events
                    .publish(&names::event_scope(subsystem), &[Arg::Int(code)]);
                self.events
                    .publish(&names::event_qualified(subsystem, code), &[]);
            }
            Notification::Answer(params) => {
                let args: Vec<Arg> = params.into_iter().map(Arg::Int).collect();
                self.events.publish(names::ANSWER, &args);
            }
            Notification::Ack(acked) => {
                self.events.publish(names::ACK, &[Arg::Bool(acked)]);
            }
            Notification::Receive { port, size } => {
                return Ok(Some(PendingReceive { port, size }));
            }
        }
        Ok(None)
    }

    /// Publish a received downlink. `raw` holds the padding followed by the payload.
    pub fn deliver(&self, pending: PendingReceive, raw: Bytes) {
        let payload = raw.slice(RECEIVE_PADDING.min(raw.len())..);
        self.events.publish(
            names::MESSAGE,
            &[Arg::Int(pending.port), Arg::Bytes(payload)],
        );
    }

    /// Reader loop. Runs until the link fails and returns the reason.
    ///
    /// A malformed notification is logged and skipped; only transport failures end the loop.
    pub async fn run<R>(self, mut frames: FramedRead<R, LineCodec>) -> AtError
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let line = match frames.next().await {
                Some(Ok(Frame::Line(line))) => line,
                Some(Ok(Frame::Raw(raw))) => {
                    tracing::warn!(len = raw.len(), "ignoring unexpected raw frame");
                    continue;
                }
                Some(Err(e)) => return e,
                None => return AtError::Transport("link closed".to_string()),
            };

            tracing::debug!("> {}", self.redactor.display(&line));

            let pending = match self.dispatch(line) {
                Ok(Some(pending)) => pending,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring reader error");
                    continue;
                }
            };

            let Some(expected) = pending.size.checked_add(RECEIVE_PADDING) else {
                tracing::warn!(size = pending.size, "ignoring receive with impossible size");
                continue;
            };
            frames.decoder_mut().expect_raw(expected);
            match frames.next().await {
                Some(Ok(Frame::Raw(raw))) => {
                    tracing::debug!(port = pending.port, size = pending.size, "downlink received");
                    self.deliver(pending, raw);
                }
                Some(Ok(Frame::Line(_))) | None => {
                    return AtError::Transport(format!(
                        "short read: expected {expected} payload bytes"
                    ))
                }
                Some(Err(e)) => return e,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::response::{self, ResponseChannel};
    use crate::protocol::Reply;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    const MAX_PAYLOAD: usize = 16;

    fn classify_line(line: &[u8]) -> Result<Classified, AtError> {
        classify(line, MAX_PAYLOAD)
    }

    fn demux() -> (Demultiplexer, EventBus, ResponseChannel) {
        let bus = EventBus::new();
        let (sink, mut channel) = response::channel();
        channel.open_slot();
        (
            Demultiplexer::new(bus.clone(), sink, Redactor::default(), MAX_PAYLOAD),
            bus,
            channel,
        )
    }

    fn record(bus: &EventBus, names: &[&str]) -> Arc<Mutex<Vec<(String, Vec<Arg>)>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in names {
            let log = log.clone();
            let owned = name.to_string();
            bus.subscribe(name, move |args: &[Arg]| {
                log.lock().unwrap().push((owned.clone(), args.to_vec()));
            });
        }
        log
    }

    #[test]
    fn test_classify_precedence() {
        assert_eq!(
            classify_line(b"+EVENT=0,0").unwrap(),
            Classified::Notification(Notification::Event(Some((0, 0))))
        );
        assert_eq!(
            classify_line(b"+EVENT").unwrap(),
            Classified::Notification(Notification::Event(None))
        );
        assert_eq!(
            classify_line(b"+ANS=2,10,1").unwrap(),
            Classified::Notification(Notification::Answer(vec![2, 10, 1]))
        );
        assert_eq!(
            classify_line(b"+ACK").unwrap(),
            Classified::Notification(Notification::Ack(true))
        );
        assert_eq!(
            classify_line(b"+NOACK").unwrap(),
            Classified::Notification(Notification::Ack(false))
        );
        assert_eq!(
            classify_line(b"+RECV=2,6").unwrap(),
            Classified::Notification(Notification::Receive { port: 2, size: 6 })
        );
        for line in [&b"+OK"[..], b"+OK=+EVENT", b"+ERR=-1", b"1.1.06", b"EVENT=1,1"] {
            assert_eq!(classify_line(line).unwrap(), Classified::Response);
        }
    }

    #[test]
    fn test_classify_rejects_bad_event_parameters() {
        assert!(matches!(classify_line(b"+EVENT=1"), Err(AtError::Protocol(_))));
        assert!(matches!(classify_line(b"+EVENT=1,2,3"), Err(AtError::Protocol(_))));
        assert!(matches!(classify_line(b"+EVENT=a,b"), Err(AtError::Protocol(_))));
        assert!(matches!(classify_line(b"+RECV=2,-1"), Err(AtError::Protocol(_))));
    }

    #[test]
    fn test_classify_rejects_oversized_receive() {
        assert_eq!(
            classify(b"+RECV=1,16", 16).unwrap(),
            Classified::Notification(Notification::Receive { port: 1, size: 16 })
        );
        assert!(matches!(classify(b"+RECV=1,17", 16), Err(AtError::Protocol(_))));
        assert!(matches!(
            classify(b"+RECV=1,9223372036854775807", 256),
            Err(AtError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_tunnel_routes_by_prefix() {
        let bus = EventBus::new();
        let (sink, mut channel) = response::channel();
        let (host_sink, mut host) = response::channel();
        channel.open_slot();
        host.open_slot();
        let demux = Demultiplexer::new(bus.clone(), sink, Redactor::default(), MAX_PAYLOAD)
            .with_tunnel("$LORA: ", host_sink);
        let log = record(&bus, &["ack"]);

        demux.dispatch(Bytes::from_static(b"$LORA: +ACK")).unwrap();
        demux.dispatch(Bytes::from_static(b"$LORA: +OK=5")).unwrap();
        demux.dispatch(Bytes::from_static(b"OK")).unwrap();
        demux.dispatch(Bytes::from_static(b"+ACK")).unwrap();

        assert_eq!(*log.lock().unwrap(), vec![("ack".to_string(), vec![Arg::Bool(true)])]);
        let timeout = Duration::from_millis(10);
        assert_eq!(channel.read_inline(timeout).await.unwrap(), Reply::Value("5".into()));
        assert!(host.read_host(timeout).await.unwrap().is_empty());
        assert!(channel.read_inline(timeout).await.unwrap_err().is_timeout());
    }

    #[test]
    fn test_event_publishes_three_names_in_order() {
        let (demux, bus, _channel) = demux();
        let log = record(&bus, &["event", "event=1", "event=1,1"]);

        demux.dispatch(Bytes::from_static(b"+EVENT=1,1")).unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                ("event".to_string(), vec![Arg::Int(1), Arg::Int(1)]),
                ("event=1".to_string(), vec![Arg::Int(1)]),
                ("event=1,1".to_string(), vec![]),
            ]
        );
    }

    #[test]
    fn test_answer_and_ack() {
        let (demux, bus, _channel) = demux();
        let log = record(&bus, &["answer", "ack"]);

        demux.dispatch(Bytes::from_static(b"+ANS=2,10,1")).unwrap();
        demux.dispatch(Bytes::from_static(b"+NOACK")).unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                (
                    "answer".to_string(),
                    vec![Arg::Int(2), Arg::Int(10), Arg::Int(1)]
                ),
                ("ack".to_string(), vec![Arg::Bool(false)]),
            ]
        );
    }

    #[tokio::test]
    async fn test_plain_lines_go_to_response_channel_in_order() {
        let (demux, bus, mut channel) = demux();
        let log = record(&bus, &["event", "answer", "ack", "message"]);

        for line in ["+OK=1", "+OK=2", "+OK"] {
            assert_eq!(demux.dispatch(Bytes::from(line)).unwrap(), None);
        }

        let timeout = Duration::from_millis(10);
        assert_eq!(channel.read_inline(timeout).await.unwrap(), Reply::Value("1".into()));
        assert_eq!(channel.read_inline(timeout).await.unwrap(), Reply::Value("2".into()));
        assert_eq!(channel.read_inline(timeout).await.unwrap(), Reply::Ok);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_reads_receive_payload() {
        let (demux, bus, mut channel) = demux();
        let log = record(&bus, &["message"]);
        let (host, mut device) = tokio::io::duplex(256);
        let reader = tokio::spawn(demux.run(FramedRead::new(host, LineCodec::default())));

        // size=6: 8 bytes follow, the first two are padding
        device.write_all(b"+RECV=3,6\r\n").await.unwrap();
        device.write_all(b"\r\nab\r\ncd").await.unwrap();
        device.write_all(b"+OK\r\n").await.unwrap();

        let reply = channel
            .read_inline(Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Ok);
        assert_eq!(
            *log.lock().unwrap(),
            vec![(
                "message".to_string(),
                vec![Arg::Int(3), Arg::Bytes(Bytes::from_static(b"ab\r\ncd"))]
            )]
        );

        drop(device);
        let err = reader.await.unwrap();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_run_survives_malformed_event() {
        let (demux, _bus, mut channel) = demux();
        let (host, mut device) = tokio::io::duplex(256);
        let _reader = tokio::spawn(demux.run(FramedRead::new(host, LineCodec::default())));

        device.write_all(b"+EVENT=1,2,3\r\n+OK=alive\r\n").await.unwrap();

        let reply = channel
            .read_inline(Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Value("alive".into()));
    }

    #[tokio::test]
    async fn test_run_short_receive_is_fatal() {
        let (demux, _bus, _channel) = demux();
        let (host, mut device) = tokio::io::duplex(256);
        let reader = tokio::spawn(demux.run(FramedRead::new(host, LineCodec::default())));

        device.write_all(b"+RECV=1,10\r\n\r\nabc").await.unwrap();
        drop(device);

        let err = reader.await.unwrap();
        assert!(matches!(err, AtError::Transport(msg) if msg.contains("short read")));
    }

    #[tokio::test]
    async fn test_run_survives_oversized_receive() {
        let (demux, _bus, mut channel) = demux();
        let (host, mut device) = tokio::io::duplex(256);
        let reader = tokio::spawn(demux.run(FramedRead::new(host, LineCodec::default())));

        device
            .write_all(b"+RECV=1,9223372036854775807\r\n+OK=alive\r\n")
            .await
            .unwrap();

        let reply = channel
            .read_inline(Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Value("alive".into()));
        assert!(!reader.is_finished());
    }
}
