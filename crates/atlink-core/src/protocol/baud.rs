//! Baud rate detection
//!
//! Runs before the engine is opened. Each candidate speed gets a fresh raw link, a probe command
//! and a short deadline for the expected reply.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

use super::config::LinkConfig;
use super::link::{drain_input, Link};
use super::{serial, AtError, DEFAULT_DRAIN_IDLE_MS};

/// Parameters of a baud rate probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaudProbe {
    /// Speeds to try, in order
    pub candidates: Vec<u32>,
    /// Bytes sent at each speed
    pub command: Vec<u8>,
    /// Reply that confirms the speed
    pub expected_reply: Vec<u8>,
    /// Deadline for the whole reply at one speed
    pub timeout: Duration,
    /// Quiet period for the input drain before probing, `None` to skip it
    pub drain_idle: Option<Duration>,
}

impl Default for BaudProbe {
    fn default() -> Self {
        Self {
            candidates: vec![9600, 19200, 38400, 4800],
            command: b"AT\r\n".to_vec(),
            expected_reply: b"+OK\r".to_vec(),
            timeout: Duration::from_millis(300),
            drain_idle: Some(Duration::from_millis(DEFAULT_DRAIN_IDLE_MS)),
        }
    }
}

impl BaudProbe {
    /// Probe for a modem behind the Tower SDK host firmware, which answers `OK` itself
    pub fn tower_sdk() -> Self {
        Self {
            candidates: vec![115200, 57600, 38400, 19200, 9600],
            expected_reply: b"OK\r".to_vec(),
            ..Self::default()
        }
    }
}

/// Find the speed the modem answers at.
///
/// `open` is called once per candidate to get a raw link at that speed. The first candidate that
/// returns the complete expected reply wins and later candidates are not tried. Returns
/// `Ok(None)` when no candidate answers.
pub async fn detect_baud<L, F>(mut open: F, probe: &BaudProbe) -> Result<Option<u32>, AtError>
where
    L: Link,
    F: FnMut(u32) -> Result<L, AtError>,
{
    for &speed in &probe.candidates {
        let mut link = open(speed)?;
        if probe_link(&mut link, probe).await? {
            tracing::info!(speed, "baud rate detected");
            return Ok(Some(speed));
        }
        tracing::debug!(speed, "incorrect response");
    }

    tracing::warn!(candidates = ?probe.candidates, "could not detect baud rate");
    Ok(None)
}

/// Detect the baud rate of a serial port
pub async fn detect_serial_baud(
    path: &str,
    link: &LinkConfig,
    probe: &BaudProbe,
) -> Result<Option<u32>, AtError> {
    detect_baud(|speed| serial::open_port(path, speed, link), probe).await
}

async fn probe_link<L: Link>(link: &mut L, probe: &BaudProbe) -> Result<bool, AtError> {
    link.clear_buffers()?;
    if let Some(idle) = probe.drain_idle {
        drain_input(link, idle).await?;
    }

    link.write_all(&probe.command).await?;
    link.flush().await?;

    let deadline = Instant::now() + probe.timeout;
    for &expected in &probe.expected_reply {
        match tokio::time::timeout_at(deadline, link.read_u8()).await {
            Ok(Ok(byte)) if byte == expected => {}
            _ => return Ok(false),
        }
    }
    Ok(true)
}
