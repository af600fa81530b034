//! Engine and link configuration
//!
//! Every knob the engine uses is injected through these structs. Both deserialize from JSON with
//! missing fields falling back to their defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{
    AtError, DEFAULT_DRAIN_IDLE_MS, DEFAULT_MAX_PAYLOAD, DEFAULT_TIMEOUT_MS, MAX_LINE_LENGTH,
};

/// Serial control line levels applied after a port is opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// RTS level, or `None` to leave it alone
    pub rts: Option<bool>,
    /// DTR level, or `None` to leave it alone
    pub dtr: Option<bool>,
}

/// Command engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModemConfig {
    /// Minimum spacing between a reply and the next command, in milliseconds.
    /// The stock Type ABZ firmware misreads commands sent right after a reply.
    pub guard_ms: Option<u64>,
    /// Reply timeout used by [`Modem::command`](super::Modem::command)
    pub timeout_ms: u64,
    /// Bytes written in front of every command
    pub command_prefix: String,
    /// Quiet period that ends the input drain on open; 0 skips the drain
    pub drain_idle_ms: u64,
    /// Longest line the reader accumulates before discarding it
    pub max_line_length: usize,
    /// Largest downlink payload a `+RECV` may announce
    pub max_payload: usize,
    /// Control lines for the serial port
    pub link: LinkConfig,
    /// Set when the modem is reached through a host firmware tunnel
    pub tunnel: Option<TunnelConfig>,
}

/// AT interface tunnelled through a host MCU firmware (HARDWARIO Tower SDK).
///
/// Modem lines arrive with `line_prefix` in front; every other line is a reply from the host
/// firmware itself and goes to a separate channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Prefix the host puts in front of lines coming from the modem
    pub line_prefix: String,
    /// Host command sent after opening, without the `AT`
    pub enable_command: Option<String>,
    /// Host command sent before closing, without the `AT`
    pub disable_command: Option<String>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            line_prefix: "$LORA: ".to_string(),
            enable_command: Some("$LORA>ATCI=1".to_string()),
            disable_command: Some("$LORA>ATCI=0".to_string()),
        }
    }
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            guard_ms: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            command_prefix: "AT".to_string(),
            drain_idle_ms: DEFAULT_DRAIN_IDLE_MS,
            max_line_length: MAX_LINE_LENGTH,
            max_payload: DEFAULT_MAX_PAYLOAD,
            link: LinkConfig::default(),
            tunnel: None,
        }
    }
}

impl ModemConfig {
    /// Parse a JSON configuration
    pub fn from_json(json: &str) -> Result<Self, AtError> {
        serde_json::from_str(json).map_err(|e| AtError::Config(e.to_string()))
    }

    /// Load a JSON configuration file
    pub fn from_file(path: &Path) -> Result<Self, AtError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Configuration for a modem behind the Tower SDK host firmware
    pub fn tower_sdk() -> Self {
        Self {
            command_prefix: "AT$LORA AT".to_string(),
            tunnel: Some(TunnelConfig::default()),
            ..Self::default()
        }
    }

    /// Guard interval, if enabled
    pub fn guard(&self) -> Option<Duration> {
        self.guard_ms.map(Duration::from_millis)
    }

    /// Default reply timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Drain quiet period, or `None` when draining is disabled
    pub fn drain_idle(&self) -> Option<Duration> {
        (self.drain_idle_ms > 0).then(|| Duration::from_millis(self.drain_idle_ms))
    }
}
