//! AT command transport
//!
//! Implements the line-oriented AT protocol spoken by Murata Type ABZ LoRaWAN modems.
//!
//! A single serial link carries command replies, asynchronous notifications and raw downlink
//! payloads. The [`Modem`] engine splits them apart and serialises command exchanges.

pub mod baud;
pub mod config;
pub mod demux;
mod error;
pub mod framing;
pub mod link;
mod modem;
mod redact;
mod response;
pub mod serial;

pub use baud::{detect_baud, detect_serial_baud, BaudProbe};
pub use config::{LinkConfig, ModemConfig, TunnelConfig};
pub use demux::{classify, Classified, Notification};
pub use error::{AtError, DeviceError, DeviceErrorKind};
pub use framing::{Frame, LineCodec};
pub use link::{drain_input, Link};
pub use modem::{Modem, Session};
pub use redact::{redact, SecretGuard};
pub use response::Reply;
pub use serial::open_port;

/// Default reply timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Default quiet period that ends an input drain, in milliseconds
pub const DEFAULT_DRAIN_IDLE_MS: u64 = 100;

/// Default limit on the payload size a `+RECV` may announce
pub const DEFAULT_MAX_PAYLOAD: usize = 256;

/// Maximum line length accumulated by the line reader
pub const MAX_LINE_LENGTH: usize = 1024;
