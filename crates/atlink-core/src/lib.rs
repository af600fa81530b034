//! # atlink Core Library
//!
//! Host-side transport engine for the AT command interface of Murata Type ABZ LoRaWAN modems.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Serial link handling and baud rate detection
//! - Line framing with inline binary downlink payloads
//! - Demultiplexing of command replies and asynchronous notifications
//! - Event publish/subscribe with one-shot waiters
//! - Serialised command invocation with timeouts and a guard interval
//!
//! ## Example
//!
//! ```rust,ignore
//! use atlink_core::prelude::*;
//! use std::time::Duration;
//!
//! let probe = BaudProbe::default();
//! let speed = detect_serial_baud("/dev/ttyUSB0", &LinkConfig::default(), &probe)
//!     .await?
//!     .unwrap_or(19200);
//!
//! let modem = Modem::open_serial("/dev/ttyUSB0", speed, ModemConfig::default()).await?;
//! println!("Firmware: {}", modem.query("+VER?").await?);
//!
//! // Register before sending so the event cannot be missed
//! let joined = modem.events().waiter("event=1");
//! modem.command("+JOIN").await?;
//! let args = joined.wait(Duration::from_secs(30)).await?;
//! ```

pub mod events;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::events::{ints, names, Arg, EventBus, Scope, SubscriptionId, Waiter};
    pub use crate::protocol::{
        detect_baud, detect_serial_baud, AtError, BaudProbe, DeviceError, DeviceErrorKind,
        LinkConfig, Modem, ModemConfig, Reply, Session, TunnelConfig,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
