//! Event publish/subscribe
//!
//! Notifications from the modem are published on an [`EventBus`] under string names. Each
//! publication carries a list of [`Arg`]s.

mod bus;

pub use bus::{Callback, EventBus, Scope, SubscriptionId, Waiter};

use bytes::Bytes;

/// A single argument carried by a published event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// Integer parameter of `+EVENT` or `+ANS`, or a `+RECV` port
    Int(i64),
    /// `+ACK` (true) or `+NOACK` (false)
    Bool(bool),
    /// Downlink payload
    Bytes(Bytes),
}

impl Arg {
    /// The integer, if this is [`Arg::Int`]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Arg::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The flag, if this is [`Arg::Bool`]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Arg::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// The payload, if this is [`Arg::Bytes`]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Arg::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Int(v)
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Bool(v)
    }
}

impl From<Bytes> for Arg {
    fn from(v: Bytes) -> Self {
        Arg::Bytes(v)
    }
}

/// Collect integer arguments, or `None` if any argument is not an integer
pub fn ints(args: &[Arg]) -> Option<Vec<i64>> {
    args.iter().map(Arg::as_int).collect()
}

/// Event names used by the demultiplexer
pub mod names {
    /// Every `+EVENT` line, with `(subsystem, code)` arguments
    pub const EVENT: &str = "event";
    /// `+ANS` lines, with their integer parameters
    pub const ANSWER: &str = "answer";
    /// `+ACK` / `+NOACK`, with one boolean
    pub const ACK: &str = "ack";
    /// `+RECV` downlinks, with `(port, payload)`
    pub const MESSAGE: &str = "message";

    /// Events from one subsystem, carrying the event code
    pub fn event_scope(subsystem: i64) -> String {
        format!("{EVENT}={subsystem}")
    }

    /// One specific event, carrying no arguments
    pub fn event_qualified(subsystem: i64, code: i64) -> String {
        format!("{EVENT}={subsystem},{code}")
    }
}
