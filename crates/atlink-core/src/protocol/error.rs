//! Protocol errors

use std::fmt;

use thiserror::Error;

/// Errors that can occur while talking to the modem
#[derive(Error, Debug)]
pub enum AtError {
    /// The link is gone: end of stream, read failure or a short raw read.
    /// Fatal for the engine.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// Opening or configuring a serial port failed
    #[error("Serial port error: {0}")]
    Serial(String),

    /// No reply or event arrived in time
    #[error("Timed out: {0}")]
    Timeout(&'static str),

    /// The modem answered with `+ERR=<code>`
    #[error("Command failed: {0}")]
    Device(DeviceError),

    /// A line did not have the shape the protocol requires
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// The tunnelling host firmware answered `ERROR`
    #[error("Host command failed: {0}")]
    Host(String),

    /// The command contains non-ASCII characters
    #[error("Command is not valid ASCII: {0:?}")]
    Encoding(String),

    /// A configuration file could not be parsed
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Writing to the link failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AtError {
    /// No reply arrived in time. The caller may retry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AtError::Timeout(_))
    }

    /// The device rejected the command.
    pub fn is_device(&self) -> bool {
        matches!(self, AtError::Device(_))
    }

    /// The link can no longer be used.
    pub fn is_transport(&self) -> bool {
        matches!(self, AtError::Transport(_) | AtError::Io(_))
    }

    /// Device error details, if this is a device error
    pub fn device_error(&self) -> Option<&DeviceError> {
        match self {
            AtError::Device(e) => Some(e),
            _ => None,
        }
    }
}

impl From<tokio_serial::Error> for AtError {
    fn from(e: tokio_serial::Error) -> Self {
        AtError::Serial(e.to_string())
    }
}

/// Error reported by the modem firmware as `+ERR=<code>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceError {
    code: i32,
}

impl DeviceError {
    /// Wrap a raw `+ERR` code
    pub fn new(code: i32) -> Self {
        Self { code }
    }

    /// Numeric code as sent by the modem (always negative for known errors)
    pub fn code(&self) -> i32 {
        self.code
    }

    /// Kind from the firmware error table
    pub fn kind(&self) -> DeviceErrorKind {
        DeviceErrorKind::from_code(self.code)
    }

    /// Human readable description
    pub fn message(&self) -> &'static str {
        self.kind().message()
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code)
    }
}

/// Firmware error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// -1
    UnknownCommand,
    /// -2
    ParamCount,
    /// -3
    Param,
    /// -4
    FactoryResetFailed,
    /// -5
    NotJoined,
    /// -6
    AlreadyJoined,
    /// -7
    Busy,
    /// -8
    SameVersion,
    /// -9
    MissingInfo,
    /// -10
    Flash,
    /// -11
    UpdateFailed,
    /// -12
    PayloadTooLong,
    /// -13
    AbpOnly,
    /// -14
    OtaaOnly,
    /// -15
    BandUnsupported,
    /// -16
    PowerTooHigh,
    /// -17
    Unsupported,
    /// -18
    DutyCycle,
    /// -19
    NoChannel,
    /// -20
    TooManyLinkChecks,
    /// -50
    AccessDenied,
    /// -51
    DetachDenied,
    /// A code outside the documented table
    Other(i32),
}

impl DeviceErrorKind {
    /// Map a raw code to its kind
    pub fn from_code(code: i32) -> Self {
        use DeviceErrorKind::*;
        match code {
            -1 => UnknownCommand,
            -2 => ParamCount,
            -3 => Param,
            -4 => FactoryResetFailed,
            -5 => NotJoined,
            -6 => AlreadyJoined,
            -7 => Busy,
            -8 => SameVersion,
            -9 => MissingInfo,
            -10 => Flash,
            -11 => UpdateFailed,
            -12 => PayloadTooLong,
            -13 => AbpOnly,
            -14 => OtaaOnly,
            -15 => BandUnsupported,
            -16 => PowerTooHigh,
            -17 => Unsupported,
            -18 => DutyCycle,
            -19 => NoChannel,
            -20 => TooManyLinkChecks,
            -50 => AccessDenied,
            -51 => DetachDenied,
            other => Other(other),
        }
    }

    /// Description from the firmware documentation
    pub fn message(&self) -> &'static str {
        use DeviceErrorKind::*;
        match self {
            UnknownCommand => "Unknown command",
            ParamCount => "Invalid number of parameters",
            Param => "Invalid parameter value(s)",
            FactoryResetFailed => "Factory reset failed",
            NotJoined => "Device has not joined LoRaWAN yet",
            AlreadyJoined => "Device has already joined LoRaWAN",
            Busy => "Resource unavailable: LoRa MAC is transmitting",
            SameVersion => "New firmware version must be different",
            MissingInfo => "Missing firmware information",
            Flash => "Flash read/write error",
            UpdateFailed => "Firmware update failed",
            PayloadTooLong => "Payload is too long",
            AbpOnly => "Only supported in ABP activation mode",
            OtaaOnly => "Only supported in OTAA activation mode",
            BandUnsupported => "Region is not supported",
            PowerTooHigh => "Power value too high",
            Unsupported => "Not supported in the current region",
            DutyCycle => "Cannot transmit due to duty cycling",
            NoChannel => "Channel unavailable due to LBT or error",
            TooManyLinkChecks => "Too many link check requests",
            AccessDenied => "Access to LoRaWAN security keys denied",
            DetachDenied => "ATCI detach request denied (PB12 low)",
            Other(_) => "Unknown error",
        }
    }
}
