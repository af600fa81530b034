//! Serial port handling
//!
//! Opens ports for AT traffic. Type ABZ modems always use 8N1 without flow control; only the
//! speed varies.

use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use super::{config::LinkConfig, link::Link, AtError};

/// Open a serial port at `baud_rate` configured for AT traffic.
///
/// Must be called from within a tokio runtime.
pub fn open_port(name: &str, baud_rate: u32, config: &LinkConfig) -> Result<SerialStream, AtError> {
    let mut port = tokio_serial::new(name, baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .open_native_async()?;

    port.set_control_lines(config)
        .map_err(|e| AtError::Serial(e.to_string()))?;
    port.clear_buffers()
        .map_err(|e| AtError::Serial(e.to_string()))?;

    tracing::debug!(port = name, baud_rate, ?config, "serial port opened");
    Ok(port)
}
