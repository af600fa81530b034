//! Type ABZ Modem Probe
//!
//! Detects the baud rate of a modem, prints its firmware and device information and then logs
//! every notification it sends for a while.
//!
//! Usage:
//!   cargo run --example modem_probe -- [OPTIONS] [PORT]
//!
//! Options:
//!   --port PORT       Serial port (default: /dev/ttyUSB0)
//!   --baud RATE       Skip detection and use this speed
//!   --listen SECS     How long to log notifications (default: 10)
//!   --guard MS        Guard interval between commands
//!   --config FILE     JSON engine configuration
//!   --tower-sdk       Modem sits behind HARDWARIO Tower SDK firmware
//!
//! Set RUST_LOG=atlink_core=debug to see the line traffic.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use atlink_core::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut port_name = "/dev/ttyUSB0".to_string();
    let mut baud_rate: Option<u32> = None;
    let mut listen_secs = 10u64;
    let mut config = ModemConfig::default();
    let mut probe = BaudProbe::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                port_name = args.get(i).context("--port needs a value")?.clone();
            }
            "--baud" | "-b" => {
                i += 1;
                baud_rate = Some(args.get(i).context("--baud needs a value")?.parse()?);
            }
            "--listen" => {
                i += 1;
                listen_secs = args.get(i).context("--listen needs a value")?.parse()?;
            }
            "--guard" => {
                i += 1;
                config.guard_ms = Some(args.get(i).context("--guard needs a value")?.parse()?);
            }
            "--config" => {
                i += 1;
                let path = args.get(i).context("--config needs a value")?;
                config = ModemConfig::from_file(Path::new(path))?;
            }
            "--tower-sdk" => {
                config = ModemConfig {
                    guard_ms: config.guard_ms,
                    ..ModemConfig::tower_sdk()
                };
                probe = BaudProbe::tower_sdk();
            }
            other if !other.starts_with('-') => port_name = other.to_string(),
            other => bail!("unknown option {other}"),
        }
        i += 1;
    }

    let speed = match baud_rate {
        Some(speed) => speed,
        None => {
            println!("Detecting baud rate on {port_name}...");
            detect_serial_baud(&port_name, &config.link, &probe)
                .await?
                .context("modem did not answer at any candidate speed")?
        }
    };
    println!("Using {port_name} at {speed} baud");

    let modem = Modem::open_serial(&port_name, speed, config).await?;

    let mut scope = modem.events().scope();
    scope.subscribe(names::EVENT, |args: &[Arg]| {
        println!("  event {:?}", ints(args).unwrap_or_default());
    });
    scope.subscribe(names::ANSWER, |args: &[Arg]| {
        println!("  answer {:?}", ints(args).unwrap_or_default());
    });
    scope.subscribe(names::ACK, |args: &[Arg]| {
        println!("  ack {:?}", args.first().and_then(Arg::as_bool));
    });
    scope.subscribe(names::MESSAGE, |args: &[Arg]| {
        let port = args.first().and_then(Arg::as_int);
        let len = args.get(1).and_then(Arg::as_bytes).map(|b| b.len());
        println!("  message on port {port:?}, {len:?} bytes");
    });

    match modem.query("+VER?").await {
        Ok(version) => println!("Firmware: {version}"),
        Err(e) if e.is_device() => println!("Firmware: unavailable ({e})"),
        Err(e) => return Err(e.into()),
    }
    match modem.query("+DEV?").await {
        Ok(device) => println!("Device: {device}"),
        Err(e) if e.is_device() => println!("Device: unavailable ({e})"),
        Err(e) => return Err(e.into()),
    }

    println!("Listening for notifications for {listen_secs}s...");
    tokio::time::sleep(Duration::from_secs(listen_secs)).await;

    drop(scope);
    modem.close().await?;
    Ok(())
}
