//! Command engine
//!
//! A [`Modem`] owns an open link. A spawned reader task runs the line reader and the
//! demultiplexer over the read half; the write half sits behind the exchange lock together with
//! the response channel, so a command and its reply are always handled by one caller at a time.
//!
//! With a [`TunnelConfig`](super::TunnelConfig) the modem sits behind host firmware that shares
//! the link: modem lines carry a prefix, and everything else is a host reply read through
//! [`Session::host_command`].

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::FramedRead;

use super::config::{ModemConfig, TunnelConfig};
use super::demux::Demultiplexer;
use super::framing::LineCodec;
use super::link::{drain_input, Link};
use super::redact::{Redactor, SecretGuard};
use super::response::{self, Reply, ResponseChannel};
use super::{serial, AtError};
use crate::events::EventBus;

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// State guarded by the exchange lock
struct Exchange {
    writer: Writer,
    responses: ResponseChannel,
    /// Replies from tunnelling host firmware
    host: Option<ResponseChannel>,
    /// When the previous session ended, for the guard interval
    last_reply: Option<Instant>,
}

/// An open AT command engine
pub struct Modem {
    config: ModemConfig,
    events: EventBus,
    redactor: Redactor,
    exchange: tokio::sync::Mutex<Exchange>,
    failure: Arc<Mutex<Option<String>>>,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for Modem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Modem")
            .field("config", &self.config)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Modem {
    /// Start the engine on an already open link.
    ///
    /// Clears the link's buffers and drains stale input before the reader task starts. When a
    /// tunnel is configured its enable command is sent once the reader runs. Must be called from
    /// within a tokio runtime.
    pub async fn open<L: Link>(mut link: L, config: ModemConfig) -> Result<Self, AtError> {
        link.clear_buffers()?;
        if let Some(idle) = config.drain_idle() {
            drain_input(&mut link, idle).await?;
        }

        let (read_half, write_half) = tokio::io::split(link);
        let events = EventBus::new();
        let redactor = Redactor::default();
        let (sink, responses) = response::channel();

        let mut demux =
            Demultiplexer::new(events.clone(), sink, redactor.clone(), config.max_payload);
        let mut host = None;
        if let Some(tunnel) = &config.tunnel {
            let (host_sink, host_responses) = response::channel();
            demux = demux.with_tunnel(&tunnel.line_prefix, host_sink);
            host = Some(host_responses);
        }

        let frames = FramedRead::new(read_half, LineCodec::new(config.max_line_length));
        let failure = Arc::new(Mutex::new(None));
        let reader = {
            let failure = failure.clone();
            tokio::spawn(async move {
                let reason = match AssertUnwindSafe(demux.run(frames)).catch_unwind().await {
                    Ok(err) => err.to_string(),
                    Err(_) => "reader panicked".to_string(),
                };
                tracing::error!(reason = %reason, "reader stopped");
                *failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
            })
        };

        tracing::info!(prefix = %config.command_prefix, guard = ?config.guard(), "modem opened");
        let modem = Self {
            config,
            events,
            redactor,
            exchange: tokio::sync::Mutex::new(Exchange {
                writer: Box::new(write_half),
                responses,
                host,
                last_reply: None,
            }),
            failure,
            reader,
        };

        if let Some(enable) = modem.tunnel_command(|t| t.enable_command.as_deref()) {
            modem.host_command(&enable).await?;
        }
        Ok(modem)
    }

    /// Open a serial port and start the engine on it
    pub async fn open_serial(
        path: &str,
        baud_rate: u32,
        config: ModemConfig,
    ) -> Result<Self, AtError> {
        let port = serial::open_port(path, baud_rate, &config.link)?;
        Self::open(port, config).await
    }

    /// Bus carrying the modem's notifications
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Configuration the engine was opened with
    pub fn config(&self) -> &ModemConfig {
        &self.config
    }

    /// False once the reader task has stopped
    pub fn is_alive(&self) -> bool {
        !self.reader.is_finished()
    }

    /// Why the reader stopped, if it has
    pub fn failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Redact values in traced lines until the guard is dropped
    pub fn secret(&self) -> SecretGuard {
        self.redactor.guard()
    }

    /// Take the exchange lock.
    ///
    /// Waits out the guard interval if one is configured. Lines read while the session is held
    /// are handed to it; the lock is released when the session is dropped. Lines arriving during
    /// the guard interval belong to an earlier exchange and are dropped.
    pub async fn lock(&self) -> Session<'_> {
        let mut exchange = self.exchange.lock().await;

        if let (Some(guard), Some(last)) = (self.config.guard(), exchange.last_reply) {
            let elapsed = last.elapsed();
            if elapsed < guard {
                tokio::time::sleep(guard - elapsed).await;
            }
        }

        exchange.responses.open_slot();
        if let Some(host) = &mut exchange.host {
            host.open_slot();
        }

        Session {
            modem: self,
            exchange,
        }
    }

    /// Send a command and read its reply under the exchange lock.
    ///
    /// `command` is written with the configured prefix and a trailing CR. With `expect_body` the
    /// reply is read up to the terminating `+OK`.
    pub async fn invoke(
        &self,
        command: &str,
        timeout: Duration,
        expect_body: bool,
    ) -> Result<Reply, AtError> {
        self.lock().await.invoke(command, timeout, expect_body).await
    }

    /// Single-line command with the default timeout
    pub async fn command(&self, command: &str) -> Result<Reply, AtError> {
        self.invoke(command, self.config.timeout(), false).await
    }

    /// Single-line command whose reply must carry a value
    pub async fn query(&self, command: &str) -> Result<String, AtError> {
        match self.command(command).await? {
            Reply::Value(value) => Ok(value),
            other => Err(AtError::Protocol(format!(
                "expected a value in reply to {command:?}, got {other:?}"
            ))),
        }
    }

    /// Send a command to the tunnelling host firmware and wait for its `OK`
    pub async fn host_command(&self, command: &str) -> Result<Vec<String>, AtError> {
        let timeout = self.config.timeout();
        self.lock().await.host_command(command, timeout).await
    }

    /// Flush a half-entered command out of the modem and wait for the line to go quiet.
    ///
    /// Runs as a session of its own, so the guard interval applies before and after it. Whatever
    /// the modem sends back is discarded when the session ends.
    pub async fn drain(&self) -> Result<(), AtError> {
        let mut session = self.lock().await;
        session.write(b"\r\n").await?;
        if let Some(idle) = self.config.drain_idle() {
            tokio::time::sleep(idle).await;
        }
        Ok(())
    }

    /// Stop the reader task and shut the write half down.
    ///
    /// A configured tunnel disable command is sent first; its failure is returned after the
    /// link has been shut down.
    pub async fn close(self) -> Result<(), AtError> {
        let disabled = match self.tunnel_command(|t| t.disable_command.as_deref()) {
            Some(disable) => self.host_command(&disable).await.map(drop),
            None => Ok(()),
        };

        self.reader.abort();
        let mut exchange = self.exchange.lock().await;
        exchange.writer.shutdown().await?;
        tracing::info!("modem closed");
        disabled
    }

    fn tunnel_command<F>(&self, pick: F) -> Option<String>
    where
        F: FnOnce(&TunnelConfig) -> Option<&str>,
    {
        self.config.tunnel.as_ref().and_then(pick).map(str::to_string)
    }
}

impl Drop for Modem {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Exclusive use of the link for a multi-step exchange.
///
/// Obtained from [`Modem::lock`]. Dropping it closes the response slot and records the time for
/// the guard interval.
pub struct Session<'a> {
    modem: &'a Modem,
    exchange: tokio::sync::MutexGuard<'a, Exchange>,
}

impl Session<'_> {
    fn check_alive(&self) -> Result<(), AtError> {
        match self.modem.failure() {
            Some(reason) => Err(AtError::Transport(reason)),
            None => Ok(()),
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), AtError> {
        self.check_alive()?;
        self.exchange.writer.write_all(bytes).await?;
        self.exchange.writer.flush().await?;
        Ok(())
    }

    /// Write a command without waiting for the reply
    pub async fn send(&mut self, command: &str) -> Result<(), AtError> {
        if !command.is_ascii() {
            return Err(AtError::Encoding(command.to_string()));
        }

        let mut line = format!("{}{}", self.modem.config.command_prefix, command);
        tracing::debug!("< {}", self.modem.redactor.display(line.as_bytes()));
        line.push('\r');

        self.write(line.as_bytes()).await
    }

    /// Write payload bytes as they are, e.g. after `AT+UTX`
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<(), AtError> {
        tracing::debug!(len = data.len(), "< raw payload");
        self.write(data).await
    }

    /// Read a single-line reply
    pub async fn read_inline(&mut self, timeout: Duration) -> Result<Reply, AtError> {
        self.exchange.responses.read_inline(timeout).await
    }

    /// Read a reply body up to its terminating `+OK`
    pub async fn read_multiline(&mut self, timeout: Duration) -> Result<Reply, AtError> {
        self.exchange.responses.read_multiline(timeout).await
    }

    /// Send `AT<command>` to the tunnelling host firmware, without the modem prefix, and read
    /// its reply lines up to `OK`.
    pub async fn host_command(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, AtError> {
        let no_tunnel = || AtError::Config("no host tunnel configured".to_string());
        if self.exchange.host.is_none() {
            return Err(no_tunnel());
        }
        if !command.is_ascii() {
            return Err(AtError::Encoding(command.to_string()));
        }

        let line = format!("AT{command}");
        tracing::debug!("< {}", self.modem.redactor.display(line.as_bytes()));
        self.write(format!("{line}\r").as_bytes()).await?;

        let host = self.exchange.host.as_mut().ok_or_else(no_tunnel)?;
        host.read_host(timeout).await
    }

    /// Send a command and read its reply
    pub async fn invoke(
        &mut self,
        command: &str,
        timeout: Duration,
        expect_body: bool,
    ) -> Result<Reply, AtError> {
        self.send(command).await?;
        if expect_body {
            self.read_multiline(timeout).await
        } else {
            self.read_inline(timeout).await
        }
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.exchange.responses.close_slot();
        if let Some(host) = &mut self.exchange.host {
            host.close_slot();
        }
        self.exchange.last_reply = Some(Instant::now());
    }
}
