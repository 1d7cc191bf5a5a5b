//! Serial link manager
//! Owns the one open port: the exclusive reader and writer halves, the link
//! state and the last opened descriptor used for reconnects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, watch};
use tokio::time::{sleep, timeout};

use crate::config::serial_config::SerialConfig;
use crate::core::error::{BridgeError, Result};
use crate::core::protocol::frame_line;
use crate::core::serial::backend::{BoxedSerialStream, SerialBackend};
use crate::core::serial::types::{LinkDescriptor, OpenLink, SerialOptions};
use crate::core::transport::{DeviceTransport, LinkState, LinkStateCell, TransportKind};

pub struct SerialManager {
    backend: Arc<dyn SerialBackend>,
    state: LinkStateCell,
    /// Last opened link. Also serializes open/close/baud changes.
    last_link: Mutex<Option<OpenLink>>,
    reader: Mutex<Option<ReadHalf<BoxedSerialStream>>>,
    /// Held for the whole of a write, so chunks of two writes never interleave
    writer: Mutex<Option<WriteHalf<BoxedSerialStream>>>,
    /// Settings for the next open; the read path takes its buffer size from here
    options: std::sync::Mutex<SerialOptions>,
    chunk_size: usize,
    chunk_delay: Duration,
    read_timeout: Duration,
}

impl SerialManager {
    pub fn new(backend: Arc<dyn SerialBackend>) -> Self {
        Self::with_config(backend, &SerialConfig::default())
    }

    pub fn with_config(backend: Arc<dyn SerialBackend>, config: &SerialConfig) -> Self {
        Self {
            backend,
            state: LinkStateCell::new("serial"),
            last_link: Mutex::new(None),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            options: std::sync::Mutex::new(SerialOptions::from(config)),
            chunk_size: config.chunk_size.max(1),
            chunk_delay: Duration::from_millis(config.chunk_delay_ms),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
        }
    }

    /// Settings the next open will use (the current ones while connected)
    pub fn options(&self) -> SerialOptions {
        self.options.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_options(&self, options: SerialOptions) {
        *self.options.lock().unwrap_or_else(|e| e.into_inner()) = options;
    }

    /// The open link, if connected
    pub async fn current_link(&self) -> Option<OpenLink> {
        if self.state.get() != LinkState::Connected {
            return None;
        }
        self.last_link.lock().await.clone()
    }

    /// Lists the ports the host currently sees.
    pub async fn discover(&self) -> Result<Vec<LinkDescriptor>> {
        let idle = self.state.get() == LinkState::Disconnected;
        if idle {
            self.state.set(LinkState::Scanning);
        }
        let result = self.backend.available_ports();
        if idle {
            self.state.set(LinkState::Disconnected);
        }
        match &result {
            Ok(ports) => info!("Found {} serial port(s)", ports.len()),
            Err(e) => warn!("Serial discovery failed: {}", e),
        }
        result
    }

    /// Opens `descriptor`. An already open link is closed first.
    pub async fn open(&self, descriptor: LinkDescriptor, options: SerialOptions) -> Result<()> {
        let mut last_link = self.last_link.lock().await;
        self.open_locked(&mut last_link, descriptor, options).await
    }

    /// Reopens the most recently opened port with its last settings.
    pub async fn reconnect(&self) -> Result<()> {
        let mut last_link = self.last_link.lock().await;
        let Some(link) = last_link.clone() else {
            return Err(BridgeError::ConnectionError(
                "no port has been opened yet".to_string(),
            ));
        };
        info!("Reconnecting to {}", link.descriptor.path);
        self.open_locked(&mut last_link, link.descriptor, self.options()).await
    }

    async fn open_locked(
        &self,
        last_link: &mut Option<OpenLink>,
        descriptor: LinkDescriptor,
        options: SerialOptions,
    ) -> Result<()> {
        if self.holds_link().await {
            info!("Serial link already open, closing it before reopening");
            if let Err(e) = self.release_link().await {
                warn!("Error while closing previous link: {}", e);
            }
        }

        self.state.set(LinkState::Connecting);
        info!(
            "Opening {} at {} baud",
            descriptor.path, options.baud_rate
        );

        let stream = match self.backend.open(&descriptor, &options).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to open {}: {}", descriptor.path, e);
                self.state.set(LinkState::Disconnected);
                return Err(match e {
                    BridgeError::ConnectionError(_) | BridgeError::UnsupportedCapability(_) => e,
                    other => BridgeError::ConnectionError(other.to_string()),
                });
            }
        };

        let (reader, writer) = tokio::io::split(stream);
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        self.set_options(options.clone());
        *last_link = Some(OpenLink {
            descriptor,
            options,
        });
        self.state.set(LinkState::Connected);
        Ok(())
    }

    /// Closes the link. Calling it on a closed link is a no-op.
    pub async fn close(&self) -> Result<()> {
        let _last_link = self.last_link.lock().await;
        self.release_link().await
    }

    /// Applies a new line speed. While connected this closes and reopens the
    /// port; `Ok(false)` means the reopen failed and the link is now down.
    pub async fn change_baud_rate(&self, baud_rate: u32) -> Result<bool> {
        let mut last_link = self.last_link.lock().await;
        let mut options = self.options();
        options.baud_rate = baud_rate;

        let reopen = match last_link.clone() {
            Some(link) if self.state.get() == LinkState::Connected => link,
            _ => {
                self.set_options(options);
                return Ok(true);
            }
        };

        info!("Changing baud rate of {} to {}", reopen.descriptor.path, baud_rate);
        if let Err(e) = self.release_link().await {
            warn!("Error while closing link for baud change: {}", e);
        }
        match self
            .open_locked(&mut last_link, reopen.descriptor, options.clone())
            .await
        {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Reopen at {} baud failed: {}", baud_rate, e);
                self.set_options(options);
                Ok(false)
            }
        }
    }

    /// Single read bounded by the read timeout.
    pub async fn read(&self) -> Result<Option<Vec<u8>>> {
        let buffer_size = self.options().buffer_size.max(1);
        let mut guard = self.reader.lock().await;
        let Some(reader) = guard.as_mut() else {
            return Err(BridgeError::NotConnected);
        };

        let mut buf = vec![0u8; buffer_size];
        match timeout(self.read_timeout, reader.read(&mut buf)).await {
            Err(_elapsed) => Ok(Some(Vec::new())),
            Ok(Ok(0)) => {
                info!("Serial stream ended, device gone");
                guard.take();
                drop(guard);
                self.release_writer().await;
                self.state.set(LinkState::Disconnected);
                Ok(None)
            }
            Ok(Ok(n)) => {
                buf.truncate(n);
                debug!("Read {} bytes", n);
                Ok(Some(buf))
            }
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                ) =>
            {
                Ok(Some(Vec::new()))
            }
            Ok(Err(e)) => {
                error!("Serial read error: {}", e);
                guard.take();
                drop(guard);
                self.release_writer().await;
                self.state.set(LinkState::Disconnected);
                Err(BridgeError::ReadError(e.to_string()))
            }
        }
    }

    /// Sends `text` as one line, in chunks with a short pause between them.
    pub async fn write(&self, text: &str) -> Result<()> {
        let payload = frame_line(text);
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(BridgeError::NotConnected);
        };

        let chunks: Vec<&[u8]> = payload.as_bytes().chunks(self.chunk_size).collect();
        let count = chunks.len();
        debug!("Writing {} bytes in {} chunk(s)", payload.len(), count);

        for (index, chunk) in chunks.into_iter().enumerate() {
            let sent = match writer.write_all(chunk).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                error!("Serial write error: {}", e);
                if Self::is_disconnect(&e) {
                    guard.take();
                    drop(guard);
                    self.release_reader().await;
                    self.state.set(LinkState::Disconnected);
                }
                return Err(BridgeError::WriteError(e.to_string()));
            }
            if index + 1 < count {
                sleep(self.chunk_delay).await;
            }
        }
        Ok(())
    }

    fn is_disconnect(error: &std::io::Error) -> bool {
        use std::io::ErrorKind;
        matches!(
            error.kind(),
            ErrorKind::BrokenPipe
                | ErrorKind::NotConnected
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::UnexpectedEof
                | ErrorKind::NotFound
        )
    }

    async fn holds_link(&self) -> bool {
        self.writer.lock().await.is_some() || self.reader.lock().await.is_some()
    }

    /// Releases writer then reader, then marks the link down. Both halves are
    /// dropped on every path, the shutdown error is reported afterwards.
    async fn release_link(&self) -> Result<()> {
        let writer = self.writer.lock().await.take();
        let reader = self.reader.lock().await.take();
        let had_link = writer.is_some() || reader.is_some();

        let result = match writer {
            Some(mut writer) => writer.shutdown().await.map_err(BridgeError::Io),
            None => Ok(()),
        };
        drop(reader);
        self.state.set(LinkState::Disconnected);
        if had_link {
            info!("Serial link closed");
        }
        result
    }

    async fn release_reader(&self) {
        self.reader.lock().await.take();
    }

    async fn release_writer(&self) {
        self.writer.lock().await.take();
    }
}

#[async_trait]
impl DeviceTransport for SerialManager {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn name(&self) -> String {
        match self.last_link.try_lock() {
            Ok(link) => match link.as_ref() {
                Some(link) => format!("serial:{}", link.descriptor.path),
                None => "serial".to_string(),
            },
            Err(_) => "serial".to_string(),
        }
    }

    fn state(&self) -> LinkState {
        self.state.get()
    }

    fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    async fn close(&self) -> Result<()> {
        SerialManager::close(self).await
    }

    async fn read(&self) -> Result<Option<Vec<u8>>> {
        SerialManager::read(self).await
    }

    async fn write(&self, text: &str) -> Result<()> {
        SerialManager::write(self, text).await
    }
}
