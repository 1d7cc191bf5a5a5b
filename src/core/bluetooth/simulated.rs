//! Simulated BLE peripheral
//! Exposes a [`SimulatedDevice`] through the Nordic UART service so the
//! wireless transport can run without a radio.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{info, warn};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::backend::{GattBackend, GattSession, NotificationStream};
use crate::core::bluetooth::constants::{
    UUID_DEVICE_INFORMATION_SERVICE, UUID_DEVICE_NAME, UUID_GENERIC_ACCESS_SERVICE,
    UUID_MANUFACTURER_NAME, UUID_MODEL_NUMBER, UUID_UART_RX_CHAR, UUID_UART_SERVICE,
    UUID_UART_TX_CHAR,
};
use crate::core::bluetooth::types::{EndpointFlags, WirelessDevice};
use crate::core::error::{BridgeError, Result};
use crate::core::protocol::{LineBuffer, Response, frame_line};
use crate::core::simulation::SimulatedDevice;

/// Id the simulated peripheral advertises under
pub const SIMULATED_DEVICE_ID: &str = "sim-ble-24:6F:28:00:00:01";
pub const SIMULATED_DEVICE_NAME: &str = "ESP32 GPIO Bridge";

const NOTIFY_CAPACITY: usize = 64;

pub struct SimulatedGattBackend {
    device: Arc<Mutex<SimulatedDevice>>,
    advertised: WirelessDevice,
    available: bool,
    uart: bool,
    fail_connects: AtomicU32,
    sessions: std::sync::Mutex<Vec<Arc<SimulatedGattSession>>>,
}

impl SimulatedGattBackend {
    pub fn new(device: Arc<Mutex<SimulatedDevice>>) -> Self {
        Self {
            device,
            advertised: WirelessDevice::new(SIMULATED_DEVICE_ID, SIMULATED_DEVICE_NAME, Some(-52))
                .with_services(vec![UUID_UART_SERVICE]),
            available: true,
            uart: true,
            fail_connects: AtomicU32::new(0),
            sessions: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// A host without a usable Bluetooth adapter
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(SimulatedDevice::default().shared())
        }
    }

    /// Peripheral that only exposes read-only information services
    pub fn without_uart(mut self) -> Self {
        self.uart = false;
        self.advertised.services.clear();
        self
    }

    pub fn device(&self) -> Arc<Mutex<SimulatedDevice>> {
        self.device.clone()
    }

    /// The next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.fail_connects.store(count, Ordering::SeqCst);
    }

    /// Drops every open session from the peripheral side.
    pub fn drop_connection(&self) {
        let sessions = std::mem::take(&mut *self.sessions.lock().unwrap_or_else(|e| e.into_inner()));
        info!("Simulated peripheral dropping {} session(s)", sessions.len());
        for session in sessions {
            session.shutdown();
        }
    }
}

#[async_trait]
impl GattBackend for SimulatedGattBackend {
    async fn scan(&self, _services: &[Uuid]) -> Result<mpsc::Receiver<WirelessDevice>> {
        if !self.available {
            return Err(BridgeError::UnsupportedCapability(
                "no Bluetooth adapter found".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel(1);
        if tx.try_send(self.advertised.clone()).is_err() {
            warn!("Simulated scan channel closed early");
        }
        // Keep advertising until the scanner stops listening
        tokio::spawn(async move { tx.closed().await });
        Ok(rx)
    }

    async fn connect(&self, device_id: &str) -> Result<Arc<dyn GattSession>> {
        if !self.available {
            return Err(BridgeError::UnsupportedCapability(
                "no Bluetooth adapter found".to_string(),
            ));
        }
        if device_id != self.advertised.id {
            return Err(BridgeError::ConnectionError(format!(
                "Device not found with ID: {}",
                device_id
            )));
        }
        let failing = self
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BridgeError::ConnectionError(
                "connection attempt timed out".to_string(),
            ));
        }

        let session = SimulatedGattSession::start(
            self.device.clone(),
            self.advertised.clone(),
            self.uart,
        )
        .await;
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(session.clone());
        Ok(session)
    }
}

struct SimulatedGattSession {
    info: WirelessDevice,
    device: Arc<Mutex<SimulatedDevice>>,
    uart: bool,
    rx_lines: Mutex<LineBuffer>,
    tx: std::sync::Mutex<Option<broadcast::Sender<Vec<u8>>>>,
    connected: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl SimulatedGattSession {
    async fn start(
        device: Arc<Mutex<SimulatedDevice>>,
        info: WirelessDevice,
        uart: bool,
    ) -> Arc<Self> {
        let (tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        let (connected, _) = watch::channel(true);
        let session = Arc::new(Self {
            info,
            device: device.clone(),
            uart,
            rx_lines: Mutex::new(LineBuffer::new()),
            tx: std::sync::Mutex::new(Some(tx.clone())),
            connected,
            cancel: CancellationToken::new(),
        });

        let mut unsolicited = device.lock().await.subscribe_unsolicited();
        let cancel = session.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = unsolicited.recv() => match frame {
                        Ok(frame) => {
                            let _ = tx.send(Self::encode(&frame));
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        session
    }

    fn encode(frame: &Response) -> Vec<u8> {
        frame_line(&frame.to_string()).into_bytes()
    }

    fn notify(&self, frame: &Response) {
        if let Some(tx) = self.tx.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            let _ = tx.send(Self::encode(frame));
        }
    }

    fn shutdown(&self) {
        self.connected.send_replace(false);
        self.cancel.cancel();
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    fn ensure_connected(&self) -> Result<()> {
        if *self.connected.borrow() {
            Ok(())
        } else {
            Err(BridgeError::NotConnected)
        }
    }
}

#[async_trait]
impl GattSession for SimulatedGattSession {
    fn device(&self) -> WirelessDevice {
        self.info.clone()
    }

    async fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    async fn services(&self) -> Result<Vec<Uuid>> {
        self.ensure_connected()?;
        let mut services = vec![UUID_GENERIC_ACCESS_SERVICE, UUID_DEVICE_INFORMATION_SERVICE];
        if self.uart {
            services.push(UUID_UART_SERVICE);
        }
        Ok(services)
    }

    async fn characteristics(&self, service: Uuid) -> Result<Vec<(Uuid, EndpointFlags)>> {
        self.ensure_connected()?;
        match service {
            UUID_GENERIC_ACCESS_SERVICE => Ok(vec![(UUID_DEVICE_NAME, EndpointFlags::READ)]),
            UUID_DEVICE_INFORMATION_SERVICE => Ok(vec![
                (UUID_MANUFACTURER_NAME, EndpointFlags::READ),
                (UUID_MODEL_NUMBER, EndpointFlags::READ),
            ]),
            UUID_UART_SERVICE if self.uart => Ok(vec![
                (UUID_UART_RX_CHAR, EndpointFlags::WRITE),
                (UUID_UART_TX_CHAR, EndpointFlags::NOTIFY),
            ]),
            other => Err(BridgeError::ConnectionError(format!(
                "service {} not present",
                other
            ))),
        }
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        self.ensure_connected()?;
        match characteristic {
            UUID_DEVICE_NAME => Ok(self.info.name.clone().into_bytes()),
            UUID_MANUFACTURER_NAME => Ok(b"Espressif".to_vec()),
            UUID_MODEL_NUMBER => Ok(b"ESP32-DevKitC".to_vec()),
            other => Err(BridgeError::ReadError(format!(
                "characteristic {} is not readable",
                other
            ))),
        }
    }

    async fn write(&self, characteristic: Uuid, payload: &[u8]) -> Result<()> {
        if !*self.connected.borrow() {
            return Err(BridgeError::WriteError("device disconnected".to_string()));
        }
        if !self.uart || characteristic != UUID_UART_RX_CHAR {
            return Err(BridgeError::WriteError(format!(
                "characteristic {} is not writable",
                characteristic
            )));
        }

        let mut lines = self.rx_lines.lock().await;
        for line in lines.push(payload) {
            let frames = self.device.lock().await.handle_line(&line);
            for frame in &frames {
                self.notify(frame);
            }
        }
        Ok(())
    }

    async fn notifications(&self, characteristic: Uuid) -> Result<NotificationStream> {
        if !self.uart || characteristic != UUID_UART_TX_CHAR {
            return Err(BridgeError::ReadError(format!(
                "characteristic {} does not notify",
                characteristic
            )));
        }
        let rx = match self.tx.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(tx) => tx.subscribe(),
            None => return Err(BridgeError::NotConnected),
        };

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(value) => return Some((Ok(value), rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Notification subscriber lagged, {} values lost", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed())
    }

    async fn wait_disconnected(&self) {
        let mut connected = self.connected.subscribe();
        let _ = connected.wait_for(|up| !*up).await;
    }

    async fn disconnect(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }
}
