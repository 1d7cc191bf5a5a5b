//! Bluetooth manager for the GPIO bridge
//! This module provides the main interface for Bluetooth LE operations

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::bluetooth_config::BluetoothConfig;
use crate::core::bluetooth::backend::{GattBackend, GattSession};
use crate::core::bluetooth::connection::ConnectionManager;
use crate::core::bluetooth::constants::MAX_WRITE_CHUNK;
use crate::core::bluetooth::notification::{NotificationCallback, NotificationHandler};
use crate::core::bluetooth::scanner::BluetoothScanner;
use crate::core::bluetooth::types::{Endpoint, ScanFilter, WirelessDevice};
use crate::core::error::{BridgeError, Result};
use crate::core::protocol::frame_line;
use crate::core::transport::{DeviceTransport, LinkState, LinkStateCell, TransportKind};

/// Represents the state of a successfully connected device.
/// This struct holds the active handles needed for interaction.
struct ConnectedDeviceState {
    session: Arc<dyn GattSession>,
    device: WirelessDevice,
    endpoints: Vec<Endpoint>,
    /// Feeds the transport read path; kept here so the channel stays open for
    /// as long as the device is connected
    _inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    /// Stops the disconnect observer
    watcher: CancellationToken,
}

/// Manages Bluetooth operations
pub struct BluetoothManager {
    scanner: BluetoothScanner,
    connection_manager: ConnectionManager,
    notification_handler: NotificationHandler,
    state: Arc<LinkStateCell>,
    /// Currently connected device
    connected_state: Arc<Mutex<Option<ConnectedDeviceState>>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    /// Held for every chunk of one write so concurrent writes never interleave
    write_lock: Mutex<()>,
    default_filter: ScanFilter,
    scan_duration: Duration,
    read_timeout: Duration,
}

impl BluetoothManager {
    pub fn new(backend: Arc<dyn GattBackend>, config: &BluetoothConfig) -> Self {
        Self {
            scanner: BluetoothScanner::new(backend.clone()),
            connection_manager: ConnectionManager::new(
                backend,
                config.max_connect_retries,
                config.connect_retry_delay_ms,
            ),
            notification_handler: NotificationHandler::new(),
            state: Arc::new(LinkStateCell::new("bluetooth")),
            connected_state: Arc::new(Mutex::new(None)),
            inbound: Mutex::new(None),
            write_lock: Mutex::new(()),
            default_filter: ScanFilter {
                name_contains: config.name_filter.clone(),
                services: config.service_filter.clone(),
                min_rssi: Some(config.min_rssi),
            },
            scan_duration: Duration::from_secs(config.scan_duration_secs),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
        }
    }

    /// Manager over the host Bluetooth adapter
    #[cfg(feature = "bluetooth")]
    pub async fn native(config: &BluetoothConfig) -> Result<Self> {
        let backend = crate::core::bluetooth::bluest_backend::BluestBackend::new().await?;
        Ok(Self::new(Arc::new(backend), config))
    }

    #[cfg(not(feature = "bluetooth"))]
    pub async fn native(_config: &BluetoothConfig) -> Result<Self> {
        Err(BridgeError::UnsupportedCapability(
            "built without Bluetooth support".to_string(),
        ))
    }

    /// Scans for devices. `None` uses the filter from the configuration.
    pub async fn scan(&self, filter: Option<&ScanFilter>) -> Result<Vec<WirelessDevice>> {
        let filter = filter.unwrap_or(&self.default_filter);
        let idle = self.state.get() == LinkState::Disconnected;
        if idle {
            self.state.set(LinkState::Scanning);
        }
        let result = self.scanner.scan(filter, self.scan_duration).await;
        if idle {
            self.state.set(LinkState::Disconnected);
        }
        match &result {
            Ok(devices) => info!("Scan finished with {} device(s)", devices.len()),
            Err(e) => warn!("Bluetooth scan failed: {}", e),
        }
        result
    }

    pub fn stop_scan(&self) {
        self.scanner.stop_scan();
    }

    /// Connects to a device with the given ID
    pub async fn connect(&self, device_id: &str) -> Result<()> {
        let mut connected_state = self.connected_state.lock().await;
        if let Some(current) = connected_state.as_ref() {
            if current.device.id == device_id && current.session.is_connected().await {
                info!("Device already connected.");
                return Ok(());
            }
            info!("Switching from {} to {}", current.device.id, device_id);
            if let Err(e) = self.teardown(&mut connected_state).await {
                warn!("Error while disconnecting previous device: {}", e);
            }
        }

        self.state.set(LinkState::Connecting);
        let (session, endpoints) = match self.connection_manager.connect_with_retry(device_id).await {
            Ok(connected) => connected,
            Err(e) => {
                error!("Failed to connect to {}: {}", device_id, e);
                self.state.set(LinkState::Disconnected);
                return Err(e);
            }
        };

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        if let Some(endpoint) = endpoints.iter().find(|e| e.flags.notifiable) {
            let sink = inbound_tx.clone();
            let callback: NotificationCallback = Arc::new(move |value| {
                let _ = sink.send(value);
            });
            if let Err(e) = self
                .notification_handler
                .subscribe(session.clone(), endpoint.characteristic, callback)
                .await
            {
                warn!("Failed to subscribe to {}: {}", endpoint.characteristic, e);
            }
        } else {
            warn!("Device exposes no notifiable endpoint, reads will stay empty");
        }

        let watcher = CancellationToken::new();
        self.spawn_disconnect_observer(session.clone(), watcher.clone());

        let device = session.device();
        info!(
            "Device {} ({}) connected with {} endpoint(s)",
            device.name,
            device.id,
            endpoints.len()
        );
        *connected_state = Some(ConnectedDeviceState {
            session,
            device,
            endpoints,
            _inbound_tx: inbound_tx,
            watcher,
        });
        *self.inbound.lock().await = Some(inbound_rx);
        self.state.set(LinkState::Connected);
        Ok(())
    }

    /// Reflects a drop the device or the OS initiated without waiting for
    /// the next read or write to fail.
    fn spawn_disconnect_observer(&self, session: Arc<dyn GattSession>, watcher: CancellationToken) {
        let connected_state = self.connected_state.clone();
        let notification_handler = self.notification_handler.clone();
        let state = self.state.clone();

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = watcher.cancelled() => return,
                _ = session.wait_disconnected() => {}
            }

            let mut guard = connected_state.lock().await;
            // An explicit disconnect got here first
            if watcher.is_cancelled() {
                return;
            }
            warn!("Device {} dropped the connection", session.device().id);
            guard.take();
            notification_handler.stop_notifications();
            state.set(LinkState::Disconnected);
        });
    }

    /// Disconnects from the currently connected device. Safe to call when
    /// nothing is connected.
    pub async fn disconnect(&self) -> Result<()> {
        let mut connected_state = self.connected_state.lock().await;
        let result = self.teardown(&mut connected_state).await;
        self.inbound.lock().await.take();
        result
    }

    async fn teardown(&self, connected_state: &mut Option<ConnectedDeviceState>) -> Result<()> {
        let Some(current) = connected_state.take() else {
            self.state.set(LinkState::Disconnected);
            return Ok(());
        };
        current.watcher.cancel();
        self.notification_handler.stop_notifications();
        info!("Connected state cleared, releasing device {}", current.device.id);
        let result = self
            .connection_manager
            .disconnect(current.session.as_ref())
            .await;
        self.state.set(LinkState::Disconnected);
        result
    }

    pub async fn is_connected(&self) -> bool {
        let guard = self.connected_state.lock().await;
        match guard.as_ref() {
            Some(current) => current.session.is_connected().await,
            None => false,
        }
    }

    pub async fn connected_device(&self) -> Option<WirelessDevice> {
        self.connected_state
            .lock()
            .await
            .as_ref()
            .map(|current| current.device.clone())
    }

    /// Endpoint set of the connected device, empty when disconnected
    pub async fn endpoints(&self) -> Vec<Endpoint> {
        self.connected_state
            .lock()
            .await
            .as_ref()
            .map(|current| current.endpoints.clone())
            .unwrap_or_default()
    }

    /// Session plus the endpoint matching `characteristic`.
    async fn resolve(&self, characteristic: Uuid) -> Result<(Arc<dyn GattSession>, Endpoint)> {
        let guard = self.connected_state.lock().await;
        let current = guard.as_ref().ok_or(BridgeError::NotConnected)?;
        let endpoint = current
            .endpoints
            .iter()
            .find(|e| e.characteristic == characteristic)
            .copied()
            .ok_or(BridgeError::CharacteristicNotFound(characteristic))?;
        Ok((current.session.clone(), endpoint))
    }

    /// Writes `payload` to `characteristic`, or to the first writable
    /// endpoint when none is given. Long payloads go out in several writes.
    pub async fn write(&self, payload: &[u8], characteristic: Option<Uuid>) -> Result<()> {
        let (session, endpoint) = match characteristic {
            Some(id) => self.resolve(id).await?,
            None => {
                let guard = self.connected_state.lock().await;
                let current = guard.as_ref().ok_or(BridgeError::NotConnected)?;
                let endpoint = current
                    .endpoints
                    .iter()
                    .find(|e| e.flags.writable)
                    .copied()
                    .ok_or(BridgeError::NoWritableEndpoint)?;
                (current.session.clone(), endpoint)
            }
        };
        if !endpoint.flags.writable {
            return Err(BridgeError::WriteError(format!(
                "characteristic {} is not writable",
                endpoint.characteristic
            )));
        }

        let _write_guard = self.write_lock.lock().await;
        for chunk in payload.chunks(MAX_WRITE_CHUNK) {
            if let Err(e) = session.write(endpoint.characteristic, chunk).await {
                error!("Bluetooth write error: {}", e);
                return Err(match e {
                    BridgeError::WriteError(_) => e,
                    other => BridgeError::WriteError(other.to_string()),
                });
            }
        }
        debug!("Wrote {} bytes to {}", payload.len(), endpoint.characteristic);
        Ok(())
    }

    /// Reads the current value of a characteristic
    pub async fn read_characteristic(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        let (session, _) = self.resolve(characteristic).await?;
        session.read(characteristic).await.map_err(|e| match e {
            BridgeError::ReadError(_) => e,
            other => BridgeError::ReadError(other.to_string()),
        })
    }

    pub async fn subscribe(&self, characteristic: Uuid, on_value: NotificationCallback) -> Result<()> {
        let (session, _) = self.resolve(characteristic).await?;
        self.notification_handler
            .subscribe(session, characteristic, on_value)
            .await
    }

    pub async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
        self.resolve(characteristic).await?;
        if !self.notification_handler.unsubscribe(characteristic) {
            debug!("No active subscription on {}", characteristic);
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceTransport for BluetoothManager {
    fn kind(&self) -> TransportKind {
        TransportKind::Bluetooth
    }

    fn name(&self) -> String {
        match self.connected_state.try_lock() {
            Ok(guard) => match guard.as_ref() {
                Some(current) => format!("bluetooth:{}", current.device.name),
                None => "bluetooth".to_string(),
            },
            Err(_) => "bluetooth".to_string(),
        }
    }

    fn state(&self) -> LinkState {
        self.state.get()
    }

    fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.disconnect().await
    }

    /// Next notified chunk. Notifications are pushed, so this only drains
    /// what the subscription already delivered.
    async fn read(&self) -> Result<Option<Vec<u8>>> {
        let mut guard = self.inbound.lock().await;
        let Some(inbound) = guard.as_mut() else {
            return Err(BridgeError::NotConnected);
        };
        match timeout(self.read_timeout, inbound.recv()).await {
            Err(_elapsed) => Ok(Some(Vec::new())),
            Ok(Some(value)) => Ok(Some(value)),
            Ok(None) => {
                info!("Notification channel closed, device gone");
                guard.take();
                self.state.set(LinkState::Disconnected);
                Ok(None)
            }
        }
    }

    async fn write(&self, text: &str) -> Result<()> {
        BluetoothManager::write(self, frame_line(text).as_bytes(), None).await
    }
}
