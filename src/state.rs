//! Application state management
//! Owns the configuration, the session and the link managers, and exposes the
//! operations a UI layer calls.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use log::{info, warn};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::config::engine_config::TransportChoice;
use crate::core::bluetooth::{BluetoothManager, GattBackend, SimulatedGattBackend, WirelessDevice};
use crate::core::logic::LogicRule;
use crate::core::message_log::Message;
use crate::core::pins::Pin;
use crate::core::serial::{
    LOOPBACK_PORT, LinkDescriptor, LoopbackSerialBackend, NativeSerialBackend, SerialBackend,
    SerialManager, SerialOptions,
};
use crate::core::session::{BridgeSession, StatusEvent};
use crate::core::simulation::SimulatedDevice;
use crate::core::transport::LinkState;

/// Global application state
pub struct AppState {
    pub config: AppConfig,
    config_dir: PathBuf,
    pub session: BridgeSession,
    serial: Mutex<Option<Arc<SerialManager>>>,
    bluetooth: Mutex<Option<Arc<BluetoothManager>>>,
    /// Firmware behind the simulated transports
    simulated_device: Arc<Mutex<SimulatedDevice>>,
    /// Stops the callback forwarders on shutdown
    listeners: CancellationToken,
}

impl AppState {
    /// Creates the state from the config stored in `config_dir`
    pub async fn new(config_dir: &Path) -> Result<Self> {
        let config = AppConfig::load_config(config_dir).await?;
        Ok(Self::with_config(config, config_dir))
    }

    pub fn with_config(config: AppConfig, config_dir: &Path) -> Self {
        let session = BridgeSession::new(&config.engine);
        let simulated_device = SimulatedDevice::new(&config.engine.pins).shared();
        Self {
            config,
            config_dir: config_dir.to_path_buf(),
            session,
            serial: Mutex::new(None),
            bluetooth: Mutex::new(None),
            simulated_device,
            listeners: CancellationToken::new(),
        }
    }

    pub fn simulated_device(&self) -> Arc<Mutex<SimulatedDevice>> {
        self.simulated_device.clone()
    }

    fn serial_backend(&self) -> Arc<dyn SerialBackend> {
        match self.config.engine.transport {
            TransportChoice::SimulatedSerial => {
                Arc::new(LoopbackSerialBackend::new(self.simulated_device.clone()))
            }
            _ => Arc::new(NativeSerialBackend),
        }
    }

    /// The serial manager of this app, created on first use so every open
    /// goes through the same manager and closes the previous link first.
    async fn serial_manager(&self) -> Arc<SerialManager> {
        let mut serial = self.serial.lock().await;
        match serial.as_ref() {
            Some(manager) => manager.clone(),
            None => {
                let manager = Arc::new(SerialManager::with_config(
                    self.serial_backend(),
                    &self.config.serial,
                ));
                *serial = Some(manager.clone());
                manager
            }
        }
    }

    /// The Bluetooth manager of this app, created on first use. Scans run on
    /// it so `stop_scan` can reach them.
    async fn bluetooth_manager(&self) -> Result<Arc<BluetoothManager>> {
        let mut bluetooth = self.bluetooth.lock().await;
        if let Some(manager) = bluetooth.as_ref() {
            return Ok(manager.clone());
        }
        let manager = match self.config.engine.transport {
            TransportChoice::SimulatedBluetooth => {
                let backend: Arc<dyn GattBackend> =
                    Arc::new(SimulatedGattBackend::new(self.simulated_device.clone()));
                BluetoothManager::new(backend, &self.config.bluetooth)
            }
            _ => BluetoothManager::native(&self.config.bluetooth).await?,
        };
        let manager = Arc::new(manager);
        *bluetooth = Some(manager.clone());
        Ok(manager)
    }

    /// Opens the transport chosen in the config and attaches it to the
    /// session. A link that is already open is closed first.
    pub async fn connect(&self) -> Result<()> {
        self.session.disconnect().await?;
        match self.config.engine.transport {
            TransportChoice::Serial | TransportChoice::SimulatedSerial => {
                self.connect_serial().await
            }
            TransportChoice::Bluetooth | TransportChoice::SimulatedBluetooth => {
                self.connect_bluetooth().await
            }
        }
    }

    /// Ports a serial link could be opened on
    pub async fn list_serial_ports(&self) -> Result<Vec<LinkDescriptor>> {
        Ok(self.serial_manager().await.discover().await?)
    }

    /// Wireless devices in range that pass the configured filter
    pub async fn scan_devices(&self) -> Result<Vec<WirelessDevice>> {
        let manager = self.bluetooth_manager().await?;
        Ok(manager.scan(None).await?)
    }

    /// Cuts a running scan short
    pub async fn stop_scan(&self) {
        if let Some(manager) = self.bluetooth.lock().await.as_ref() {
            manager.stop_scan();
        }
    }

    async fn connect_serial(&self) -> Result<()> {
        let manager = self.serial_manager().await;
        let descriptor = match &self.config.serial.port {
            Some(path) => LinkDescriptor::new(path.clone()),
            None => {
                let ports = manager.discover().await?;
                ports
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow!("No serial port found"))?
            }
        };
        if descriptor.path == LOOPBACK_PORT {
            info!("Using the simulated serial device");
        }

        manager
            .open(descriptor.clone(), SerialOptions::from(&self.config.serial))
            .await
            .with_context(|| format!("Failed to open {}", descriptor.path))?;
        self.session.attach(manager).await;
        Ok(())
    }

    async fn connect_bluetooth(&self) -> Result<()> {
        let manager = self.bluetooth_manager().await?;
        let device_id = match &self.config.bluetooth.device_id {
            Some(id) => id.clone(),
            None => {
                let devices = manager.scan(None).await?;
                devices
                    .into_iter()
                    .next()
                    .map(|device| device.id)
                    .ok_or_else(|| anyhow!("No matching Bluetooth device found"))?
            }
        };
        manager
            .connect(&device_id)
            .await
            .with_context(|| format!("Failed to connect to {}", device_id))?;
        self.session.attach(manager).await;
        Ok(())
    }

    /// Closes whatever link is active. Safe to call when nothing is open.
    pub async fn disconnect(&self) -> Result<()> {
        Ok(self.session.disconnect().await?)
    }

    /// Reopens the last serial port after the device was unplugged or the
    /// link was closed, and attaches it again.
    pub async fn reconnect_serial(&self) -> Result<()> {
        let manager = self
            .serial
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow!("No serial link to reconnect"))?;
        manager.reconnect().await?;
        self.session.attach(manager).await;
        Ok(())
    }

    pub async fn change_baud_rate(&self, baud_rate: u32) -> Result<bool> {
        let manager = self
            .serial
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow!("No serial link open"))?;
        Ok(manager.change_baud_rate(baud_rate).await?)
    }

    /// Pushes the rules from the config to the device
    pub async fn push_configured_rules(&self) -> Result<()> {
        for rule in &self.config.engine.rules {
            if let Err(e) = self.session.configure_rule(rule.clone()).await {
                warn!("Rule for pin {} rejected: {}", rule.output_pin, e);
            }
        }
        Ok(())
    }

    /// Calls `callback` for every status event until shutdown
    pub fn on_status<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(StatusEvent) + Send + 'static,
    {
        let mut events = self.session.on_status();
        let cancel = self.listeners.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => callback(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Status listener skipped {} events", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    /// Calls `callback` with the current link state and on every change
    pub fn on_connection_change<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(LinkState) + Send + 'static,
    {
        let mut states = self.session.watch_connection();
        let cancel = self.listeners.clone();
        tokio::spawn(async move {
            loop {
                let state = *states.borrow_and_update();
                callback(state);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = states.changed() => if changed.is_err() { break },
                }
            }
        })
    }

    pub async fn send_raw(&self, text: &str) -> Result<()> {
        Ok(self.session.send_raw(text).await?)
    }

    pub fn get_messages(&self) -> Vec<Message> {
        self.session.messages()
    }

    pub async fn get_pins(&self) -> Vec<Pin> {
        self.session.pins().await
    }

    pub async fn get_rules(&self) -> Vec<LogicRule> {
        self.session.rules().await
    }

    pub async fn save_config(&self) -> Result<()> {
        self.config.save_config(&self.config_dir).await
    }

    /// Stops the listeners and closes the link
    pub async fn shutdown(&self) -> Result<()> {
        self.listeners.cancel();
        self.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::core::logic::ConditionType;

    fn simulated(transport: TransportChoice) -> AppState {
        let mut config = AppConfig::default();
        config.engine.transport = transport;
        config.engine.poll_interval_ms = 10;
        config.bluetooth.scan_duration_secs = 1;
        config.engine.rules = vec![LogicRule::new(16, ConditionType::Nor, vec![32, 33], true)];
        AppState::with_config(config, Path::new(""))
    }

    #[tokio::test]
    async fn test_connect_over_simulated_serial() {
        let state = simulated(TransportChoice::SimulatedSerial);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _listener = state.on_connection_change(move |s| {
            let _ = tx.send(s);
        });

        state.connect().await.unwrap();
        state.push_configured_rules().await.unwrap();
        assert_eq!(state.get_rules().await.len(), 1);
        let device = state.simulated_device();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !device.lock().await.value(16) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let mut seen = Vec::new();
        while !seen.contains(&LinkState::Connected) {
            seen.push(
                tokio::time::timeout(Duration::from_secs(1), rx.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        assert!(state.change_baud_rate(57_600).await.unwrap());

        state.shutdown().await.unwrap();
        assert_eq!(state.session.connection_state(), LinkState::Disconnected);
        state.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_over_simulated_bluetooth() {
        let state = simulated(TransportChoice::SimulatedBluetooth);
        state.connect().await.unwrap();
        state.send_raw("GET_GPIO_STATE").await.unwrap();
        assert!(state.get_messages().iter().any(|m| m.content == "GET_GPIO_STATE"));
        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_native_bluetooth_without_feature() {
        if cfg!(feature = "bluetooth") {
            return;
        }
        let state = simulated(TransportChoice::Bluetooth);
        assert!(state.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_reconnect_without_link() {
        let state = simulated(TransportChoice::SimulatedSerial);
        assert!(state.reconnect_serial().await.is_err());
        assert!(state.send_raw("GET_GPIO_STATE").await.is_err());
    }

    #[tokio::test]
    async fn test_connect_twice_releases_previous_link() {
        let state = simulated(TransportChoice::SimulatedSerial);
        let device = state.simulated_device();

        state.connect().await.unwrap();
        state.connect().await.unwrap();
        assert_eq!(state.session.connection_state(), LinkState::Connected);

        tokio::time::timeout(Duration::from_secs(1), async {
            while device.lock().await.attached_links() != 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        state.send_raw("GET_GPIO_STATE").await.unwrap();
        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect() {
        let state = simulated(TransportChoice::SimulatedSerial);
        state.connect().await.unwrap();
        state.disconnect().await.unwrap();
        assert!(state.send_raw("GET_GPIO_STATE").await.is_err());

        state.reconnect_serial().await.unwrap();
        assert_eq!(state.session.connection_state(), LinkState::Connected);
        state.send_raw("GET_GPIO_STATE").await.unwrap();
        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_scan_ends_running_scan() {
        let mut config = AppConfig::default();
        config.engine.transport = TransportChoice::SimulatedBluetooth;
        config.bluetooth.scan_duration_secs = 30;
        let state = Arc::new(AppState::with_config(config, Path::new("")));

        let scan = {
            let state = state.clone();
            tokio::spawn(async move { state.scan_devices().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        state.stop_scan().await;

        let devices = tokio::time::timeout(Duration::from_secs(1), scan)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(devices.len(), 1);
    }

    #[tokio::test]
    async fn test_discovery_follows_transport() {
        let serial = simulated(TransportChoice::SimulatedSerial);
        let ports = serial.list_serial_ports().await.unwrap();
        assert_eq!(ports[0].path, LOOPBACK_PORT);

        let bluetooth = simulated(TransportChoice::SimulatedBluetooth);
        let devices = bluetooth.scan_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, crate::core::bluetooth::SIMULATED_DEVICE_ID);
    }
}
