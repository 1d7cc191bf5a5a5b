//! Host Bluetooth LE through bluest

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bluest::{Adapter, Characteristic, Device, Service};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::backend::{GattBackend, GattSession, NotificationStream};
use crate::core::bluetooth::constants::LINK_CHECK_INTERVAL_MS;
use crate::core::bluetooth::types::{EndpointFlags, WirelessDevice};
use crate::core::error::{BridgeError, Result};

const SCAN_CHANNEL_CAPACITY: usize = 32;
const NOTIFY_CHANNEL_CAPACITY: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct BluestBackend {
    adapter: Adapter,
    /// Devices seen by scans, by id
    devices: Arc<Mutex<HashMap<String, Device>>>,
}

impl BluestBackend {
    pub async fn new() -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| BridgeError::UnsupportedCapability("No Bluetooth adapter found".to_string()))?;
        adapter
            .wait_available()
            .await
            .map_err(|e| BridgeError::UnsupportedCapability(e.to_string()))?;
        info!("Bluetooth adapter is available.");
        Ok(Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn describe(device: &Device, rssi: Option<i16>, services: Vec<Uuid>) -> WirelessDevice {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let rssi = match rssi {
            Some(rssi) => Some(rssi),
            None => device.rssi().await.ok(),
        };
        WirelessDevice::new(device.id().to_string(), name, rssi).with_services(services)
    }
}

#[async_trait]
impl GattBackend for BluestBackend {
    async fn scan(&self, services: &[Uuid]) -> Result<mpsc::Receiver<WirelessDevice>> {
        let (tx, rx) = mpsc::channel(SCAN_CHANNEL_CAPACITY);
        let adapter = self.adapter.clone();
        let devices = self.devices.clone();
        let services = services.to_vec();

        tokio::spawn(async move {
            // Devices already connected to the host do not advertise
            match adapter.connected_devices().await {
                Ok(connected) => {
                    for device in connected {
                        let info = Self::describe(&device, None, Vec::new()).await;
                        lock(&devices).insert(info.id.clone(), device);
                        if tx.send(info).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!("Failed to list connected devices: {}", e),
            }

            let mut scan_stream = match adapter.scan(&services).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to start scan: {}", e);
                    return;
                }
            };
            while let Some(discovered) = scan_stream.next().await {
                let mut info = Self::describe(
                    &discovered.device,
                    discovered.rssi,
                    discovered.adv_data.services,
                )
                .await;
                if let Some(local_name) = discovered.adv_data.local_name {
                    info.name = local_name;
                }
                debug!("Found device - {:?}", info);
                lock(&devices).insert(info.id.clone(), discovered.device);
                if tx.send(info).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn connect(&self, device_id: &str) -> Result<Arc<dyn GattSession>> {
        let device = lock(&self.devices)
            .get(device_id)
            .cloned()
            .ok_or_else(|| BridgeError::ConnectionError(format!("Device not found with ID: {}", device_id)))?;

        if !device.is_connected().await {
            self.adapter
                .connect_device(&device)
                .await
                .map_err(|e| BridgeError::ConnectionError(e.to_string()))?;
        }

        let info = Self::describe(&device, None, Vec::new()).await;
        Ok(Arc::new(BluestSession {
            adapter: self.adapter.clone(),
            device,
            info,
            services: Mutex::new(HashMap::new()),
            characteristics: Mutex::new(HashMap::new()),
        }))
    }
}

struct BluestSession {
    adapter: Adapter,
    device: Device,
    info: WirelessDevice,
    services: Mutex<HashMap<Uuid, Service>>,
    characteristics: Mutex<HashMap<Uuid, Characteristic>>,
}

impl BluestSession {
    fn characteristic(&self, id: Uuid) -> Result<Characteristic> {
        lock(&self.characteristics)
            .get(&id)
            .cloned()
            .ok_or(BridgeError::CharacteristicNotFound(id))
    }
}

#[async_trait]
impl GattSession for BluestSession {
    fn device(&self) -> WirelessDevice {
        self.info.clone()
    }

    async fn is_connected(&self) -> bool {
        self.device.is_connected().await
    }

    async fn services(&self) -> Result<Vec<Uuid>> {
        let services = self
            .device
            .services()
            .await
            .map_err(|e| BridgeError::ConnectionError(e.to_string()))?;
        let mut known = lock(&self.services);
        Ok(services
            .into_iter()
            .map(|service| {
                let uuid = service.uuid();
                known.insert(uuid, service);
                uuid
            })
            .collect())
    }

    async fn characteristics(&self, service: Uuid) -> Result<Vec<(Uuid, EndpointFlags)>> {
        let handle = lock(&self.services)
            .get(&service)
            .cloned()
            .ok_or_else(|| BridgeError::ConnectionError(format!("service {} not present", service)))?;
        let characteristics = handle
            .characteristics()
            .await
            .map_err(|e| BridgeError::ConnectionError(e.to_string()))?;

        let mut endpoints = Vec::with_capacity(characteristics.len());
        for characteristic in characteristics {
            let properties = characteristic
                .properties()
                .await
                .map_err(|e| BridgeError::ConnectionError(e.to_string()))?;
            let flags = EndpointFlags {
                readable: properties.read,
                writable: properties.write || properties.write_without_response,
                notifiable: properties.notify || properties.indicate,
            };
            let uuid = characteristic.uuid();
            lock(&self.characteristics).insert(uuid, characteristic);
            endpoints.push((uuid, flags));
        }
        Ok(endpoints)
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        self.characteristic(characteristic)?
            .read()
            .await
            .map_err(|e| BridgeError::ReadError(e.to_string()))
    }

    async fn write(&self, characteristic: Uuid, payload: &[u8]) -> Result<()> {
        self.characteristic(characteristic)?
            .write(payload)
            .await
            .map_err(|e| BridgeError::WriteError(e.to_string()))
    }

    async fn notifications(&self, characteristic: Uuid) -> Result<NotificationStream> {
        let characteristic = self.characteristic(characteristic)?;
        let (tx, rx) = mpsc::channel(NOTIFY_CHANNEL_CAPACITY);

        // The bluest stream borrows the characteristic, so it lives in its own task
        tokio::spawn(async move {
            match characteristic.notify().await {
                Ok(mut values) => {
                    while let Some(value) = values.next().await {
                        let value = value.map_err(|e| BridgeError::ReadError(e.to_string()));
                        if tx.send(value).await.is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(BridgeError::ReadError(e.to_string()))).await;
                }
            }
        });

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|value| (value, rx))
        })
        .boxed())
    }

    async fn wait_disconnected(&self) {
        while self.device.is_connected().await {
            tokio::time::sleep(Duration::from_millis(LINK_CHECK_INTERVAL_MS)).await;
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.adapter
            .disconnect_device(&self.device)
            .await
            .map_err(|e| BridgeError::ConnectionError(e.to_string()))
    }
}
