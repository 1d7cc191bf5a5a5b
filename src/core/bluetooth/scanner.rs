use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::backend::GattBackend;
use crate::core::bluetooth::types::{ScanFilter, WirelessDevice};
use crate::core::error::Result;

pub struct BluetoothScanner {
    backend: Arc<dyn GattBackend>,
    cancel_token: Mutex<CancellationToken>,
}

impl BluetoothScanner {
    pub fn new(backend: Arc<dyn GattBackend>) -> Self {
        Self {
            backend,
            cancel_token: Mutex::new(CancellationToken::new()),
        }
    }

    /// Collects matching devices until `duration` elapses, the backend ends
    /// the scan, or [`stop_scan`](Self::stop_scan) is called. A device seen
    /// several times is reported once, with its latest signal strength.
    pub async fn scan(&self, filter: &ScanFilter, duration: Duration) -> Result<Vec<WirelessDevice>> {
        let cancel_token = {
            let mut guard = self.cancel_token.lock().unwrap_or_else(|e| e.into_inner());
            guard.cancel();
            *guard = CancellationToken::new();
            guard.clone()
        };

        info!("Starting bluetooth scan");
        let mut scan_stream = self.backend.scan(&filter.services).await?;
        let deadline = Instant::now() + duration;
        let mut found: Vec<WirelessDevice> = Vec::new();

        loop {
            tokio::select! {
                result = scan_stream.recv() => {
                    match result {
                        Some(device) => {
                            debug!("Found device - {:?}", device);
                            if !filter.matches(&device) {
                                continue;
                            }
                            match found.iter_mut().find(|d| d.id == device.id) {
                                Some(known) => *known = device,
                                None => {
                                    info!(
                                        "Found device: Address: {}, ID: {}, Name: {}, RSSI: {:?}",
                                        device.address, device.id, device.name, device.rssi
                                    );
                                    found.push(device);
                                }
                            }
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    debug!("Scan window elapsed");
                    break;
                }
                _ = cancel_token.cancelled() => {
                    info!("Bluetooth scan stopped.");
                    break;
                }
            }
        }

        Ok(found)
    }

    pub fn stop_scan(&self) {
        info!("Stopping Bluetooth scan.");
        self.cancel_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
    }
}
