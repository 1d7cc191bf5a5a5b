//! Bluetooth connection handling
//! This module connects to a device, enumerates its endpoints and tears the
//! session down again.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::core::bluetooth::backend::{GattBackend, GattSession};
use crate::core::bluetooth::types::Endpoint;
use crate::core::error::{BridgeError, Result};

/// Connection manager for a GATT device
#[derive(Clone)]
pub struct ConnectionManager {
    backend: Arc<dyn GattBackend>,
    max_retries: u32,
    retry_delay: u64,
}

impl ConnectionManager {
    pub fn new(backend: Arc<dyn GattBackend>, max_retries: u32, retry_delay: u64) -> Self {
        Self {
            backend,
            max_retries: max_retries.max(1),
            retry_delay,
        }
    }

    /// Connect to the device with retry mechanism
    pub async fn connect_with_retry(
        &self,
        device_id: &str,
    ) -> Result<(Arc<dyn GattSession>, Vec<Endpoint>)> {
        let mut retry_count = 0;
        let mut last_error = None;

        while retry_count < self.max_retries {
            match self.try_connect(device_id).await {
                Ok(connected) => {
                    info!("Successfully connected to device {}", device_id);
                    return Ok(connected);
                }
                Err(e) => {
                    warn!("Connection attempt {} failed: {}", retry_count + 1, e);
                    last_error = Some(e);

                    if retry_count < self.max_retries - 1 {
                        info!("Retrying connection in {} ms...", self.retry_delay);
                        tokio::time::sleep(Duration::from_millis(self.retry_delay)).await;
                    }
                }
            }
            retry_count += 1;
        }

        Err(BridgeError::ConnectionError(match last_error {
            Some(e) => format!(
                "{} (after {} attempts)",
                e.to_string().trim_start_matches("Connection failed: "),
                self.max_retries
            ),
            None => format!("Failed to connect after {} attempts", self.max_retries),
        }))
    }

    /// Try to connect once and build the endpoint set
    async fn try_connect(&self, device_id: &str) -> Result<(Arc<dyn GattSession>, Vec<Endpoint>)> {
        info!("Initiating connection to {}...", device_id);
        let session = self.backend.connect(device_id).await?;

        info!("Connection successful, discovering services...");
        match Self::discover_endpoints(session.as_ref()).await {
            Ok(endpoints) => Ok((session, endpoints)),
            Err(e) => {
                if let Err(disconnect_error) = session.disconnect().await {
                    warn!("Cleanup after failed discovery: {}", disconnect_error);
                }
                Err(e)
            }
        }
    }

    /// Enumerates primary services, then the characteristics of each.
    pub async fn discover_endpoints(session: &dyn GattSession) -> Result<Vec<Endpoint>> {
        let mut endpoints = Vec::new();
        for service in session.services().await? {
            debug!("Available service: {}", service);
            for (characteristic, flags) in session.characteristics(service).await? {
                debug!("  characteristic {} {:?}", characteristic, flags);
                endpoints.push(Endpoint {
                    service,
                    characteristic,
                    flags,
                });
            }
        }
        info!("Discovered {} endpoint(s)", endpoints.len());
        Ok(endpoints)
    }

    /// Disconnect from the device
    pub async fn disconnect(&self, session: &dyn GattSession) -> Result<()> {
        let id = session.device().id;
        if session.is_connected().await {
            info!("Disconnecting from device {}", id);
            session.disconnect().await?;
            info!("Successfully disconnected");
        } else {
            info!("Device {} not connected", id);
        }
        Ok(())
    }
}
