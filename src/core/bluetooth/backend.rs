//! Seams between the Bluetooth manager and the platform stack.
//! A backend scans and connects; a session is one connected device with its
//! services and characteristics.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::types::{EndpointFlags, WirelessDevice};
use crate::core::error::Result;

/// Values notified by one characteristic. Ends when the link drops.
pub type NotificationStream = BoxStream<'static, Result<Vec<u8>>>;

#[async_trait]
pub trait GattBackend: Send + Sync {
    /// Starts discovery. Devices arrive on the channel until the scan ends or
    /// the receiver is dropped.
    async fn scan(&self, services: &[Uuid]) -> Result<mpsc::Receiver<WirelessDevice>>;

    /// Opens a session to a device seen by a previous scan.
    async fn connect(&self, device_id: &str) -> Result<Arc<dyn GattSession>>;
}

#[async_trait]
pub trait GattSession: Send + Sync {
    fn device(&self) -> WirelessDevice;

    async fn is_connected(&self) -> bool;

    /// Primary services
    async fn services(&self) -> Result<Vec<Uuid>>;

    async fn characteristics(&self, service: Uuid) -> Result<Vec<(Uuid, EndpointFlags)>>;

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>>;

    async fn write(&self, characteristic: Uuid, payload: &[u8]) -> Result<()>;

    async fn notifications(&self, characteristic: Uuid) -> Result<NotificationStream>;

    /// Resolves once the link is gone, whoever dropped it.
    async fn wait_disconnected(&self);

    async fn disconnect(&self) -> Result<()>;
}
