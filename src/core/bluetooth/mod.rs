//! Bluetooth LE (characteristic) transport
//! This module handles scanning, connecting, endpoint discovery and the
//! notification-driven read path for a single wireless device.

mod backend;
#[cfg(feature = "bluetooth")]
mod bluest_backend;
mod connection;
mod constants;
mod manager;
mod notification;
mod scanner;
mod simulated;
mod types;

// Re-export types that should be publicly accessible
pub use backend::{GattBackend, GattSession, NotificationStream};
#[cfg(feature = "bluetooth")]
pub use bluest_backend::BluestBackend;
pub use connection::ConnectionManager;
pub use constants::*; // Re-export all constants
pub use manager::BluetoothManager;
pub use notification::{NotificationCallback, NotificationHandler};
pub use scanner::BluetoothScanner;
pub use simulated::{SIMULATED_DEVICE_ID, SIMULATED_DEVICE_NAME, SimulatedGattBackend};
pub use types::{Endpoint, EndpointFlags, ScanFilter, WirelessDevice, extract_mac_address};
