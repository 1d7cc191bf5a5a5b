use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::{
    CONNECT_RETRY_DELAY_MS, DEFAULT_SCAN_DURATION_SECS, MAX_CONNECT_RETRIES, MIN_RSSI_THRESHOLD,
    UUID_UART_SERVICE,
};

/// Bluetooth LE settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Device id to connect to. When unset the first matching device is used.
    pub device_id: Option<String>,
    /// Only report devices whose name contains this text
    pub name_filter: Option<String>,
    /// Only report devices advertising one of these services
    pub service_filter: Vec<Uuid>,
    pub scan_duration_secs: u64,
    /// Devices weaker than this are ignored
    pub min_rssi: i16,
    pub max_connect_retries: u32,
    pub connect_retry_delay_ms: u64,
    /// How long a read waits for a notification before reporting nothing
    pub read_timeout_ms: u64,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        BluetoothConfig {
            device_id: None,
            name_filter: None,
            service_filter: vec![UUID_UART_SERVICE],
            scan_duration_secs: DEFAULT_SCAN_DURATION_SECS,
            min_rssi: MIN_RSSI_THRESHOLD,
            max_connect_retries: MAX_CONNECT_RETRIES,
            connect_retry_delay_ms: CONNECT_RETRY_DELAY_MS,
            read_timeout_ms: 50,
        }
    }
}
