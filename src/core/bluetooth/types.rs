//! Defines shared data structures for the Bluetooth module.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

/// Represents a discovered Bluetooth device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WirelessDevice {
    /// Platform-specific unique identifier for the device (especially important on macOS)
    pub id: String,
    /// Advertised name, "Unknown" when the device has none
    pub name: String,
    /// The address of the device (MAC address on most platforms, may be N/A on macOS)
    pub address: String,
    /// The signal strength (RSSI) of the device
    pub rssi: Option<i16>,
    /// Services listed in the advertisement
    pub services: Vec<Uuid>,
}

impl WirelessDevice {
    pub fn new(id: impl Into<String>, name: impl Into<String>, rssi: Option<i16>) -> Self {
        let id = id.into();
        let address = extract_mac_address(&id).unwrap_or_else(|| "N/A".to_string());
        Self {
            id,
            name: name.into(),
            address,
            rssi,
            services: Vec::new(),
        }
    }

    pub fn with_services(mut self, services: Vec<Uuid>) -> Self {
        self.services = services;
        self
    }
}

/// Pulls the last MAC-looking group out of a platform device id.
pub fn extract_mac_address(device_id: &str) -> Option<String> {
    static MAC: OnceLock<Option<Regex>> = OnceLock::new();
    let re = MAC
        .get_or_init(|| Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok())
        .as_ref()?;
    re.find_iter(device_id)
        .last()
        .map(|m| m.as_str().replace('-', ":").to_uppercase())
}

/// What a characteristic supports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EndpointFlags {
    pub readable: bool,
    pub writable: bool,
    pub notifiable: bool,
}

impl EndpointFlags {
    pub const READ: EndpointFlags = EndpointFlags {
        readable: true,
        writable: false,
        notifiable: false,
    };
    pub const WRITE: EndpointFlags = EndpointFlags {
        readable: false,
        writable: true,
        notifiable: false,
    };
    pub const NOTIFY: EndpointFlags = EndpointFlags {
        readable: false,
        writable: false,
        notifiable: true,
    };
}

/// One characteristic of the connected device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub flags: EndpointFlags,
}

/// Narrows scan results
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    /// Name must contain this text
    pub name_contains: Option<String>,
    /// Device must advertise at least one of these (any device when empty)
    pub services: Vec<Uuid>,
    /// Devices weaker than this, or without a reading, are skipped
    pub min_rssi: Option<i16>,
}

impl ScanFilter {
    pub fn matches(&self, device: &WirelessDevice) -> bool {
        if let Some(min) = self.min_rssi {
            match device.rssi {
                Some(rssi) if rssi >= min => {}
                _ => return false,
            }
        }
        if let Some(needle) = &self.name_contains {
            if !device.name.contains(needle.as_str()) {
                return false;
            }
        }
        self.services.is_empty() || self.services.iter().any(|s| device.services.contains(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::constants::UUID_UART_SERVICE;

    #[test]
    fn test_extract_mac_address() {
        assert_eq!(
            extract_mac_address("/org/bluez/hci0/dev_24-6f-28-aa-bb-cc").as_deref(),
            Some("24:6F:28:AA:BB:CC")
        );
        assert_eq!(
            WirelessDevice::new("bluetooth#BluetoothLE00:11:22:33:44:55-24:6f:28:00:00:01", "x", None)
                .address,
            "24:6F:28:00:00:01"
        );
        assert_eq!(WirelessDevice::new("F3B1-UUID", "x", None).address, "N/A");
    }

    #[test]
    fn test_scan_filter() {
        let device = WirelessDevice::new("dev", "ESP32 GPIO Bridge", Some(-60))
            .with_services(vec![UUID_UART_SERVICE]);

        assert!(ScanFilter::default().matches(&device));
        assert!(
            ScanFilter {
                name_contains: Some("ESP32".into()),
                services: vec![UUID_UART_SERVICE],
                min_rssi: Some(-80),
            }
            .matches(&device)
        );
        assert!(
            !ScanFilter {
                min_rssi: Some(-50),
                ..Default::default()
            }
            .matches(&device)
        );
        assert!(
            !ScanFilter {
                services: vec![Uuid::nil()],
                ..Default::default()
            }
            .matches(&device)
        );
        assert!(
            !ScanFilter {
                min_rssi: Some(-80),
                ..Default::default()
            }
            .matches(&WirelessDevice::new("dev", "ESP32", None))
        );
    }
}
