//! Data structures of the serial transport.

use serde::{Deserialize, Serialize};

use crate::config::serial_config::{ParityConfig, SerialConfig};

/// A serial port found by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkDescriptor {
    /// OS path or name of the port, e.g. `/dev/ttyUSB0` or `COM3`
    pub path: String,
    pub manufacturer: Option<String>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl LinkDescriptor {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            manufacturer: None,
            vendor_id: None,
            product_id: None,
        }
    }
}

/// Line settings used when opening a port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialOptions {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: ParityConfig,
    pub buffer_size: usize,
}

impl SerialOptions {
    pub fn with_baud_rate(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Self::default()
        }
    }
}

impl Default for SerialOptions {
    fn default() -> Self {
        Self::from(&SerialConfig::default())
    }
}

impl From<&SerialConfig> for SerialOptions {
    fn from(config: &SerialConfig) -> Self {
        Self {
            baud_rate: config.baud_rate,
            data_bits: config.data_bits,
            stop_bits: config.stop_bits,
            parity: config.parity,
            buffer_size: config.buffer_size,
        }
    }
}

/// The link currently (or most recently) open
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenLink {
    pub descriptor: LinkDescriptor,
    pub options: SerialOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_follow_config_defaults() {
        let options = SerialOptions::default();
        assert_eq!(options.baud_rate, 115_200);
        assert_eq!(options.data_bits, 8);
        assert_eq!(options.parity, ParityConfig::None);
        assert_eq!(options.buffer_size, SerialConfig::default().buffer_size);

        let config = SerialConfig {
            parity: ParityConfig::Even,
            ..SerialConfig::default()
        };
        assert_eq!(SerialOptions::from(&config).parity, ParityConfig::Even);
    }
}
