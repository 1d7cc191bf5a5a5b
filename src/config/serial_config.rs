use serde::{Deserialize, Serialize};

use crate::core::serial::{
    DEFAULT_BAUD_RATE, DEFAULT_BUFFER_SIZE, READ_TIMEOUT_MS, WRITE_CHUNK_DELAY_MS, WRITE_CHUNK_SIZE,
};

/// Parity setting of a serial link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParityConfig {
    None,
    Odd,
    Even,
}

/// Serial link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port to open. When unset the first discovered port is used.
    pub port: Option<String>,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: ParityConfig,
    /// Size of the buffer handed to each read
    pub buffer_size: usize,
    /// Largest slice written to the port in one go
    pub chunk_size: usize,
    /// Pause between two chunks of the same write, so the device UART keeps up
    pub chunk_delay_ms: u64,
    /// How long a single read waits for data before reporting nothing
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: 8,
            stop_bits: 1,
            parity: ParityConfig::None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            chunk_size: WRITE_CHUNK_SIZE,
            chunk_delay_ms: WRITE_CHUNK_DELAY_MS,
            read_timeout_ms: READ_TIMEOUT_MS,
        }
    }
}
