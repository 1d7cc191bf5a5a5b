use serde::{Deserialize, Serialize};

use crate::core::logic::LogicRule;
use crate::core::pins::PinDirection;

/// Which link the bridge drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportChoice {
    Serial,
    Bluetooth,
    /// Serial-shaped link to the in-process firmware simulation
    SimulatedSerial,
    /// Bluetooth-shaped link to the in-process firmware simulation
    SimulatedBluetooth,
}

/// One entry of the pin table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinConfig {
    pub number: u8,
    pub name: String,
    pub direction: PinDirection,
}

impl PinConfig {
    pub fn input(number: u8, name: &str) -> Self {
        Self {
            number,
            name: name.to_string(),
            direction: PinDirection::Input,
        }
    }

    pub fn output(number: u8, name: &str) -> Self {
        Self {
            number,
            name: name.to_string(),
            direction: PinDirection::Output,
        }
    }
}

/// Session and logic engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub transport: TransportChoice,
    /// Cadence of the read loop while connected
    pub poll_interval_ms: u64,
    /// Pin table the session starts with
    pub pins: Vec<PinConfig>,
    /// Rules pushed to the device after connecting
    pub rules: Vec<LogicRule>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            transport: TransportChoice::Serial,
            poll_interval_ms: 100,
            pins: default_pin_table(),
            rules: Vec::new(),
        }
    }
}

/// Pin layout of an ESP32 devkit: GPIO 34-39 are input only.
pub fn default_pin_table() -> Vec<PinConfig> {
    vec![
        PinConfig::output(2, "LED"),
        PinConfig::output(4, "GPIO4"),
        PinConfig::output(5, "GPIO5"),
        PinConfig::output(16, "GPIO16"),
        PinConfig::output(17, "GPIO17"),
        PinConfig::output(18, "GPIO18"),
        PinConfig::output(19, "GPIO19"),
        PinConfig::output(23, "GPIO23"),
        PinConfig::input(32, "GPIO32"),
        PinConfig::input(33, "GPIO33"),
        PinConfig::input(34, "GPIO34"),
        PinConfig::input(35, "GPIO35"),
        PinConfig::input(36, "VP"),
        PinConfig::input(39, "VN"),
    ]
}
