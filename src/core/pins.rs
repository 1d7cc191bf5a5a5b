//! Name-indexed table of digital pins
//! Inbound status frames may update any pin; local writes are limited to outputs.
//! Every value change is published on a broadcast channel.

use std::collections::BTreeMap;

use chrono::{DateTime, Local};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::engine_config::PinConfig;
use crate::core::error::{BridgeError, Result};
use crate::core::protocol::Response;

const PIN_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinDirection {
    Input,
    Output,
}

/// A digital pin of the attached device
#[derive(Debug, Clone, Serialize)]
pub struct Pin {
    pub name: String,
    pub number: u8,
    /// Fixed at creation
    pub direction: PinDirection,
    pub value: bool,
    pub last_updated: DateTime<Local>,
}

impl Pin {
    fn from_config(config: &PinConfig) -> Self {
        Self {
            name: config.name.clone(),
            number: config.number,
            direction: config.direction,
            value: false,
            last_updated: Local::now(),
        }
    }
}

/// Published whenever a pin's value changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PinChange {
    pub number: u8,
    pub direction: PinDirection,
    pub value: bool,
}

pub struct PinTable {
    pins: BTreeMap<u8, Pin>,
    /// Latest analog readings, informational only
    analog: BTreeMap<u8, i32>,
    events: broadcast::Sender<PinChange>,
}

impl PinTable {
    pub fn new(configs: &[PinConfig]) -> Self {
        let (events, _) = broadcast::channel(PIN_EVENT_CAPACITY);
        let mut table = Self {
            pins: BTreeMap::new(),
            analog: BTreeMap::new(),
            events,
        };
        table.reconfigure(configs);
        table
    }

    /// Replaces the whole table. This is the only way a pin's direction changes.
    pub fn reconfigure(&mut self, configs: &[PinConfig]) {
        self.pins = configs
            .iter()
            .map(|config| (config.number, Pin::from_config(config)))
            .collect();
        self.analog.clear();
        info!("Pin table configured with {} pins", self.pins.len());
    }

    /// Parses a status line and applies it. Lines for pins that are not modeled
    /// are ignored.
    pub fn apply_line(&mut self, line: &str) -> Result<Option<PinChange>> {
        let response = Response::parse(line)?;
        Ok(self.apply(&response))
    }

    /// Applies an inbound frame. Inbound frames may update pins of either
    /// direction; frames other than `GPIO`/`ADC` are ignored here.
    pub fn apply(&mut self, frame: &Response) -> Option<PinChange> {
        match frame {
            Response::Gpio { pin, value } => match self.pins.get_mut(pin) {
                Some(entry) => {
                    entry.last_updated = Local::now();
                    if entry.value == *value {
                        return None;
                    }
                    entry.value = *value;
                    let change = PinChange {
                        number: *pin,
                        direction: entry.direction,
                        value: *value,
                    };
                    self.publish(change);
                    Some(change)
                }
                None => {
                    debug!("Ignoring status for unmodeled pin {}", pin);
                    None
                }
            },
            Response::Adc { pin, value } => {
                self.analog.insert(*pin, *value);
                None
            }
            _ => None,
        }
    }

    /// Local write. Returns whether the value changed.
    pub fn set(&mut self, number: u8, value: bool) -> Result<bool> {
        let entry = self
            .pins
            .get_mut(&number)
            .ok_or(BridgeError::UnknownPin(number))?;
        if entry.direction != PinDirection::Output {
            return Err(BridgeError::InvalidDirection(number));
        }
        entry.last_updated = Local::now();
        if entry.value == value {
            return Ok(false);
        }
        entry.value = value;
        let change = PinChange {
            number,
            direction: entry.direction,
            value,
        };
        self.publish(change);
        Ok(true)
    }

    pub fn get(&self, number: u8) -> Option<&Pin> {
        self.pins.get(&number)
    }

    /// Value of a pin, `false` for pins the table does not model
    pub fn value(&self, number: u8) -> bool {
        self.pins.get(&number).map(|pin| pin.value).unwrap_or(false)
    }

    pub fn pins(&self) -> Vec<Pin> {
        self.pins.values().cloned().collect()
    }

    pub fn analog(&self, pin: u8) -> Option<i32> {
        self.analog.get(&pin).copied()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PinChange> {
        self.events.subscribe()
    }

    fn publish(&self, change: PinChange) {
        // No subscriber is not an error
        let _ = self.events.send(change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::engine_config::default_pin_table;

    fn table() -> PinTable {
        PinTable::new(&default_pin_table())
    }

    #[test]
    fn test_set_rejects_every_input_pin() {
        let mut pins = table();
        let inputs: Vec<u8> = pins
            .pins()
            .iter()
            .filter(|pin| pin.direction == PinDirection::Input)
            .map(|pin| pin.number)
            .collect();
        assert!(!inputs.is_empty());

        for number in inputs {
            for value in [true, false] {
                let result = pins.set(number, value);
                assert!(matches!(result, Err(BridgeError::InvalidDirection(n)) if n == number));
                assert!(!pins.value(number));
            }
        }
    }

    #[test]
    fn test_set_output_reports_change() {
        let mut pins = table();
        assert!(pins.set(16, true).unwrap());
        assert!(!pins.set(16, true).unwrap());
        assert!(pins.get(16).unwrap().value);
        assert!(matches!(pins.set(99, true), Err(BridgeError::UnknownPin(99))));
    }

    #[test]
    fn test_inbound_frames_update_any_direction() {
        let mut pins = table();
        let change = pins.apply_line("GPIO:32:1").unwrap().unwrap();
        assert_eq!(change.number, 32);
        assert_eq!(change.direction, PinDirection::Input);
        assert!(pins.value(32));

        pins.apply_line("GPIO:16:1").unwrap();
        assert!(pins.value(16));

        // Same value again is not a change
        assert!(pins.apply_line("GPIO:32:1").unwrap().is_none());
    }

    #[test]
    fn test_unknown_pins_are_ignored() {
        let mut pins = table();
        assert!(pins.apply_line("GPIO:77:1").unwrap().is_none());
        assert!(pins.get(77).is_none());
    }

    #[test]
    fn test_malformed_line_is_an_error() {
        let mut pins = table();
        assert!(matches!(
            pins.apply_line("GPIO:32:yes"),
            Err(BridgeError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_analog_readings_are_kept_apart() {
        let mut pins = table();
        assert!(pins.apply_line("ADC:34:1234").unwrap().is_none());
        assert_eq!(pins.analog(34), Some(1234));
        assert!(!pins.value(34));
    }

    #[tokio::test]
    async fn test_changes_are_published() {
        let mut pins = table();
        let mut rx = pins.subscribe();

        pins.apply_line("GPIO:33:1").unwrap();
        pins.set(2, true).unwrap();
        pins.set(2, true).unwrap();

        assert_eq!(rx.recv().await.unwrap().number, 33);
        let change = rx.recv().await.unwrap();
        assert_eq!((change.number, change.value), (2, true));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_reconfigure_replaces_table() {
        let mut pins = table();
        pins.set(16, true).unwrap();
        pins.reconfigure(&[PinConfig::input(16, "BUTTON")]);
        assert_eq!(pins.pins().len(), 1);
        assert_eq!(pins.get(16).unwrap().direction, PinDirection::Input);
        assert!(!pins.value(16));
    }

    #[test]
    fn test_pin_serializes_for_listeners() {
        let table = table();
        let json = serde_json::to_value(table.get(2).unwrap()).unwrap();
        assert_eq!(json["number"], 2);
        assert_eq!(json["value"], false);
        assert!(json["last_updated"].is_string());
    }
}
