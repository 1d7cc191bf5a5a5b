//! Line based GPIO wire protocol
//! This module parses and formats the ASCII frames exchanged with the device.
//!
//! Commands (bridge -> device):
//! - `GET_GPIO_STATE`
//! - `SET_GPIO:<pin>:<0|1>`
//! - `SET_LOGIC:<output>:<type>:<in1,in2,...>:<0|1>`
//!
//! Responses (device -> bridge):
//! - `GPIO:<pin>:<0|1>`
//! - `LOGIC:<output>:<type>:<in1,in2,...>:<0|1>`
//! - `ADC:<pin>:<integer>`
//! - `ERROR:<message>`

use log::warn;

use crate::core::error::{BridgeError, Result};
use crate::core::logic::{ConditionType, LogicRule};

pub const LINE_TERMINATOR: char = '\n';

/// Longest partial line kept while waiting for its terminator
const MAX_PENDING_LINE: usize = 4096;

/// Command sent to the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    GetGpioState,
    SetGpio { pin: u8, value: bool },
    SetLogic(LogicRule),
}

impl Command {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let mut fields = line.split(':');
        match fields.next() {
            Some("GET_GPIO_STATE") if line == "GET_GPIO_STATE" => Ok(Command::GetGpioState),
            Some("SET_GPIO") => {
                let (pin, value) = parse_pin_value(&mut fields, line)?;
                Ok(Command::SetGpio { pin, value })
            }
            Some("SET_LOGIC") => Ok(Command::SetLogic(parse_rule(&mut fields, line)?)),
            _ => Err(BridgeError::MalformedFrame(line.to_string())),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::GetGpioState => write!(f, "GET_GPIO_STATE"),
            Command::SetGpio { pin, value } => write!(f, "SET_GPIO:{}:{}", pin, bit(*value)),
            Command::SetLogic(rule) => write!(f, "SET_LOGIC:{}", format_rule(rule)),
        }
    }
}

/// Frame received from the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Gpio { pin: u8, value: bool },
    Logic(LogicRule),
    Adc { pin: u8, value: i32 },
    Error(String),
}

impl Response {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let Some((tag, rest)) = line.split_once(':') else {
            return Err(BridgeError::MalformedFrame(line.to_string()));
        };
        match tag {
            "GPIO" => {
                let (pin, value) = parse_pin_value(&mut rest.split(':'), line)?;
                Ok(Response::Gpio { pin, value })
            }
            "LOGIC" => Ok(Response::Logic(parse_rule(&mut rest.split(':'), line)?)),
            "ADC" => {
                let mut fields = rest.split(':');
                let pin = parse_number(fields.next(), line)?;
                let value = fields
                    .next()
                    .and_then(|v| v.trim().parse::<i32>().ok())
                    .ok_or_else(|| BridgeError::MalformedFrame(line.to_string()))?;
                if fields.next().is_some() {
                    return Err(BridgeError::MalformedFrame(line.to_string()));
                }
                Ok(Response::Adc { pin, value })
            }
            // The message may itself contain ':'
            "ERROR" => Ok(Response::Error(rest.to_string())),
            _ => Err(BridgeError::MalformedFrame(line.to_string())),
        }
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Response::Gpio { pin, value } => write!(f, "GPIO:{}:{}", pin, bit(*value)),
            Response::Logic(rule) => write!(f, "LOGIC:{}", format_rule(rule)),
            Response::Adc { pin, value } => write!(f, "ADC:{}:{}", pin, value),
            Response::Error(message) => write!(f, "ERROR:{}", message),
        }
    }
}

/// Appends the line terminator unless `text` already ends with one.
pub fn frame_line(text: &str) -> String {
    if text.ends_with(LINE_TERMINATOR) {
        text.to_string()
    } else {
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push(LINE_TERMINATOR);
        line
    }
}

/// Reassembles complete lines out of arbitrarily split reads.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes in and returns every line they complete, without terminators.
    /// Blank lines are skipped.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                let raw = std::mem::take(&mut self.pending);
                let text = String::from_utf8_lossy(&raw);
                let text = text.trim_end_matches('\r');
                if !text.trim().is_empty() {
                    lines.push(text.to_string());
                }
            } else {
                self.pending.push(byte);
            }
        }
        if self.pending.len() > MAX_PENDING_LINE {
            warn!("Discarding {} bytes without a line terminator", self.pending.len());
            self.pending.clear();
        }
        lines
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

fn bit(value: bool) -> char {
    if value { '1' } else { '0' }
}

fn format_rule(rule: &LogicRule) -> String {
    let inputs = rule
        .input_pins
        .iter()
        .map(|pin| pin.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "{}:{}:{}:{}",
        rule.output_pin,
        rule.condition,
        inputs,
        bit(rule.enabled)
    )
}

fn parse_bit(field: Option<&str>, line: &str) -> Result<bool> {
    match field.map(str::trim) {
        Some("1") => Ok(true),
        Some("0") => Ok(false),
        _ => Err(BridgeError::MalformedFrame(line.to_string())),
    }
}

fn parse_number(field: Option<&str>, line: &str) -> Result<u8> {
    field
        .and_then(|f| f.trim().parse::<u8>().ok())
        .ok_or_else(|| BridgeError::MalformedFrame(line.to_string()))
}

fn parse_pin_value<'a>(fields: &mut impl Iterator<Item = &'a str>, line: &str) -> Result<(u8, bool)> {
    let pin = parse_number(fields.next(), line)?;
    let value = parse_bit(fields.next(), line)?;
    if fields.next().is_some() {
        return Err(BridgeError::MalformedFrame(line.to_string()));
    }
    Ok((pin, value))
}

/// Parses `<output>:<type>:<in1,in2,...>:<0|1>`. Pin counts are checked by the
/// rule engine, not here.
fn parse_rule<'a>(fields: &mut impl Iterator<Item = &'a str>, line: &str) -> Result<LogicRule> {
    let output_pin = parse_number(fields.next(), line)?;
    let condition = fields
        .next()
        .and_then(|f| f.trim().parse::<ConditionType>().ok())
        .ok_or_else(|| BridgeError::MalformedFrame(line.to_string()))?;
    let input_pins = fields
        .next()
        .ok_or_else(|| BridgeError::MalformedFrame(line.to_string()))?
        .split(',')
        .map(|pin| parse_number(Some(pin), line))
        .collect::<Result<Vec<u8>>>()?;
    let enabled = parse_bit(fields.next(), line)?;
    if fields.next().is_some() {
        return Err(BridgeError::MalformedFrame(line.to_string()));
    }
    Ok(LogicRule {
        output_pin,
        condition,
        input_pins,
        enabled,
    })
}
