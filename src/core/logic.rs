//! Combinational logic rules binding output pins to input pins
//!
//! The engine keeps [`MAX_RULES`] slots, exactly like the firmware it mirrors.
//! Slot selection on upsert:
//! 1. the slot already holding a rule for the same output,
//! 2. otherwise the first free slot,
//! 3. otherwise slot 0, evicting whatever rule lives there.
//!
//! Step 3 silently drops a rule for a different output. The firmware does the
//! same, so the two tables stay identical.

use std::collections::BTreeSet;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::core::error::{BridgeError, Result};
use crate::core::pins::{PinDirection, PinTable};

/// Number of rule slots
pub const MAX_RULES: usize = 4;

/// Largest input list of a multi-input gate
pub const MAX_RULE_INPUTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConditionType {
    And,
    Or,
    Xor,
    Not,
    Nand,
    Nor,
}

impl ConditionType {
    /// Applies the gate to the input values.
    pub fn apply(self, inputs: &[bool]) -> bool {
        match self {
            ConditionType::And => inputs.iter().all(|v| *v),
            ConditionType::Or => inputs.iter().any(|v| *v),
            ConditionType::Xor => inputs.iter().filter(|v| **v).count() % 2 == 1,
            ConditionType::Not => !inputs.first().copied().unwrap_or(false),
            ConditionType::Nand => !ConditionType::And.apply(inputs),
            ConditionType::Nor => !ConditionType::Or.apply(inputs),
        }
    }

    fn accepts_input_count(self, count: usize) -> bool {
        match self {
            ConditionType::Not => count == 1,
            _ => (1..=MAX_RULE_INPUTS).contains(&count),
        }
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConditionType::And => "AND",
            ConditionType::Or => "OR",
            ConditionType::Xor => "XOR",
            ConditionType::Not => "NOT",
            ConditionType::Nand => "NAND",
            ConditionType::Nor => "NOR",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for ConditionType {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "AND" => Ok(ConditionType::And),
            "OR" => Ok(ConditionType::Or),
            "XOR" => Ok(ConditionType::Xor),
            "NOT" => Ok(ConditionType::Not),
            "NAND" => Ok(ConditionType::Nand),
            "NOR" => Ok(ConditionType::Nor),
            other => Err(BridgeError::InvalidRule(format!(
                "unknown condition type {}",
                other
            ))),
        }
    }
}

/// One output pin driven by a gate over input pins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicRule {
    pub output_pin: u8,
    pub condition: ConditionType,
    pub input_pins: Vec<u8>,
    pub enabled: bool,
}

impl LogicRule {
    pub fn new(output_pin: u8, condition: ConditionType, input_pins: Vec<u8>, enabled: bool) -> Self {
        Self {
            output_pin,
            condition,
            input_pins,
            enabled,
        }
    }

    fn validate_shape(&self) -> Result<()> {
        if self.condition.accepts_input_count(self.input_pins.len()) {
            return Ok(());
        }
        let expected = match self.condition {
            ConditionType::Not => "exactly 1".to_string(),
            _ => format!("1 to {}", MAX_RULE_INPUTS),
        };
        Err(BridgeError::InvalidRule(format!(
            "{} rule for pin {} needs {} inputs, got {}",
            self.condition,
            self.output_pin,
            expected,
            self.input_pins.len()
        )))
    }
}

/// Where an upserted rule landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub slot: usize,
    /// Rule previously in that slot, if any
    pub replaced: Option<LogicRule>,
}

/// Output command produced by an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinCommand {
    pub pin: u8,
    pub value: bool,
}

#[derive(Debug, Default, Clone)]
pub struct RuleEngine {
    slots: [Option<LogicRule>; MAX_RULES],
    overrides: BTreeSet<u8>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and stores `rule`, clearing any manual override on its output.
    pub fn upsert(&mut self, rule: LogicRule, pins: &PinTable) -> Result<UpsertOutcome> {
        rule.validate_shape()?;
        match pins.get(rule.output_pin) {
            Some(pin) if pin.direction == PinDirection::Output => {}
            Some(_) => return Err(BridgeError::InvalidDirection(rule.output_pin)),
            None => return Err(BridgeError::UnknownPin(rule.output_pin)),
        }
        self.overrides.remove(&rule.output_pin);
        Ok(self.place(rule))
    }

    /// Stores a rule echoed by the device. Same slot policy as [`upsert`](Self::upsert)
    /// but the manual override on the output is left alone.
    pub fn apply_echo(&mut self, rule: LogicRule) -> Result<UpsertOutcome> {
        rule.validate_shape()?;
        Ok(self.place(rule))
    }

    fn place(&mut self, rule: LogicRule) -> UpsertOutcome {
        let slot = self
            .slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|r| r.output_pin == rule.output_pin))
            .or_else(|| self.slots.iter().position(Option::is_none))
            .unwrap_or(0);

        if let Some(evicted) = self.slots[slot]
            .as_ref()
            .filter(|existing| existing.output_pin != rule.output_pin)
        {
            warn!(
                "Rule table full, rule for pin {} in slot 0 replaced by rule for pin {}",
                evicted.output_pin, rule.output_pin
            );
        }
        debug!("Rule for pin {} stored in slot {}", rule.output_pin, slot);
        let replaced = self.slots[slot].replace(rule);
        UpsertOutcome { slot, replaced }
    }

    /// Writes `value` to an output and stops rules from driving it until the
    /// next upsert for that pin.
    pub fn set_override(&mut self, pin: u8, value: bool, pins: &mut PinTable) -> Result<PinCommand> {
        pins.set(pin, value)?;
        self.overrides.insert(pin);
        Ok(PinCommand { pin, value })
    }

    pub fn is_overridden(&self, pin: u8) -> bool {
        self.overrides.contains(&pin)
    }

    /// Recomputes every enabled, non-overridden rule from the current pin values.
    /// Returns a command for each output whose value changed.
    pub fn evaluate(&self, pins: &mut PinTable) -> Vec<PinCommand> {
        let mut commands = Vec::new();
        for rule in self.slots.iter().flatten() {
            if !rule.enabled || self.overrides.contains(&rule.output_pin) {
                continue;
            }
            let inputs: Vec<bool> = rule.input_pins.iter().map(|pin| pins.value(*pin)).collect();
            let result = rule.condition.apply(&inputs);
            match pins.set(rule.output_pin, result) {
                Ok(true) => {
                    debug!(
                        "{} rule drives pin {} to {}",
                        rule.condition, rule.output_pin, result
                    );
                    commands.push(PinCommand {
                        pin: rule.output_pin,
                        value: result,
                    });
                }
                Ok(false) => {}
                Err(e) => warn!("Skipping rule for pin {}: {}", rule.output_pin, e),
            }
        }
        commands
    }

    /// Rules in slot order
    pub fn rules(&self) -> Vec<LogicRule> {
        self.slots.iter().flatten().cloned().collect()
    }

    pub fn slots(&self) -> &[Option<LogicRule>; MAX_RULES] {
        &self.slots
    }

    pub fn rule_for(&self, output_pin: u8) -> Option<&LogicRule> {
        self.slots
            .iter()
            .flatten()
            .find(|rule| rule.output_pin == output_pin)
    }
}
