//! Error types shared by the transports, the pin table and the rule engine.

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the device bridge core
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The host has no usable implementation of the requested transport
    #[error("Unsupported capability: {0}")]
    UnsupportedCapability(String),

    /// Opening a serial link or connecting to a wireless device failed
    #[error("Connection failed: {0}")]
    ConnectionError(String),

    /// An operation needed an open link but there is none
    #[error("Not connected")]
    NotConnected,

    /// Mid-session read failure
    #[error("Read error: {0}")]
    ReadError(String),

    /// Mid-session write failure
    #[error("Write error: {0}")]
    WriteError(String),

    /// Local write attempted on an input pin
    #[error("Pin {0} is an input and cannot be written locally")]
    InvalidDirection(u8),

    /// Pin number is not part of the pin table
    #[error("Unknown pin: {0}")]
    UnknownPin(u8),

    /// Rule rejected at upsert time
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    /// Characteristic is not in the endpoint set of the connected device
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    /// The connected device exposes no writable characteristic
    #[error("No writable endpoint on connected device")]
    NoWritableEndpoint,

    /// Inbound text did not match any known response shape
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            BridgeError::InvalidDirection(32).to_string(),
            "Pin 32 is an input and cannot be written locally"
        );
        assert_eq!(BridgeError::NotConnected.to_string(), "Not connected");
    }
}
