//! Core functionality of the GPIO bridge
//! Transports, the wire protocol, the pin table, the rule engine, the message
//! log and the session tying them together.

pub mod bluetooth;
pub mod error;
pub mod logic;
pub mod message_log;
pub mod pins;
pub mod protocol;
pub mod serial;
pub mod session;
pub mod simulation;
pub mod transport;

// Re-export commonly used types
pub use bluetooth::BluetoothManager;
pub use error::{BridgeError, Result};
pub use serial::SerialManager;
pub use session::{BridgeSession, StatusEvent};
pub use transport::{DeviceTransport, LinkState, TransportKind};
