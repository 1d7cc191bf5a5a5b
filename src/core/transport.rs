//! Transport capability shared by the serial and the Bluetooth link managers
//! This module defines the link state machine value and the trait the session
//! drives, independent of how bytes reach the device.

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::core::error::Result;

/// Lifecycle state of a device link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// No link is open
    Disconnected,
    /// Enumerating links or devices
    Scanning,
    /// Open/connect in progress
    Connecting,
    /// Link open, reader and writer held
    Connected,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Scanning => write!(f, "scanning"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
        }
    }
}

/// Which kind of physical link a transport drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Serial,
    Bluetooth,
}

/// Single owner of a link's state. Observers get a `watch` receiver.
#[derive(Debug)]
pub struct LinkStateCell {
    label: &'static str,
    tx: watch::Sender<LinkState>,
}

impl LinkStateCell {
    pub fn new(label: &'static str) -> Self {
        let (tx, _rx) = watch::channel(LinkState::Disconnected);
        Self { label, tx }
    }

    pub fn get(&self) -> LinkState {
        *self.tx.borrow()
    }

    /// Moves to `next`, notifying observers only on an actual transition.
    pub fn set(&self, next: LinkState) {
        let mut previous = next;
        let changed = self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            previous = *current;
            *current = next;
            true
        });
        if changed {
            info!("{} link: {} -> {}", self.label, previous, next);
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.tx.subscribe()
    }
}

/// Open/close/read/write capability implemented by every link manager.
///
/// Opening is transport specific (a port descriptor for serial, a device id
/// for Bluetooth) and therefore lives on the concrete managers.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Human readable link name, for logging
    fn name(&self) -> String;

    fn state(&self) -> LinkState;

    fn watch_state(&self) -> watch::Receiver<LinkState>;

    fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Releases the link. Safe to call when already closed.
    async fn close(&self) -> Result<()>;

    /// Single read. `Ok(None)` means end of stream, an empty buffer means
    /// nothing arrived within the read window.
    async fn read(&self) -> Result<Option<Vec<u8>>>;

    /// Sends one line, appending the terminator if missing.
    async fn write(&self, text: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_state_display() {
        assert_eq!(LinkState::Connected.to_string(), "connected");
        assert_eq!(LinkState::Scanning.to_string(), "scanning");
    }

    #[tokio::test]
    async fn test_state_cell_notifies_only_on_change() {
        let cell = LinkStateCell::new("test");
        let mut rx = cell.subscribe();
        assert_eq!(cell.get(), LinkState::Disconnected);

        cell.set(LinkState::Connecting);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), LinkState::Connecting);

        cell.set(LinkState::Connecting);
        assert!(!rx.has_changed().unwrap());
        assert_eq!(cell.get(), LinkState::Connecting);
    }
}
