//! Frontend commands
//! This module defines the operations a frontend can invoke. Every command
//! reports failures as display strings so they can be shown as they are.

use std::path::Path;

use crate::core::bluetooth::WirelessDevice;
use crate::core::logic::LogicRule;
use crate::core::message_log::Message;
use crate::core::pins::Pin;
use crate::core::serial::LinkDescriptor;
use crate::core::transport::LinkState;
use crate::state::AppState;

/// Lists the serial ports the bridge could open
///
/// # Arguments
/// * `app_state` - The application state
pub async fn list_serial_ports(app_state: &AppState) -> Result<Vec<LinkDescriptor>, String> {
    app_state.list_serial_ports().await.map_err(|e| e.to_string())
}

/// Scans for wireless devices that pass the configured filter
///
/// # Returns
/// The devices found before the scan window elapsed
pub async fn start_scan(app_state: &AppState) -> Result<Vec<WirelessDevice>, String> {
    app_state.scan_devices().await.map_err(|e| e.to_string())
}

pub async fn stop_scan(app_state: &AppState) -> Result<(), String> {
    app_state.stop_scan().await;
    Ok(())
}

/// Opens the configured transport and asks the device for its state
///
/// # Arguments
/// * `app_state` - The application state
pub async fn connect(app_state: &AppState) -> Result<(), String> {
    app_state.connect().await.map_err(|e| format!("{:#}", e))?;
    app_state
        .session
        .request_state()
        .await
        .map_err(|e| e.to_string())
}

/// Disconnects from the current device. Does nothing when no link is open.
pub async fn disconnect(app_state: &AppState) -> Result<(), String> {
    app_state.disconnect().await.map_err(|e| e.to_string())
}

pub async fn reconnect(app_state: &AppState) -> Result<(), String> {
    app_state.reconnect_serial().await.map_err(|e| e.to_string())
}

pub fn get_connection_state(app_state: &AppState) -> LinkState {
    app_state.session.connection_state()
}

/// Changes the baud rate of the serial link
///
/// # Returns
/// Whether the link had to be reopened
pub async fn change_baud_rate(baud_rate: u32, app_state: &AppState) -> Result<bool, String> {
    app_state
        .change_baud_rate(baud_rate)
        .await
        .map_err(|e| e.to_string())
}

/// Sends a line to the device exactly as typed
pub async fn send_raw(text: String, app_state: &AppState) -> Result<(), String> {
    app_state.send_raw(&text).await.map_err(|e| e.to_string())
}

/// Drives an output pin directly
///
/// # Arguments
/// * `pin` - The output pin number
/// * `value` - The level to drive
pub async fn set_pin(pin: u8, value: bool, app_state: &AppState) -> Result<(), String> {
    app_state
        .session
        .set_pin(pin, value)
        .await
        .map_err(|e| e.to_string())
}

/// Stores a rule and pushes it to the device
pub async fn configure_rule(rule: LogicRule, app_state: &AppState) -> Result<(), String> {
    app_state
        .session
        .configure_rule(rule)
        .await
        .map_err(|e| e.to_string())
}

pub async fn get_pins(app_state: &AppState) -> Result<Vec<Pin>, String> {
    Ok(app_state.get_pins().await)
}

pub async fn get_rules(app_state: &AppState) -> Result<Vec<LogicRule>, String> {
    Ok(app_state.get_rules().await)
}

pub fn get_messages(app_state: &AppState) -> Result<Vec<Message>, String> {
    Ok(app_state.get_messages())
}

pub fn clear_messages(app_state: &AppState) -> Result<(), String> {
    app_state.session.clear_messages();
    Ok(())
}

/// Writes the message log to `path` as text
pub async fn export_messages(path: String, app_state: &AppState) -> Result<(), String> {
    app_state
        .session
        .export_messages_to_file(Path::new(&path))
        .await
        .map_err(|e| e.to_string())
}

pub async fn save_config(app_state: &AppState) -> Result<(), String> {
    app_state.save_config().await.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::config::engine_config::TransportChoice;
    use crate::core::logic::ConditionType;

    fn app_state() -> AppState {
        let mut config = AppConfig::default();
        config.engine.transport = TransportChoice::SimulatedSerial;
        config.engine.poll_interval_ms = 10;
        AppState::with_config(config, Path::new(""))
    }

    #[tokio::test]
    async fn test_commands_require_link() {
        let state = app_state();
        let err = set_pin(2, true, &state).await.unwrap_err();
        assert_eq!(err, "Not connected");
        assert!(disconnect(&state).await.is_ok());
        assert_eq!(get_connection_state(&state), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_session_through_commands() {
        let state = app_state();
        connect(&state).await.unwrap();

        set_pin(2, true, &state).await.unwrap();
        configure_rule(
            LogicRule::new(16, ConditionType::Not, vec![32], true),
            &state,
        )
        .await
        .unwrap();
        // The state dump may still report the old level before the rule lands
        let mut driven = false;
        for _ in 0..100 {
            let pins = get_pins(&state).await.unwrap();
            if pins.iter().any(|p| p.number == 16 && p.value) {
                driven = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(driven);
        assert_eq!(
            set_pin(32, true, &state).await.unwrap_err(),
            "Pin 32 is an input and cannot be written locally"
        );

        let messages = get_messages(&state).unwrap();
        assert!(messages.iter().any(|m| m.content == "SET_GPIO:2:1"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        export_messages(path.to_string_lossy().into_owned(), &state)
            .await
            .unwrap();
        let text = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(text.contains("SET_GPIO:2:1"));

        clear_messages(&state).unwrap();
        assert!(get_messages(&state).unwrap().is_empty());
        disconnect(&state).await.unwrap();
    }
}
