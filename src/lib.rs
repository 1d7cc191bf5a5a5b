//! GPIO Link Bridge library
//! Drives a microcontroller's pins over a serial or Bluetooth LE link and
//! evaluates logic rules against them.

// Module declarations
pub mod commands;
pub mod config;
pub mod core;
pub mod logging;
pub mod state;
pub mod utils;

/// Installs the forwarding logger, falling back to env_logger when another
/// logger is already in place.
pub fn setup_logging(level: log::Level) {
    if logging::BridgeLogger::init(level).is_err() {
        let _ = env_logger::builder()
            .filter_level(level.to_level_filter())
            .try_init();
    }
    log::info!("Logging initialized");
}
