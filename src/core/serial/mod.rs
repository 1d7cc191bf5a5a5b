//! Serial (byte-stream) transport
//! This module handles port discovery, opening and closing a single serial
//! link, the chunked write path and the polled read path.

mod backend;
mod constants;
mod manager;
mod types;

#[cfg(test)]
pub(crate) mod mock;

pub use backend::{
    BoxedSerialStream, LOOPBACK_PORT, LoopbackSerialBackend, NativeSerialBackend, SerialBackend,
};
pub use constants::*;
pub use manager::SerialManager;
pub use types::{LinkDescriptor, OpenLink, SerialOptions};
