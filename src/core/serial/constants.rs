//! Defaults of the serial link.

/// Default line speed of the firmware console
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default read buffer handed to each read call
pub const DEFAULT_BUFFER_SIZE: usize = 255;

/// Largest slice written in one go
pub const WRITE_CHUNK_SIZE: usize = 512;

/// Pause between two chunks of one write
pub const WRITE_CHUNK_DELAY_MS: u64 = 5;

/// How long one read waits before reporting that nothing arrived
pub const READ_TIMEOUT_MS: u64 = 50;
