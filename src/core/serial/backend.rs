//! Port enumeration and opening, behind a trait so the manager can run over
//! native ports or the in-process firmware simulation.

use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::core::error::{BridgeError, Result};
use crate::core::serial::types::{LinkDescriptor, SerialOptions};
use crate::core::simulation::SimulatedDevice;

/// Byte stream of an open port
pub trait SerialStreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SerialStreamIo for T {}

pub type BoxedSerialStream = Box<dyn SerialStreamIo>;

/// Source of serial ports
#[async_trait]
pub trait SerialBackend: Send + Sync {
    /// Lists the ports currently visible to the host
    fn available_ports(&self) -> Result<Vec<LinkDescriptor>>;

    /// Opens `descriptor` with the given line settings
    async fn open(
        &self,
        descriptor: &LinkDescriptor,
        options: &SerialOptions,
    ) -> Result<BoxedSerialStream>;
}

/// Host serial ports through `serialport` enumeration and `tokio-serial` streams
#[derive(Debug, Default, Clone)]
pub struct NativeSerialBackend;

#[cfg(feature = "serial")]
#[async_trait]
impl SerialBackend for NativeSerialBackend {
    fn available_ports(&self) -> Result<Vec<LinkDescriptor>> {
        let ports = serialport::available_ports()
            .map_err(|e| BridgeError::UnsupportedCapability(format!("serial enumeration: {}", e)))?;

        Ok(ports
            .into_iter()
            .map(|port| match port.port_type {
                serialport::SerialPortType::UsbPort(usb) => LinkDescriptor {
                    path: port.port_name,
                    manufacturer: usb.manufacturer,
                    vendor_id: Some(usb.vid),
                    product_id: Some(usb.pid),
                },
                _ => LinkDescriptor::new(port.port_name),
            })
            .collect())
    }

    async fn open(
        &self,
        descriptor: &LinkDescriptor,
        options: &SerialOptions,
    ) -> Result<BoxedSerialStream> {
        use tokio_serial::SerialPortBuilderExt;

        use crate::config::serial_config::ParityConfig;

        let data_bits = match options.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            8 => tokio_serial::DataBits::Eight,
            other => {
                return Err(BridgeError::ConnectionError(format!(
                    "unsupported data bits: {}",
                    other
                )));
            }
        };
        let stop_bits = match options.stop_bits {
            1 => tokio_serial::StopBits::One,
            2 => tokio_serial::StopBits::Two,
            other => {
                return Err(BridgeError::ConnectionError(format!(
                    "unsupported stop bits: {}",
                    other
                )));
            }
        };
        let parity = match options.parity {
            ParityConfig::None => tokio_serial::Parity::None,
            ParityConfig::Odd => tokio_serial::Parity::Odd,
            ParityConfig::Even => tokio_serial::Parity::Even,
        };

        let stream = tokio_serial::new(descriptor.path.as_str(), options.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .open_native_async()
            .map_err(|e| {
                BridgeError::ConnectionError(format!("{}: {}", descriptor.path, e))
            })?;

        Ok(Box::new(stream))
    }
}

#[cfg(not(feature = "serial"))]
#[async_trait]
impl SerialBackend for NativeSerialBackend {
    fn available_ports(&self) -> Result<Vec<LinkDescriptor>> {
        Err(BridgeError::UnsupportedCapability(
            "built without serial support".to_string(),
        ))
    }

    async fn open(
        &self,
        _descriptor: &LinkDescriptor,
        _options: &SerialOptions,
    ) -> Result<BoxedSerialStream> {
        Err(BridgeError::UnsupportedCapability(
            "built without serial support".to_string(),
        ))
    }
}

/// Path of the one port the loopback backend exposes
pub const LOOPBACK_PORT: &str = "sim://esp32";

/// Serial port wired to a [`SimulatedDevice`] through an in-memory pipe
pub struct LoopbackSerialBackend {
    device: Arc<Mutex<SimulatedDevice>>,
    links: std::sync::Mutex<Vec<CancellationToken>>,
}

impl LoopbackSerialBackend {
    pub fn new(device: Arc<Mutex<SimulatedDevice>>) -> Self {
        Self {
            device,
            links: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn device(&self) -> Arc<Mutex<SimulatedDevice>> {
        self.device.clone()
    }

    /// Drops every open pipe from the device side, like pulling the cable.
    pub fn unplug(&self) {
        let links = std::mem::take(&mut *self.links.lock().unwrap_or_else(|e| e.into_inner()));
        info!("Unplugging {} loopback link(s)", links.len());
        for token in links {
            token.cancel();
        }
    }
}

#[async_trait]
impl SerialBackend for LoopbackSerialBackend {
    fn available_ports(&self) -> Result<Vec<LinkDescriptor>> {
        Ok(vec![LinkDescriptor {
            path: LOOPBACK_PORT.to_string(),
            manufacturer: Some("Simulated".to_string()),
            vendor_id: Some(0x10c4),
            product_id: Some(0xea60),
        }])
    }

    async fn open(
        &self,
        descriptor: &LinkDescriptor,
        options: &SerialOptions,
    ) -> Result<BoxedSerialStream> {
        if descriptor.path != LOOPBACK_PORT {
            return Err(BridgeError::ConnectionError(format!(
                "No such port: {}",
                descriptor.path
            )));
        }
        let (ours, theirs) = tokio::io::duplex(options.buffer_size.max(64) * 16);
        let token = CancellationToken::new();
        self.links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(token.clone());
        let unsolicited = self.device.lock().await.subscribe_unsolicited();
        tokio::spawn(SimulatedDevice::serve(
            self.device.clone(),
            theirs,
            unsolicited,
            token,
        ));
        Ok(Box::new(ours))
    }
}
