//! Serial backend double for unit tests. Records every write call and counts
//! opens and shutdowns; reads never return data.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::core::error::{BridgeError, Result};
use crate::core::serial::backend::{BoxedSerialStream, SerialBackend};
use crate::core::serial::types::{LinkDescriptor, SerialOptions};

#[derive(Default)]
struct Recorded {
    chunks: Vec<Vec<u8>>,
    opened: Vec<u32>,
    shutdowns: usize,
    fail_opens: usize,
}

pub struct MockSerialBackend {
    recorded: Arc<Mutex<Recorded>>,
    supported: bool,
}

impl MockSerialBackend {
    pub fn recording() -> Self {
        Self {
            recorded: Arc::new(Mutex::new(Recorded::default())),
            supported: true,
        }
    }

    pub fn failing() -> Self {
        let backend = Self::recording();
        backend.recorded.lock().unwrap().fail_opens = usize::MAX;
        backend
    }

    pub fn unsupported() -> Self {
        Self {
            supported: false,
            ..Self::recording()
        }
    }

    pub fn fail_next_open(&self) {
        self.recorded.lock().unwrap().fail_opens = 1;
    }

    pub fn chunks(&self) -> Vec<Vec<u8>> {
        self.recorded.lock().unwrap().chunks.clone()
    }

    pub fn opened_baud_rates(&self) -> Vec<u32> {
        self.recorded.lock().unwrap().opened.clone()
    }

    pub fn shutdowns(&self) -> usize {
        self.recorded.lock().unwrap().shutdowns
    }
}

#[async_trait]
impl SerialBackend for MockSerialBackend {
    fn available_ports(&self) -> Result<Vec<LinkDescriptor>> {
        if !self.supported {
            return Err(BridgeError::UnsupportedCapability("mock".to_string()));
        }
        Ok(vec![LinkDescriptor {
            path: "/dev/ttyMOCK0".to_string(),
            manufacturer: Some("Espressif".to_string()),
            vendor_id: Some(0x303a),
            product_id: Some(0x1001),
        }])
    }

    async fn open(
        &self,
        descriptor: &LinkDescriptor,
        options: &SerialOptions,
    ) -> Result<BoxedSerialStream> {
        let mut recorded = self.recorded.lock().unwrap();
        if recorded.fail_opens > 0 {
            recorded.fail_opens -= 1;
            return Err(BridgeError::ConnectionError(format!(
                "{}: device busy",
                descriptor.path
            )));
        }
        recorded.opened.push(options.baud_rate);
        Ok(Box::new(MockStream {
            recorded: self.recorded.clone(),
        }))
    }
}

struct MockStream {
    recorded: Arc<Mutex<Recorded>>,
}

impl AsyncRead for MockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.recorded.lock().unwrap().chunks.push(buf.to_vec());
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.recorded.lock().unwrap().shutdowns += 1;
        Poll::Ready(Ok(()))
    }
}
