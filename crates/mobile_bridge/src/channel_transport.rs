//! Transport whose port is driven by the host application
//!
//! Writes are queued on a bounded channel that Dart drains and forwards to
//! the USB serial driver. A full queue counts against the write timeout.

use async_trait::async_trait;
use microlink_core::{CoreError, Result, Transport};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Outgoing chunks buffered before writes start timing out
pub const DEFAULT_OUTGOING_CAPACITY: usize = 256;

pub struct ChannelTransport {
    tx: mpsc::Sender<Vec<u8>>,
    open: bool,
}

impl ChannelTransport {
    /// Create a closed transport and the queue Dart drains
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, open: false }, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn open(&mut self) -> Result<()> {
        if self.tx.is_closed() {
            return Err(CoreError::CantOpenPort {
                port: "host channel".into(),
                reason: "outgoing queue has no reader".into(),
            });
        }
        self.open = true;
        debug!("Channel transport opened");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        debug!("Channel transport closed");
        Ok(())
    }

    async fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        if !self.open {
            return Err(CoreError::NotConnected);
        }
        match tokio::time::timeout(timeout, self.tx.send(data.to_vec())).await {
            Ok(Ok(())) => {
                trace!("Queued {} bytes for the host", data.len());
                Ok(())
            }
            Ok(Err(_)) => Err(CoreError::ConnectionLost("host stopped reading".into())),
            Err(_) => Err(CoreError::Timeout(timeout.as_millis() as u64)),
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
