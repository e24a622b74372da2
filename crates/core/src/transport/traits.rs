//! Transport trait and serial line parameters

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Write side of the byte-stream link to a board
///
/// Implementations deliver incoming bytes by calling
/// `TransportSession::on_bytes_received` from their own read loop.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the underlying port
    async fn open(&mut self) -> Result<()>;

    /// Close the underlying port
    async fn close(&mut self) -> Result<()>;

    /// Write all bytes, failing if the link does not accept them within `timeout`
    async fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()>;

    /// Whether the port is currently open
    fn is_open(&self) -> bool;
}

/// Parity setting of the serial line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

/// Serial line configuration
///
/// Boards running MicroPython / CircuitPython expect 115200 8N1 with DTR
/// asserted; the REPL stays silent until DTR is raised.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    /// Assert DTR after opening
    pub dtr: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            dtr: true,
        }
    }
}

impl SerialConfig {
    /// Default line settings at a different speed
    pub fn with_baud_rate(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Default::default()
        }
    }

    /// Set DTR handling
    pub fn with_dtr(mut self, dtr: bool) -> Self {
        self.dtr = dtr;
        self
    }
}
