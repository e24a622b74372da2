//! Microlink Core - REPL protocol engine for MicroPython / CircuitPython boards
//!
//! This crate provides:
//! - Domain types (devices, files, scripts, connection state)
//! - Protocol handling (command builder, response decoder)
//! - Transport abstraction and the stateful REPL session
//! - Board client (filesystem + execution operations)
//! - Command history
//! - Error types

pub mod board;
pub mod error;
pub mod history;
pub mod protocol;
pub mod session;
pub mod streaming;
pub mod transport;
pub mod types;

// Re-export common types
pub use board::BoardClient;
pub use error::{CoreError, ErrorKind, Result};
pub use history::CommandHistory;
pub use protocol::{CommandBuilder, ControlSequence, RawResponse, ResponseDecoder};
pub use session::{SessionConfig, TransportSession};
pub use streaming::OutputSink;
pub use transport::{MockTransport, Parity, SerialConfig, Transport};
pub use types::{ConnectionState, DeviceInfo, EditorMode, FileType, MicroFile, MicroScript};
