//! Byte-stream transport abstraction
//!
//! The physical link (USB enumeration, permissions, reads) belongs to the
//! host platform. The core writes through [`Transport`] and receives bytes
//! and failures through [`crate::session::TransportSession::on_bytes_received`]
//! and [`crate::session::TransportSession::on_transport_error`].

mod mock;
mod traits;

pub use mock::MockTransport;
pub use traits::{Parity, SerialConfig, Transport};
