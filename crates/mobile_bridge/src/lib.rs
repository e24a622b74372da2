//! Mobile bridge - Flutter FFI surface for the Android app
//!
//! The Android USB serial port is owned by Dart. Bytes flow through
//! [`channel_transport::ChannelTransport`]: outgoing writes are queued for
//! Dart to send, incoming reads are pushed back into the session.

pub mod api;
pub mod bridge;
pub mod channel_transport;

pub use bridge::{DeviceLink, DeviceStatus};
pub use channel_transport::ChannelTransport;
