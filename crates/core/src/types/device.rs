//! Connected board identity and connection lifecycle

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// USB vendor id used by CircuitPython boards (Adafruit)
pub const CIRCUITPYTHON_VENDOR_ID: u16 = 0x239A;

/// Identifies the connected board
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Stable port/path identifier (e.g. `/dev/ttyACM0`)
    pub port: String,
    /// Human-readable board / manufacturer string
    pub description: String,
    /// MicroPython (true) or CircuitPython (false)
    pub is_micropython: bool,
}

impl DeviceInfo {
    /// Create device info with an explicit runtime flavor
    pub fn new(port: impl Into<String>, description: impl Into<String>, is_micropython: bool) -> Self {
        Self {
            port: port.into(),
            description: description.into(),
            is_micropython,
        }
    }

    /// Create device info from USB descriptors, inferring the runtime from the vendor
    pub fn from_usb(port: impl Into<String>, description: impl Into<String>, vendor_id: u16) -> Self {
        Self::new(port, description, vendor_id != CIRCUITPYTHON_VENDOR_ID)
    }

    /// Short runtime name for logs and banners
    pub fn runtime_name(&self) -> &'static str {
        if self.is_micropython {
            "MicroPython"
        } else {
            "CircuitPython"
        }
    }
}

/// Connection lifecycle as reported by the transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    AwaitingPermission,
    Connected(DeviceInfo),
    Failed(ErrorKind, String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }

    /// Device of an established connection
    pub fn device(&self) -> Option<&DeviceInfo> {
        match self {
            ConnectionState::Connected(info) => Some(info),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_inference() {
        let adafruit = DeviceInfo::from_usb("/dev/ttyACM0", "Feather M4", 0x239A);
        assert!(!adafruit.is_micropython);
        assert_eq!(adafruit.runtime_name(), "CircuitPython");

        let pico = DeviceInfo::from_usb("/dev/ttyACM1", "Raspberry Pi Pico", 0x2E8A);
        assert!(pico.is_micropython);
    }

    #[test]
    fn test_state_device() {
        let info = DeviceInfo::new("COM3", "pyboard", true);
        let state = ConnectionState::Connected(info.clone());
        assert!(state.is_connected());
        assert_eq!(state.device(), Some(&info));
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert!(ConnectionState::Failed(ErrorKind::ConnectionLost, "gone".into())
            .device()
            .is_none());
    }
}
