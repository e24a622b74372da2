//! Error types for microlink-core

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure category shared by errors and `ConnectionState::Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NoDevices,
    PermissionDenied,
    CantOpenPort,
    ConnectionLost,
    NotSupported,
    /// A synchronous exchange is already in flight
    Busy,
    /// No completion sentinel within the deadline
    Timeout,
    /// An explicit interrupt aborted the exchange
    Terminated,
    MalformedResponse,
    /// Raw REPL handshake did not receive its acknowledgement
    ProtocolDesync,
    NotConnected,
}

impl ErrorKind {
    /// Transport-level kinds end the connection; the rest only fail one command
    pub fn is_connection_failure(self) -> bool {
        matches!(
            self,
            ErrorKind::NoDevices
                | ErrorKind::PermissionDenied
                | ErrorKind::CantOpenPort
                | ErrorKind::ConnectionLost
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NoDevices => "no devices",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::CantOpenPort => "can't open port",
            ErrorKind::ConnectionLost => "connection lost",
            ErrorKind::NotSupported => "not supported",
            ErrorKind::Busy => "busy",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Terminated => "terminated",
            ErrorKind::MalformedResponse => "malformed response",
            ErrorKind::ProtocolDesync => "protocol desync",
            ErrorKind::NotConnected => "not connected",
        };
        f.write_str(name)
    }
}

/// Core error type
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("No devices found")]
    NoDevices,

    #[error("Permission denied for device {0}")]
    PermissionDenied(String),

    #[error("Cannot open port {port}: {reason}")]
    CantOpenPort { port: String, reason: String },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Another synchronous exchange is already in flight")]
    Busy,

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Execution terminated")]
    Terminated,

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Raw REPL handshake failed: {0}")]
    ProtocolDesync(String),

    #[error("Not connected")]
    NotConnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::NoDevices => ErrorKind::NoDevices,
            CoreError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            CoreError::CantOpenPort { .. } => ErrorKind::CantOpenPort,
            CoreError::ConnectionLost(_) | CoreError::Io(_) => ErrorKind::ConnectionLost,
            CoreError::NotSupported(_) => ErrorKind::NotSupported,
            CoreError::Busy => ErrorKind::Busy,
            CoreError::Timeout(_) => ErrorKind::Timeout,
            CoreError::Terminated => ErrorKind::Terminated,
            CoreError::MalformedResponse(_) | CoreError::Json(_) => ErrorKind::MalformedResponse,
            CoreError::ProtocolDesync(_) => ErrorKind::ProtocolDesync,
            CoreError::NotConnected => ErrorKind::NotConnected,
        }
    }

    /// Rebuild an error from a kind and message, e.g. when failing a pending
    /// exchange after the connection reported `Failed(kind, message)`
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::NoDevices => CoreError::NoDevices,
            ErrorKind::PermissionDenied => CoreError::PermissionDenied(message),
            ErrorKind::CantOpenPort => CoreError::CantOpenPort {
                port: String::new(),
                reason: message,
            },
            ErrorKind::ConnectionLost => CoreError::ConnectionLost(message),
            ErrorKind::NotSupported => CoreError::NotSupported(message),
            ErrorKind::Busy => CoreError::Busy,
            ErrorKind::Timeout => CoreError::Timeout(0),
            ErrorKind::Terminated => CoreError::Terminated,
            ErrorKind::MalformedResponse => CoreError::MalformedResponse(message),
            ErrorKind::ProtocolDesync => CoreError::ProtocolDesync(message),
            ErrorKind::NotConnected => CoreError::NotConnected,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::Busy;
        assert_eq!(err.to_string(), "Another synchronous exchange is already in flight");
        assert_eq!(CoreError::Timeout(5000).to_string(), "Timeout after 5000ms");
    }

    #[test]
    fn test_io_error_is_connection_lost() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "unplugged");
        let core_err: CoreError = io_err.into();
        assert!(matches!(core_err, CoreError::Io(_)));
        assert_eq!(core_err.kind(), ErrorKind::ConnectionLost);
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            ErrorKind::PermissionDenied,
            ErrorKind::ConnectionLost,
            ErrorKind::Busy,
            ErrorKind::Terminated,
            ErrorKind::ProtocolDesync,
        ] {
            assert_eq!(CoreError::from_kind(kind, "x").kind(), kind);
        }
    }

    #[test]
    fn test_connection_failure_kinds() {
        assert!(ErrorKind::CantOpenPort.is_connection_failure());
        assert!(!ErrorKind::Timeout.is_connection_failure());
        assert!(!ErrorKind::Busy.is_connection_failure());
    }
}
