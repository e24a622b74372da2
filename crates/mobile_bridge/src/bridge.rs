//! Mobile device link
//!
//! Glues one [`TransportSession`] to the Dart side: outgoing bytes are
//! queued for the USB serial driver, REPL output is buffered for the terminal
//! widget, and the REPL input line keeps its own command history.

use bytes::Bytes;
use microlink_core::{
    BoardClient, CommandHistory, ConnectionState, CoreError, DeviceInfo, SessionConfig, TransportSession,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{mpsc, Mutex};

use crate::channel_transport::{ChannelTransport, DEFAULT_OUTGOING_CAPACITY};

/// Flat connection status for the Flutter UI
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceStatus {
    /// `disconnected`, `connecting`, `awaiting_permission`, `connected` or `failed`
    pub state: String,
    pub port: Option<String>,
    /// `MicroPython` / `CircuitPython` once connected
    pub runtime: Option<String>,
    /// Failure category and message once failed
    pub error: Option<String>,
}

impl From<&ConnectionState> for DeviceStatus {
    fn from(state: &ConnectionState) -> Self {
        match state {
            ConnectionState::Disconnected => Self::named("disconnected"),
            ConnectionState::Connecting => Self::named("connecting"),
            ConnectionState::AwaitingPermission => Self::named("awaiting_permission"),
            ConnectionState::Connected(device) => Self {
                state: "connected".into(),
                port: Some(device.port.clone()),
                runtime: Some(device.runtime_name().into()),
                error: None,
            },
            ConnectionState::Failed(kind, message) => Self {
                error: Some(format!("{}: {}", kind, message)),
                ..Self::named("failed")
            },
        }
    }
}

impl DeviceStatus {
    fn named(state: &str) -> Self {
        Self {
            state: state.into(),
            ..Default::default()
        }
    }
}

/// One board connection as seen from Dart
pub struct DeviceLink {
    board: BoardClient,
    output: Mutex<mpsc::Receiver<Bytes>>,
    outgoing: Mutex<mpsc::Receiver<Vec<u8>>>,
    history: StdMutex<CommandHistory>,
}

impl DeviceLink {
    pub fn new(config: SessionConfig) -> Self {
        let (transport, outgoing) = ChannelTransport::new(DEFAULT_OUTGOING_CAPACITY);
        let (session, output) = TransportSession::new(Box::new(transport), config);
        Self {
            board: BoardClient::new(Arc::new(session)),
            output: Mutex::new(output),
            outgoing: Mutex::new(outgoing),
            history: StdMutex::new(CommandHistory::new()),
        }
    }

    pub fn board(&self) -> &BoardClient {
        &self.board
    }

    pub fn session(&self) -> &Arc<TransportSession> {
        self.board.session()
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from(&self.session().state())
    }

    /// Called once Android granted access to the port
    pub async fn connect(&self, device: DeviceInfo) -> Result<DeviceStatus, CoreError> {
        self.session().open(device).await?;
        Ok(self.status())
    }

    pub async fn disconnect(&self) -> Result<(), CoreError> {
        self.session().close().await
    }

    /// Bytes read by the Dart serial driver
    pub fn push_incoming(&self, data: &[u8]) {
        self.session().on_bytes_received(data);
    }

    /// Next chunk Dart must write to the port
    pub async fn next_outgoing(&self) -> Option<Vec<u8>> {
        self.outgoing.lock().await.recv().await
    }

    /// Next chunk of live REPL output for the terminal widget
    pub async fn next_output(&self) -> Option<Bytes> {
        self.output.lock().await.recv().await
    }

    /// Submit a line typed into the REPL input and remember it
    pub async fn submit_line(&self, line: &str) -> Result<(), CoreError> {
        self.lock_history().push(line);
        self.board.eval(line).await
    }

    pub fn history_up(&self) -> Option<String> {
        self.lock_history().up().map(str::to_owned)
    }

    pub fn history_down(&self) -> Option<String> {
        self.lock_history().down().map(str::to_owned)
    }

    pub fn history_entries(&self) -> Vec<String> {
        self.lock_history().entries().to_vec()
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, CommandHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for DeviceLink {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use microlink_core::ErrorKind;

    fn pico() -> DeviceInfo {
        DeviceInfo::from_usb("usb:1-1", "Raspberry Pi Pico", 0x2E8A)
    }

    #[tokio::test]
    async fn test_connect_reports_runtime() {
        let link = DeviceLink::default();
        assert_eq!(link.status().state, "disconnected");

        let status = link.connect(pico()).await.unwrap();
        assert_eq!(status.state, "connected");
        assert_eq!(status.runtime.as_deref(), Some("MicroPython"));
    }

    #[tokio::test]
    async fn test_submit_line_queues_bytes_and_records_history() {
        let link = DeviceLink::default();
        link.connect(pico()).await.unwrap();

        link.submit_line("print(1)").await.unwrap();
        assert_eq!(link.next_outgoing().await.unwrap(), b"\rprint(1)\r".to_vec());
        assert_eq!(link.history_up().as_deref(), Some("print(1)"));
        assert_eq!(link.history_entries(), vec!["print(1)".to_string()]);
    }

    #[tokio::test]
    async fn test_incoming_bytes_reach_terminal() {
        let link = DeviceLink::default();
        link.connect(pico()).await.unwrap();
        link.push_incoming(b"MicroPython v1.22\r\n>>> ");
        assert_eq!(link.next_output().await.unwrap(), Bytes::from_static(b"MicroPython v1.22\r\n>>> "));
    }

    #[tokio::test]
    async fn test_list_dir_round_trip() {
        let link = Arc::new(DeviceLink::default());
        link.connect(pico()).await.unwrap();

        let worker = link.clone();
        let handle = tokio::spawn(async move { worker.board().list_dir("/").await });

        let command = link.next_outgoing().await.unwrap();
        let command = String::from_utf8_lossy(&command).into_owned();
        assert!(command.starts_with("\r_g=1;"));
        assert!(command.contains("os.listdir"));
        link.push_incoming(b"@{ [('boot.py', 32768, 0, 40)] }@ EXEC DONE 1\r\n>>> ");

        let files = handle.await.unwrap().unwrap();
        assert_eq!(files[0].name, "boot.py");
    }

    #[test]
    fn test_failed_status() {
        let state = ConnectionState::Failed(ErrorKind::PermissionDenied, "usb:1-1".into());
        let status = DeviceStatus::from(&state);
        assert_eq!(status.state, "failed");
        assert_eq!(status.error.as_deref(), Some("permission denied: usb:1-1"));
    }
}
