//! Flutter Rust Bridge API
//!
//! FFI-safe functions for Dart integration. Errors cross the boundary as
//! `String`.
//!
//! Dart owns the USB serial port: it pumps `next_outgoing_bytes` into the
//! port, feeds everything it reads to `push_incoming_bytes`, and reports
//! permission / lifecycle events with the `report_*` functions.

use flutter_rust_bridge::frb;
use microlink_core::{
    ConnectionState, CoreError, DeviceInfo, ErrorKind, MicroFile, MicroScript, RawResponse, SessionConfig,
};
use once_cell::sync::OnceCell;
use std::time::Duration;

use crate::bridge::{DeviceLink, DeviceStatus};

/// Global device link (thread-safe, initialized once)
static DEVICE_LINK: OnceCell<DeviceLink> = OnceCell::new();

fn link() -> &'static DeviceLink {
    DEVICE_LINK.get_or_init(DeviceLink::default)
}

fn ffi_error(e: CoreError) -> String {
    e.to_string()
}

// ===== Setup & lifecycle =====

/// Override session timeouts
///
/// Must run before any other call; the link is created once.
#[frb(sync)]
pub fn configure_session(read_timeout_ms: u64, write_timeout_ms: u64) -> Result<(), String> {
    let config = SessionConfig::default()
        .with_read_timeout(Duration::from_millis(read_timeout_ms))
        .with_write_timeout(Duration::from_millis(write_timeout_ms));
    DEVICE_LINK
        .set(DeviceLink::new(config))
        .map_err(|_| "Session already initialized. Please restart app to reset.".to_string())
}

/// Open the session once Android granted access to the port
#[frb]
pub async fn connect_device(port: String, description: String, vendor_id: u16) -> Result<DeviceStatus, String> {
    let device = DeviceInfo::from_usb(port, description, vendor_id);
    link().connect(device).await.map_err(ffi_error)
}

#[frb]
pub async fn disconnect_device() -> Result<(), String> {
    link().disconnect().await.map_err(ffi_error)
}

#[frb(sync)]
pub fn connection_status() -> DeviceStatus {
    link().status()
}

#[frb(sync)]
pub fn report_no_devices() {
    link()
        .session()
        .notify_connection_state(ConnectionState::Failed(ErrorKind::NoDevices, "no serial devices attached".into()));
}

#[frb(sync)]
pub fn report_permission_pending() {
    link().session().notify_connection_state(ConnectionState::AwaitingPermission);
}

#[frb(sync)]
pub fn report_permission_denied(port: String) {
    link()
        .session()
        .notify_connection_state(ConnectionState::Failed(ErrorKind::PermissionDenied, port));
}

/// Serial driver failure (unplugged, read error)
#[frb(sync)]
pub fn report_transport_error(message: String) {
    link().session().on_transport_error(CoreError::ConnectionLost(message));
}

// ===== Byte pumps =====

/// Bytes read from the port
#[frb(sync)]
pub fn push_incoming_bytes(data: Vec<u8>) {
    link().push_incoming(&data);
}

/// Next chunk to write to the port; `None` once the link is gone
#[frb]
pub async fn next_outgoing_bytes() -> Option<Vec<u8>> {
    link().next_outgoing().await
}

/// Next chunk of live REPL output
#[frb]
pub async fn next_terminal_output() -> Option<Vec<u8>> {
    link().next_output().await.map(|chunk| chunk.to_vec())
}

#[frb(sync)]
pub fn is_busy() -> bool {
    link().session().is_busy()
}

// ===== Filesystem =====

#[frb]
pub async fn list_dir(path: String) -> Result<Vec<MicroFile>, String> {
    link().board().list_dir(&path).await.map_err(ffi_error)
}

#[frb]
pub async fn read_file(path: String) -> Result<String, String> {
    link().board().read_file(&path).await.map_err(ffi_error)
}

/// Returns the byte count reported by the board
#[frb]
pub async fn write_file(path: String, content: String) -> Result<u64, String> {
    link()
        .board()
        .write_file(&path, &content)
        .await
        .map(|n| n as u64)
        .map_err(ffi_error)
}

#[frb]
pub async fn remove_file(file: MicroFile) -> Result<Vec<MicroFile>, String> {
    link().board().remove_file(&file).await.map_err(ffi_error)
}

#[frb]
pub async fn remove_dir(dir: MicroFile) -> Result<Vec<MicroFile>, String> {
    link().board().remove_dir(&dir).await.map_err(ffi_error)
}

#[frb]
pub async fn make_dir(dir: MicroFile) -> Result<Vec<MicroFile>, String> {
    link().board().make_dir(&dir).await.map_err(ffi_error)
}

#[frb]
pub async fn make_file(file: MicroFile) -> Result<Vec<MicroFile>, String> {
    link().board().make_file(&file).await.map_err(ffi_error)
}

/// Rename within the same directory
#[frb]
pub async fn rename(file: MicroFile, new_name: String) -> Result<Vec<MicroFile>, String> {
    let target = file.with_name(new_name);
    link().board().rename(&file, &target).await.map_err(ffi_error)
}

// ===== Execution =====

/// REPL input line, recorded in history
#[frb]
pub async fn submit_line(line: String) -> Result<(), String> {
    link().submit_line(&line).await.map_err(ffi_error)
}

/// Editor content, pasted as one block
#[frb]
pub async fn execute_code(code: String) -> Result<(), String> {
    link().board().execute(&code).await.map_err(ffi_error)
}

#[frb]
pub async fn run_file(path: String) -> Result<(), String> {
    link().board().run_file(&path).await.map_err(ffi_error)
}

#[frb]
pub async fn execute_raw(code: String) -> Result<RawResponse, String> {
    link().board().execute_raw(&code).await.map_err(ffi_error)
}

#[frb]
pub async fn terminate_execution() -> Result<(), String> {
    link().board().terminate_execution().await.map_err(ffi_error)
}

#[frb]
pub async fn soft_reset() -> Result<(), String> {
    link().board().soft_reset().await.map_err(ffi_error)
}

#[frb]
pub async fn hard_reset() -> Result<(), String> {
    link().board().reset().await.map_err(ffi_error)
}

// ===== Scripts =====

#[frb]
pub async fn load_script(path: String) -> Result<MicroScript, String> {
    link().board().load_script(&path).await.map_err(ffi_error)
}

#[frb]
pub async fn save_script(script: MicroScript) -> Result<u64, String> {
    link()
        .board()
        .save_script(&script)
        .await
        .map(|n| n as u64)
        .map_err(ffi_error)
}

// ===== History =====

#[frb(sync)]
pub fn history_up() -> Option<String> {
    link().history_up()
}

#[frb(sync)]
pub fn history_down() -> Option<String> {
    link().history_down()
}

#[frb(sync)]
pub fn history_entries() -> Vec<String> {
    link().history_entries()
}
