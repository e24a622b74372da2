//! Serial port transport for USB CDC boards on Unix hosts
//!
//! The port is a plain tty configured through termios. A blocking reader
//! thread forwards everything it reads as [`TtyEvent`]s; [`pump_events`]
//! hands them to the session.

use async_trait::async_trait;
use microlink_core::{CoreError, Parity, Result, SerialConfig, Transport, TransportSession};
use nix::libc;
use nix::sys::termios::{self, BaudRate, ControlFlags, SetArg, SpecialCharacterIndices};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// What the reader thread observed
#[derive(Debug)]
pub enum TtyEvent {
    Data(Vec<u8>),
    Error(String),
}

pub struct TtyTransport {
    path: String,
    config: SerialConfig,
    file: Option<Arc<File>>,
    stop: Arc<AtomicBool>,
    events: mpsc::Sender<TtyEvent>,
}

impl TtyTransport {
    pub fn new(path: impl Into<String>, config: SerialConfig) -> (Self, mpsc::Receiver<TtyEvent>) {
        let (events, rx) = mpsc::channel(256);
        let transport = Self {
            path: path.into(),
            config,
            file: None,
            stop: Arc::new(AtomicBool::new(false)),
            events,
        };
        (transport, rx)
    }

    fn open_port(&self) -> Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(&self.path)
            .map_err(|e| match e.kind() {
                IoErrorKind::PermissionDenied => CoreError::PermissionDenied(self.path.clone()),
                _ => CoreError::CantOpenPort {
                    port: self.path.clone(),
                    reason: e.to_string(),
                },
            })?;

        configure_line(&file, &self.config).map_err(|e| CoreError::CantOpenPort {
            port: self.path.clone(),
            reason: e.to_string(),
        })?;

        if self.config.dtr {
            let bits: libc::c_int = libc::TIOCM_DTR;
            // SAFETY: valid fd, TIOCMBIS reads one c_int
            let result = unsafe { libc::ioctl(file.as_raw_fd(), libc::TIOCMBIS as _, &bits) };
            if result != 0 {
                warn!("Could not assert DTR on {}", self.path);
            }
        }
        Ok(file)
    }

    fn spawn_reader(&self, mut reader: File) {
        let stop = self.stop.clone();
        let events = self.events.clone();
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 1024];
            while !stop.load(Ordering::Relaxed) {
                match reader.read(&mut buf) {
                    // VTIME expired without data
                    Ok(0) => continue,
                    Ok(n) => {
                        if events.blocking_send(TtyEvent::Data(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
                    Err(e) => {
                        if !stop.load(Ordering::Relaxed) {
                            error!("Read from {} failed: {}", path, e);
                            let _ = events.blocking_send(TtyEvent::Error(e.to_string()));
                        }
                        break;
                    }
                }
            }
            debug!("Reader for {} stopped", path);
        });
    }
}

#[async_trait]
impl Transport for TtyTransport {
    async fn open(&mut self) -> Result<()> {
        let file = self.open_port()?;
        let reader = file.try_clone()?;
        self.stop.store(false, Ordering::Relaxed);
        self.spawn_reader(reader);
        self.file = Some(Arc::new(file));
        info!("Opened {} at {} baud", self.path, self.config.baud_rate);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        self.file = None;
        debug!("Closed {}", self.path);
        Ok(())
    }

    async fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        let file = self.file.clone().ok_or(CoreError::NotConnected)?;
        let data = data.to_vec();
        let write = tokio::task::spawn_blocking(move || {
            let mut port: &File = &file;
            port.write_all(&data)?;
            port.flush()
        });
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(e)) => Err(CoreError::ConnectionLost(format!("writer task failed: {}", e))),
            Err(_) => Err(CoreError::Timeout(timeout.as_millis() as u64)),
        }
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }
}

/// Route reader events into the session until the reader stops
pub async fn pump_events(mut events: mpsc::Receiver<TtyEvent>, session: Arc<TransportSession>) {
    while let Some(event) = events.recv().await {
        match event {
            TtyEvent::Data(bytes) => session.on_bytes_received(&bytes),
            TtyEvent::Error(message) => session.on_transport_error(CoreError::ConnectionLost(message)),
        }
    }
}

/// Raw 8N1-style line with a 100ms read timeout
fn configure_line(file: &File, config: &SerialConfig) -> nix::Result<()> {
    let mut tio = termios::tcgetattr(file)?;
    termios::cfmakeraw(&mut tio);
    termios::cfsetspeed(&mut tio, baud_rate(config.baud_rate)?)?;

    let flags = &mut tio.control_flags;
    flags.remove(ControlFlags::CSIZE | ControlFlags::PARENB | ControlFlags::PARODD | ControlFlags::CSTOPB);
    flags.insert(ControlFlags::CREAD | ControlFlags::CLOCAL);
    flags.insert(match config.data_bits {
        5 => ControlFlags::CS5,
        6 => ControlFlags::CS6,
        7 => ControlFlags::CS7,
        _ => ControlFlags::CS8,
    });
    match config.parity {
        Parity::None => {}
        Parity::Even => flags.insert(ControlFlags::PARENB),
        Parity::Odd => flags.insert(ControlFlags::PARENB | ControlFlags::PARODD),
    }
    if config.stop_bits == 2 {
        flags.insert(ControlFlags::CSTOPB);
    }

    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;
    termios::tcsetattr(file, SetArg::TCSANOW, &tio)
}

fn baud_rate(rate: u32) -> nix::Result<BaudRate> {
    Ok(match rate {
        9_600 => BaudRate::B9600,
        19_200 => BaudRate::B19200,
        38_400 => BaudRate::B38400,
        57_600 => BaudRate::B57600,
        115_200 => BaudRate::B115200,
        230_400 => BaudRate::B230400,
        _ => return Err(nix::Error::EINVAL),
    })
}

/// Candidate board ports, sorted
pub fn discover_ports() -> Vec<String> {
    let Ok(entries) = std::fs::read_dir("/dev") else {
        return Vec::new();
    };
    let mut ports: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| is_board_port(name))
        .map(|name| format!("/dev/{}", name))
        .collect();
    ports.sort();
    ports
}

fn is_board_port(name: &str) -> bool {
    ["ttyACM", "ttyUSB", "cu.usbmodem"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// USB vendor id of a Linux tty, read from sysfs
pub fn usb_vendor_id(port: &str) -> Option<u16> {
    let name = Path::new(port).file_name()?.to_str()?;
    let device = std::fs::canonicalize(format!("/sys/class/tty/{}/device", name)).ok()?;
    device.ancestors().find_map(|dir| {
        let id = std::fs::read_to_string(dir.join("idVendor")).ok()?;
        u16::from_str_radix(id.trim(), 16).ok()
    })
}

/// USB product string of a Linux tty, read from sysfs
pub fn usb_product(port: &str) -> Option<String> {
    let name = Path::new(port).file_name()?.to_str()?;
    let device = std::fs::canonicalize(format!("/sys/class/tty/{}/device", name)).ok()?;
    device.ancestors().find_map(|dir| {
        let product = std::fs::read_to_string(dir.join("product")).ok()?;
        Some(product.trim().to_string())
    })
}
