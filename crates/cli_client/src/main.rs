//! Microlink CLI - console and file manager for MicroPython / CircuitPython boards
//!
//! Talks to a board over its USB serial REPL. Without a subcommand it opens
//! an interactive console; subcommands manage the board filesystem.

mod console;
mod tty;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use microlink_core::{
    BoardClient, CommandHistory, CoreError, DeviceInfo, FileType, MicroFile, SerialConfig, SessionConfig,
    TransportSession,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::tty::TtyTransport;

/// Microlink - REPL console for MicroPython / CircuitPython boards
#[derive(Parser, Debug)]
#[command(name = "microlink")]
#[command(author = "Microlink Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Console and file manager for MicroPython / CircuitPython boards", long_about = None)]
struct Args {
    /// Serial device (first /dev/ttyACM*, /dev/ttyUSB* or /dev/cu.usbmodem* if omitted)
    #[arg(short, long)]
    device: Option<String>,

    /// Line speed
    #[arg(short, long, default_value_t = 115_200)]
    baud: u32,

    /// Treat the board as CircuitPython when its USB vendor is unknown
    #[arg(long, default_value = "false")]
    circuitpython: bool,

    /// Deadline for file operations in milliseconds
    #[arg(short, long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive REPL (default)
    Repl,
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file
    Cat { path: String },
    /// Copy a host file to the board
    Put {
        local: PathBuf,
        /// Board path (defaults to /<file name>)
        remote: Option<String>,
    },
    /// Delete a file, or an empty directory with --dir
    Rm {
        path: String,
        #[arg(long, default_value = "false")]
        dir: bool,
    },
    /// Create a directory
    Mkdir { path: String },
    /// Create an empty file
    Touch { path: String },
    /// Move or rename
    Mv { src: String, dst: String },
    /// Edit a board file with $EDITOR
    Edit { path: String },
    /// Run a board script and attach the console
    Run { path: String },
    /// Run code through the raw REPL and print its output
    Exec { code: String },
    /// Reset the board (hard reset unless --soft)
    Reset {
        #[arg(long, default_value = "false")]
        soft: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    let port = match &args.device {
        Some(port) => port.clone(),
        None => tty::discover_ports().into_iter().next().ok_or(CoreError::NoDevices)?,
    };
    let device = identify(&port, args.circuitpython);
    info!("Using {} ({})", port, device.runtime_name());

    let timeout = Duration::from_millis(args.timeout_ms);
    let config = SessionConfig::default()
        .with_read_timeout(timeout)
        .with_write_timeout(timeout);
    let (transport, events) = TtyTransport::new(&port, SerialConfig::with_baud_rate(args.baud));
    let (session, output) = TransportSession::new(Box::new(transport), config);
    let session = Arc::new(session);

    session
        .open(device.clone())
        .await
        .with_context(|| format!("Failed to open {}", port))?;
    let pump = tokio::spawn(tty::pump_events(events, session.clone()));
    let board = BoardClient::new(session.clone());

    let mut history = CommandHistory::new();
    let result = match args.command.unwrap_or(Command::Repl) {
        Command::Repl => {
            print_banner(&device);
            console::run(&board, output, &mut history).await
        }
        Command::Run { path } => {
            interrupt(&board).await?;
            print_banner(&device);
            board.run_file(&path).await?;
            console::run(&board, output, &mut history).await
        }
        command => {
            drop(output);
            interrupt(&board).await?;
            run_command(&board, command).await
        }
    };

    if let Err(e) = session.close().await {
        warn!("Close failed: {}", e);
    }
    pump.abort();
    result
}

/// Stop whatever the board is running so the REPL prompt is available
async fn interrupt(board: &BoardClient) -> Result<()> {
    board.terminate_execution().await?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    Ok(())
}

async fn run_command(board: &BoardClient, command: Command) -> Result<()> {
    match command {
        Command::Ls { path } => print_listing(&board.list_dir(&path).await?),
        Command::Cat { path } => {
            let content = board.read_file(&path).await?;
            println!("{}", content);
        }
        Command::Put { local, remote } => {
            let content = std::fs::read_to_string(&local)
                .with_context(|| format!("Failed to read {}", local.display()))?;
            let remote = match remote {
                Some(remote) => remote,
                None => {
                    let name = local
                        .file_name()
                        .and_then(|n| n.to_str())
                        .ok_or_else(|| anyhow!("Invalid file name: {}", local.display()))?;
                    format!("/{}", name)
                }
            };
            let written = board.write_file(&remote, &content).await?;
            println!("Wrote {} bytes to {}", written, remote);
        }
        Command::Rm { path, dir } => {
            let listing = if dir {
                board.remove_dir(&MicroFile::from_full_path(&path, FileType::Directory)).await?
            } else {
                board.remove_file(&MicroFile::from_full_path(&path, FileType::File)).await?
            };
            print_listing(&listing);
        }
        Command::Mkdir { path } => {
            print_listing(&board.make_dir(&MicroFile::from_full_path(&path, FileType::Directory)).await?)
        }
        Command::Touch { path } => {
            print_listing(&board.make_file(&MicroFile::from_full_path(&path, FileType::File)).await?)
        }
        Command::Mv { src, dst } => {
            let src = MicroFile::from_full_path(&src, FileType::File);
            let dst = MicroFile::from_full_path(&dst, FileType::File);
            print_listing(&board.rename(&src, &dst).await?);
        }
        Command::Edit { path } => edit(board, &path).await?,
        Command::Exec { code } => {
            let response = board.execute_raw(&code).await?;
            print!("{}", response.output);
            std::io::stdout().flush()?;
            if !response.is_success() {
                return Err(anyhow!("{}", response.error));
            }
        }
        Command::Reset { soft } => {
            if soft {
                board.soft_reset().await?;
            } else {
                board.reset().await?;
            }
            println!("Reset sent");
        }
        Command::Repl | Command::Run { .. } => {}
    }
    Ok(())
}

/// Load a board script, hand it to $EDITOR, save it back when changed
async fn edit(board: &BoardClient, path: &str) -> Result<()> {
    let mut script = board.load_script(path).await?;
    let scratch = std::env::temp_dir().join(format!("microlink-{}", script.name()));
    std::fs::write(&scratch, script.text())
        .with_context(|| format!("Failed to write {}", scratch.display()))?;

    let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
    let status = std::process::Command::new(&editor)
        .arg(&scratch)
        .status()
        .with_context(|| format!("Failed to start {}", editor))?;
    if !status.success() {
        return Err(anyhow!("{} exited with {}", editor, status));
    }

    let edited = std::fs::read_to_string(&scratch)?;
    let _ = std::fs::remove_file(&scratch);
    if edited == script.text() {
        println!("{} unchanged", path);
        return Ok(());
    }
    script.set_text(edited);
    let written = board.save_script(&script).await?;
    println!("Saved {} ({} bytes)", path, written);
    Ok(())
}

fn identify(port: &str, circuitpython: bool) -> DeviceInfo {
    let description = tty::usb_product(port).unwrap_or_else(|| "USB serial board".to_string());
    match tty::usb_vendor_id(port) {
        Some(vendor_id) if !circuitpython => DeviceInfo::from_usb(port, description, vendor_id),
        _ => DeviceInfo::new(port, description, !circuitpython),
    }
}

fn print_listing(files: &[MicroFile]) {
    for file in files {
        if file.is_dir() {
            println!("{:>10}  {}/", "<dir>", file.name);
        } else {
            println!("{:>10}  {}", file.size, file.name);
        }
    }
}

fn print_banner(device: &DeviceInfo) {
    let datetime = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    let banner = format!(
        "\r\n\
        \x1b[1;36m╔═══════════════════════════════════════════════════════╗\x1b[0m\r\n\
        \x1b[1;36m║\x1b[1;33m                 MICROLINK CONSOLE\x1b[1;36m                     ║\x1b[0m\r\n\
        \x1b[1;36m╠═══════════════════════════════════════════════════════╣\x1b[0m\r\n\
        \x1b[1;36m║\x1b[0m \x1b[90mBoard:\x1b[0m     {:<43} \x1b[1;36m║\x1b[0m\r\n\
        \x1b[1;36m║\x1b[0m \x1b[90mPort:\x1b[0m      {:<43} \x1b[1;36m║\x1b[0m\r\n\
        \x1b[1;36m║\x1b[0m \x1b[90mConnected:\x1b[0m {:<43} \x1b[1;36m║\x1b[0m\r\n\
        \x1b[1;36m║\x1b[0m \x1b[90mKeys:\x1b[0m      \x1b[33m^C\x1b[0m stop  \x1b[33m^D\x1b[0m soft reset  \x1b[33m^X\x1b[0m exit         \x1b[1;36m║\x1b[0m\r\n\
        \x1b[1;36m╚═══════════════════════════════════════════════════════╝\x1b[0m\r\n\r\n",
        format!("{} ({})", device.description, device.runtime_name()),
        device.port,
        datetime
    );
    let mut stdout = std::io::stdout();
    let _ = stdout.write_all(banner.as_bytes());
    let _ = stdout.flush();
}

fn setup_logging(level: &str) -> Result<()> {
    let log_level = level.parse::<Level>().unwrap_or(Level::WARN);

    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}
