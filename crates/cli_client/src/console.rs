//! Interactive REPL console
//!
//! Keys are edited locally so Up/Down can recall history; a finished line is
//! sent to the board, which echoes it back along with its output.

use anyhow::{Context, Result};
use bytes::Bytes;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use microlink_core::{BoardClient, CommandHistory};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Enables raw mode and restores normal mode on drop (even on panic)
pub struct RawModeGuard;

impl RawModeGuard {
    pub fn enable() -> Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// What the console must do after a key press
#[derive(Debug, PartialEq, Eq)]
pub enum EditAction {
    None,
    /// Erase `erase` echoed characters, then echo `text`
    Redraw { erase: usize, text: String },
    /// Erase the local echo and send `line`
    Submit { erase: usize, line: String },
    /// Ctrl-C
    Terminate { erase: usize },
    /// Ctrl-D
    SoftReset,
    /// Ctrl-X
    Exit,
}

/// Local line buffer with history recall
#[derive(Debug, Default)]
pub struct LineEditor {
    buffer: String,
}

impl LineEditor {
    pub fn handle(&mut self, key: KeyEvent, history: &mut CommandHistory) -> EditAction {
        if key.kind != KeyEventKind::Press {
            return EditAction::None;
        }
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);

        match key.code {
            KeyCode::Char('c') if ctrl => {
                let erase = self.echoed();
                self.buffer.clear();
                history.reset_cursor();
                EditAction::Terminate { erase }
            }
            KeyCode::Char('d') if ctrl => EditAction::SoftReset,
            KeyCode::Char('x') if ctrl => EditAction::Exit,
            KeyCode::Char(_) if ctrl => EditAction::None,
            KeyCode::Char(c) => {
                self.buffer.push(c);
                EditAction::Redraw {
                    erase: 0,
                    text: c.to_string(),
                }
            }
            KeyCode::Backspace => match self.buffer.pop() {
                Some(_) => EditAction::Redraw {
                    erase: 1,
                    text: String::new(),
                },
                None => EditAction::None,
            },
            KeyCode::Enter => {
                let erase = self.echoed();
                let line = std::mem::take(&mut self.buffer);
                history.push(line.clone());
                EditAction::Submit { erase, line }
            }
            KeyCode::Up => match history.up() {
                Some(entry) => self.replace(entry.to_string()),
                None => EditAction::None,
            },
            KeyCode::Down => match history.down() {
                Some(entry) => self.replace(entry.to_string()),
                None => EditAction::None,
            },
            _ => EditAction::None,
        }
    }

    fn replace(&mut self, text: String) -> EditAction {
        let erase = self.echoed();
        self.buffer = text.clone();
        EditAction::Redraw { erase, text }
    }

    fn echoed(&self) -> usize {
        self.buffer.chars().count()
    }
}

/// Run the console until Ctrl-X or connection loss
pub async fn run(board: &BoardClient, mut output: mpsc::Receiver<Bytes>, history: &mut CommandHistory) -> Result<()> {
    let _guard = RawModeGuard::enable().context("The REPL needs an interactive terminal")?;

    let (key_tx, mut key_rx) = mpsc::channel::<KeyEvent>(64);
    let stop = Arc::new(AtomicBool::new(false));
    let reader_stop = stop.clone();
    let reader = tokio::task::spawn_blocking(move || {
        while !reader_stop.load(Ordering::Relaxed) {
            match event::poll(Duration::from_millis(100)) {
                Ok(true) => match event::read() {
                    Ok(Event::Key(key)) => {
                        if key_tx.blocking_send(key).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(_) => break,
                },
                Ok(false) => continue,
                Err(_) => break,
            }
        }
    });

    let mut editor = LineEditor::default();
    let mut states = board.session().subscribe_state();
    let mut stdout = std::io::stdout();

    loop {
        tokio::select! {
            Some(chunk) = output.recv() => {
                stdout.write_all(&chunk)?;
                stdout.flush()?;
            }
            Some(key) = key_rx.recv() => {
                let result = match editor.handle(key, history) {
                    EditAction::None => Ok(()),
                    EditAction::Redraw { erase, text } => {
                        echo(&mut stdout, erase, &text)?;
                        Ok(())
                    }
                    EditAction::Submit { erase, line } => {
                        echo(&mut stdout, erase, "")?;
                        board.eval(&line).await
                    }
                    EditAction::Terminate { erase } => {
                        echo(&mut stdout, erase, "")?;
                        board.terminate_execution().await
                    }
                    EditAction::SoftReset => board.soft_reset().await,
                    EditAction::Exit => break,
                };
                if let Err(e) = result {
                    write!(stdout, "\r\n\x1b[31m[microlink] {}\x1b[0m\r\n", e)?;
                    stdout.flush()?;
                }
            }
            changed = states.changed() => {
                let state = board.session().state();
                if changed.is_err() || !state.is_connected() {
                    write!(stdout, "\r\n\x1b[31m[microlink] {:?}\x1b[0m\r\n", state)?;
                    stdout.flush()?;
                    break;
                }
            }
            else => break,
        }
    }

    stop.store(true, Ordering::Relaxed);
    let _ = reader.await;
    debug!("Console closed");
    Ok(())
}

fn echo(stdout: &mut impl Write, erase: usize, text: &str) -> std::io::Result<()> {
    stdout.write_all("\x08 \x08".repeat(erase).as_bytes())?;
    stdout.write_all(text.as_bytes())?;
    stdout.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn ctrl(c: char) -> KeyEvent {
        KeyEvent::new(KeyCode::Char(c), KeyModifiers::CONTROL)
    }

    fn type_line(editor: &mut LineEditor, history: &mut CommandHistory, text: &str) -> EditAction {
        for c in text.chars() {
            editor.handle(key(KeyCode::Char(c)), history);
        }
        editor.handle(key(KeyCode::Enter), history)
    }

    #[test]
    fn test_enter_submits_and_records() {
        let mut editor = LineEditor::default();
        let mut history = CommandHistory::new();
        let action = type_line(&mut editor, &mut history, "1+1");
        assert_eq!(
            action,
            EditAction::Submit {
                erase: 3,
                line: "1+1".into()
            }
        );
        assert_eq!(history.entries(), ["1+1"]);
    }

    #[test]
    fn test_up_recalls_previous_line() {
        let mut editor = LineEditor::default();
        let mut history = CommandHistory::new();
        type_line(&mut editor, &mut history, "a");
        type_line(&mut editor, &mut history, "bb");

        editor.handle(key(KeyCode::Char('x')), &mut history);
        assert_eq!(
            editor.handle(key(KeyCode::Up), &mut history),
            EditAction::Redraw {
                erase: 1,
                text: "bb".into()
            }
        );
        assert_eq!(
            editor.handle(key(KeyCode::Up), &mut history),
            EditAction::Redraw {
                erase: 2,
                text: "a".into()
            }
        );
        assert_eq!(editor.handle(key(KeyCode::Up), &mut history), EditAction::None);
        assert_eq!(
            editor.handle(key(KeyCode::Enter), &mut history),
            EditAction::Submit {
                erase: 1,
                line: "a".into()
            }
        );
    }

    #[test]
    fn test_backspace() {
        let mut editor = LineEditor::default();
        let mut history = CommandHistory::new();
        assert_eq!(editor.handle(key(KeyCode::Backspace), &mut history), EditAction::None);
        editor.handle(key(KeyCode::Char('a')), &mut history);
        assert_eq!(
            editor.handle(key(KeyCode::Backspace), &mut history),
            EditAction::Redraw {
                erase: 1,
                text: String::new()
            }
        );
    }

    #[test]
    fn test_control_keys() {
        let mut editor = LineEditor::default();
        let mut history = CommandHistory::new();
        editor.handle(key(KeyCode::Char('w')), &mut history);
        assert_eq!(editor.handle(ctrl('c'), &mut history), EditAction::Terminate { erase: 1 });
        assert_eq!(editor.handle(ctrl('d'), &mut history), EditAction::SoftReset);
        assert_eq!(editor.handle(ctrl('x'), &mut history), EditAction::Exit);
        assert_eq!(editor.handle(ctrl('q'), &mut history), EditAction::None);
    }
}
