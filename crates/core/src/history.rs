//! In-memory REPL command history with up/down navigation

use serde::{Deserialize, Serialize};

/// Default number of commands kept
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Command history plus a navigation cursor
///
/// `cursor == None` means "past the newest entry": the next `up()` returns
/// the most recent command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandHistory {
    entries: Vec<String>,
    cursor: Option<usize>,
    capacity: usize,
}

impl Default for CommandHistory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}

impl CommandHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// History keeping at most `capacity` commands (at least one)
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            cursor: None,
            capacity: capacity.max(1),
        }
    }

    /// Record a submitted command and reset the cursor
    ///
    /// Blank commands and repeats of the most recent command are not stored.
    pub fn push(&mut self, command: impl Into<String>) {
        self.cursor = None;
        let command = command.into();
        if command.trim().is_empty() {
            return;
        }
        if self.entries.last() == Some(&command) {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.remove(0);
        }
        self.entries.push(command);
    }

    /// Step toward older commands
    ///
    /// Returns `None` when empty or already at the oldest entry.
    pub fn up(&mut self) -> Option<&str> {
        let next = match self.cursor {
            None => self.entries.len().checked_sub(1)?,
            Some(0) => return None,
            Some(i) => i - 1,
        };
        self.cursor = Some(next);
        self.entries.get(next).map(String::as_str)
    }

    /// Step toward newer commands
    ///
    /// Stops on the newest entry and keeps returning it; `None` only when
    /// empty.
    pub fn down(&mut self) -> Option<&str> {
        let last = self.entries.len().checked_sub(1)?;
        let next = match self.cursor {
            Some(i) if i < last => i + 1,
            _ => last,
        };
        self.cursor = Some(next);
        self.entries.get(next).map(String::as_str)
    }

    /// Forget the navigation position
    pub fn reset_cursor(&mut self) {
        self.cursor = None;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest first
    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}
