//! Source code under edit

use serde::{Deserialize, Serialize};

/// Backing store of a script
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EditorMode {
    /// Host filesystem, persisted by the host application
    Local,
    /// Device filesystem, persisted through the board connection
    Remote,
}

/// A unit of source code held in memory by the editor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MicroScript {
    pub path: String,
    pub content: String,
    pub editor_mode: EditorMode,
    pub micro_python: bool,
}

impl MicroScript {
    /// Script stored on the host
    pub fn local(path: impl Into<String>, content: impl Into<String>, micro_python: bool) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            editor_mode: EditorMode::Local,
            micro_python,
        }
    }

    /// Script stored on the board
    pub fn remote(path: impl Into<String>, content: impl Into<String>, micro_python: bool) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            editor_mode: EditorMode::Remote,
            micro_python,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.editor_mode == EditorMode::Remote
    }

    /// Leaf file name
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Full editor text
    pub fn text(&self) -> &str {
        &self.content
    }

    /// Replace the full editor text
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.content = text.into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_name() {
        let script = MicroScript::remote("/lib/util.py", "x = 1", true);
        assert_eq!(script.name(), "util.py");
        assert!(script.is_remote());
        assert_eq!(MicroScript::local("main.py", "", false).name(), "main.py");
    }

    #[test]
    fn test_set_text() {
        let mut script = MicroScript::local("blink.py", "", true);
        script.set_text("import machine\n");
        assert_eq!(script.text(), "import machine\n");
    }
}
