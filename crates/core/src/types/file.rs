//! Device filesystem entries

use serde::{Deserialize, Serialize};

/// Stat mode bits for a directory on the device
const STAT_DIRECTORY: i64 = 0x4000;
/// Mask selecting the file-type bits of a stat mode
const STAT_TYPE_MASK: i64 = 0xF000;

/// Kind of a directory entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FileType {
    File,
    Directory,
}

impl FileType {
    /// Map a device stat mode (`0x4000` directory, `0x8000` file)
    ///
    /// Anything that is not a directory is treated as a regular file; the
    /// MicroPython VFS never reports other types.
    pub fn from_stat_mode(mode: i64) -> Self {
        if mode & STAT_TYPE_MASK == STAT_DIRECTORY {
            FileType::Directory
        } else {
            FileType::File
        }
    }
}

/// One entry of a device directory listing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MicroFile {
    /// Leaf name
    pub name: String,
    /// Parent directory (empty for root)
    pub path: String,
    pub file_type: FileType,
    /// Size in bytes, meaningful for files only
    pub size: u64,
}

impl MicroFile {
    pub fn new(name: impl Into<String>, path: impl Into<String>, file_type: FileType, size: u64) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            file_type,
            size,
        }
    }

    /// Build an entry from an absolute device path such as `/lib/util.py`
    pub fn from_full_path(full_path: &str, file_type: FileType) -> Self {
        let normalized = collapse_slashes(full_path);
        let trimmed = normalized.trim_end_matches('/');
        match trimmed.rfind('/') {
            Some(idx) => Self::new(&trimmed[idx + 1..], &trimmed[..idx], file_type, 0),
            None => Self::new(trimmed, "", file_type, 0),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// `path` and `name` joined by a single separator
    pub fn full_path(&self) -> String {
        collapse_slashes(&format!("{}/{}", self.path, self.name))
    }

    /// Directory that contains this entry (`/` for root entries)
    pub fn parent_path(&self) -> String {
        let parent = collapse_slashes(&format!("/{}", self.path));
        if parent.len() > 1 {
            parent.trim_end_matches('/').to_string()
        } else {
            parent
        }
    }

    /// Same parent directory, different leaf name (rename targets)
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }
}

/// Collapse runs of `/` into one
pub(crate) fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut last_slash = false;
    for c in path.chars() {
        if c == '/' {
            if !last_slash {
                out.push(c);
            }
            last_slash = true;
        } else {
            out.push(c);
            last_slash = false;
        }
    }
    out
}
