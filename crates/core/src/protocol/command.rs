//! Command builder: MicroPython source text and control bytes
//!
//! Every builder is a pure function. Source text is a single line so it can be
//! typed into the interactive REPL; file-operation commands end with a
//! `print` of the sentinel-wrapped payload and an end-of-output token tagged
//! with the exchange generation (see [`CommandBuilder::tag_exchange`]).

use std::fmt::Write as _;

use super::{BEGIN_MARKER, END_MARKER, END_OF_OUTPUT};
use crate::types::{FileType, MicroFile};

/// Board-side variable holding the exchange generation
const GENERATION_VAR: &str = "_g";

/// Escaped in literals: markers, the end-of-output token and the prompt
const SENTINEL_CHARS: [char; 5] = ['@', '{', '}', 'E', '>'];

/// Single control bytes understood by the REPL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlSequence {
    /// Ctrl-A: enter raw REPL
    EnterRawMode = 0x01,
    /// Ctrl-B: back to the friendly REPL
    EnterInteractiveMode = 0x02,
    /// Ctrl-C: keyboard interrupt
    Terminate = 0x03,
    /// Ctrl-D: soft reboot, or end of transmission in raw/paste mode
    SoftReset = 0x04,
    /// Ctrl-E: paste mode
    EnterPasteMode = 0x05,
}

impl ControlSequence {
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn as_bytes(self) -> [u8; 1] {
        [self as u8]
    }
}

/// Builds the exact bytes/text to transmit for each board operation
pub struct CommandBuilder;

impl CommandBuilder {
    /// Wrap a command line in carriage returns so the REPL runs it as one line
    pub fn frame_line(text: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(text.len() + 2);
        buf.push(b'\r');
        buf.extend_from_slice(text.as_bytes());
        buf.push(b'\r');
        buf
    }

    /// Print `(name, type, inode, size)` tuples for every entry of `path`
    ///
    /// Uses `os.listdir` + `os.stat` because `os.ilistdir` is missing on
    /// CircuitPython. The type is the raw stat mode (`0x4000` / `0x8000`).
    pub fn list_directory(path: &str) -> String {
        format!("import os;{}", listing_statement(path))
    }

    /// Print the byte count and hex dump of the whole content of `path`
    ///
    /// Hex keeps file content from ever reproducing a sentinel in the output;
    /// [`ResponseDecoder::decode_file_content`](super::ResponseDecoder::decode_file_content)
    /// turns it back into text with `\r\n` normalized to `\n`.
    pub fn read_file(path: &str) -> String {
        format!(
            "_f=open({},'rb');_b=_f.read();_f.close();{}",
            python_string_literal(path),
            print_payload("len(_b),''.join(['%02x'%_x for _x in _b])"),
        )
    }

    /// Write `content` to `path` and print the number of bytes written
    ///
    /// The content is embedded as an escaped string literal, so quotes,
    /// backslashes and control characters survive unchanged.
    pub fn write_file(path: &str, content: &str) -> String {
        format!(
            "_f=open({},'w');_n=_f.write({});_f.close();{}",
            python_string_literal(path),
            python_string_literal(content),
            print_payload("_n"),
        )
    }

    /// Delete a file, then list its parent
    pub fn remove_file(file: &MicroFile) -> String {
        mutate_then_list(
            &format!("os.remove({})", python_string_literal(&file.full_path())),
            &file.parent_path(),
        )
    }

    /// Delete an empty directory, then list its parent
    pub fn remove_directory(file: &MicroFile) -> String {
        mutate_then_list(
            &format!("os.rmdir({})", python_string_literal(&file.full_path())),
            &file.parent_path(),
        )
    }

    /// Create a directory, then list its parent
    pub fn make_directory(file: &MicroFile) -> String {
        mutate_then_list(
            &format!("os.mkdir({})", python_string_literal(&file.full_path())),
            &file.parent_path(),
        )
    }

    /// Create an empty file, then list its parent
    pub fn make_file(file: &MicroFile) -> String {
        mutate_then_list(
            &format!("open({},'w').close()", python_string_literal(&file.full_path())),
            &file.parent_path(),
        )
    }

    /// Move `src` to `dst`, then list the destination's parent
    pub fn rename(src: &MicroFile, dst: &MicroFile) -> String {
        mutate_then_list(
            &format!(
                "os.rename({},{})",
                python_string_literal(&src.full_path()),
                python_string_literal(&dst.full_path())
            ),
            &dst.parent_path(),
        )
    }

    /// Bind the generation printed in the end-of-output token of `command`
    ///
    /// The board then prints `EXEC DONE <generation>`, so a late reply can
    /// never complete a newer exchange.
    pub fn tag_exchange(command: &str, generation: u64) -> String {
        format!("{}={};{}", GENERATION_VAR, generation, command)
    }

    /// Run a script stored on the device; output streams to the terminal
    pub fn run_file(path: &str) -> String {
        format!("exec(open({}).read())", python_string_literal(path))
    }

    /// Hard reset through the runtime's reset call
    pub fn hard_reset(micro_python: bool) -> String {
        if micro_python {
            "import machine;machine.reset()".to_string()
        } else {
            "import microcontroller;microcontroller.reset()".to_string()
        }
    }

    /// Interrupt, drop to the friendly REPL, soft reboot
    pub fn soft_reset_sequence() -> Vec<u8> {
        vec![
            ControlSequence::Terminate.as_byte(),
            ControlSequence::EnterInteractiveMode.as_byte(),
            ControlSequence::SoftReset.as_byte(),
        ]
    }

    /// Multi-line code through paste mode (Ctrl-E ... Ctrl-D)
    pub fn paste_block(code: &str) -> Vec<u8> {
        let code = normalize_newlines(code);
        let mut buf = Vec::with_capacity(code.len() + 2);
        buf.push(ControlSequence::EnterPasteMode.as_byte());
        buf.extend_from_slice(code.as_bytes());
        buf.push(ControlSequence::SoftReset.as_byte());
        buf
    }

    /// Raw REPL framing: enter raw mode, code, execution trigger
    ///
    /// The rest of the handshake (wait for `OK` and the two end-of-transmission
    /// bytes, then send [`ControlSequence::EnterInteractiveMode`]) is driven by
    /// the session.
    pub fn wrap_for_sync_execution(code: &str) -> Vec<u8> {
        let code = normalize_newlines(code);
        let mut buf = Vec::with_capacity(code.len() + 3);
        buf.push(b'\r');
        buf.push(ControlSequence::EnterRawMode.as_byte());
        buf.extend_from_slice(code.as_bytes());
        buf.push(ControlSequence::SoftReset.as_byte());
        buf
    }
}

/// Render `value` as a single-quoted Python string literal
///
/// Backslashes, quotes and control characters are escaped, and so are the
/// characters sentinels are made of, so the REPL echo of a literal never
/// contains one. Other characters (including non-ASCII) are kept as UTF-8.
pub fn python_string_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c as u32 == 0x7F || SENTINEL_CHARS.contains(&c) => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// `print(<begin>, expr, <end>, <eot>, _g)` with every marker split in two
fn print_payload(expr: &str) -> String {
    format!(
        "print({},{},{},{},{})",
        split_literal(BEGIN_MARKER),
        expr,
        split_literal(END_MARKER),
        split_literal(END_OF_OUTPUT),
        GENERATION_VAR
    )
}

/// `'ab'+'cd'` for an ASCII marker
fn split_literal(marker: &str) -> String {
    let (head, tail) = marker.split_at(marker.len() / 2);
    format!("'{}'+'{}'", head, tail)
}

fn listing_statement(path: &str) -> String {
    let dir = directory_path(path);
    let prefix = if dir == "/" { dir.clone() } else { format!("{}/", dir) };
    format!(
        "_p={};_d={};{}",
        python_string_literal(&dir),
        python_string_literal(&prefix),
        print_payload("[(_n,os.stat(_d+_n)[0],0,os.stat(_d+_n)[6]) for _n in os.listdir(_p)]"),
    )
}

fn mutate_then_list(operation: &str, parent: &str) -> String {
    format!("import os;{};{}", operation, listing_statement(parent))
}

/// Absolute directory path without trailing slash (`/` for root)
fn directory_path(path: &str) -> String {
    // the parent of a nameless entry is the normalized directory itself
    MicroFile::new("", path, FileType::Directory, 0).parent_path()
}

fn normalize_newlines(code: &str) -> String {
    code.replace("\r\n", "\n")
}
