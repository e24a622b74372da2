//! Response decoder: completion detection and payload extraction
//!
//! All functions are pure. Completion is always re-tested against the
//! cumulative buffer of an exchange, never a single read chunk, so sentinels
//! split across chunks are still found. Completion searches work on bytes:
//! every sentinel is ASCII, and offsets must stay valid even when the buffer
//! holds a partial UTF-8 sequence.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{BEGIN_MARKER, END_MARKER, END_OF_OUTPUT, RAW_ACK};
use crate::error::{CoreError, Result};
use crate::types::{FileType, MicroFile};

const TRACEBACK: &[u8] = b"Traceback (most recent call last)";
const PROMPT: &[u8] = b">>>";
const EOT: u8 = 0x04;

/// Output of one raw-REPL execution
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawResponse {
    /// Everything the code printed
    pub output: String,
    /// Exception text, empty on success
    pub error: String,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }
}

/// Decodes accumulated REPL output
pub struct ResponseDecoder;

impl ResponseDecoder {
    /// True once an end-of-output token (or a traceback followed by a fresh
    /// prompt) is present in the accumulated text
    pub fn is_exchange_complete(accumulated: &str) -> bool {
        Self::find_completion(accumulated.as_bytes()).is_some()
    }

    /// True once the raw REPL acknowledged the code and sent both
    /// end-of-transmission bytes
    pub fn is_raw_exchange_complete(accumulated: &str) -> bool {
        Self::find_raw_completion(accumulated.as_bytes()).is_some()
    }

    /// Byte offset just past the completion evidence of a friendly-REPL command
    ///
    /// Any end-of-output token counts, whatever its generation tag. A command
    /// that raises never prints its sentinel; the REPL prints a traceback and
    /// a new `>>>` prompt instead, which also ends the exchange.
    pub fn find_completion(accumulated: &[u8]) -> Option<usize> {
        match end_tokens(accumulated).first() {
            Some(token) => Some(token.end),
            None => find_traceback_completion(accumulated),
        }
    }

    /// Completion of the exchange tagged `generation`
    ///
    /// Only `EXEC DONE <generation>` counts; tokens of other exchanges are
    /// ignored. Falls back to the traceback rule.
    pub fn find_tagged_completion(accumulated: &[u8], generation: u64) -> Option<usize> {
        Self::find_own_token(accumulated, generation).or_else(|| find_traceback_completion(accumulated))
    }

    /// Offset just past `EXEC DONE <generation>`, ignoring tracebacks
    pub fn find_own_token(accumulated: &[u8], generation: u64) -> Option<usize> {
        end_tokens(accumulated)
            .into_iter()
            .find(|token| token.tag == Some(generation))
            .map(|token| token.end)
    }

    /// Highest generation tag among the complete end-of-output tokens
    pub fn newest_tag(accumulated: &[u8]) -> Option<u64> {
        end_tokens(accumulated).into_iter().filter_map(|token| token.tag).max()
    }

    /// Byte offset just past the raw-REPL response (`OK` ... `\x04` ... `\x04`,
    /// plus the `>` prompt when it has already arrived)
    pub fn find_raw_completion(accumulated: &[u8]) -> Option<usize> {
        let ack = find_subslice(accumulated, RAW_ACK.as_bytes())?;
        let body_start = ack + RAW_ACK.len();
        let mut eots = accumulated[body_start..]
            .iter()
            .enumerate()
            .filter(|(_, b)| **b == EOT)
            .map(|(i, _)| body_start + i);
        let _stdout_end = eots.next()?;
        let stderr_end = eots.next()?;
        if accumulated.get(stderr_end + 1) == Some(&b'>') {
            Some(stderr_end + 2)
        } else {
            Some(stderr_end + 1)
        }
    }

    /// Whether the raw REPL acknowledged the submitted code
    pub fn has_raw_ack(accumulated: &str) -> bool {
        accumulated.contains(RAW_ACK)
    }

    /// Text between the last begin marker and the last end marker, trimmed
    ///
    /// The last pair wins because echoed input and banners can contain
    /// marker-like text earlier in the stream. Returns `default` when the
    /// markers are missing or out of order.
    pub fn extract_payload(accumulated: &str, default: &str) -> String {
        let Some(begin) = accumulated.rfind(BEGIN_MARKER) else {
            return default.to_string();
        };
        let Some(end) = accumulated.rfind(END_MARKER) else {
            return default.to_string();
        };
        let start = begin + BEGIN_MARKER.len();
        if end < start {
            return default.to_string();
        }
        accumulated[start..end].trim().to_string()
    }

    /// Decode a printed list of `(name, type, inode, size)` tuples
    ///
    /// Accepts list or tuple brackets. Entries without exactly four fields, or
    /// with fields of the wrong type, are dropped; an unparseable payload
    /// yields an empty listing. Directories sort first, then by name.
    pub fn decode_directory_listing(payload: &str, parent: &str) -> Vec<MicroFile> {
        let Some(json) = python_literal_to_json(payload) else {
            tracing::warn!("Unterminated string in directory listing ({} bytes)", payload.len());
            return Vec::new();
        };

        let entries: Vec<Value> = match serde_json::from_str(&json) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Unparseable directory listing: {}", e);
                return Vec::new();
            }
        };

        let mut files: Vec<MicroFile> = entries
            .iter()
            .filter_map(|entry| decode_entry(entry, parent))
            .collect();

        files.sort_by(|a, b| match (a.is_dir(), b.is_dir()) {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            _ => a.name.cmp(&b.name),
        });
        files
    }

    /// Decode a `<byte count> <hex>` file payload into text
    ///
    /// `\r\n` is normalized to `\n`. An empty payload means the board never
    /// printed the content (usually a traceback), which is an error rather
    /// than an empty file.
    pub fn decode_file_content(payload: &str) -> Result<String> {
        let payload = payload.trim();
        if payload.is_empty() {
            return Err(CoreError::MalformedResponse("response carried no file content".into()));
        }
        let (count, hex) = payload.split_once(' ').unwrap_or((payload, ""));
        let count: usize = count
            .parse()
            .map_err(|_| CoreError::MalformedResponse(format!("bad byte count {:?}", count)))?;
        let hex = hex.trim().as_bytes();
        if hex.len() != count * 2 {
            return Err(CoreError::MalformedResponse(format!(
                "expected {} bytes of content, got {} hex digits",
                count,
                hex.len()
            )));
        }

        let bytes = hex
            .chunks(2)
            .map(|pair| Some((hex_digit(pair[0])? << 4) | hex_digit(pair[1])?))
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(|| CoreError::MalformedResponse("invalid hex in file content".into()))?;
        Ok(String::from_utf8_lossy(&bytes).replace("\r\n", "\n"))
    }

    /// Split a raw-REPL response into program output and exception text
    pub fn decode_raw_response(accumulated: &str) -> Result<RawResponse> {
        let ack = accumulated.find(RAW_ACK).ok_or_else(|| {
            CoreError::ProtocolDesync(format!(
                "no {} acknowledgement in {} bytes of output",
                RAW_ACK,
                accumulated.len()
            ))
        })?;

        let mut parts = accumulated[ack + RAW_ACK.len()..].split(EOT as char);
        let output = parts.next().unwrap_or_default();
        let error = parts.next().ok_or_else(|| {
            CoreError::ProtocolDesync("raw response ended before the end-of-transmission marker".into())
        })?;

        Ok(RawResponse {
            output: output.to_string(),
            error: error.trim().to_string(),
        })
    }
}

/// One complete `EXEC DONE[ <tag>]` occurrence
struct EndToken {
    tag: Option<u64>,
    end: usize,
}

/// Every end-of-output token whose tag is fully received
///
/// A tag counts only once a non-digit follows it, so `EXEC DONE 1` is not
/// mistaken for a prefix of `EXEC DONE 12` across a chunk boundary.
fn end_tokens(accumulated: &[u8]) -> Vec<EndToken> {
    let token = END_OF_OUTPUT.as_bytes();
    let mut tokens = Vec::new();
    let mut from = 0;
    while let Some(idx) = find_subslice(&accumulated[from..], token) {
        let start = from + idx + token.len();
        from = start;
        if let Some((tag, len)) = parse_tag(&accumulated[start..]) {
            tokens.push(EndToken { tag, end: start + len });
        }
    }
    tokens
}

/// ` 12\r...` gives `(Some(12), 3)`, `\r...` gives `(None, 0)`, `None` while incomplete
fn parse_tag(rest: &[u8]) -> Option<(Option<u64>, usize)> {
    if *rest.first()? != b' ' {
        return Some((None, 0));
    }
    let digits = rest[1..].iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return rest.get(1).map(|_| (None, 0));
    }
    rest.get(1 + digits)?;
    let tag = std::str::from_utf8(&rest[1..1 + digits]).ok()?.parse().ok()?;
    Some((Some(tag), 1 + digits))
}

fn find_traceback_completion(accumulated: &[u8]) -> Option<usize> {
    let traceback = find_subslice(accumulated, TRACEBACK)?;
    let tail = trim_ascii_end(&accumulated[traceback..]);
    if tail.ends_with(PROMPT) {
        Some(traceback + tail.len())
    } else {
        None
    }
}

fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

fn decode_entry(entry: &Value, parent: &str) -> Option<MicroFile> {
    let fields = entry.as_array()?;
    if fields.len() != 4 {
        tracing::debug!("Dropping listing entry with {} fields", fields.len());
        return None;
    }
    let name = fields[0].as_str()?;
    let mode = fields[1].as_i64()?;
    let size = fields[3].as_u64().unwrap_or(0);
    Some(MicroFile::new(name, parent, FileType::from_stat_mode(mode), size))
}

/// Rewrite a Python literal (lists, tuples, strings, ints) as JSON
///
/// Tuple brackets become list brackets and trailing commas are dropped, both
/// only outside string literals. Returns `None` for an unterminated string.
fn python_literal_to_json(literal: &str) -> Option<String> {
    let mut out = String::with_capacity(literal.len());
    let mut chars = literal.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                let text = read_python_string(&mut chars, c)?;
                out.push_str(&Value::String(text).to_string());
            }
            '(' | '[' => out.push('['),
            ')' | ']' => {
                let trimmed = out.trim_end().len();
                out.truncate(trimmed);
                if out.ends_with(',') {
                    out.pop();
                }
                out.push(']');
            }
            c => out.push(c),
        }
    }
    Some(out)
}

/// Read the body of a Python string literal whose opening quote was consumed
fn read_python_string(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, quote: char) -> Option<String> {
    let mut text = String::new();
    loop {
        let c = chars.next()?;
        if c == quote {
            return Some(text);
        }
        if c != '\\' {
            text.push(c);
            continue;
        }
        match chars.next()? {
            'n' => text.push('\n'),
            'r' => text.push('\r'),
            't' => text.push('\t'),
            'x' => text.push(read_hex_escape(chars, 2)?),
            'u' => text.push(read_hex_escape(chars, 4)?),
            other => text.push(other),
        }
    }
}

fn read_hex_escape(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, digits: usize) -> Option<char> {
    let hex: String = (0..digits).filter_map(|_| chars.next()).collect();
    u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn trim_ascii_end(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &bytes[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_payload_without_markers_returns_default() {
        for text in ["", "plain output", ">>> print(1)\r\n1\r\n", "}@ reversed @{"] {
            assert_eq!(ResponseDecoder::extract_payload(text, "DEFAULT"), "DEFAULT");
        }
    }

    #[test]
    fn test_extract_payload_uses_last_pair() {
        let text = "noise @{ old }@ ... @{ real-data }@ EXEC DONE";
        assert_eq!(ResponseDecoder::extract_payload(text, ""), "real-data");
    }

    #[test]
    fn test_extract_payload_from_echoed_command() {
        let text = ">>> _g=3;import os;print('@'+'{',5,'}'+'@','EXEC'+' DONE',_g)\r\n@{ 5 }@ EXEC DONE 3\r\n>>> ";
        assert_eq!(ResponseDecoder::extract_payload(text, "?"), "5");
    }

    #[test]
    fn test_completion_tolerates_split_chunks() {
        let mut acc = String::from("@{ [] }@ EXEC DO");
        assert!(!ResponseDecoder::is_exchange_complete(&acc));
        acc.push_str("NE\r\n");
        assert!(ResponseDecoder::is_exchange_complete(&acc));
        assert_eq!(
            ResponseDecoder::find_completion(acc.as_bytes()),
            Some("@{ [] }@ EXEC DONE".len())
        );
    }

    #[test]
    fn test_tagged_completion_matches_own_generation() {
        let acc = b"@{ old }@ EXEC DONE 6\r\n>>> @{ new }@ EXEC DONE 7\r\n>>> ";
        let own = ResponseDecoder::find_tagged_completion(acc, 7).unwrap();
        assert!(acc[..own].ends_with(b"EXEC DONE 7"));
        assert_eq!(ResponseDecoder::find_tagged_completion(acc, 8), None);
        assert_eq!(ResponseDecoder::newest_tag(acc), Some(7));
        assert!(ResponseDecoder::is_exchange_complete(std::str::from_utf8(acc).unwrap()));
    }

    #[test]
    fn test_tag_needs_terminator() {
        let mut acc = b"@{ 1 }@ EXEC DONE 1".to_vec();
        assert_eq!(ResponseDecoder::find_tagged_completion(&acc, 1), None);
        assert_eq!(ResponseDecoder::newest_tag(&acc), None);

        acc.extend_from_slice(b"2\r\n");
        assert_eq!(ResponseDecoder::find_tagged_completion(&acc, 1), None);
        assert_eq!(ResponseDecoder::find_tagged_completion(&acc, 12), Some(acc.len() - 2));
    }

    #[test]
    fn test_completion_on_traceback() {
        let partial = "Traceback (most recent call last):\r\n  File \"<stdin>\", line 1\r\nOSError: [Errno 2] ENOENT\r\n";
        assert!(!ResponseDecoder::is_exchange_complete(partial));

        let done = format!("{}>>> ", partial);
        assert!(ResponseDecoder::is_exchange_complete(&done));
        assert_eq!(ResponseDecoder::extract_payload(&done, "none"), "none");
    }

    #[test]
    fn test_raw_completion() {
        let banner = "raw REPL; CTRL-B to exit\r\n>";
        let mut acc = format!("{}OKhello\r\n\x04", banner);
        assert!(!ResponseDecoder::is_raw_exchange_complete(&acc));
        acc.push('\x04');
        assert!(ResponseDecoder::is_raw_exchange_complete(&acc));
        assert_eq!(ResponseDecoder::find_raw_completion(acc.as_bytes()), Some(acc.len()));

        acc.push('>');
        assert_eq!(ResponseDecoder::find_raw_completion(acc.as_bytes()), Some(acc.len()));
    }

    #[test]
    fn test_decode_file_content() {
        assert_eq!(ResponseDecoder::decode_file_content("2 6869").unwrap(), "hi");
        assert_eq!(ResponseDecoder::decode_file_content("4 610d0a62").unwrap(), "a\nb");
        assert_eq!(ResponseDecoder::decode_file_content("0").unwrap(), "");
        assert_eq!(ResponseDecoder::decode_file_content(" 3 C2B041 ").unwrap(), "°A");
    }

    #[test]
    fn test_decode_file_content_rejects_missing_or_damaged_payload() {
        for payload in ["", "   ", "x 6869", "3 6869", "2 68zz", "2 686"] {
            let err = ResponseDecoder::decode_file_content(payload).unwrap_err();
            assert!(matches!(err, CoreError::MalformedResponse(_)), "{payload:?}");
        }
    }

    #[test]
    fn test_decode_raw_response() {
        let ok = ResponseDecoder::decode_raw_response("raw REPL; CTRL-B to exit\r\n>OK3\r\n\x04\x04>").unwrap();
        assert_eq!(ok.output, "3\r\n");
        assert!(ok.is_success());

        let failed = ResponseDecoder::decode_raw_response(
            ">OK\x04Traceback (most recent call last):\r\nNameError: name 'x' isn't defined\r\n\x04>",
        )
        .unwrap();
        assert!(failed.output.is_empty());
        assert!(failed.error.starts_with("Traceback"));

        let desync = ResponseDecoder::decode_raw_response(">>> \r\n>>> ").unwrap_err();
        assert!(matches!(desync, CoreError::ProtocolDesync(_)));
    }

    #[test]
    fn test_decode_directory_listing() {
        let files = ResponseDecoder::decode_directory_listing(
            "[('main.py', 32768, 0, 120), ('lib', 16384, 0, 0)]",
            "/",
        );
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "lib");
        assert_eq!(files[0].file_type, FileType::Directory);
        assert_eq!(files[1].name, "main.py");
        assert_eq!(files[1].file_type, FileType::File);
        assert_eq!(files[1].size, 120);
        assert_eq!(files[1].full_path(), "/main.py");
    }

    #[test]
    fn test_decode_drops_malformed_entries() {
        let files = ResponseDecoder::decode_directory_listing(
            "[('a.py', 32768, 0, 5), ('short', 32768), ('b.py', 32768, 0, 7, 9), (1, 2, 3, 4)]",
            "/",
        );
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "a.py");
    }

    #[test]
    fn test_tuple_brackets_decode_like_lists() {
        let tuples = ResponseDecoder::decode_directory_listing("(('a.py', 32768, 0, 5),)", "/lib");
        let lists = ResponseDecoder::decode_directory_listing("[['a.py', 32768, 0, 5]]", "/lib");
        assert_eq!(tuples, lists);
        assert_eq!(tuples[0].full_path(), "/lib/a.py");
    }

    #[test]
    fn test_decode_quoted_names() {
        let files = ResponseDecoder::decode_directory_listing(
            r#"[("it's (v2).py", 32768, 0, 1), ('caf\xe9', 16384, 0, 0)]"#,
            "",
        );
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "café");
        assert_eq!(files[1].name, "it's (v2).py");
    }

    #[test]
    fn test_decode_garbage_is_empty() {
        assert!(ResponseDecoder::decode_directory_listing("", "/").is_empty());
        assert!(ResponseDecoder::decode_directory_listing("[('open", "/").is_empty());
        assert!(ResponseDecoder::decode_directory_listing("[]", "/").is_empty());
    }
}
