//! REPL wire protocol: command framing and response decoding
//!
//! Generated commands print their result as
//! `@{ <payload> }@ EXEC DONE <generation>`. The markers are assembled by
//! string concatenation on the device and embedded string literals escape
//! marker characters, so the echoed command line never contains them
//! verbatim and only real output can complete an exchange. The generation
//! tag ties each token to the exchange that asked for it.

pub mod command;
pub mod decoder;

pub use command::{python_string_literal, CommandBuilder, ControlSequence};
pub use decoder::{RawResponse, ResponseDecoder};

/// Printed before the payload
pub const BEGIN_MARKER: &str = "@{";
/// Printed after the payload
pub const END_MARKER: &str = "}@";
/// Printed last by every generated command, followed by the generation
pub const END_OF_OUTPUT: &str = "EXEC DONE";
/// Acknowledgement sent by the raw REPL after accepting code
pub const RAW_ACK: &str = "OK";
