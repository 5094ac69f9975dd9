//! Wire vocabulary shared by the camlink device and its peers.
//!
//! Everything on the link is a text line terminated by `\r\n` (or `\n`),
//! fields separated by `|`, except the raw chunk payload that follows a
//! `CHUNK_READY` handshake. This crate only knows how to format and parse
//! those lines; it never touches I/O.

pub mod constants;
pub mod control;
pub mod reply;

pub use constants::{FIELD_SEPARATOR, PARAM_DELIMITER};
pub use control::{ControlMessage, FileHeader};
pub use reply::{ErrorCode, Reply};

/// Errors produced while parsing wire lines.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty line")]
    Empty,

    #[error("unknown control token: {0}")]
    UnknownToken(String),

    #[error("malformed {kind}: {line}")]
    Malformed { kind: &'static str, line: String },

    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}
