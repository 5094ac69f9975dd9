//! Transfer control lines exchanged between sender and receiver.

use std::fmt;
use std::str::FromStr;

use crate::ProtocolError;
use crate::constants::FIELD_SEPARATOR;
use crate::reply::ErrorCode;

/// Marker field introducing the compressed size in a `HEADER` line.
const COMPRESSED_MARKER: &str = "COMPRESSED";

/// File description announced by the sender in `HEADER`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub name: String,
    pub total_size: u64,
    pub checksum: String,
    pub compressed_size: Option<u64>,
}

impl FileHeader {
    /// Number of bytes that will cross the wire.
    pub fn wire_size(&self) -> u64 {
        self.compressed_size.unwrap_or(self.total_size)
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed_size.is_some()
    }
}

/// One control line of the transfer protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// `HEADER|<name>|<size>|<checksum>[|COMPRESSED|<csize>]`
    Header(FileHeader),
    /// `READY`
    Ready,
    /// `CHUNK|<seq>|<len>`, followed by exactly `len` raw bytes once the
    /// receiver answers `CHUNK_READY`.
    Chunk { sequence: u32, length: u16 },
    /// `CHUNK_READY`
    ChunkReady,
    /// `ACK`
    Ack,
    /// `NACK`
    Nack,
    /// `VERIFY|<checksum>`
    Verify { checksum: String },
    /// `DONE`
    Done,
    /// `CANCEL`, a peer-initiated abort request.
    Cancel,
    /// `ERROR|<code>|<detail>`, aborts the session on either side.
    Error { code: ErrorCode, detail: String },
}

impl ControlMessage {
    /// Builds an `ERROR` line.
    pub fn error(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self::Error {
            code,
            detail: detail.into(),
        }
    }

    /// Short name of the token, used in logs and error details.
    pub fn token(&self) -> &'static str {
        match self {
            Self::Header(_) => "HEADER",
            Self::Ready => "READY",
            Self::Chunk { .. } => "CHUNK",
            Self::ChunkReady => "CHUNK_READY",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Verify { .. } => "VERIFY",
            Self::Done => "DONE",
            Self::Cancel => "CANCEL",
            Self::Error { .. } => "ERROR",
        }
    }

    /// Returns `true` if `line` starts with a control token.
    ///
    /// Lines that look like control traffic but fail to parse still count,
    /// so the caller can report them as protocol errors instead of routing
    /// them to the command dispatcher.
    pub fn is_control_line(line: &str) -> bool {
        !matches!(
            line.parse::<Self>(),
            Err(ProtocolError::UnknownToken(_) | ProtocolError::Empty)
        )
    }
}

fn parse_u64(field: &'static str, value: &str) -> Result<u64, ProtocolError> {
    value.trim().parse().map_err(|_| ProtocolError::InvalidField {
        field,
        value: value.to_string(),
    })
}

impl FromStr for ControlMessage {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ProtocolError::Empty);
        }

        let malformed = |kind: &'static str| ProtocolError::Malformed {
            kind,
            line: line.to_string(),
        };

        let mut fields = line.split(FIELD_SEPARATOR);
        let token = fields.next().unwrap_or_default();
        let rest: Vec<&str> = fields.collect();

        match token {
            "HEADER" => {
                let compressed_size = match rest.as_slice() {
                    [_, _, _] => None,
                    [_, _, _, marker, csize] if *marker == COMPRESSED_MARKER => {
                        Some(parse_u64("compressed size", csize)?)
                    }
                    _ => return Err(malformed("HEADER")),
                };
                let name = rest[0].trim();
                let checksum = rest[2].trim();
                if name.is_empty() || checksum.is_empty() {
                    return Err(malformed("HEADER"));
                }
                Ok(Self::Header(FileHeader {
                    name: name.to_string(),
                    total_size: parse_u64("size", rest[1])?,
                    checksum: checksum.to_ascii_lowercase(),
                    compressed_size,
                }))
            }
            "CHUNK" => match rest.as_slice() {
                [seq, len] => {
                    let sequence = seq.trim().parse().map_err(|_| ProtocolError::InvalidField {
                        field: "sequence",
                        value: seq.to_string(),
                    })?;
                    let length = len.trim().parse().map_err(|_| ProtocolError::InvalidField {
                        field: "length",
                        value: len.to_string(),
                    })?;
                    Ok(Self::Chunk { sequence, length })
                }
                _ => Err(malformed("CHUNK")),
            },
            "VERIFY" => match rest.as_slice() {
                [checksum] if !checksum.trim().is_empty() => Ok(Self::Verify {
                    checksum: checksum.trim().to_ascii_lowercase(),
                }),
                _ => Err(malformed("VERIFY")),
            },
            "ERROR" => {
                // The detail may itself contain separators.
                let mut parts = line.splitn(3, FIELD_SEPARATOR).skip(1);
                let code = parts.next().map(str::trim).unwrap_or_default();
                let detail = parts.next().map(str::trim).unwrap_or_default();
                Ok(Self::Error {
                    code: ErrorCode::from_wire(code),
                    detail: detail.to_string(),
                })
            }
            "READY" | "CHUNK_READY" | "ACK" | "NACK" | "DONE" | "CANCEL" => {
                if !rest.is_empty() {
                    return Err(malformed("control token"));
                }
                Ok(match token {
                    "READY" => Self::Ready,
                    "CHUNK_READY" => Self::ChunkReady,
                    "ACK" => Self::Ack,
                    "NACK" => Self::Nack,
                    "DONE" => Self::Done,
                    _ => Self::Cancel,
                })
            }
            _ => Err(ProtocolError::UnknownToken(line.to_string())),
        }
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Header(h) => {
                write!(f, "HEADER|{}|{}|{}", h.name, h.total_size, h.checksum)?;
                if let Some(csize) = h.compressed_size {
                    write!(f, "|{COMPRESSED_MARKER}|{csize}")?;
                }
                Ok(())
            }
            Self::Chunk { sequence, length } => write!(f, "CHUNK|{sequence}|{length}"),
            Self::Verify { checksum } => write!(f, "VERIFY|{checksum}"),
            Self::Error { code, detail } if detail.is_empty() => write!(f, "ERROR|{code}"),
            Self::Error { code, detail } => {
                write!(f, "ERROR|{code}|{}", crate::reply::sanitize_field(detail))
            }
            other => f.write_str(other.token()),
        }
    }
}
