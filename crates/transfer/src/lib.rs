//! Chunked file transfer with per-chunk acknowledgement, retry,
//! integrity verification and cooperative cancellation.
//!
//! One [`TransferSession`] drives one file across the link. The sender
//! announces the file with `HEADER`, then moves it chunk by chunk, each
//! chunk gated by a `CHUNK_READY` handshake and confirmed by `ACK`, and
//! finally asks the receiver to `VERIFY` the checksum.

mod checksum;
mod chunked;
mod compression;
mod config;
mod io;
mod progress;
mod receiver;
mod sender;
mod space;
mod types;
mod validation;

pub use checksum::{calculate_file_checksum, checksum_bytes};
pub use chunked::{ChunkReader, ChunkWriter, chunk_count};
pub use compression::{compress_file, decompress_file};
pub use config::TransferConfig;
pub use io::{Inbound, LinkIo, SessionIo, classify_line, recv_session};
pub use progress::SpeedCalculator;
pub use receiver::{await_header, run_receiver};
pub use sender::{AckOutcome, PreparedFile, prepare_file, run_sender};
pub use space::{SpaceProbe, StatvfsProbe};
pub use types::{
    Chunk, Direction, FileMetadata, TransferContext, TransferProgress, TransferRecord,
    TransferSession, TransferState,
};
pub use validation::sanitize_file_name;

use camlink_link::LinkError;
use camlink_protocol::ErrorCode;

/// Errors that end a transfer session.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("connection lost: {0}")]
    Connection(String),

    #[error("timed out waiting for {phase}")]
    Timeout { phase: &'static str },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("chunk {sequence} failed after {attempts} attempts")]
    RetriesExhausted { sequence: u32, attempts: u32 },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("insufficient space: need {required} bytes, {available} available")]
    Resource { required: u64, available: u64 },

    #[error("invalid file name: {0}")]
    InvalidName(String),

    #[error("peer aborted with {code}: {detail}")]
    PeerAborted { code: ErrorCode, detail: String },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("compression error: {0}")]
    Compression(String),
}

impl TransferError {
    /// Code used in the `ERROR|<code>|...` line announcing this failure.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            Self::Connection(_) => ErrorCode::Connection,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Protocol(_) => ErrorCode::ProtocolError,
            Self::RetriesExhausted { .. } => ErrorCode::RetriesExhausted,
            Self::Integrity { .. } => ErrorCode::ChecksumMismatch,
            Self::Resource { .. } => ErrorCode::InsufficientSpace,
            Self::InvalidName(_) => ErrorCode::InvalidName,
            Self::PeerAborted { code, .. } => code.clone(),
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Io(_) => ErrorCode::IoError,
            Self::Compression(_) => ErrorCode::Other("COMPRESSION_ERROR".into()),
        }
    }

    /// Whether the peer still needs to be told about this failure.
    ///
    /// A peer that aborted already knows, and a dead channel cannot carry
    /// the line anyway.
    pub fn should_notify_peer(&self) -> bool {
        !matches!(self, Self::PeerAborted { .. } | Self::Connection(_))
    }

    /// Whether the channel itself failed and needs reconnecting.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<LinkError> for TransferError {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::Timeout => Self::Timeout { phase: "peer" },
            other => Self::Connection(other.to_string()),
        }
    }
}
