use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use camlink_protocol::FileHeader;

use crate::chunked::chunk_count;
use crate::config::TransferConfig;
use crate::progress::SpeedCalculator;
use crate::TransferError;

/// Which end of the transfer this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Receive,
}

/// State of a transfer session.
///
/// ```text
/// PENDING -> HEADER_SENT -> AWAITING_READY -> TRANSFERRING -> VERIFYING -> COMPLETED
/// ```
/// `ERROR` and `CANCELLED` are reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferState {
    Pending,
    HeaderSent,
    AwaitingReady,
    Transferring,
    Verifying,
    Completed,
    Error,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use TransferState::*;
        match (self, next) {
            (from, Error | Cancelled) => !from.is_terminal(),
            (Pending, HeaderSent)
            | (HeaderSent, AwaitingReady)
            | (AwaitingReady, Transferring)
            | (Transferring, Verifying)
            | (Verifying, Completed) => true,
            // Empty files have no chunks.
            (AwaitingReady, Verifying) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::HeaderSent => "HEADER_SENT",
            Self::AwaitingReady => "AWAITING_READY",
            Self::Transferring => "TRANSFERRING",
            Self::Verifying => "VERIFYING",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Description of the file being moved. Fixed for the whole session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub logical_name: String,
    pub total_size: u64,
    /// MD5 of the bytes on the wire.
    pub checksum: String,
    pub compressed: bool,
    pub compressed_size: Option<u64>,
}

impl FileMetadata {
    /// Number of bytes that cross the wire.
    pub fn wire_size(&self) -> u64 {
        match (self.compressed, self.compressed_size) {
            (true, Some(size)) => size,
            _ => self.total_size,
        }
    }

    pub fn from_header(header: &FileHeader) -> Self {
        Self {
            logical_name: header.name.clone(),
            total_size: header.total_size,
            checksum: header.checksum.clone(),
            compressed: header.is_compressed(),
            compressed_size: header.compressed_size,
        }
    }

    pub fn to_header(&self) -> FileHeader {
        FileHeader {
            name: self.logical_name.clone(),
            total_size: self.total_size,
            checksum: self.checksum.clone(),
            compressed_size: if self.compressed {
                self.compressed_size
            } else {
                None
            },
        }
    }
}

/// One slice of the wire bytes, in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub sequence: u32,
    pub payload: Vec<u8>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Point-in-time progress of a session, sent to observers.
#[derive(Debug, Clone, Serialize)]
pub struct TransferProgress {
    pub session_id: String,
    pub name: String,
    pub direction: Direction,
    pub state: TransferState,
    pub bytes_acked: u64,
    pub wire_size: u64,
    pub chunk_index: u32,
    pub chunk_count: u32,
    pub throughput_bps: f64,
    pub eta_secs: Option<f64>,
}

impl TransferProgress {
    pub fn percentage(&self) -> f64 {
        if self.wire_size == 0 {
            return 100.0;
        }
        self.bytes_acked as f64 / self.wire_size as f64 * 100.0
    }
}

/// Serializable snapshot of a session, kept in the status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: String,
    pub direction: Direction,
    pub name: String,
    pub state: TransferState,
    pub total_size: u64,
    pub wire_size: u64,
    pub compressed: bool,
    pub bytes_acked: u64,
    pub chunk_index: u32,
    pub chunk_count: u32,
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_sequence: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub throughput_bps: f64,
}

/// What a running session needs besides its channel.
#[derive(Clone, Default)]
pub struct TransferContext {
    pub config: TransferConfig,
    pub cancel: CancellationToken,
    pub progress: Option<mpsc::Sender<TransferProgress>>,
}

impl TransferContext {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: mpsc::Sender<TransferProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub(crate) fn check_cancelled(&self) -> Result<(), TransferError> {
        if self.cancel.is_cancelled() {
            Err(TransferError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sends a progress event if anyone listens. A full queue drops it.
    pub(crate) fn report(&self, session: &TransferSession) {
        if let Some(tx) = &self.progress {
            let _ = tx.try_send(session.progress());
        }
    }
}

/// One file transfer, from `HEADER` to a terminal state.
///
/// Owned by the task that drives it; nothing else mutates it.
pub struct TransferSession {
    id: String,
    direction: Direction,
    metadata: FileMetadata,
    state: TransferState,
    bytes_acked: u64,
    chunk_index: u32,
    chunk_count: u32,
    retries_current_chunk: u32,
    total_retries: u32,
    failed_sequence: Option<u32>,
    error: Option<String>,
    started_at: DateTime<Utc>,
    started: Instant,
    finished: Option<Instant>,
    speed: SpeedCalculator,
}

impl TransferSession {
    /// Creates a session. `chunk_size` is the size this side expects; a
    /// receiver only learns the real chunk count as chunks arrive.
    pub fn new(direction: Direction, metadata: FileMetadata, chunk_size: usize) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let chunk_count = chunk_count(metadata.wire_size(), chunk_size);
        let mut speed = SpeedCalculator::default();
        speed.add_sample(0);
        Self {
            id,
            direction,
            metadata,
            state: TransferState::Pending,
            bytes_acked: 0,
            chunk_index: 0,
            chunk_count,
            retries_current_chunk: 0,
            total_retries: 0,
            failed_sequence: None,
            error: None,
            started_at: Utc::now(),
            started: Instant::now(),
            finished: None,
            speed,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn bytes_acked(&self) -> u64 {
        self.bytes_acked
    }

    pub fn chunk_index(&self) -> u32 {
        self.chunk_index
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    pub fn retries_current_chunk(&self) -> u32 {
        self.retries_current_chunk
    }

    pub fn total_retries(&self) -> u32 {
        self.total_retries
    }

    pub fn failed_sequence(&self) -> Option<u32> {
        self.failed_sequence
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Moves to `next`, refusing transitions the state machine does not
    /// allow.
    pub fn transition(&mut self, next: TransferState) -> Result<(), TransferError> {
        if !self.state.can_transition_to(next) {
            return Err(TransferError::Protocol(format!(
                "invalid transition {} -> {next}",
                self.state
            )));
        }
        tracing::debug!(session = %self.id, from = %self.state, to = %next, "state change");
        self.state = next;
        if next.is_terminal() {
            self.finished = Some(Instant::now());
        }
        Ok(())
    }

    /// Records one acknowledged chunk of `len` bytes.
    ///
    /// Never lets `bytes_acked` pass the wire size.
    pub fn record_ack(&mut self, len: usize) -> Result<(), TransferError> {
        let next = self.bytes_acked + len as u64;
        if next > self.metadata.wire_size() {
            return Err(TransferError::Protocol(format!(
                "chunk {} overruns file: {next} > {} bytes",
                self.chunk_index,
                self.metadata.wire_size()
            )));
        }
        self.bytes_acked = next;
        self.chunk_index += 1;
        self.chunk_count = self.chunk_count.max(self.chunk_index);
        self.retries_current_chunk = 0;
        self.speed.add_sample(len as u64);
        Ok(())
    }

    /// Records one failed attempt at the current chunk.
    pub fn record_retry(&mut self) {
        self.retries_current_chunk += 1;
        self.total_retries += 1;
    }

    pub fn complete(&mut self) -> Result<(), TransferError> {
        self.transition(TransferState::Completed)
    }

    /// Moves to `ERROR`, or `CANCELLED` for a cancellation.
    pub fn fail(&mut self, err: &TransferError) {
        let next = match err {
            TransferError::Cancelled => TransferState::Cancelled,
            TransferError::PeerAborted { code, .. }
                if *code == camlink_protocol::ErrorCode::Cancelled =>
            {
                TransferState::Cancelled
            }
            _ => TransferState::Error,
        };
        if let TransferError::RetriesExhausted { sequence, .. } = err {
            self.failed_sequence = Some(*sequence);
        }
        self.error = Some(err.to_string());
        if self.state.can_transition_to(next) {
            self.state = next;
            self.finished = Some(Instant::now());
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.finished.unwrap_or_else(Instant::now) - self.started
    }

    /// Average throughput over the whole session.
    pub fn throughput_bps(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes_acked as f64 / secs
    }

    pub fn progress(&self) -> TransferProgress {
        let wire_size = self.metadata.wire_size();
        TransferProgress {
            session_id: self.id.clone(),
            name: self.metadata.logical_name.clone(),
            direction: self.direction,
            state: self.state,
            bytes_acked: self.bytes_acked,
            wire_size,
            chunk_index: self.chunk_index,
            chunk_count: self.chunk_count,
            throughput_bps: self.speed.bytes_per_second(),
            eta_secs: self
                .speed
                .eta(wire_size - self.bytes_acked)
                .map(|d| d.as_secs_f64()),
        }
    }

    pub fn record(&self) -> TransferRecord {
        TransferRecord {
            id: self.id.clone(),
            direction: self.direction,
            name: self.metadata.logical_name.clone(),
            state: self.state,
            total_size: self.metadata.total_size,
            wire_size: self.metadata.wire_size(),
            compressed: self.metadata.compressed,
            bytes_acked: self.bytes_acked,
            chunk_index: self.chunk_index,
            chunk_count: self.chunk_count,
            retries: self.total_retries,
            failed_sequence: self.failed_sequence,
            error: self.error.clone(),
            started_at: self.started_at,
            elapsed_secs: self.elapsed().as_secs_f64(),
            throughput_bps: self.throughput_bps(),
        }
    }
}

impl fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSession")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("name", &self.metadata.logical_name)
            .field("state", &self.state)
            .field("bytes_acked", &self.bytes_acked)
            .field("chunk_index", &self.chunk_index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(size: u64) -> FileMetadata {
        FileMetadata {
            logical_name: "foto.jpg".into(),
            total_size: size,
            checksum: "00".repeat(16),
            compressed: false,
            compressed_size: None,
        }
    }

    #[test]
    fn new_session_is_pending() {
        let session = TransferSession::new(Direction::Send, metadata(600), 256);
        assert_eq!(session.state(), TransferState::Pending);
        assert_eq!(session.id().len(), 8);
        assert_eq!(session.chunk_count(), 3);
        assert!(session.is_active());
    }

    #[test]
    fn happy_path_transitions() {
        let mut session = TransferSession::new(Direction::Send, metadata(10), 256);
        for next in [
            TransferState::HeaderSent,
            TransferState::AwaitingReady,
            TransferState::Transferring,
            TransferState::Verifying,
        ] {
            session.transition(next).unwrap();
        }
        session.complete().unwrap();
        assert!(!session.is_active());
    }

    #[test]
    fn skipping_states_is_refused() {
        let mut session = TransferSession::new(Direction::Send, metadata(10), 256);
        let err = session.transition(TransferState::Transferring).unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)));
        assert_eq!(session.state(), TransferState::Pending);
    }

    #[test]
    fn terminal_states_are_final() {
        let mut session = TransferSession::new(Direction::Send, metadata(10), 256);
        session.fail(&TransferError::Cancelled);
        assert_eq!(session.state(), TransferState::Cancelled);

        session.fail(&TransferError::Protocol("late".into()));
        assert_eq!(session.state(), TransferState::Cancelled);
        assert!(session.transition(TransferState::HeaderSent).is_err());
    }

    #[test]
    fn ack_accounting() {
        let mut session = TransferSession::new(Direction::Send, metadata(600), 256);
        session.record_retry();
        assert_eq!(session.retries_current_chunk(), 1);

        session.record_ack(256).unwrap();
        assert_eq!(session.bytes_acked(), 256);
        assert_eq!(session.chunk_index(), 1);
        assert_eq!(session.retries_current_chunk(), 0);
        assert_eq!(session.total_retries(), 1);

        session.record_ack(256).unwrap();
        session.record_ack(88).unwrap();
        assert_eq!(session.bytes_acked(), 600);
        assert!(session.record_ack(1).is_err());
        assert_eq!(session.bytes_acked(), 600);
    }

    #[test]
    fn exhausted_retries_record_the_sequence() {
        let mut session = TransferSession::new(Direction::Send, metadata(600), 256);
        session.fail(&TransferError::RetriesExhausted {
            sequence: 2,
            attempts: 3,
        });
        let record = session.record();
        assert_eq!(record.state, TransferState::Error);
        assert_eq!(record.failed_sequence, Some(2));
        assert!(record.error.unwrap().contains("chunk 2"));
    }

    #[test]
    fn compressed_metadata_uses_compressed_size() {
        let meta = FileMetadata {
            compressed: true,
            compressed_size: Some(120),
            ..metadata(600)
        };
        assert_eq!(meta.wire_size(), 120);
        let header = meta.to_header();
        assert_eq!(header.compressed_size, Some(120));
        assert_eq!(FileMetadata::from_header(&header), meta);
    }

    #[test]
    fn record_serializes_state_names() {
        let session = TransferSession::new(Direction::Receive, metadata(0), 256);
        let json = serde_json::to_value(session.record()).unwrap();
        assert_eq!(json["state"], "PENDING");
        assert_eq!(json["direction"], "receive");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn empty_file_progress_is_complete() {
        let session = TransferSession::new(Direction::Send, metadata(0), 256);
        assert_eq!(session.chunk_count(), 0);
        assert_eq!(session.progress().percentage(), 100.0);
    }
}
