use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use camlink_protocol::ControlMessage;

use crate::checksum::calculate_file_checksum;
use crate::chunked::ChunkReader;
use crate::compression::compress_file;
use crate::config::TransferConfig;
use crate::io::{Inbound, SessionIo, recv_session};
use crate::types::{Chunk, FileMetadata, TransferContext, TransferSession, TransferState};
use crate::TransferError;

/// A file ready to go on the wire, possibly as a compressed copy.
///
/// The compressed copy is removed when this is dropped.
#[derive(Debug)]
pub struct PreparedFile {
    pub metadata: FileMetadata,
    wire_path: PathBuf,
    temp: Option<PathBuf>,
}

impl PreparedFile {
    /// Path of the bytes that are actually sent.
    pub fn wire_path(&self) -> &Path {
        &self.wire_path
    }
}

impl Drop for PreparedFile {
    fn drop(&mut self) {
        if let Some(temp) = self.temp.take() {
            if let Err(e) = std::fs::remove_file(&temp) {
                debug!(path = %temp.display(), error = %e, "failed to remove compressed copy");
            }
        }
    }
}

/// Builds the file metadata, compressing first when enabled.
///
/// A compression failure falls back to sending the original bytes.
pub fn prepare_file(
    path: &Path,
    name: &str,
    config: &TransferConfig,
) -> Result<PreparedFile, TransferError> {
    let total_size = std::fs::metadata(path)?.len();

    let mut prepared = PreparedFile {
        metadata: FileMetadata {
            logical_name: name.to_string(),
            total_size,
            checksum: String::new(),
            compressed: false,
            compressed_size: None,
        },
        wire_path: path.to_path_buf(),
        temp: None,
    };

    if config.compression_enabled {
        let dir = config.temp_dir.clone().unwrap_or_else(std::env::temp_dir);
        let id = uuid::Uuid::new_v4().simple().to_string();
        let temp = dir.join(format!("camlink-{}.z", &id[..8]));
        match compress_file(path, &temp, config.compression_level()) {
            Ok(size) => {
                debug!(name, original = total_size, compressed = size, "compressed for transfer");
                prepared.metadata.compressed = true;
                prepared.metadata.compressed_size = Some(size);
                prepared.wire_path = temp.clone();
                prepared.temp = Some(temp);
            }
            Err(e) => {
                warn!(name, error = %e, "compression failed, sending uncompressed");
                let _ = std::fs::remove_file(&temp);
            }
        }
    }

    prepared.metadata.checksum = calculate_file_checksum(&prepared.wire_path)?;
    Ok(prepared)
}

/// Result of waiting for `ACK` after a chunk, or for `CHUNK_READY` before it.
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    Ack,
    Nack,
    Timeout,
    Unexpected(String),
}

#[derive(Debug)]
enum ReadyOutcome {
    Ready,
    Timeout,
    Unexpected(String),
}

#[derive(Debug)]
enum DoneOutcome {
    Done,
    Timeout,
    Unexpected(String),
}

/// Control lines that end the session no matter what we were waiting for.
fn abort_reason(message: &ControlMessage) -> Option<TransferError> {
    match message {
        ControlMessage::Error { code, detail } => Some(TransferError::PeerAborted {
            code: code.clone(),
            detail: detail.clone(),
        }),
        ControlMessage::Cancel => Some(TransferError::Cancelled),
        _ => None,
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

async fn wait_ready<I: SessionIo>(io: &mut I, wait: Duration) -> Result<ReadyOutcome, TransferError> {
    match recv_session(io, wait).await? {
        Inbound::Message(ControlMessage::Ready) => Ok(ReadyOutcome::Ready),
        Inbound::Message(message) => match abort_reason(&message) {
            Some(err) => Err(err),
            None => Ok(ReadyOutcome::Unexpected(message.to_string())),
        },
        Inbound::Malformed { line, .. } | Inbound::Unexpected(line) => {
            Ok(ReadyOutcome::Unexpected(line))
        }
        Inbound::Timeout => Ok(ReadyOutcome::Timeout),
    }
}

/// Waits for `CHUNK_READY`. `Ack` means the gate opened.
async fn wait_chunk_ready<I: SessionIo>(
    io: &mut I,
    wait: Duration,
) -> Result<AckOutcome, TransferError> {
    let deadline = Instant::now() + wait;
    loop {
        match recv_session(io, remaining(deadline)).await? {
            Inbound::Message(ControlMessage::ChunkReady) => return Ok(AckOutcome::Ack),
            Inbound::Message(ControlMessage::Nack) => return Ok(AckOutcome::Nack),
            Inbound::Message(ControlMessage::Ack) => {
                debug!("skipping stale ACK");
            }
            Inbound::Message(message) => {
                return match abort_reason(&message) {
                    Some(err) => Err(err),
                    None => Ok(AckOutcome::Unexpected(message.to_string())),
                };
            }
            Inbound::Malformed { line, error } => {
                return Err(TransferError::Protocol(format!("{error}: {line}")));
            }
            Inbound::Unexpected(line) => return Ok(AckOutcome::Unexpected(line)),
            Inbound::Timeout => return Ok(AckOutcome::Timeout),
        }
    }
}

async fn wait_ack<I: SessionIo>(io: &mut I, wait: Duration) -> Result<AckOutcome, TransferError> {
    match recv_session(io, wait).await? {
        Inbound::Message(ControlMessage::Ack) => Ok(AckOutcome::Ack),
        Inbound::Message(ControlMessage::Nack) => Ok(AckOutcome::Nack),
        Inbound::Message(message) => match abort_reason(&message) {
            Some(err) => Err(err),
            None => Ok(AckOutcome::Unexpected(message.to_string())),
        },
        Inbound::Malformed { line, error } => {
            Err(TransferError::Protocol(format!("{error}: {line}")))
        }
        Inbound::Unexpected(line) => Ok(AckOutcome::Unexpected(line)),
        Inbound::Timeout => Ok(AckOutcome::Timeout),
    }
}

async fn wait_done<I: SessionIo>(io: &mut I, wait: Duration) -> Result<DoneOutcome, TransferError> {
    match recv_session(io, wait).await? {
        Inbound::Message(ControlMessage::Done) => Ok(DoneOutcome::Done),
        Inbound::Message(message) => match abort_reason(&message) {
            Some(err) => Err(err),
            None => Ok(DoneOutcome::Unexpected(message.to_string())),
        },
        Inbound::Malformed { line, .. } | Inbound::Unexpected(line) => {
            Ok(DoneOutcome::Unexpected(line))
        }
        Inbound::Timeout => Ok(DoneOutcome::Timeout),
    }
}

/// Sends one chunk, retrying the same sequence until it is acknowledged.
async fn send_chunk<I: SessionIo>(
    io: &mut I,
    session: &mut TransferSession,
    chunk: &Chunk,
    ctx: &TransferContext,
) -> Result<(), TransferError> {
    let attempts = ctx.config.attempts_per_chunk();
    let wait = ctx.config.ack_timeout();
    let header = ControlMessage::Chunk {
        sequence: chunk.sequence,
        length: chunk.len() as u16,
    }
    .to_string();

    loop {
        io.send_line(&header).await?;
        let outcome = match wait_chunk_ready(io, wait).await? {
            AckOutcome::Ack => {
                io.send_raw(&chunk.payload).await?;
                wait_ack(io, wait).await?
            }
            refused => refused,
        };

        if outcome == AckOutcome::Ack {
            session.record_ack(chunk.len())?;
            debug!(session = %session.id(), sequence = chunk.sequence, bytes = chunk.len(), "chunk acknowledged");
            return Ok(());
        }

        session.record_retry();
        let failures = session.retries_current_chunk();
        warn!(
            session = %session.id(),
            sequence = chunk.sequence,
            attempt = failures,
            ?outcome,
            "chunk not acknowledged"
        );
        if failures >= attempts {
            return Err(TransferError::RetriesExhausted {
                sequence: chunk.sequence,
                attempts,
            });
        }
        ctx.check_cancelled()?;
    }
}

async fn drive_sender<I: SessionIo>(
    io: &mut I,
    session: &mut TransferSession,
    prepared: &PreparedFile,
    ctx: &TransferContext,
) -> Result<(), TransferError> {
    ctx.check_cancelled()?;

    let header = ControlMessage::Header(prepared.metadata.to_header());
    io.send_line(&header.to_string()).await?;
    session.transition(TransferState::HeaderSent)?;
    session.transition(TransferState::AwaitingReady)?;

    match wait_ready(io, ctx.config.ready_timeout()).await? {
        ReadyOutcome::Ready => {}
        ReadyOutcome::Timeout => return Err(TransferError::Timeout { phase: "READY" }),
        ReadyOutcome::Unexpected(line) => {
            return Err(TransferError::Protocol(format!("expected READY, got {line}")));
        }
    }
    ctx.check_cancelled()?;

    let mut reader = ChunkReader::open(prepared.wire_path(), ctx.config.effective_chunk_size())?;
    if reader.file_size() != prepared.metadata.wire_size() {
        return Err(TransferError::Protocol(format!(
            "{} changed size while sending",
            prepared.metadata.logical_name
        )));
    }
    if reader.file_size() > 0 {
        session.transition(TransferState::Transferring)?;
    }
    ctx.report(session);

    while let Some(chunk) = reader.next_chunk()? {
        send_chunk(io, session, &chunk, ctx).await?;
        ctx.report(session);
        ctx.check_cancelled()?;
    }

    session.transition(TransferState::Verifying)?;
    let verify = ControlMessage::Verify {
        checksum: prepared.metadata.checksum.clone(),
    };
    io.send_line(&verify.to_string()).await?;

    match wait_done(io, ctx.config.verify_timeout()).await? {
        DoneOutcome::Done => Ok(()),
        DoneOutcome::Timeout => Err(TransferError::Timeout { phase: "DONE" }),
        DoneOutcome::Unexpected(line) => {
            Err(TransferError::Protocol(format!("expected DONE, got {line}")))
        }
    }
}

/// Runs the sender role for one prepared file.
///
/// On failure exactly one `ERROR|<code>|<detail>` line is sent, unless the
/// peer aborted first or the channel is gone.
pub async fn run_sender<I: SessionIo>(
    io: &mut I,
    session: &mut TransferSession,
    prepared: &PreparedFile,
    ctx: &TransferContext,
) -> Result<(), TransferError> {
    info!(
        session = %session.id(),
        name = %prepared.metadata.logical_name,
        bytes = prepared.metadata.wire_size(),
        compressed = prepared.metadata.compressed,
        "sending file"
    );

    let result = drive_sender(io, session, prepared, ctx).await;
    finish(io, session, result, ctx).await
}

/// Settles the session state and notifies the peer of a failure.
pub(crate) async fn finish<I: SessionIo, T>(
    io: &mut I,
    session: &mut TransferSession,
    result: Result<T, TransferError>,
    ctx: &TransferContext,
) -> Result<T, TransferError> {
    match result {
        Ok(value) => {
            session.complete()?;
            info!(
                session = %session.id(),
                bytes = session.bytes_acked(),
                chunks = session.chunk_index(),
                elapsed_ms = session.elapsed().as_millis() as u64,
                "transfer completed"
            );
            ctx.report(session);
            Ok(value)
        }
        Err(err) => {
            if err.should_notify_peer() {
                let line = ControlMessage::error(err.wire_code(), err.to_string()).to_string();
                if let Err(e) = io.send_line(&line).await {
                    warn!(session = %session.id(), error = %e, "could not report transfer failure");
                }
            }
            session.fail(&err);
            warn!(session = %session.id(), state = %session.state(), error = %err, "transfer ended");
            ctx.report(session);
            Err(err)
        }
    }
}
