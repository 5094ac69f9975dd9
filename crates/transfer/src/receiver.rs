use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use camlink_link::LinkError;
use camlink_protocol::{ControlMessage, FileHeader};

use crate::checksum::calculate_file_checksum;
use crate::chunked::ChunkWriter;
use crate::compression::decompress_file;
use crate::io::{Inbound, SessionIo, recv_session};
use crate::sender::finish;
use crate::space::SpaceProbe;
use crate::types::{TransferContext, TransferSession, TransferState};
use crate::validation::sanitize_file_name;
use crate::TransferError;

/// Waits for the sender's `HEADER`, skipping lines that are not transfer
/// traffic.
pub async fn await_header<I: SessionIo>(
    io: &mut I,
    wait: Duration,
) -> Result<FileHeader, TransferError> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let left = deadline.saturating_duration_since(tokio::time::Instant::now());
        match recv_session(io, left).await? {
            Inbound::Message(ControlMessage::Header(header)) => return Ok(header),
            Inbound::Message(ControlMessage::Error { code, detail }) => {
                return Err(TransferError::PeerAborted { code, detail });
            }
            Inbound::Message(other) => {
                return Err(TransferError::Protocol(format!(
                    "expected HEADER, got {}",
                    other.token()
                )));
            }
            Inbound::Malformed { line, error } => {
                return Err(TransferError::Protocol(format!("{error}: {line}")));
            }
            Inbound::Unexpected(line) => debug!(line, "ignoring line before HEADER"),
            Inbound::Timeout => return Err(TransferError::Timeout { phase: "HEADER" }),
        }
    }
}

/// Removes partial files unless the transfer succeeds.
struct PartGuard {
    paths: Vec<PathBuf>,
    armed: bool,
}

impl PartGuard {
    fn new() -> Self {
        Self {
            paths: Vec::new(),
            armed: true,
        }
    }

    fn track(&mut self, path: &Path) {
        self.paths.push(path.to_path_buf());
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for path in &self.paths {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "removed partial file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial file"),
            }
        }
    }
}

fn check_space(
    probe: &dyn SpaceProbe,
    dest: &Path,
    header: &FileHeader,
    ctx: &TransferContext,
) -> Result<(), TransferError> {
    let mut required = header.wire_size().saturating_add(ctx.config.free_space_margin);
    if header.is_compressed() {
        required = required.saturating_add(header.total_size);
    }
    let available = probe.available(dest)?;
    if available < required {
        return Err(TransferError::Resource {
            required,
            available,
        });
    }
    Ok(())
}

/// Reads one announced payload.
///
/// The raw read is registered before `CHUNK_READY` goes out so the reader
/// never frames payload bytes as lines.
async fn read_payload<I: SessionIo>(
    io: &mut I,
    len: usize,
    wait: Duration,
) -> Result<Option<Vec<u8>>, TransferError> {
    let pending = io.request_raw(len).await?;
    io.send_line(&ControlMessage::ChunkReady.to_string()).await?;
    match pending.recv(wait).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(LinkError::Timeout) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn drive_receiver<I: SessionIo>(
    io: &mut I,
    session: &mut TransferSession,
    header: &FileHeader,
    dest_dir: &Path,
    probe: &dyn SpaceProbe,
    ctx: &TransferContext,
    parts: &mut PartGuard,
) -> Result<PathBuf, TransferError> {
    let name = sanitize_file_name(&header.name)?.to_string();
    std::fs::create_dir_all(dest_dir)?;
    check_space(probe, dest_dir, header, ctx)?;

    let final_path = dest_dir.join(&name);
    let part_path = dest_dir.join(format!("{name}.part"));
    parts.track(&part_path);
    let mut writer = ChunkWriter::create(&part_path)?;

    session.transition(TransferState::HeaderSent)?;
    io.send_line(&ControlMessage::Ready.to_string()).await?;
    session.transition(TransferState::AwaitingReady)?;
    ctx.report(session);

    let wire_size = header.wire_size();
    let raw_wait = ctx.config.ack_timeout();
    let mut expected: u32 = 0;

    let verify_checksum = loop {
        let inbound = recv_session(io, ctx.config.frame_timeout()).await?;
        ctx.check_cancelled()?;

        let (sequence, length) = match inbound {
            Inbound::Message(ControlMessage::Chunk { sequence, length }) => (sequence, length),
            Inbound::Message(ControlMessage::Verify { checksum }) => break checksum,
            Inbound::Message(ControlMessage::Error { code, detail }) => {
                return Err(TransferError::PeerAborted { code, detail });
            }
            Inbound::Message(ControlMessage::Cancel) => return Err(TransferError::Cancelled),
            Inbound::Message(other) => {
                return Err(TransferError::Protocol(format!(
                    "unexpected {} during transfer",
                    other.token()
                )));
            }
            Inbound::Malformed { line, error } => {
                return Err(TransferError::Protocol(format!("{error}: {line}")));
            }
            Inbound::Unexpected(line) => {
                debug!(session = %session.id(), line, "ignoring non-protocol line");
                continue;
            }
            Inbound::Timeout => return Err(TransferError::Timeout { phase: "CHUNK" }),
        };

        let len = length as usize;
        let left = wire_size - writer.written();

        if sequence == expected {
            if length == 0 || length as u64 > left {
                return Err(TransferError::Protocol(format!(
                    "chunk {sequence} declares {length} bytes with {left} remaining"
                )));
            }
            if session.state() == TransferState::AwaitingReady {
                session.transition(TransferState::Transferring)?;
            }
            match read_payload(io, len, raw_wait).await? {
                Some(payload) => {
                    writer.append(&payload)?;
                    session.record_ack(len)?;
                    io.send_line(&ControlMessage::Ack.to_string()).await?;
                    expected += 1;
                    debug!(session = %session.id(), sequence, bytes = len, "chunk stored");
                    ctx.report(session);
                }
                None => {
                    session.record_retry();
                    warn!(session = %session.id(), sequence, "payload timed out");
                    io.send_line(&ControlMessage::Nack.to_string()).await?;
                }
            }
        } else if expected.checked_sub(1) == Some(sequence) {
            // The ACK for this chunk was lost; take the bytes off the wire
            // and confirm again.
            match read_payload(io, len, raw_wait).await? {
                Some(_) => {
                    debug!(session = %session.id(), sequence, "duplicate chunk discarded");
                    io.send_line(&ControlMessage::Ack.to_string()).await?;
                }
                None => io.send_line(&ControlMessage::Nack.to_string()).await?,
            }
        } else {
            session.record_retry();
            warn!(session = %session.id(), sequence, expected, "out-of-order chunk");
            io.send_line(&ControlMessage::Nack.to_string()).await?;
        }
    };

    session.transition(TransferState::Verifying)?;
    let part_path = writer.finish()?;
    let actual = calculate_file_checksum(&part_path)?;
    for expected in [&header.checksum, &verify_checksum.to_ascii_lowercase()] {
        if actual != *expected {
            return Err(TransferError::Integrity {
                expected: expected.clone(),
                actual,
            });
        }
    }

    if header.is_compressed() {
        parts.track(&final_path);
        let expanded = decompress_file(&part_path, &final_path)?;
        if expanded != header.total_size {
            return Err(TransferError::Integrity {
                expected: format!("{} bytes", header.total_size),
                actual: format!("{expanded} bytes"),
            });
        }
        std::fs::remove_file(&part_path)?;
    } else {
        std::fs::rename(&part_path, &final_path)?;
    }
    parts.disarm();

    io.send_line(&ControlMessage::Done.to_string()).await?;
    Ok(final_path)
}

/// Runs the receiver role for an announced file, writing it into
/// `dest_dir`. Returns the final path.
///
/// Bytes land in `<name>.part` and are promoted only after the checksum
/// matches; every failure removes them.
pub async fn run_receiver<I: SessionIo>(
    io: &mut I,
    session: &mut TransferSession,
    header: &FileHeader,
    dest_dir: &Path,
    probe: &dyn SpaceProbe,
    ctx: &TransferContext,
) -> Result<PathBuf, TransferError> {
    info!(
        session = %session.id(),
        name = %header.name,
        bytes = header.wire_size(),
        compressed = header.is_compressed(),
        "receiving file"
    );

    let mut parts = PartGuard::new();
    let result = drive_receiver(io, session, header, dest_dir, probe, ctx, &mut parts).await;
    drop(parts);
    finish(io, session, result, ctx).await
}
