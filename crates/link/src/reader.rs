//! The single task that drains the byte stream.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::framer::LineFramer;
use crate::stats::LinkStats;
use crate::READ_BUFFER_SIZE;

/// What the reader task delivers to the link owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A complete, non-empty text line.
    Line(String),
    /// The stream hit EOF or failed. No further events follow.
    Disconnected { reason: String },
}

/// Request for exactly `len` raw bytes, bypassing line framing.
pub(crate) struct RawRequest {
    pub(crate) len: usize,
    pub(crate) reply: oneshot::Sender<Vec<u8>>,
}

/// Resolves once the requester of a pending raw read has given up.
async fn abandoned(pending: &mut Option<RawRequest>) {
    match pending {
        Some(req) => req.reply.closed().await,
        None => std::future::pending().await,
    }
}

/// Reads the stream until EOF, error, or cancellation.
///
/// While a raw request is pending no lines are extracted, so payload bytes
/// can never be mistaken for commands.
pub(crate) async fn reader_pump<R>(
    mut reader: R,
    events_tx: mpsc::Sender<LinkEvent>,
    mut raw_rx: mpsc::Receiver<RawRequest>,
    stats: Arc<LinkStats>,
    max_line_length: usize,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut framer = LineFramer::new();
    let mut pending: Option<RawRequest> = None;
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let reason = loop {
        if let Some(req) = pending.take() {
            match framer.take_raw(req.len) {
                Some(bytes) => {
                    trace!(len = bytes.len(), "raw read satisfied");
                    // The requester may have timed out in the meantime.
                    let _ = req.reply.send(bytes);
                }
                None => pending = Some(req),
            }
        }

        if pending.is_none() {
            while let Some(line) = framer.next_line() {
                stats.record_line();
                debug!(%line, "line received");
                if events_tx.send(LinkEvent::Line(line)).await.is_err() {
                    return;
                }
            }
            if framer.buffered() > max_line_length {
                warn!(
                    buffered = framer.buffered(),
                    max_line_length, "discarding oversized unterminated line"
                );
                stats.record_dropped_line();
                framer.clear();
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("reader task cancelled");
                return;
            }
            _ = abandoned(&mut pending) => {
                debug!(buffered = framer.buffered(), "raw read abandoned, discarding partial payload");
                pending = None;
                framer.clear();
            }
            req = raw_rx.recv(), if pending.is_none() => match req {
                Some(req) => pending = Some(req),
                None => return,
            },
            result = reader.read(&mut buf) => match result {
                Ok(0) => break "end of stream".to_string(),
                Ok(n) => {
                    trace!(bytes = n, "read from channel");
                    stats.record_received(n);
                    framer.extend(&buf[..n]);
                }
                Err(e) => break e.to_string(),
            },
        }
    };

    debug!(%reason, "reader task stopping");
    let _ = events_tx.send(LinkEvent::Disconnected { reason }).await;
}
