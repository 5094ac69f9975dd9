use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use camlink_protocol::constants::{LINE_TERMINATOR, MAX_LINE_LENGTH};

use crate::reader::{LinkEvent, RawRequest, reader_pump};
use crate::stats::LinkStats;
use crate::{EVENT_QUEUE_CAPACITY, LinkError};

/// Read half of a byte channel.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a byte channel.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Tuning for one [`Link`].
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Longest unterminated line kept before the buffer is discarded.
    pub max_line_length: usize,
    /// Capacity of the line queue.
    pub event_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_line_length: MAX_LINE_LENGTH,
            event_capacity: EVENT_QUEUE_CAPACITY,
        }
    }
}

/// One connected byte channel.
///
/// Reading happens on a dedicated task; consumers pull lines with
/// [`recv_line`](Self::recv_line) and raw payloads with
/// [`request_raw`](Self::request_raw). Writing requires the
/// [`ChannelGuard`] returned by [`acquire_exclusive`](Self::acquire_exclusive),
/// so at most one party writes at any instant.
pub struct Link {
    writer: Arc<Mutex<BoxedWriter>>,
    events: mpsc::Receiver<LinkEvent>,
    raw_tx: mpsc::Sender<RawRequest>,
    stats: Arc<LinkStats>,
    cancel: CancellationToken,
    reader_task: JoinHandle<()>,
}

impl Link {
    /// Wraps a split stream and starts its reader task.
    pub fn new<R, W>(reader: R, writer: W, config: LinkConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (events_tx, events) = mpsc::channel(config.event_capacity.max(1));
        let (raw_tx, raw_rx) = mpsc::channel(1);
        let stats = Arc::new(LinkStats::new());
        let cancel = CancellationToken::new();

        let reader_task = tokio::spawn(reader_pump(
            reader,
            events_tx,
            raw_rx,
            Arc::clone(&stats),
            config.max_line_length,
            cancel.clone(),
        ));

        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
            events,
            raw_tx,
            stats,
            cancel,
            reader_task,
        }
    }

    /// Wraps a bidirectional stream such as a TCP socket or a pipe.
    pub fn from_stream<S>(stream: S, config: LinkConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer, config)
    }

    /// Waits until no one else holds the write half.
    pub async fn acquire_exclusive(&self) -> ChannelGuard {
        ChannelGuard {
            writer: Arc::clone(&self.writer).lock_owned().await,
            stats: Arc::clone(&self.stats),
        }
    }

    /// Takes the write half only if it is free right now.
    pub fn try_acquire_exclusive(&self) -> Option<ChannelGuard> {
        let writer = Arc::clone(&self.writer).try_lock_owned().ok()?;
        Some(ChannelGuard {
            writer,
            stats: Arc::clone(&self.stats),
        })
    }

    /// Next event from the reader task, or `None` once it is gone.
    pub async fn next_event(&mut self) -> Option<LinkEvent> {
        self.events.recv().await
    }

    /// Next line within `wait`.
    pub async fn recv_line(&mut self, wait: Duration) -> Result<String, LinkError> {
        match tokio::time::timeout(wait, self.events.recv()).await {
            Ok(Some(LinkEvent::Line(line))) => Ok(line),
            Ok(Some(LinkEvent::Disconnected { reason })) => Err(LinkError::Disconnected(reason)),
            Ok(None) => Err(LinkError::Closed),
            Err(_) => Err(LinkError::Timeout),
        }
    }

    /// Asks the reader task to set aside the next `len` bytes.
    ///
    /// Register the request before telling the peer to send, so the reader
    /// never frames the payload as lines.
    pub async fn request_raw(&self, len: usize) -> Result<PendingRaw, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.raw_tx
            .send(RawRequest { len, reply })
            .await
            .map_err(|_| LinkError::Closed)?;
        Ok(PendingRaw { rx })
    }

    /// Reads exactly `len` raw bytes within `wait`.
    pub async fn read_raw(&self, len: usize, wait: Duration) -> Result<Vec<u8>, LinkError> {
        self.request_raw(len).await?.recv(wait).await
    }

    pub fn stats(&self) -> Arc<LinkStats> {
        Arc::clone(&self.stats)
    }

    /// Stops the reader task. Pending raw reads fail with [`LinkError::Closed`].
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_reader_finished(&self) -> bool {
        self.reader_task.is_finished()
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A raw read registered with the reader task.
///
/// Dropping it before completion abandons the read; bytes collected so far
/// are discarded.
pub struct PendingRaw {
    rx: oneshot::Receiver<Vec<u8>>,
}

impl PendingRaw {
    pub async fn recv(self, wait: Duration) -> Result<Vec<u8>, LinkError> {
        match tokio::time::timeout(wait, self.rx).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(_)) => Err(LinkError::Closed),
            Err(_) => Err(LinkError::Timeout),
        }
    }
}

/// Exclusive right to write to the channel.
///
/// Dropping the guard releases the channel.
pub struct ChannelGuard {
    writer: OwnedMutexGuard<BoxedWriter>,
    stats: Arc<LinkStats>,
}

impl ChannelGuard {
    /// Writes one line, appending `\r\n` unless already terminated.
    pub async fn send_line(&mut self, line: &str) -> Result<(), LinkError> {
        let mut out = String::with_capacity(line.len() + LINE_TERMINATOR.len());
        out.push_str(line);
        if !line.ends_with('\n') {
            out.push_str(LINE_TERMINATOR);
        }
        self.writer.write_all(out.as_bytes()).await?;
        self.writer.flush().await?;
        self.stats.record_sent(out.len(), true);
        debug!(line = line.trim_end(), "line sent");
        Ok(())
    }

    /// Writes raw bytes with no framing.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        self.stats.record_sent(bytes.len(), false);
        Ok(())
    }

    /// Hands the channel back. Equivalent to dropping the guard.
    pub fn release(self) {}
}
