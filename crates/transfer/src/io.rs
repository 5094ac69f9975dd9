//! The channel as seen by a running session.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use camlink_link::{ChannelGuard, Link, LinkError, PendingRaw};
use camlink_protocol::{ControlMessage, ProtocolError};

/// One inbound line, sorted by what the session should do with it.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(ControlMessage),
    /// Starts with a control token but does not parse.
    Malformed { line: String, error: ProtocolError },
    /// Not transfer traffic at all.
    Unexpected(String),
    /// Nothing arrived in time.
    Timeout,
}

pub fn classify_line(line: String) -> Inbound {
    match line.parse::<ControlMessage>() {
        Ok(message) => Inbound::Message(message),
        Err(ProtocolError::UnknownToken(_) | ProtocolError::Empty) => Inbound::Unexpected(line),
        Err(error) => Inbound::Malformed { line, error },
    }
}

/// Next inbound line for a running session.
///
/// `ERROR` lines that answer a stray command (`UNKNOWN_COMMAND`,
/// `TRANSFER_IN_PROGRESS`) are skipped; they do not end the session.
pub async fn recv_session<I: SessionIo>(io: &mut I, wait: Duration) -> Result<Inbound, LinkError> {
    let deadline = Instant::now() + wait;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match io.recv(left).await? {
            Inbound::Message(ControlMessage::Error { code, detail }) if code.is_command_reply() => {
                debug!(%code, %detail, "skipping command reply during transfer");
            }
            other => return Ok(other),
        }
    }
}

/// Exclusive access to the channel for the length of one session.
///
/// Implemented directly over a [`Link`] by [`LinkIo`]; the supervisor wraps
/// it to answer commands that arrive mid-transfer.
pub trait SessionIo: Send {
    fn send_line(&mut self, line: &str) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn send_raw(&mut self, bytes: &[u8]) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Next inbound line within `wait`. Link failures are errors; silence
    /// is [`Inbound::Timeout`].
    fn recv(&mut self, wait: Duration) -> impl Future<Output = Result<Inbound, LinkError>> + Send;

    /// Registers a raw read of `len` bytes with the reader task.
    fn request_raw(
        &mut self,
        len: usize,
    ) -> impl Future<Output = Result<PendingRaw, LinkError>> + Send;
}

/// A [`Link`] held exclusively for one session.
pub struct LinkIo<'a> {
    link: &'a mut Link,
    guard: ChannelGuard,
}

impl<'a> LinkIo<'a> {
    /// Waits for the write half, then holds it until dropped.
    pub async fn acquire(link: &'a mut Link) -> Self {
        let guard = link.acquire_exclusive().await;
        Self { link, guard }
    }

    pub fn link(&self) -> &Link {
        self.link
    }
}

impl SessionIo for LinkIo<'_> {
    async fn send_line(&mut self, line: &str) -> Result<(), LinkError> {
        self.guard.send_line(line).await
    }

    async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.guard.send_raw(bytes).await
    }

    async fn recv(&mut self, wait: Duration) -> Result<Inbound, LinkError> {
        match self.link.recv_line(wait).await {
            Ok(line) => Ok(classify_line(line)),
            Err(LinkError::Timeout) => Ok(Inbound::Timeout),
            Err(e) => Err(e),
        }
    }

    async fn request_raw(&mut self, len: usize) -> Result<PendingRaw, LinkError> {
        self.link.request_raw(len).await
    }
}
