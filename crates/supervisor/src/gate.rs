use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use camlink_dispatch::{Command, CommandKind, Dispatcher};
use camlink_link::{LinkError, PendingRaw};
use camlink_protocol::{ErrorCode, Reply};
use camlink_transfer::{Inbound, SessionIo};

/// Session I/O that answers commands arriving mid-transfer.
///
/// Lines that are not transfer traffic never reach the engine:
/// - a cancel command cancels the session,
/// - any other registered command is refused with `TRANSFER_IN_PROGRESS`,
/// - an unknown command gets the usual `UNKNOWN_COMMAND` reply.
pub struct GatedIo<'a, I> {
    inner: I,
    dispatcher: &'a Dispatcher,
    session_id: String,
    cancel: CancellationToken,
    cancel_requested: bool,
}

impl<'a, I: SessionIo> GatedIo<'a, I> {
    pub fn new(
        inner: I,
        dispatcher: &'a Dispatcher,
        session_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner,
            dispatcher,
            session_id: session_id.into(),
            cancel,
            cancel_requested: false,
        }
    }

    /// Whether the peer asked to cancel during the session.
    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn into_inner(self) -> I {
        self.inner
    }

    async fn gate(&mut self, line: &str) -> Result<(), LinkError> {
        let Some(cmd) = Command::parse(line) else {
            return Ok(());
        };
        match self.dispatcher.kind_of(&cmd.name) {
            Some(CommandKind::Cancel) => {
                info!(session = %self.session_id, command = %cmd.name, "cancel requested");
                self.cancel_requested = true;
                self.cancel.cancel();
                Ok(())
            }
            Some(_) => {
                debug!(session = %self.session_id, command = %cmd.name, "command rejected during transfer");
                let reply = Reply::error(
                    ErrorCode::TransferInProgress,
                    format!(
                        "{} rejected while transfer {} is active",
                        cmd.name, self.session_id
                    ),
                );
                self.inner.send_line(&reply.to_string()).await
            }
            None => {
                let reply = self.dispatcher.unknown_reply(&cmd.name);
                self.inner.send_line(&reply.to_string()).await
            }
        }
    }
}

impl<I: SessionIo> SessionIo for GatedIo<'_, I> {
    async fn send_line(&mut self, line: &str) -> Result<(), LinkError> {
        self.inner.send_line(line).await
    }

    async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.inner.send_raw(bytes).await
    }

    async fn recv(&mut self, wait: Duration) -> Result<Inbound, LinkError> {
        let deadline = Instant::now() + wait;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.inner.recv(left).await? {
                Inbound::Unexpected(line) => self.gate(&line).await?,
                other => return Ok(other),
            }
        }
    }

    async fn request_raw(&mut self, len: usize) -> Result<PendingRaw, LinkError> {
        self.inner.request_raw(len).await
    }
}
