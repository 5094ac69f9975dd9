use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use camlink_dispatch::{Dispatcher, Outcome, TransferRequest};
use camlink_link::{ChannelGuard, Connector, Link, LinkEvent, connect_with_backoff};
use camlink_protocol::constants::{CAMERA_OFFLINE, CAMERA_READY, HEARTBEAT};
use camlink_protocol::{ControlMessage, ErrorCode, Reply};
use camlink_transfer::{
    Direction, LinkIo, SessionIo, TransferContext, TransferError, TransferSession, prepare_file,
    run_sender,
};

use crate::config::SupervisorConfig;
use crate::gate::GatedIo;
use crate::status::StatusBoard;
use crate::SupervisorError;

/// Why [`Supervisor::serve`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEnd {
    /// Shutdown was requested; `CAMERA_OFFLINE` has been sent.
    Shutdown,
    /// The link dropped.
    Disconnected(String),
}

/// Single thread of control for one device link.
pub struct Supervisor {
    dispatcher: Dispatcher,
    status: StatusBoard,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(dispatcher: Dispatcher, status: StatusBoard, config: SupervisorConfig) -> Self {
        Self {
            dispatcher,
            status,
            config,
        }
    }

    pub fn status(&self) -> &StatusBoard {
        &self.status
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Connects through `connector`, serves the link, and reconnects with
    /// backoff whenever it drops. Returns once `shutdown` fires.
    ///
    /// Writes `final_stats.json` to the state directory on the way out.
    pub async fn run(
        &self,
        connector: &dyn Connector,
        shutdown: CancellationToken,
    ) -> Result<(), SupervisorError> {
        let endpoint = connector.describe();
        loop {
            let Some((reader, writer)) =
                connect_with_backoff(connector, &self.config.reconnect, &shutdown).await
            else {
                break;
            };

            let mut link = Link::new(reader, writer, self.config.link.clone());
            self.status.set_connected(Some(endpoint.clone()));
            let end = self.serve(&mut link, &shutdown).await;
            self.status.record_link(link.stats().snapshot());
            self.status.set_connected(None);
            link.close();

            match end {
                Ok(LinkEnd::Shutdown) => break,
                Ok(LinkEnd::Disconnected(reason)) => {
                    warn!(%endpoint, %reason, "link lost, reconnecting");
                }
                Err(e) => warn!(%endpoint, error = %e, "link failed, reconnecting"),
            }
            if shutdown.is_cancelled() {
                break;
            }
        }

        info!(%endpoint, "supervisor stopped");
        if let Some(dir) = &self.config.state_dir {
            self.status.write_final_stats(dir)?;
            info!(path = %dir.join("final_stats.json").display(), "final statistics written");
        }
        Ok(())
    }

    /// Serves one connected link until it drops or `shutdown` fires.
    pub async fn serve(
        &self,
        link: &mut Link,
        shutdown: &CancellationToken,
    ) -> Result<LinkEnd, SupervisorError> {
        send_one(link, CAMERA_READY).await?;
        info!("link up");

        let heartbeat = self.config.heartbeat_interval.filter(|d| !d.is_zero());
        let mut ticker = heartbeat.map(|period| {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    send_one(link, CAMERA_OFFLINE).await?;
                    info!("link shut down");
                    return Ok(LinkEnd::Shutdown);
                }
                event = link.next_event() => match event {
                    Some(LinkEvent::Line(line)) => self.handle_line(link, &line, shutdown).await?,
                    Some(LinkEvent::Disconnected { reason }) => {
                        return Ok(LinkEnd::Disconnected(reason));
                    }
                    None => return Ok(LinkEnd::Disconnected("reader stopped".into())),
                },
                _ = next_tick(&mut ticker) => {
                    let idle = link.stats().idle_for();
                    if heartbeat.is_some_and(|hb| idle >= hb) {
                        let line = format!("{HEARTBEAT}|{}", self.status.uptime().as_secs());
                        send_one(link, &line).await?;
                    }
                }
            }
            self.status.record_link(link.stats().snapshot());
        }
    }

    async fn handle_line(
        &self,
        link: &mut Link,
        line: &str,
        shutdown: &CancellationToken,
    ) -> Result<(), SupervisorError> {
        if ControlMessage::is_control_line(line) {
            debug!(line, "ignoring transfer line outside a session");
            return Ok(());
        }

        let outcome = self.dispatcher.dispatch(line).await;
        self.status.record_commands(self.dispatcher.stats());

        match outcome {
            Outcome::Reply(reply) => send_one(link, &reply).await?,
            Outcome::Silent => {}
            Outcome::Transfer { command, request } => {
                debug!(command = %command.name, file = %request.name, "starting transfer");
                self.run_transfer(link, request, shutdown).await?;
            }
        }
        Ok(())
    }

    /// Sends `request.path` to the peer while holding the channel.
    async fn run_transfer(
        &self,
        link: &mut Link,
        request: TransferRequest,
        shutdown: &CancellationToken,
    ) -> Result<(), SupervisorError> {
        if let Some(active) = self.status.active() {
            let reply = Reply::error(
                ErrorCode::TransferInProgress,
                format!("transfer {} is active", active.id),
            );
            send_one(link, &reply.to_string()).await?;
            return Ok(());
        }

        let config = self.config.transfer.clone();
        let path = request.path.clone();
        let name = request.name.clone();
        let prepared = tokio::task::spawn_blocking(move || prepare_file(&path, &name, &config))
            .await
            .map_err(|e| TransferError::Io(std::io::Error::other(e)))
            .and_then(|r| r);
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(file = %request.name, error = %e, "cannot prepare transfer");
                let code = match &e {
                    TransferError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                        ErrorCode::FileNotFound
                    }
                    other => other.wire_code(),
                };
                send_one(link, &Reply::error(code, e.to_string()).to_string()).await?;
                return Ok(());
            }
        };

        let mut session = TransferSession::new(
            Direction::Send,
            prepared.metadata.clone(),
            self.config.transfer.effective_chunk_size(),
        );
        let session_id = session.id().to_string();

        let mut io = LinkIo::acquire(link).await;
        if let Some(token) = &request.announce {
            let line = format!("{token}|{session_id}|{}", prepared.metadata.total_size);
            io.send_line(&line).await?;
        }
        self.status.begin_transfer(session.record());

        let (progress_tx, mut progress_rx) = mpsc::channel(16);
        let status = self.status.clone();
        let progress_task = tokio::spawn(async move {
            while let Some(progress) = progress_rx.recv().await {
                status.update_progress(&progress);
            }
        });

        let cancel = shutdown.child_token();
        let ctx = TransferContext::new(self.config.transfer.clone())
            .with_cancel(cancel.clone())
            .with_progress(progress_tx);

        let mut gated = GatedIo::new(io, &self.dispatcher, session_id.as_str(), cancel);
        let result = run_sender(&mut gated, &mut session, &prepared, &ctx).await;
        let cancelled_reply = if gated.cancel_requested() {
            gated.send_line(&format!("CANCELLED|{session_id}")).await
        } else {
            Ok(())
        };
        drop(gated);
        drop(ctx);
        let _ = progress_task.await;

        self.status.finish_transfer(session.record());
        cancelled_reply?;
        match result {
            Ok(()) => info!(session = %session_id, "download finished"),
            Err(e) if e.is_connection() => return Err(SupervisorError::Connect(e.to_string())),
            Err(e) => debug!(session = %session_id, error = %e, "download did not finish"),
        }
        Ok(())
    }
}

/// Writes one line, holding the channel only for that line.
async fn send_one(link: &Link, line: &str) -> Result<(), SupervisorError> {
    let mut guard: ChannelGuard = link.acquire_exclusive().await;
    guard.send_line(line).await?;
    Ok(())
}

/// Next heartbeat tick, or never when heartbeats are off.
async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
