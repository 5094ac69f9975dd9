//! `camlink fetch`: asks a device for one photo and receives it.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use camlink_link::{Link, LinkError};
use camlink_protocol::Reply;
use camlink_transfer::{
    Direction, FileMetadata, LinkIo, SpaceProbe, StatvfsProbe, TransferConfig, TransferContext,
    TransferRecord, TransferSession, await_header, run_receiver,
};

use crate::config::Config;
use crate::connectors;

/// Token of the reply that precedes `HEADER`.
const DOWNLOAD_STARTED: &str = "DOWNLOAD_STARTED";

/// Connects once, downloads `name` into `out` and returns the final record.
pub async fn run(config: &Config, name: &str, out: &Path) -> anyhow::Result<(PathBuf, TransferRecord)> {
    let connector = connectors::from_config(&config.link);
    let endpoint = connector.describe();
    let (reader, writer) = connector
        .connect()
        .await
        .with_context(|| format!("connecting to {endpoint}"))?;
    info!(%endpoint, "connected");

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling download");
            on_signal.cancel();
        }
    });

    let mut link = Link::new(reader, writer, config.link.link_config());
    let result = fetch(&mut link, name, out, &config.transfer, &StatvfsProbe, cancel).await;
    link.close();
    signal.abort();
    result
}

/// Requests `name` over an open link and runs the receiving side.
pub async fn fetch(
    link: &mut Link,
    name: &str,
    out: &Path,
    transfer: &TransferConfig,
    probe: &dyn SpaceProbe,
    cancel: CancellationToken,
) -> anyhow::Result<(PathBuf, TransferRecord)> {
    link.acquire_exclusive()
        .await
        .send_line(&format!("descargar:{name}"))
        .await?;

    let (id, size) = await_started(link, transfer).await?;
    info!(session = %id, size, %name, "download started");

    let ctx = TransferContext::new(transfer.clone()).with_cancel(cancel);
    let mut io = LinkIo::acquire(link).await;
    let header = await_header(&mut io, transfer.ready_timeout()).await?;
    let mut session = TransferSession::new(
        Direction::Receive,
        FileMetadata::from_header(&header),
        transfer.effective_chunk_size(),
    );

    let result = run_receiver(&mut io, &mut session, &header, out, probe, &ctx).await;
    let record = session.record();
    let path = result.with_context(|| format!("receiving {name}"))?;
    Ok((path, record))
}

/// Skips device chatter until the download is announced or refused.
async fn await_started(link: &mut Link, transfer: &TransferConfig) -> anyhow::Result<(String, u64)> {
    let deadline = Instant::now() + transfer.ready_timeout();
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let line = match link.recv_line(left).await {
            Ok(line) => line,
            Err(LinkError::Timeout) => bail!("device did not answer the download request"),
            Err(e) => return Err(e.into()),
        };

        match Reply::parse(&line) {
            Reply::Error { code, detail } => bail!("device refused download: {code}: {detail}"),
            Reply::Token(token) => {
                let mut fields = token.split('|');
                if fields.next() != Some(DOWNLOAD_STARTED) {
                    debug!(line = %token, "ignoring line while waiting for download");
                    continue;
                }
                let id = fields.next().unwrap_or_default().to_string();
                let size = fields
                    .next()
                    .and_then(|s| s.parse().ok())
                    .with_context(|| format!("malformed announcement: {token}"))?;
                return Ok((id, size));
            }
            Reply::Ok(_) => debug!(%line, "ignoring line while waiting for download"),
        }
    }
}
