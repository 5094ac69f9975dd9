//! The supervisor serving a scripted peer over in-memory pipes.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use camlink_dispatch::{
    Command, CommandError, CommandKind, CommandRegistry, Dispatcher, Response, TransferRequest,
    handler_fn,
};
use camlink_link::{
    BoxedReader, BoxedWriter, ConnectFuture, Connector, Link, LinkConfig, LinkError, PendingRaw,
    ReconnectConfig,
};
use camlink_protocol::ErrorCode;
use camlink_supervisor::{LinkEnd, StatusBoard, Supervisor, SupervisorConfig};
use camlink_transfer::{
    Direction, FileMetadata, Inbound, LinkIo, SessionIo, StatvfsProbe, TransferConfig,
    TransferContext, TransferSession, TransferState, await_header, run_receiver,
};
use tempfile::TempDir;
use tokio::io::DuplexStream;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(60);

fn supervisor(photo_dir: &Path, shutdown: &CancellationToken, config: SupervisorConfig) -> Supervisor {
    let status = StatusBoard::new();
    let mut registry = CommandRegistry::new();

    registry.register(
        "ping",
        CommandKind::Query,
        handler_fn(|_cmd| async { Ok(Response::reply("PONG".to_string())) }),
    );

    let dir = photo_dir.to_path_buf();
    registry.register(
        "descargar",
        CommandKind::Transfer,
        handler_fn(move |cmd: Command| {
            let dir = dir.clone();
            async move {
                let name = cmd.require_parameter("descargar:<file>")?.to_string();
                let path = dir.join(&name);
                if !path.is_file() {
                    return Err(CommandError::new(ErrorCode::FileNotFound, name));
                }
                Ok(Response::Transfer(TransferRequest {
                    path,
                    name,
                    announce: Some("DOWNLOAD_STARTED".into()),
                }))
            }
        }),
    );

    registry.register(
        "cancelar",
        CommandKind::Cancel,
        handler_fn(|_cmd| async {
            Err(CommandError::new(
                ErrorCode::NoActiveTransfer,
                "no transfer to cancel",
            ))
        }),
    );

    let stop = shutdown.clone();
    registry.register(
        "salir",
        CommandKind::Action,
        handler_fn(move |_cmd| {
            let stop = stop.clone();
            async move {
                stop.cancel();
                Ok(Response::Silent)
            }
        }),
    );

    Supervisor::new(Dispatcher::new(registry), status, config)
}

fn quiet_config() -> SupervisorConfig {
    SupervisorConfig {
        heartbeat_interval: None,
        ..SupervisorConfig::default()
    }
}

fn link_pair() -> (Link, Link) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (
        Link::from_stream(a, LinkConfig::default()),
        Link::from_stream(b, LinkConfig::default()),
    )
}

fn write_photo(dir: &Path, name: &str, len: usize) -> Vec<u8> {
    let data: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
    std::fs::write(dir.join(name), &data).unwrap();
    data
}

async fn send(link: &Link, line: &str) {
    link.acquire_exclusive().await.send_line(line).await.unwrap();
}

async fn expect_line(link: &mut Link, prefix: &str) -> String {
    let line = link.recv_line(WAIT).await.unwrap();
    assert!(line.starts_with(prefix), "expected {prefix}, got {line}");
    line
}

#[tokio::test]
async fn commands_are_answered_in_order() {
    let photos = TempDir::new().unwrap();
    let shutdown = CancellationToken::new();
    let sup = supervisor(photos.path(), &shutdown, quiet_config());
    let (mut device, mut host) = link_pair();

    let script = async {
        expect_line(&mut host, "CAMERA_READY").await;
        send(&host, "PING").await;
        expect_line(&mut host, "PONG").await;
        send(&host, "xyz").await;
        let reply = expect_line(&mut host, "ERROR|UNKNOWN_COMMAND|").await;
        assert_eq!(
            reply,
            "ERROR|UNKNOWN_COMMAND|xyz not recognized. Available: cancelar, descargar, ping, salir"
        );
        send(&host, "cancelar").await;
        expect_line(&mut host, "ERROR|NO_ACTIVE_TRANSFER|").await;
        send(&host, "descargar").await;
        expect_line(&mut host, "ERROR|SYNTAX_ERROR|usage: descargar:<file>").await;
        send(&host, "descargar:missing.jpg").await;
        expect_line(&mut host, "ERROR|FILE_NOT_FOUND|missing.jpg").await;
        send(&host, "salir").await;
        expect_line(&mut host, "CAMERA_OFFLINE").await;
    };

    let (end, ()) = tokio::join!(sup.serve(&mut device, &shutdown), script);
    assert_eq!(end.unwrap(), LinkEnd::Shutdown);
    assert_eq!(sup.status().commands_processed(), 2);
    assert_eq!(sup.dispatcher().stats().unknown, 1);
}

#[tokio::test]
async fn download_streams_file_and_returns_to_command_mode() {
    let photos = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();
    let data = write_photo(photos.path(), "foto_1.jpg", 600);
    let shutdown = CancellationToken::new();
    let sup = supervisor(photos.path(), &shutdown, quiet_config());
    let (mut device, mut host) = link_pair();

    let script = async {
        expect_line(&mut host, "CAMERA_READY").await;
        send(&host, "descargar:foto_1.jpg").await;
        let started = expect_line(&mut host, "DOWNLOAD_STARTED|").await;
        let fields: Vec<&str> = started.split('|').collect();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[2], "600");

        let ctx = TransferContext::new(TransferConfig::default());
        let mut io = LinkIo::acquire(&mut host).await;
        let header = await_header(&mut io, WAIT).await.unwrap();
        let mut session = TransferSession::new(
            Direction::Receive,
            FileMetadata::from_header(&header),
            256,
        );
        let out = run_receiver(&mut io, &mut session, &header, inbox.path(), &StatvfsProbe, &ctx)
            .await
            .unwrap();
        drop(io);
        assert_eq!(std::fs::read(out).unwrap(), data);

        send(&host, "ping").await;
        expect_line(&mut host, "PONG").await;
        shutdown.cancel();
        expect_line(&mut host, "CAMERA_OFFLINE").await;
        fields[1].to_string()
    };

    let (end, id) = tokio::join!(sup.serve(&mut device, &shutdown), script);
    assert_eq!(end.unwrap(), LinkEnd::Shutdown);

    let history = sup.status().history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, id);
    assert_eq!(history[0].state, TransferState::Completed);
    assert_eq!(history[0].bytes_acked, 600);
    assert_eq!(history[0].chunk_count, 3);
    assert!(sup.status().active().is_none());
    assert_eq!(sup.status().totals().completed, 1);
}

#[tokio::test]
async fn commands_during_transfer_are_gated() {
    let photos = TempDir::new().unwrap();
    write_photo(photos.path(), "foto_1.jpg", 100);
    let shutdown = CancellationToken::new();
    let sup = supervisor(photos.path(), &shutdown, quiet_config());
    let (mut device, mut host) = link_pair();

    let script = async {
        expect_line(&mut host, "CAMERA_READY").await;
        send(&host, "descargar:foto_1.jpg").await;
        let started = expect_line(&mut host, "DOWNLOAD_STARTED|").await;
        let id = started.split('|').nth(1).unwrap().to_string();
        expect_line(&mut host, "HEADER|foto_1.jpg|100|").await;

        send(&host, "descargar:foto_1.jpg").await;
        let reply = expect_line(&mut host, "ERROR|TRANSFER_IN_PROGRESS|").await;
        assert_eq!(
            reply,
            format!("ERROR|TRANSFER_IN_PROGRESS|descargar rejected while transfer {id} is active")
        );

        send(&host, "ping").await;
        expect_line(&mut host, "ERROR|TRANSFER_IN_PROGRESS|ping rejected").await;

        send(&host, "xyz").await;
        expect_line(&mut host, "ERROR|UNKNOWN_COMMAND|xyz not recognized").await;

        // Honoured once the pending wait for READY completes.
        send(&host, "cancelar").await;
        send(&host, "READY").await;
        expect_line(&mut host, "ERROR|CANCELLED|").await;
        let cancelled = expect_line(&mut host, "CANCELLED|").await;
        assert_eq!(cancelled, format!("CANCELLED|{id}"));

        send(&host, "ping").await;
        expect_line(&mut host, "PONG").await;
        shutdown.cancel();
        expect_line(&mut host, "CAMERA_OFFLINE").await;
    };

    let (end, ()) = tokio::join!(sup.serve(&mut device, &shutdown), script);
    assert_eq!(end.unwrap(), LinkEnd::Shutdown);

    let history = sup.status().history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, TransferState::Cancelled);
    assert_eq!(sup.status().totals().cancelled, 1);
}

/// Host session that slips a command onto the link after each of its
/// first two `ACK`s.
struct ChattyHost<'a> {
    inner: LinkIo<'a>,
    extra: VecDeque<&'static str>,
}

impl SessionIo for ChattyHost<'_> {
    async fn send_line(&mut self, line: &str) -> Result<(), LinkError> {
        self.inner.send_line(line).await?;
        if line == "ACK" {
            if let Some(extra) = self.extra.pop_front() {
                self.inner.send_line(extra).await?;
            }
        }
        Ok(())
    }

    async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.inner.send_raw(bytes).await
    }

    async fn recv(&mut self, wait: Duration) -> Result<Inbound, LinkError> {
        self.inner.recv(wait).await
    }

    async fn request_raw(&mut self, len: usize) -> Result<PendingRaw, LinkError> {
        self.inner.request_raw(len).await
    }
}

#[tokio::test]
async fn command_replies_mid_transfer_do_not_abort_the_download() {
    let photos = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();
    let data = write_photo(photos.path(), "foto_1.jpg", 600);
    let shutdown = CancellationToken::new();
    let sup = supervisor(photos.path(), &shutdown, quiet_config());
    let (mut device, mut host) = link_pair();

    let script = async {
        expect_line(&mut host, "CAMERA_READY").await;
        send(&host, "descargar:foto_1.jpg").await;
        expect_line(&mut host, "DOWNLOAD_STARTED|").await;

        let ctx = TransferContext::new(TransferConfig::default());
        let mut io = ChattyHost {
            inner: LinkIo::acquire(&mut host).await,
            extra: VecDeque::from(["xyz", "ping"]),
        };
        let header = await_header(&mut io, WAIT).await.unwrap();
        let mut session = TransferSession::new(
            Direction::Receive,
            FileMetadata::from_header(&header),
            256,
        );
        let out = run_receiver(&mut io, &mut session, &header, inbox.path(), &StatvfsProbe, &ctx)
            .await
            .unwrap();
        drop(io);
        assert_eq!(std::fs::read(out).unwrap(), data);
        assert_eq!(session.state(), TransferState::Completed);

        send(&host, "ping").await;
        expect_line(&mut host, "PONG").await;
        shutdown.cancel();
        expect_line(&mut host, "CAMERA_OFFLINE").await;
    };

    let (end, ()) = tokio::join!(sup.serve(&mut device, &shutdown), script);
    assert_eq!(end.unwrap(), LinkEnd::Shutdown);

    let history = sup.status().history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, TransferState::Completed);
    assert_eq!(history[0].bytes_acked, 600);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_when_idle() {
    let photos = TempDir::new().unwrap();
    let shutdown = CancellationToken::new();
    let config = SupervisorConfig {
        heartbeat_interval: Some(Duration::from_secs(30)),
        ..SupervisorConfig::default()
    };
    let sup = supervisor(photos.path(), &shutdown, config);
    let (mut device, mut host) = link_pair();

    let script = async {
        expect_line(&mut host, "CAMERA_READY").await;
        let beat = expect_line(&mut host, "HEARTBEAT|").await;
        let uptime: u64 = beat.split('|').nth(1).unwrap().parse().unwrap();
        assert!(uptime >= 30);
        shutdown.cancel();
        expect_line(&mut host, "CAMERA_OFFLINE").await;
    };

    let (end, ()) = tokio::join!(sup.serve(&mut device, &shutdown), script);
    assert_eq!(end.unwrap(), LinkEnd::Shutdown);
}

#[tokio::test]
async fn hangup_ends_serve() {
    let photos = TempDir::new().unwrap();
    let shutdown = CancellationToken::new();
    let sup = supervisor(photos.path(), &shutdown, quiet_config());
    let (mut device, mut host) = link_pair();

    let script = async move {
        expect_line(&mut host, "CAMERA_READY").await;
        drop(host);
    };

    let (end, ()) = tokio::join!(sup.serve(&mut device, &shutdown), script);
    assert!(matches!(end.unwrap(), LinkEnd::Disconnected(_)));
}

struct QueueConnector {
    streams: Mutex<VecDeque<DuplexStream>>,
}

impl Connector for QueueConnector {
    fn connect(&self) -> ConnectFuture<'_> {
        Box::pin(async move {
            let next = self.streams.lock().unwrap().pop_front();
            match next {
                Some(stream) => {
                    let (r, w) = tokio::io::split(stream);
                    Ok((Box::new(r) as BoxedReader, Box::new(w) as BoxedWriter))
                }
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no device",
                )),
            }
        })
    }

    fn describe(&self) -> String {
        "queue".into()
    }
}

#[tokio::test]
async fn reconnects_and_writes_final_stats() {
    let photos = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    let shutdown = CancellationToken::new();
    let config = SupervisorConfig {
        heartbeat_interval: None,
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            backoff_factor: 2.0,
        },
        state_dir: Some(state.path().to_path_buf()),
        ..SupervisorConfig::default()
    };
    let sup = supervisor(photos.path(), &shutdown, config);

    let (first_dev, first_host) = tokio::io::duplex(4096);
    let (second_dev, second_host) = tokio::io::duplex(4096);
    let connector = QueueConnector {
        streams: Mutex::new(VecDeque::from([first_dev, second_dev])),
    };

    let script = async {
        let mut first = Link::from_stream(first_host, LinkConfig::default());
        expect_line(&mut first, "CAMERA_READY").await;
        send(&first, "ping").await;
        expect_line(&mut first, "PONG").await;
        drop(first);

        let mut second = Link::from_stream(second_host, LinkConfig::default());
        expect_line(&mut second, "CAMERA_READY").await;
        send(&second, "salir").await;
        expect_line(&mut second, "CAMERA_OFFLINE").await;
    };

    let (result, ()) = tokio::join!(sup.run(&connector, shutdown.clone()), script);
    result.unwrap();

    let stats: PathBuf = state.path().join("final_stats.json");
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(stats).unwrap()).unwrap();
    assert_eq!(json["commands_processed"], 2);
    assert_eq!(json["connected"], false);
}
