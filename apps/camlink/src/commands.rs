//! The device command set served over the link.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use camlink_dispatch::{
    Command, CommandError, CommandKind, CommandRegistry, Response, TransferRequest, handler_fn,
};
use camlink_protocol::{ErrorCode, Reply};
use camlink_supervisor::{CaptureProvider, StatusBoard};

/// Entries listed by `listar`.
const LIST_LIMIT: usize = 5;

/// Base name of the photo taken by `test`.
const SELF_TEST_HINT: &str = "test_captura";

/// Shared state the handlers work on.
pub struct Device {
    pub captures: Arc<dyn CaptureProvider>,
    pub status: StatusBoard,
    /// Endpoint reported by `estado`.
    pub port: String,
    pub baud_rate: u32,
    /// Photos `limpiar` keeps when no count is given.
    pub keep_latest: usize,
    /// Cancelled by `salir`.
    pub shutdown: CancellationToken,
    photos_taken: AtomicU64,
}

impl Device {
    pub fn new(
        captures: Arc<dyn CaptureProvider>,
        status: StatusBoard,
        port: impl Into<String>,
        baud_rate: u32,
        keep_latest: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            captures,
            status,
            port: port.into(),
            baud_rate,
            keep_latest,
            shutdown,
            photos_taken: AtomicU64::new(0),
        }
    }

    pub fn photos_taken(&self) -> u64 {
        self.photos_taken.load(Ordering::Relaxed)
    }

    async fn photo(&self, cmd: Command) -> Result<Response, CommandError> {
        let capture = self
            .captures
            .capture(cmd.parameter.as_deref())
            .await
            .map_err(|e| CommandError::new(ErrorCode::CaptureFailed, e.to_string()))?;
        self.photos_taken.fetch_add(1, Ordering::Relaxed);
        Ok(Response::reply(Reply::ok([
            capture.name,
            capture.size.to_string(),
            capture.path.display().to_string(),
        ])))
    }

    /// Timed capture used as a camera self-check. A failure is a normal
    /// reply, not an `ERROR` line.
    async fn self_test(&self) -> Response {
        let started = Instant::now();
        match self.captures.capture(Some(SELF_TEST_HINT)).await {
            Ok(capture) => {
                let secs = started.elapsed().as_secs_f64();
                info!(file = %capture.name, secs, "self-test capture succeeded");
                Response::reply(format!("TEST_OK|{secs:.2}s"))
            }
            Err(e) => {
                warn!(error = %e, "self-test capture failed");
                Response::reply(format!("TEST_FAILED|{e}"))
            }
        }
    }

    fn state(&self) -> Response {
        Response::reply(format!(
            "STATUS:ACTIVE|{}|{}|{}|{}",
            self.port,
            self.baud_rate,
            self.photos_taken(),
            self.status.commands_processed()
        ))
    }

    fn list(&self) -> Result<Response, CommandError> {
        let captures = self
            .captures
            .list()
            .map_err(|e| CommandError::new(ErrorCode::Other("LIST_FAILED".into()), e.to_string()))?;
        let total_bytes: u64 = captures.iter().map(|c| c.size).sum();

        let mut line = format!("FILES|{}|{}", captures.len(), total_bytes);
        for capture in captures.iter().take(LIST_LIMIT) {
            line.push_str(&format!("|{}:{}", capture.name, capture.size));
        }
        Ok(Response::reply(line))
    }

    fn download(&self, cmd: Command) -> Result<Response, CommandError> {
        let name = cmd.require_parameter("descargar:<file>")?;
        let capture = self
            .captures
            .resolve(name)?
            .ok_or_else(|| CommandError::new(ErrorCode::FileNotFound, name))?;
        Ok(Response::Transfer(TransferRequest {
            path: capture.path,
            name: capture.name,
            announce: Some("DOWNLOAD_STARTED".into()),
        }))
    }

    fn clean(&self, cmd: Command) -> Result<Response, CommandError> {
        let keep = match cmd.parameter.as_deref() {
            Some(p) => p
                .parse::<usize>()
                .map_err(|_| CommandError::syntax("usage: limpiar[:<photos to keep>]"))?,
            None => self.keep_latest,
        };
        let (removed, bytes) = self
            .captures
            .clean(keep)
            .map_err(|e| CommandError::new(ErrorCode::Other("CLEAN_FAILED".into()), e.to_string()))?;
        Ok(Response::reply(format!("CLEANED|{removed}|{bytes}")))
    }

    fn stats(&self) -> Response {
        let snapshot = self.status.snapshot();
        Response::reply(format!(
            "STATS|fotos:{}|comandos:{}|transferencias:{}|errores:{}|uptime:{:.1}s",
            self.photos_taken(),
            snapshot.commands_processed,
            snapshot.transfers.completed,
            snapshot.commands_failed + snapshot.transfers.failed,
            self.status.uptime().as_secs_f64()
        ))
    }
}

/// Registers every device command with its aliases.
pub fn registry(device: Arc<Device>) -> CommandRegistry {
    let mut registry = CommandRegistry::new();

    let d = Arc::clone(&device);
    registry.register_aliases(
        &["foto", "photo"],
        CommandKind::Action,
        handler_fn(move |cmd| {
            let d = Arc::clone(&d);
            async move { d.photo(cmd).await }
        }),
    );

    let d = Arc::clone(&device);
    registry.register_aliases(
        &["estado", "status"],
        CommandKind::Query,
        handler_fn(move |_cmd| {
            let d = Arc::clone(&d);
            async move { Ok(d.state()) }
        }),
    );

    let d = Arc::clone(&device);
    registry.register_aliases(
        &["listar", "list"],
        CommandKind::Query,
        handler_fn(move |_cmd| {
            let d = Arc::clone(&d);
            async move { d.list() }
        }),
    );

    let d = Arc::clone(&device);
    registry.register_aliases(
        &["descargar", "download"],
        CommandKind::Transfer,
        handler_fn(move |cmd| {
            let d = Arc::clone(&d);
            async move { d.download(cmd) }
        }),
    );

    // Only reached while idle; during a transfer the supervisor
    // intercepts cancel commands.
    registry.register_aliases(
        &["cancelar", "cancel"],
        CommandKind::Cancel,
        handler_fn(|_cmd| async {
            Err(CommandError::new(
                ErrorCode::NoActiveTransfer,
                "no transfer to cancel",
            ))
        }),
    );

    let d = Arc::clone(&device);
    registry.register_aliases(
        &["limpiar", "clean"],
        CommandKind::Action,
        handler_fn(move |cmd| {
            let d = Arc::clone(&d);
            async move { d.clean(cmd) }
        }),
    );

    let d = Arc::clone(&device);
    registry.register_aliases(
        &["estadisticas", "stats"],
        CommandKind::Query,
        handler_fn(move |_cmd| {
            let d = Arc::clone(&d);
            async move { Ok(d.stats()) }
        }),
    );

    let d = Arc::clone(&device);
    registry.register(
        "test",
        CommandKind::Action,
        handler_fn(move |_cmd| {
            let d = Arc::clone(&d);
            async move { Ok(d.self_test().await) }
        }),
    );

    registry.register(
        "ping",
        CommandKind::Query,
        handler_fn(|_cmd| async { Ok(Response::reply("PONG".to_string())) }),
    );

    let d = device;
    registry.register_aliases(
        &["salir", "exit", "quit"],
        CommandKind::Action,
        handler_fn(move |_cmd| {
            let d = Arc::clone(&d);
            async move {
                info!("shutdown requested by peer");
                d.shutdown.cancel();
                Ok(Response::Silent)
            }
        }),
    );

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;
    use std::time::{Duration, SystemTime};

    use camlink_dispatch::{Dispatcher, Outcome};
    use tempfile::TempDir;

    use crate::capture::FsCaptureProvider;

    fn device(dir: &Path, command: &[&str]) -> Arc<Device> {
        let captures = FsCaptureProvider::new(
            dir,
            command.iter().map(|s| s.to_string()).collect(),
            "jpg",
        );
        Arc::new(Device::new(
            Arc::new(captures),
            StatusBoard::new(),
            "/dev/ttyS0",
            115200,
            2,
            CancellationToken::new(),
        ))
    }

    fn photo(dir: &Path, name: &str, len: usize, age_secs: u64) {
        let path = dir.join(name);
        std::fs::write(&path, vec![1u8; len]).unwrap();
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(age_secs))
            .unwrap();
    }

    async fn reply(dispatcher: &Dispatcher, line: &str) -> String {
        match dispatcher.dispatch(line).await {
            Outcome::Reply(line) => line,
            other => panic!("expected a reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_and_aliases() {
        let tmp = TempDir::new().unwrap();
        let dispatcher = Dispatcher::new(registry(device(tmp.path(), &["true"])));
        assert_eq!(reply(&dispatcher, "ping").await, "PONG");
        assert_eq!(reply(&dispatcher, "STATUS").await, "STATUS:ACTIVE|/dev/ttyS0|115200|0|0");
        assert_eq!(reply(&dispatcher, "list").await, "FILES|0|0");
    }

    #[tokio::test]
    async fn photo_then_status_and_stats() {
        let tmp = TempDir::new().unwrap();
        let dev = device(tmp.path(), &["sh", "-c", "printf abc > \"$0\"", "{path}"]);
        let dispatcher = Dispatcher::new(registry(Arc::clone(&dev)));

        let line = reply(&dispatcher, "foto:patio").await;
        let fields: Vec<&str> = line.split('|').collect();
        assert_eq!(fields[0], "OK");
        assert!(fields[1].starts_with("patio_"));
        assert_eq!(fields[2], "3");
        assert!(Path::new(fields[3]).exists());
        assert_eq!(dev.photos_taken(), 1);

        dev.status.record_commands(dispatcher.stats());
        assert_eq!(
            reply(&dispatcher, "estado").await,
            "STATUS:ACTIVE|/dev/ttyS0|115200|1|1"
        );

        let stats = reply(&dispatcher, "stats").await;
        assert!(
            stats.starts_with("STATS|fotos:1|comandos:1|transferencias:0|errores:0|uptime:"),
            "{stats}"
        );
        assert!(stats.ends_with('s'));
    }

    #[tokio::test]
    async fn failed_capture_is_reported() {
        let tmp = TempDir::new().unwrap();
        let dev = device(tmp.path(), &["false"]);
        let dispatcher = Dispatcher::new(registry(Arc::clone(&dev)));
        assert!(reply(&dispatcher, "photo").await.starts_with("ERROR|CAPTURE_FAILED|"));
        assert_eq!(dev.photos_taken(), 0);
    }

    #[tokio::test]
    async fn self_test_times_a_capture() {
        let tmp = TempDir::new().unwrap();
        let dev = device(tmp.path(), &["sh", "-c", "printf abc > \"$0\"", "{path}"]);
        let dispatcher = Dispatcher::new(registry(Arc::clone(&dev)));

        let line = reply(&dispatcher, "test").await;
        let secs = line
            .strip_prefix("TEST_OK|")
            .and_then(|rest| rest.strip_suffix('s'))
            .unwrap_or_else(|| panic!("unexpected reply {line}"));
        assert!(secs.parse::<f64>().unwrap() >= 0.0);
        assert_eq!(dev.photos_taken(), 0);

        let names: Vec<String> = dev.captures.list().unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("test_captura_"), "{names:?}");
    }

    #[tokio::test]
    async fn failed_self_test_is_a_plain_reply() {
        let tmp = TempDir::new().unwrap();
        let dispatcher = Dispatcher::new(registry(device(tmp.path(), &["false"])));
        assert!(reply(&dispatcher, "TEST").await.starts_with("TEST_FAILED|"));
    }

    #[tokio::test]
    async fn list_shows_five_newest() {
        let tmp = TempDir::new().unwrap();
        for i in 0..7u64 {
            photo(tmp.path(), &format!("p{i}.jpg"), 10, 100 - i * 10);
        }
        let dispatcher = Dispatcher::new(registry(device(tmp.path(), &["true"])));
        assert_eq!(
            reply(&dispatcher, "listar").await,
            "FILES|7|70|p6.jpg:10|p5.jpg:10|p4.jpg:10|p3.jpg:10|p2.jpg:10"
        );
    }

    #[tokio::test]
    async fn download_resolves_photo() {
        let tmp = TempDir::new().unwrap();
        photo(tmp.path(), "a.jpg", 42, 0);
        let dispatcher = Dispatcher::new(registry(device(tmp.path(), &["true"])));

        match dispatcher.dispatch("descargar:a.jpg").await {
            Outcome::Transfer { request, .. } => {
                assert_eq!(request.name, "a.jpg");
                assert_eq!(request.path, tmp.path().join("a.jpg"));
                assert_eq!(request.announce.as_deref(), Some("DOWNLOAD_STARTED"));
            }
            other => panic!("expected a transfer, got {other:?}"),
        }

        assert_eq!(
            reply(&dispatcher, "download").await,
            "ERROR|SYNTAX_ERROR|usage: descargar:<file>"
        );
        assert_eq!(
            reply(&dispatcher, "download:b.jpg").await,
            "ERROR|FILE_NOT_FOUND|b.jpg"
        );
        assert_eq!(
            reply(&dispatcher, "download:../a.jpg").await,
            "ERROR|FILE_NOT_FOUND|../a.jpg"
        );
    }

    #[tokio::test]
    async fn cancel_while_idle() {
        let tmp = TempDir::new().unwrap();
        let dispatcher = Dispatcher::new(registry(device(tmp.path(), &["true"])));
        assert_eq!(
            reply(&dispatcher, "cancelar").await,
            "ERROR|NO_ACTIVE_TRANSFER|no transfer to cancel"
        );
        assert_eq!(dispatcher.kind_of("cancel"), Some(CommandKind::Cancel));
    }

    #[tokio::test]
    async fn clean_uses_default_or_parameter() {
        let tmp = TempDir::new().unwrap();
        for (i, name) in ["a.jpg", "b.jpg", "c.jpg", "d.jpg"].iter().enumerate() {
            photo(tmp.path(), name, 100, 400 - i as u64 * 100);
        }
        let dispatcher = Dispatcher::new(registry(device(tmp.path(), &["true"])));

        assert_eq!(reply(&dispatcher, "limpiar").await, "CLEANED|2|200");
        assert_eq!(reply(&dispatcher, "clean:1").await, "CLEANED|1|100");
        assert!(tmp.path().join("d.jpg").exists());
        assert!(
            reply(&dispatcher, "clean:all")
                .await
                .starts_with("ERROR|SYNTAX_ERROR|")
        );
    }

    #[tokio::test]
    async fn exit_cancels_shutdown_silently() {
        let tmp = TempDir::new().unwrap();
        let dev = device(tmp.path(), &["true"]);
        let dispatcher = Dispatcher::new(registry(Arc::clone(&dev)));
        assert_eq!(dispatcher.dispatch("quit").await, Outcome::Silent);
        assert!(dev.shutdown.is_cancelled());
    }
}
