use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::FutureExt;
use tracing::{debug, warn};

use camlink_protocol::{ErrorCode, Reply};

use crate::registry::{CommandRegistry, Response, TransferRequest};
use crate::{Command, CommandKind};

/// Result of dispatching one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Write this line back to the peer.
    Reply(String),
    /// Write nothing.
    Silent,
    /// Start a transfer on behalf of `command`.
    Transfer {
        command: Command,
        request: TransferRequest,
    },
}

/// Dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub processed: u64,
    pub failed: u64,
    pub unknown: u64,
}

/// Routes command lines to their handlers.
pub struct Dispatcher {
    registry: CommandRegistry,
    processed: AtomicU64,
    failed: AtomicU64,
    unknown: AtomicU64,
}

impl Dispatcher {
    pub fn new(registry: CommandRegistry) -> Self {
        Self {
            registry,
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            unknown: AtomicU64::new(0),
        }
    }

    /// Parses and dispatches one line. Blank lines are ignored.
    pub async fn dispatch(&self, line: &str) -> Outcome {
        match Command::parse(line) {
            Some(cmd) => self.dispatch_command(cmd).await,
            None => Outcome::Silent,
        }
    }

    /// Runs the handler for `cmd`.
    ///
    /// Handler errors and panics become `ERROR|...` replies; they never
    /// propagate to the caller.
    pub async fn dispatch_command(&self, cmd: Command) -> Outcome {
        let Some(entry) = self.registry.get(&cmd.name) else {
            self.unknown.fetch_add(1, Ordering::Relaxed);
            debug!(command = %cmd.name, "unknown command");
            return Outcome::Reply(self.unknown_reply(&cmd.name).to_string());
        };

        let handler = entry.handler.clone();
        let name = cmd.name.clone();
        let result = AssertUnwindSafe(handler.handle(cmd.clone()))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(response)) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                debug!(command = %name, "command processed");
                match response {
                    Response::Reply(reply) => Outcome::Reply(reply.to_string()),
                    Response::Silent => Outcome::Silent,
                    Response::Transfer(request) => Outcome::Transfer {
                        command: cmd,
                        request,
                    },
                }
            }
            Ok(Err(e)) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(command = %name, error = %e, "command failed");
                let detail = if e.code == ErrorCode::Processing {
                    format!("error processing '{name}': {}", e.detail)
                } else {
                    e.detail
                };
                Outcome::Reply(Reply::error(e.code, detail).to_string())
            }
            Err(panic) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                let msg = panic_message(panic.as_ref());
                warn!(command = %name, panic = %msg, "command handler panicked");
                Outcome::Reply(
                    Reply::error(
                        ErrorCode::Processing,
                        format!("error processing '{name}': {msg}"),
                    )
                    .to_string(),
                )
            }
        }
    }

    /// The `UNKNOWN_COMMAND` reply listing every registered name.
    pub fn unknown_reply(&self, name: &str) -> Reply {
        let available = self.registry.names().collect::<Vec<_>>().join(", ");
        Reply::error(
            ErrorCode::UnknownCommand,
            format!("{name} not recognized. Available: {available}"),
        )
    }

    pub fn kind_of(&self, name: &str) -> Option<CommandKind> {
        self.registry.kind_of(name)
    }

    /// Commands whose handler completed successfully.
    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".into()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{CommandError, handler_fn};

    fn dispatcher() -> Dispatcher {
        let mut registry = CommandRegistry::new();
        registry.register(
            "ping",
            CommandKind::Query,
            handler_fn(|_cmd| async { Ok(Response::reply(Reply::Token("PONG".into()))) }),
        );
        registry.register(
            "echo",
            CommandKind::Query,
            handler_fn(|cmd: Command| async move {
                let text = cmd.require_parameter("echo:<text>")?.to_string();
                Ok(Response::reply(Reply::ok([text])))
            }),
        );
        registry.register(
            "boom",
            CommandKind::Action,
            handler_fn(|_cmd| async { Err(CommandError::processing("disk on fire")) }),
        );
        registry.register(
            "panic",
            CommandKind::Action,
            handler_fn(|_cmd| async {
                if true {
                    panic!("handler exploded");
                }
                Ok(Response::Silent)
            }),
        );
        registry.register(
            "quit",
            CommandKind::Action,
            handler_fn(|_cmd| async { Ok(Response::Silent) }),
        );
        registry.register(
            "descargar",
            CommandKind::Transfer,
            handler_fn(|cmd: Command| async move {
                let name = cmd.require_parameter("descargar:<file>")?.to_string();
                Ok(Response::Transfer(TransferRequest {
                    path: PathBuf::from("/data").join(&name),
                    name,
                    announce: None,
                }))
            }),
        );
        Dispatcher::new(registry)
    }

    #[tokio::test]
    async fn routes_to_handler() {
        let d = dispatcher();
        assert_eq!(d.dispatch("PING").await, Outcome::Reply("PONG".into()));
        assert_eq!(d.dispatch("echo:Hola").await, Outcome::Reply("OK|Hola".into()));
        assert_eq!(d.processed_count(), 2);
    }

    #[tokio::test]
    async fn unknown_command_lists_available_names() {
        let d = dispatcher();
        let Outcome::Reply(reply) = d.dispatch("xyz").await else {
            panic!("expected reply");
        };
        assert_eq!(
            reply,
            "ERROR|UNKNOWN_COMMAND|xyz not recognized. Available: boom, descargar, echo, panic, ping, quit"
        );
        assert_eq!(d.processed_count(), 0);
        assert_eq!(d.stats().unknown, 1);
    }

    #[tokio::test]
    async fn handler_error_becomes_reply() {
        let d = dispatcher();
        assert_eq!(
            d.dispatch("boom").await,
            Outcome::Reply("ERROR|PROCESSING|error processing 'boom': disk on fire".into())
        );
        assert_eq!(
            d.dispatch("echo").await,
            Outcome::Reply("ERROR|SYNTAX_ERROR|usage: echo:<text>".into())
        );
        assert_eq!(d.processed_count(), 0);
        assert_eq!(d.stats().failed, 2);
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        let d = dispatcher();
        assert_eq!(
            d.dispatch("panic").await,
            Outcome::Reply("ERROR|PROCESSING|error processing 'panic': handler exploded".into())
        );
        // The dispatcher keeps working afterwards.
        assert_eq!(d.dispatch("ping").await, Outcome::Reply("PONG".into()));
    }

    #[tokio::test]
    async fn silent_handler_sends_nothing() {
        let d = dispatcher();
        assert_eq!(d.dispatch("quit").await, Outcome::Silent);
        assert_eq!(d.processed_count(), 1);
    }

    #[tokio::test]
    async fn blank_line_is_ignored() {
        let d = dispatcher();
        assert_eq!(d.dispatch("   ").await, Outcome::Silent);
        assert_eq!(d.stats(), DispatchStats::default());
    }

    #[tokio::test]
    async fn transfer_handler_yields_request() {
        let d = dispatcher();
        let Outcome::Transfer { command, request } = d.dispatch("descargar:foto.jpg").await else {
            panic!("expected transfer");
        };
        assert_eq!(command.name, "descargar");
        assert_eq!(request.name, "foto.jpg");
        assert_eq!(request.path, PathBuf::from("/data/foto.jpg"));
        assert_eq!(d.kind_of("descargar"), Some(CommandKind::Transfer));
    }
}
