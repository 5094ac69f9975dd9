use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use tracing::info;

use camlink_protocol::Reply;

use crate::{Command, CommandError};

/// What a handler produces.
pub type HandlerResult = Result<Response, CommandError>;

/// A boxed future returned by handlers.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = HandlerResult> + Send + 'a>>;

/// Successful handler outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Send one reply line.
    Reply(Reply),
    /// Send nothing.
    Silent,
    /// Hand the channel to the transfer engine to send a file.
    Transfer(TransferRequest),
}

impl Response {
    pub fn reply(reply: impl Into<Reply>) -> Self {
        Self::Reply(reply.into())
    }
}

impl From<Reply> for Response {
    fn from(reply: Reply) -> Self {
        Self::Reply(reply)
    }
}

/// A file the peer asked to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Local file to send.
    pub path: PathBuf,
    /// Name announced in `HEADER`.
    pub name: String,
    /// Token of the line written before `HEADER`, as
    /// `<token>|<session id>|<size>`. Nothing is written when unset.
    pub announce: Option<String>,
}

/// How a command interacts with an active transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Read-only status query.
    Query,
    /// Has side effects on the device.
    Action,
    /// Starts a file transfer.
    Transfer,
    /// Cancels the active transfer.
    Cancel,
}

/// Trait for command handlers.
pub trait CommandHandler: Send + Sync + 'static {
    fn handle(&self, cmd: Command) -> HandlerFuture<'_>;
}

/// Adapter turning an async closure into a [`CommandHandler`].
pub struct FnHandler<F>(F);

/// Wraps `f` as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler(f)
}

impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, cmd: Command) -> HandlerFuture<'_> {
        Box::pin((self.0)(cmd))
    }
}

#[derive(Clone)]
pub(crate) struct Registration {
    pub(crate) kind: CommandKind,
    pub(crate) handler: Arc<dyn CommandHandler>,
}

/// Map from lowercase command name to handler.
///
/// Built once at startup and then moved into the
/// [`Dispatcher`](crate::Dispatcher), which never mutates it.
#[derive(Default)]
pub struct CommandRegistry {
    entries: BTreeMap<String, Registration>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`.
    ///
    /// An existing handler for the same name is replaced and handed back.
    pub fn register(
        &mut self,
        name: &str,
        kind: CommandKind,
        handler: impl CommandHandler,
    ) -> Option<Arc<dyn CommandHandler>> {
        self.insert(name, kind, Arc::new(handler))
    }

    /// Registers one handler under several names.
    pub fn register_aliases(
        &mut self,
        names: &[&str],
        kind: CommandKind,
        handler: impl CommandHandler,
    ) {
        let handler: Arc<dyn CommandHandler> = Arc::new(handler);
        for name in names {
            self.insert(name, kind, Arc::clone(&handler));
        }
    }

    fn insert(
        &mut self,
        name: &str,
        kind: CommandKind,
        handler: Arc<dyn CommandHandler>,
    ) -> Option<Arc<dyn CommandHandler>> {
        let name = name.trim().to_lowercase();
        let old = self.entries.insert(name.clone(), Registration { kind, handler })?;
        info!(command = %name, old_kind = ?old.kind, new_kind = ?kind, "replacing command handler");
        Some(old.handler)
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Registration> {
        self.entries.get(name)
    }

    pub fn kind_of(&self, name: &str) -> Option<CommandKind> {
        self.entries.get(&name.to_lowercase()).map(|r| r.kind)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_lowercase())
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
