//! Command registry and dispatcher.
//!
//! A command line is `<name>` or `<name>:<parameter>`. The dispatcher looks
//! the name up in a [`CommandRegistry`] built at startup, runs the handler,
//! and turns its result (or its failure) into exactly one reply line.

mod command;
mod dispatcher;
mod registry;

pub use command::Command;
pub use dispatcher::{DispatchStats, Dispatcher, Outcome};
pub use registry::{
    CommandHandler, CommandKind, CommandRegistry, FnHandler, HandlerFuture, HandlerResult,
    Response, TransferRequest, handler_fn,
};

use camlink_protocol::ErrorCode;

/// A handler failure, reported to the peer as `ERROR|<code>|<detail>`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {detail}")]
pub struct CommandError {
    pub code: ErrorCode,
    pub detail: String,
}

impl CommandError {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    /// Bad or missing parameter.
    pub fn syntax(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::SyntaxError, detail)
    }

    /// Generic failure while running the handler.
    pub fn processing(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::Processing, detail)
    }
}

impl From<std::io::Error> for CommandError {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorCode::IoError, e.to_string())
    }
}
