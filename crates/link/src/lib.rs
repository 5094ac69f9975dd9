//! Byte channel plumbing for the camlink serial link.
//!
//! A [`Link`] splits one byte stream into:
//! - a reader task that drains the stream through a [`LineFramer`] and
//!   pushes complete lines into a bounded queue,
//! - an exclusively-held write half ([`ChannelGuard`]),
//! - length-bounded raw reads for binary chunk payloads.

mod framer;
mod link;
mod reader;
pub mod reconnect;
mod stats;

pub use framer::LineFramer;
pub use link::{BoxedReader, BoxedWriter, ChannelGuard, Link, LinkConfig, PendingRaw};
pub use reader::LinkEvent;
pub use reconnect::{ConnectFuture, Connector, ReconnectConfig, connect_with_backoff};
pub use stats::{LinkStats, LinkStatsSnapshot};

/// Bytes requested from the stream per read call.
pub const READ_BUFFER_SIZE: usize = 1024;

/// Capacity of the queue between the reader task and its consumer.
pub const EVENT_QUEUE_CAPACITY: usize = 64;

/// Errors produced by the link layer.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("link disconnected: {0}")]
    Disconnected(String),

    #[error("link closed")]
    Closed,

    #[error("timed out waiting for the peer")]
    Timeout,
}
