//! Owns the link for the lifetime of the process.
//!
//! The [`Supervisor`] reads command lines, dispatches them, hands the
//! channel to the transfer engine for downloads, keeps the link alive with
//! heartbeats and reconnects it when it drops.

mod capture;
mod config;
mod gate;
mod status;
mod supervisor;

pub use capture::{Capture, CaptureFuture, CaptureProvider};
pub use config::SupervisorConfig;
pub use gate::GatedIo;
pub use status::{StatusBoard, StatusSnapshot, TransferTotals};
pub use supervisor::{LinkEnd, Supervisor};

use camlink_link::LinkError;

/// Errors produced by the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    #[error("could not connect: {0}")]
    Connect(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
