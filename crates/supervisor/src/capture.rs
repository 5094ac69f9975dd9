use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A boxed future returned by [`CaptureProvider::capture`].
pub type CaptureFuture<'a> = Pin<Box<dyn Future<Output = std::io::Result<Capture>> + Send + 'a>>;

/// A photo on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capture {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    /// MD5, lowercase hex. Only filled in for fresh captures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub taken_at: DateTime<Utc>,
}

/// Source of photos for the command handlers.
pub trait CaptureProvider: Send + Sync + 'static {
    /// Takes a photo. `hint` is an optional base name from the peer.
    fn capture<'a>(&'a self, hint: Option<&'a str>) -> CaptureFuture<'a>;

    /// Stored photos, newest first.
    fn list(&self) -> std::io::Result<Vec<Capture>>;

    /// Finds a stored photo by file name.
    fn resolve(&self, name: &str) -> std::io::Result<Option<Capture>>;

    /// Removes all but the `keep` newest photos. Returns the number of
    /// files and bytes removed.
    fn clean(&self, keep: usize) -> std::io::Result<(usize, u64)>;
}
