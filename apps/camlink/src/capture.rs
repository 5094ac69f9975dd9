//! Photos taken by an external program and kept in a directory.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tracing::{debug, info, warn};

use camlink_supervisor::{Capture, CaptureFuture, CaptureProvider};
use camlink_transfer::calculate_file_checksum;

use crate::config::CaptureSection;

/// Longest a capture program may run.
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(15);

/// Placeholder replaced by the output path in the capture command.
const PATH_PLACEHOLDER: &str = "{path}";

pub struct FsCaptureProvider {
    dir: PathBuf,
    command: Vec<String>,
    extension: String,
}

impl FsCaptureProvider {
    pub fn new(dir: impl Into<PathBuf>, command: Vec<String>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            command,
            extension: extension.into().trim_start_matches('.').to_lowercase(),
        }
    }

    pub fn from_config(section: &CaptureSection) -> Self {
        Self::new(
            section.photo_dir.clone(),
            section.command.clone(),
            section.extension.clone(),
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn is_photo(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(&self.extension))
    }

    /// Picks a file name that does not exist yet.
    fn next_path(&self, hint: Option<&str>) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let base = match hint.map(clean_hint).filter(|h| !h.is_empty()) {
            Some(hint) => format!("{hint}_{stamp}"),
            None => format!("foto_{stamp}"),
        };

        let mut path = self.dir.join(format!("{base}.{}", self.extension));
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("{base}_{n}.{}", self.extension));
            n += 1;
        }
        path
    }

    async fn take(&self, hint: Option<&str>) -> io::Result<Capture> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty capture command"))?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.next_path(hint);
        let target = path.to_string_lossy();
        let args: Vec<String> = args
            .iter()
            .map(|a| a.replace(PATH_PLACEHOLDER, &target))
            .collect();

        debug!(%program, ?args, "running capture command");
        let child = tokio::process::Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(CAPTURE_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{program} did not finish within {}s", CAPTURE_TIMEOUT.as_secs()),
                )
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(io::Error::other(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            _ => {
                return Err(io::Error::other(format!(
                    "{program} produced no file at {}",
                    path.display()
                )));
            }
        };

        let sum_path = path.clone();
        let checksum = tokio::task::spawn_blocking(move || calculate_file_checksum(&sum_path))
            .await
            .map_err(io::Error::other)?
            .map_err(io::Error::other)?;

        let capture = Capture {
            name: file_name(&path),
            size: meta.len(),
            checksum: Some(checksum),
            taken_at: Utc::now(),
            path,
        };
        info!(name = %capture.name, size = capture.size, "photo captured");
        Ok(capture)
    }

    fn describe(&self, path: PathBuf, meta: &std::fs::Metadata) -> Capture {
        let taken_at = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Capture {
            name: file_name(&path),
            size: meta.len(),
            checksum: None,
            taken_at,
            path,
        }
    }
}

impl CaptureProvider for FsCaptureProvider {
    fn capture<'a>(&'a self, hint: Option<&'a str>) -> CaptureFuture<'a> {
        Box::pin(self.take(hint))
    }

    fn list(&self) -> io::Result<Vec<Capture>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut captures = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !self.is_photo(&path) {
                continue;
            }
            let meta = entry.metadata()?;
            if meta.is_file() {
                captures.push(self.describe(path, &meta));
            }
        }

        captures.sort_by(|a, b| b.taken_at.cmp(&a.taken_at).then_with(|| b.name.cmp(&a.name)));
        Ok(captures)
    }

    fn resolve(&self, name: &str) -> io::Result<Option<Capture>> {
        let name = name.trim();
        if name.is_empty() || Path::new(name).file_name().and_then(|n| n.to_str()) != Some(name) {
            return Ok(None);
        }

        let path = self.dir.join(name);
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(self.describe(path, &meta))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn clean(&self, keep: usize) -> io::Result<(usize, u64)> {
        let mut removed = 0;
        let mut bytes = 0;
        for capture in self.list()?.into_iter().skip(keep) {
            match std::fs::remove_file(&capture.path) {
                Ok(()) => {
                    removed += 1;
                    bytes += capture.size;
                }
                Err(e) => warn!(path = %capture.path.display(), error = %e, "could not remove photo"),
            }
        }
        info!(removed, bytes, keep, "old photos cleaned");
        Ok((removed, bytes))
    }
}

fn clean_hint(hint: &str) -> String {
    hint.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
