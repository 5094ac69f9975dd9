use std::path::Path;

/// Reports free space at a destination directory.
pub trait SpaceProbe: Send + Sync {
    fn available(&self, dir: &Path) -> std::io::Result<u64>;
}

/// Free space as seen by unprivileged users, via `statvfs(3)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsProbe;

#[cfg(unix)]
impl SpaceProbe for StatvfsProbe {
    fn available(&self, dir: &Path) -> std::io::Result<u64> {
        let stat = nix::sys::statvfs::statvfs(dir).map_err(std::io::Error::from)?;
        #[allow(clippy::useless_conversion)]
        let blocks = u64::from(stat.blocks_available());
        #[allow(clippy::useless_conversion)]
        let fragment = u64::from(stat.fragment_size());
        Ok(blocks.saturating_mul(fragment))
    }
}

#[cfg(not(unix))]
impl SpaceProbe for StatvfsProbe {
    fn available(&self, _dir: &Path) -> std::io::Result<u64> {
        Ok(u64::MAX)
    }
}
