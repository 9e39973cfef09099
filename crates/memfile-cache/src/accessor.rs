//! Storage primitives the cache reads through

use std::fs::Metadata;
use std::future::Future;
use std::io;
use std::path::Path;
use std::time::SystemTime;

/// Timestamps compared by change polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub modified: SystemTime,
    /// Status-change time; equals `modified` where the platform has none
    pub changed: SystemTime,
}

impl FileStat {
    pub fn from_metadata(meta: &Metadata) -> io::Result<Self> {
        let modified = meta.modified()?;
        Ok(Self {
            modified,
            changed: status_changed(meta).unwrap_or(modified),
        })
    }
}

#[cfg(unix)]
fn status_changed(meta: &Metadata) -> Option<SystemTime> {
    use std::os::unix::fs::MetadataExt;
    use std::time::{Duration, UNIX_EPOCH};

    let secs = u64::try_from(meta.ctime()).ok()?;
    let nanos = u32::try_from(meta.ctime_nsec()).ok()?;
    UNIX_EPOCH.checked_add(Duration::new(secs, nanos))
}

#[cfg(not(unix))]
fn status_changed(_meta: &Metadata) -> Option<SystemTime> {
    None
}

/// Read and stat primitives used by the cache.
///
/// `read_sync` backs `set_sync`; the async methods back `set` and the
/// refresh policies.
pub trait FileAccessor: Send + Sync + 'static {
    fn read_sync(&self, path: &Path) -> io::Result<Vec<u8>>;

    fn read(&self, path: &Path) -> impl Future<Output = io::Result<Vec<u8>>> + Send;

    fn stat(&self, path: &Path) -> impl Future<Output = io::Result<FileStat>> + Send;
}

/// The local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct FsAccessor;

impl FileAccessor for FsAccessor {
    fn read_sync(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    async fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let meta = tokio::fs::metadata(path).await?;
        FileStat::from_metadata(&meta)
    }
}
