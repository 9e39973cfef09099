//! Error types for the memfile cache

use std::fmt;
use std::io;
use std::path::PathBuf;

#[derive(Debug)]
pub enum CacheError {
    /// The file could not be read when creating or refreshing an entry
    Read { path: PathBuf, source: io::Error },
    /// The file could not be stat'ed while polling for changes
    Stat { path: PathBuf, source: io::Error },
    Config(String),
}

impl CacheError {
    pub(crate) fn read(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CacheError::Read {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn stat(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CacheError::Stat {
            path: path.into(),
            source,
        }
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Read { path, source } => {
                write!(f, "Failed to read {}: {}", path.display(), source)
            }
            CacheError::Stat { path, source } => {
                write!(f, "Failed to stat {}: {}", path.display(), source)
            }
            CacheError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Read { source, .. } | CacheError::Stat { source, .. } => Some(source),
            CacheError::Config(_) => None,
        }
    }
}

impl From<tracing_subscriber::filter::ParseError> for CacheError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        CacheError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
