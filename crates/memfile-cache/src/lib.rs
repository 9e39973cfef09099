//! In-memory file content cache
//!
//! Mirrors file bytes and metadata into memory, keyed by path, and keeps each
//! entry fresh or evicts it through three independent timer-driven policies:
//! change polling, forced periodic refresh, and absolute expiration.
//! Lifecycle transitions are published on a broadcast event bus.

pub mod accessor;
mod cache;
pub mod error;
pub mod events;
pub mod options;
mod policy;
pub mod server;
mod store;
pub mod types;

pub use accessor::{FileAccessor, FileStat, FsAccessor};
pub use cache::MemFileCache;
pub use error::{CacheError, Result};
pub use events::{CacheEvent, EventKind, EventPayload, EventStatus};
pub use options::{CacheOptions, PartialOptions};
pub use types::{CacheEntry, CacheStats, Content, Policy, ServeConfig};
