//! Cache types

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Cached file content.
///
/// The representation is picked once, when the entry is created, from its
/// content type: `text/*` files are decoded to UTF-8 (lossily), everything
/// else keeps the raw bytes. Refreshing an entry keeps the representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Text(Arc<str>),
    Binary(Arc<[u8]>),
}

impl Content {
    pub fn decode(content_type: &str, bytes: Vec<u8>) -> Self {
        if is_text_type(content_type) {
            Content::Text(String::from_utf8_lossy(&bytes).into())
        } else {
            Content::Binary(bytes.into())
        }
    }

    /// Re-derive content from fresh bytes using this content's representation
    pub(crate) fn reload(&self, bytes: Vec<u8>) -> Self {
        match self {
            Content::Text(_) => Content::Text(String::from_utf8_lossy(&bytes).into()),
            Content::Binary(_) => Content::Binary(bytes.into()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Content::Text(text) => text.as_bytes(),
            Content::Binary(bytes) => bytes,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(text) => Some(text),
            Content::Binary(_) => None,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Content::Text(_))
    }
}

/// Whether a content-type label selects the text representation
pub fn is_text_type(content_type: &str) -> bool {
    content_type
        .get(..5)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("text/"))
}

/// A refresh policy armed on an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum Policy {
    /// Poll the file's timestamps and refresh when they move
    OnChange {
        #[serde(serialize_with = "as_millis")]
        interval: Duration,
    },
    /// Re-read the file unconditionally
    OnUpdate {
        #[serde(serialize_with = "as_millis")]
        interval: Duration,
    },
    /// Drop the entry a fixed time after creation
    OnExpire {
        #[serde(serialize_with = "as_millis")]
        ttl: Duration,
    },
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u128(duration.as_millis())
}

/// One file's in-memory mirror
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub path: PathBuf,
    #[serde(skip)]
    pub content: Content,
    pub content_type: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub policies: Vec<Policy>,
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: CacheStats,
}

/// Configuration for the serving binary
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub port: u16,
    pub event_capacity: usize,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            port: 3002,
            event_capacity: crate::events::DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Returns `Utc::now()`, or one nanosecond past `prev` if the clock has not moved
pub(crate) fn next_stamp(prev: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > prev {
        now
    } else {
        prev + chrono::Duration::nanoseconds(1)
    }
}
