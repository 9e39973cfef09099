//! Lifecycle notifications published by the cache
//!
//! Only the cache publishes; callers get receivers through
//! `MemFileCache::subscribe` and `MemFileCache::on`.
//!
//! ```compile_fail
//! let bus = memfile_cache::events::EventBus::new(16);
//! ```

use crate::error::CacheError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// The lifecycle transition an event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Create,
    Update,
    Expire,
    Delete,
    Accessed,
    Close,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Update => "update",
            EventKind::Expire => "expire",
            EventKind::Delete => "delete",
            EventKind::Accessed => "accessed",
            EventKind::Close => "close",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventStatus {
    #[serde(rename = "OK")]
    Ok,
}

/// Event body, serialized as `{status, path, time, size?}` or
/// `{error, errorDetail, path, time}`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    Ok {
        status: EventStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
        time: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
    },
    Failed {
        error: bool,
        #[serde(rename = "errorDetail")]
        error_detail: String,
        path: PathBuf,
        time: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEvent {
    #[serde(rename = "event")]
    pub kind: EventKind,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl CacheEvent {
    pub(crate) fn ok(
        kind: EventKind,
        path: &Path,
        time: DateTime<Utc>,
        size: Option<u64>,
    ) -> Self {
        Self {
            kind,
            payload: EventPayload::Ok {
                status: EventStatus::Ok,
                path: Some(path.to_path_buf()),
                time,
                size,
            },
        }
    }

    pub(crate) fn failed(kind: EventKind, path: &Path, err: &CacheError) -> Self {
        Self {
            kind,
            payload: EventPayload::Failed {
                error: true,
                error_detail: err.to_string(),
                path: path.to_path_buf(),
                time: Utc::now(),
            },
        }
    }

    pub(crate) fn close() -> Self {
        Self {
            kind: EventKind::Close,
            payload: EventPayload::Ok {
                status: EventStatus::Ok,
                path: None,
                time: Utc::now(),
                size: None,
            },
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.payload {
            EventPayload::Ok { path, .. } => path.as_deref(),
            EventPayload::Failed { path, .. } => Some(path),
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        match &self.payload {
            EventPayload::Ok { time, .. } | EventPayload::Failed { time, .. } => *time,
        }
    }

    pub fn size(&self) -> Option<u64> {
        match &self.payload {
            EventPayload::Ok { size, .. } => *size,
            EventPayload::Failed { .. } => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.payload, EventPayload::Failed { .. })
    }
}

/// Broadcast channel fanning events out to every subscriber
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<CacheEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub(crate) fn publish(&self, event: CacheEvent) {
        debug!(event = %event.kind, path = ?event.path(), error = event.is_error(), "Cache event");
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }
}

/// Feed every event of `kind` to `handler` until the bus is dropped
pub(crate) async fn dispatch<F>(
    mut rx: broadcast::Receiver<CacheEvent>,
    kind: EventKind,
    mut handler: F,
) where
    F: FnMut(CacheEvent) + Send + 'static,
{
    loop {
        match rx.recv().await {
            Ok(event) if event.kind == kind => handler(event),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(event = %kind, skipped, "Event handler lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
