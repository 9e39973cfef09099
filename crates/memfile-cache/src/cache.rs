//! In-memory file cache with timer-driven refresh and expiry

use crate::accessor::{FileAccessor, FsAccessor};
use crate::error::{CacheError, Result};
use crate::events::{self, CacheEvent, EventBus, EventKind, DEFAULT_EVENT_CAPACITY};
use crate::options::{CacheOptions, PartialOptions};
use crate::policy;
use crate::store::{EntryStore, Slot};
use crate::types::{next_stamp, CacheEntry, CacheStats, Content};
use chrono::Utc;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// State shared between cache handles and the policy tasks.
///
/// The mutexes are never held across an `.await`.
pub(crate) struct Shared<A: FileAccessor> {
    store: Mutex<EntryStore>,
    defaults: Mutex<CacheOptions>,
    events: EventBus,
    pub(crate) accessor: A,
    pub(crate) runtime: Handle,
    next_generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<A: FileAccessor> Shared<A> {
    fn lock_store(&self) -> MutexGuard<'_, EntryStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn defaults(&self) -> CacheOptions {
        self.defaults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Build an entry from freshly read bytes and make it visible, retiring
    /// any entry already stored under `path`.
    fn install(
        shared: &Arc<Self>,
        path: PathBuf,
        options: &PartialOptions,
        bytes: Vec<u8>,
        notify: bool,
    ) -> CacheEntry {
        let options = shared.defaults().overlay(options);
        let policies = options.policies();
        let size = bytes.len() as u64;
        let content = Content::decode(&options.content_type, bytes);
        let generation = shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        let created = Instant::now();

        let entry = CacheEntry {
            path: path.clone(),
            content,
            content_type: options.content_type,
            size,
            created_at: now,
            modified_at: now,
            accessed_at: now,
            policies,
        };

        let mut store = shared.lock_store();
        // Timers first; the old slot only goes once the new one is ready
        let timers = entry
            .policies
            .iter()
            .filter_map(|policy| policy::arm(shared, &path, generation, *policy, created))
            .collect();
        if store.remove(&path).is_some() {
            debug!(path = %path.display(), "Retired previous entry");
        }
        store.replace(Slot {
            entry: entry.clone(),
            generation,
            timers,
        });
        if notify {
            shared
                .events
                .publish(CacheEvent::ok(EventKind::Create, &path, now, Some(size)));
        }
        drop(store);

        debug!(path = %path.display(), size, policies = entry.policies.len(), "Cached file");
        entry
    }

    pub(crate) fn is_current(&self, path: &Path, generation: u64) -> bool {
        self.lock_store().is_current(path, generation)
    }

    /// Silently drop an entry whose file could not be stat'ed
    pub(crate) fn drop_vanished(&self, path: &Path, generation: u64) -> bool {
        self.lock_store().remove_current(path, generation).is_some()
    }

    pub(crate) fn apply_refresh(&self, path: &Path, generation: u64, result: io::Result<Vec<u8>>) {
        let mut store = self.lock_store();
        let Some(slot) = store.current_mut(path, generation) else {
            debug!(path = %path.display(), "Entry gone before refresh completed");
            return;
        };

        match result {
            Ok(bytes) => {
                let entry = &mut slot.entry;
                entry.size = bytes.len() as u64;
                entry.content = entry.content.reload(bytes);
                entry.modified_at = next_stamp(entry.modified_at);
                self.events.publish(CacheEvent::ok(
                    EventKind::Update,
                    path,
                    entry.modified_at,
                    Some(entry.size),
                ));
            }
            Err(e) => {
                let err = CacheError::read(path, e);
                warn!(path = %path.display(), error = %err, "Refresh failed, keeping last good copy");
                self.events
                    .publish(CacheEvent::failed(EventKind::Update, path, &err));
            }
        }
    }

    pub(crate) fn expire(&self, path: &Path, generation: u64) {
        let mut store = self.lock_store();
        if !store.is_current(path, generation) {
            return;
        }
        self.events
            .publish(CacheEvent::ok(EventKind::Expire, path, Utc::now(), None));
        store.remove(path);
        info!(path = %path.display(), "Entry expired");
    }
}

impl<A: FileAccessor> Drop for Shared<A> {
    fn drop(&mut self) {
        self.store
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// A path-keyed cache of file contents.
///
/// Handles are cheap to clone and share one store. Policy timers run on the
/// Tokio runtime the cache was created in and stop when the last handle is
/// dropped.
pub struct MemFileCache<A: FileAccessor = FsAccessor> {
    shared: Arc<Shared<A>>,
}

impl<A: FileAccessor> Clone for MemFileCache<A> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl MemFileCache<FsAccessor> {
    /// Create a cache over the local filesystem.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn new() -> Self {
        Self::with_accessor(FsAccessor, DEFAULT_EVENT_CAPACITY)
    }
}

impl Default for MemFileCache<FsAccessor> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: FileAccessor> MemFileCache<A> {
    /// Create a cache reading through `accessor`, buffering up to
    /// `event_capacity` undelivered events per subscriber.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn with_accessor(accessor: A, event_capacity: usize) -> Self {
        Self::with_runtime(accessor, event_capacity, Handle::current())
    }

    pub fn with_runtime(accessor: A, event_capacity: usize, runtime: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                store: Mutex::new(EntryStore::default()),
                defaults: Mutex::new(CacheOptions::default()),
                events: EventBus::new(event_capacity),
                accessor,
                runtime,
                next_generation: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    /// Overwrite the defaults for every option `options` sets. Existing
    /// entries are unaffected.
    pub fn setup(&self, options: PartialOptions) {
        self.shared
            .defaults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .merge(&options);
    }

    pub fn defaults(&self) -> CacheOptions {
        self.shared.defaults()
    }

    /// Read `path` and cache it, replacing any existing entry.
    ///
    /// Publishes a `create` event either way. On a read failure any entry
    /// still cached for `path` is dropped.
    pub async fn set(&self, path: impl Into<PathBuf>, options: PartialOptions) -> Result<CacheEntry> {
        let path = path.into();

        match self.shared.accessor.read(&path).await {
            Ok(bytes) => {
                let entry = Shared::install(&self.shared, path, &options, bytes, true);
                info!(path = %entry.path.display(), size = entry.size, "File cached");
                Ok(entry)
            }
            Err(e) => {
                let err = CacheError::read(&path, e);
                {
                    let mut store = self.shared.lock_store();
                    if store.remove(&path).is_some() {
                        debug!(path = %path.display(), "Dropped stale entry after failed read");
                    }
                    self.shared
                        .events
                        .publish(CacheEvent::failed(EventKind::Create, &path, &err));
                }
                warn!(path = %path.display(), error = %err, "Failed to cache file");
                Err(err)
            }
        }
    }

    /// Run [`set`](Self::set) in the background, logging failures
    pub fn set_detached(&self, path: impl Into<PathBuf>, options: PartialOptions) -> JoinHandle<()> {
        let cache = self.clone();
        let path = path.into();
        self.shared.runtime.spawn(async move {
            if let Err(e) = cache.set(path, options).await {
                debug!(error = %e, "Background set failed");
            }
        })
    }

    /// Read `path` synchronously and cache it. Publishes no events; on failure
    /// the store is left untouched.
    pub fn set_sync(&self, path: impl Into<PathBuf>, options: PartialOptions) -> Result<CacheEntry> {
        let path = path.into();
        let bytes = self
            .shared
            .accessor
            .read_sync(&path)
            .map_err(|e| CacheError::read(&path, e))?;
        Ok(Shared::install(&self.shared, path, &options, bytes, false))
    }

    /// Look up a cached entry, stamping its access time
    pub fn get(&self, path: impl AsRef<Path>) -> Option<CacheEntry> {
        let path = path.as_ref();
        let mut store = self.shared.lock_store();

        match store.get_mut(path) {
            Some(slot) => {
                let entry = &mut slot.entry;
                entry.accessed_at = next_stamp(entry.accessed_at);
                self.shared.hits.fetch_add(1, Ordering::Relaxed);
                self.shared.events.publish(CacheEvent::ok(
                    EventKind::Accessed,
                    path,
                    entry.accessed_at,
                    Some(entry.size),
                ));
                Some(entry.clone())
            }
            None => {
                self.shared.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Remove the entry for `path`, cancelling its timers. Returns whether
    /// the path is now absent, which holds even if it was never cached.
    pub fn del(&self, path: impl AsRef<Path>, emit_event: bool) -> bool {
        let path = path.as_ref();
        let mut store = self.shared.lock_store();

        if let Some(entry) = store.remove(path) {
            debug!(path = %path.display(), "Entry deleted");
            if emit_event {
                self.shared.events.publish(CacheEvent::ok(
                    EventKind::Delete,
                    path,
                    Utc::now(),
                    Some(entry.size),
                ));
            }
        }
        !store.contains(path)
    }

    /// Drop every entry and publish a single `close` event. The cache stays
    /// usable afterwards.
    pub fn close(&self) {
        let mut store = self.shared.lock_store();
        let retired = store.clear();
        self.shared.events.publish(CacheEvent::close());
        drop(store);
        info!(retired, "Cache closed");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.shared.events.subscribe()
    }

    /// Call `handler` for every event of `kind` published after this returns
    pub fn on<F>(&self, kind: EventKind, handler: F) -> JoinHandle<()>
    where
        F: FnMut(CacheEvent) + Send + 'static,
    {
        let rx = self.shared.events.subscribe();
        self.shared.runtime.spawn(events::dispatch(rx, kind, handler))
    }

    /// Whether `path` is cached, without stamping its access time
    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.shared.lock_store().contains(path.as_ref())
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.shared
            .lock_store()
            .entries()
            .map(|entry| entry.path.clone())
            .collect()
    }

    /// Snapshot of every entry, without stamping access times
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.shared.lock_store().entries().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.shared.lock_store().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let store = self.shared.lock_store();
        CacheStats {
            entries: store.len(),
            total_size: store.entries().map(|entry| entry.size).sum(),
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Policy;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio::time::sleep;

    fn write_file(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    /// Swap in new contents atomically so pollers never see a half-written file
    fn replace_file(path: &Path, data: &[u8]) {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, data).unwrap();
        std::fs::rename(&tmp, path).unwrap();
    }

    fn drain(rx: &mut broadcast::Receiver<CacheEvent>) -> Vec<CacheEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn of_kind(events: &[CacheEvent], kind: EventKind) -> Vec<CacheEvent> {
        events.iter().filter(|e| e.kind == kind).cloned().collect()
    }

    fn text() -> PartialOptions {
        PartialOptions::new().content_type("text/plain")
    }

    #[tokio::test]
    async fn test_set_sync_empty_text_file() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "empty.txt", b"");
        let cache = MemFileCache::new();

        let entry = cache.set_sync(&path, text()).unwrap();
        assert_eq!(entry.size, 0);
        assert_eq!(entry.content.as_text(), Some(""));
        assert_eq!(entry.created_at, entry.modified_at);
    }

    #[tokio::test]
    async fn test_content_representation_follows_content_type() {
        let dir = tempdir().unwrap();
        let bytes = vec![0x89, b'P', b'N', b'G', 0x00, 0xff];
        let path = write_file(&dir, "image.png", &bytes);
        let cache = MemFileCache::new();

        let binary = cache.set_sync(&path, PartialOptions::new()).unwrap();
        assert_eq!(binary.content_type, "application/octet-stream");
        assert_eq!(binary.content.as_bytes(), bytes.as_slice());
        assert!(!binary.content.is_text());

        let text_path = write_file(&dir, "page.html", "héllo".as_bytes());
        let text = cache
            .set_sync(&text_path, PartialOptions::new().content_type("Text/HTML"))
            .unwrap();
        assert_eq!(text.content.as_text(), Some("héllo"));
        assert_eq!(text.size, 6);
    }

    #[tokio::test]
    async fn test_set_sync_failure_leaves_store_untouched() {
        let dir = tempdir().unwrap();
        let cache = MemFileCache::new();
        let mut rx = cache.subscribe();

        let result = cache.set_sync(dir.path().join("missing"), text());
        assert!(matches!(result, Err(CacheError::Read { .. })));
        assert!(cache.is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_set_sync_publishes_nothing() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"a");
        let cache = MemFileCache::new();
        let mut rx = cache.subscribe();

        cache.set_sync(&path, text()).unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_set_publishes_create() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"hello");
        let cache = MemFileCache::new();
        let mut rx = cache.subscribe();

        let entry = cache.set(&path, text()).await.unwrap();
        assert_eq!(entry.content.as_text(), Some("hello"));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Create);
        assert!(!events[0].is_error());
        assert_eq!(events[0].path(), Some(path.as_path()));
        assert_eq!(events[0].size(), Some(5));
    }

    #[tokio::test]
    async fn test_set_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing");
        let cache = MemFileCache::new();
        let mut rx = cache.subscribe();

        let err = cache.set(&path, PartialOptions::new()).await.unwrap_err();
        assert!(matches!(err, CacheError::Read { .. }));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Create);
        assert!(events[0].is_error());
        assert!(cache.get(&path).is_none());
    }

    #[tokio::test]
    async fn test_failed_set_drops_existing_entry() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"a");
        let cache = MemFileCache::new();
        cache.set_sync(&path, text()).unwrap();

        std::fs::remove_file(&path).unwrap();
        let mut rx = cache.subscribe();
        assert!(cache.set(&path, text()).await.is_err());

        assert!(!cache.contains(&path));
        let events = drain(&mut rx);
        assert!(of_kind(&events, EventKind::Delete).is_empty());
        assert_eq!(of_kind(&events, EventKind::Create).len(), 1);
    }

    #[tokio::test]
    async fn test_set_detached_caches_in_background() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"a");
        let cache = MemFileCache::new();

        cache
            .set_detached(&path, text())
            .await
            .unwrap();
        assert!(cache.contains(&path));

        cache
            .set_detached(dir.path().join("missing"), text())
            .await
            .unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_get_stamps_access_time() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"abc");
        let cache = MemFileCache::new();
        let created = cache.set_sync(&path, text()).unwrap();
        let mut rx = cache.subscribe();

        let first = cache.get(&path).unwrap();
        let second = cache.get(&path).unwrap();
        assert!(first.accessed_at > created.accessed_at);
        assert!(second.accessed_at > first.accessed_at);
        assert_eq!(second.content.as_text(), Some("abc"));

        let accessed = of_kind(&drain(&mut rx), EventKind::Accessed);
        assert_eq!(accessed.len(), 2);
        assert_eq!(accessed[1].time(), second.accessed_at);
    }

    #[tokio::test]
    async fn test_get_miss() {
        let cache = MemFileCache::new();
        let mut rx = cache.subscribe();

        assert!(cache.get("/nowhere").is_none());
        assert!(drain(&mut rx).is_empty());
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_del_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"a");
        let cache = MemFileCache::new();
        let mut rx = cache.subscribe();

        assert!(cache.del(&path, true));
        assert!(drain(&mut rx).is_empty());

        cache.set_sync(&path, text()).unwrap();
        assert!(cache.del(&path, true));
        assert!(cache.del(&path, true));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Delete);
        assert!(cache.get(&path).is_none());
    }

    #[tokio::test]
    async fn test_del_without_event() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"a");
        let cache = MemFileCache::new();
        cache.set_sync(&path, text()).unwrap();
        let mut rx = cache.subscribe();

        assert!(cache.del(&path, false));
        assert!(!cache.contains(&path));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_expire_removes_entry() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"a");
        let cache = MemFileCache::new();
        let mut rx = cache.subscribe();

        let entry = cache
            .set(&path, text().expire_interval(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(
            entry.policies,
            vec![Policy::OnExpire {
                ttl: Duration::from_millis(50)
            }]
        );

        sleep(Duration::from_millis(120)).await;
        assert!(cache.get(&path).is_none());

        let events = drain(&mut rx);
        let expired = of_kind(&events, EventKind::Expire);
        assert_eq!(expired.len(), 1);
        assert!(!expired[0].is_error());
        assert_eq!(expired[0].path(), Some(path.as_path()));
        assert!(of_kind(&events, EventKind::Delete).is_empty());
    }

    #[tokio::test]
    async fn test_expire_is_not_sliding() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"a");
        let cache = MemFileCache::new();
        cache
            .set_sync(
                &path,
                text()
                    .expire_interval(Duration::from_millis(100))
                    .update_interval(Duration::from_millis(20)),
            )
            .unwrap();

        sleep(Duration::from_millis(40)).await;
        assert!(cache.get(&path).is_some());
        sleep(Duration::from_millis(40)).await;
        assert!(cache.get(&path).is_some());

        sleep(Duration::from_millis(80)).await;
        assert!(cache.get(&path).is_none());
    }

    #[tokio::test]
    async fn test_del_cancels_expiry() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"a");
        let cache = MemFileCache::new();
        cache
            .set_sync(&path, text().expire_interval(Duration::from_millis(30)))
            .unwrap();
        let mut rx = cache.subscribe();

        cache.del(&path, false);
        sleep(Duration::from_millis(80)).await;
        assert!(of_kind(&drain(&mut rx), EventKind::Expire).is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_intervals_do_not_arm() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"a");
        let cache = MemFileCache::new();
        cache.set_sync(&path, text()).unwrap();
        let mut rx = cache.subscribe();

        let entry = cache
            .set_sync(
                &path,
                text()
                    .on_change(true)
                    .change_interval(Duration::MAX)
                    .update_interval(Duration::MAX)
                    .expire_interval(Duration::MAX),
            )
            .unwrap();
        assert_eq!(entry.policies.len(), 3);
        assert!(cache.contains(&path));

        // Far off but representable deadlines still arm
        let far = Duration::from_secs(100 * 365 * 24 * 60 * 60);
        cache
            .set_sync(&path, text().expire_interval(far))
            .unwrap();

        sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get(&path).unwrap().content.as_text(), Some("a"));
        assert_eq!(of_kind(&drain(&mut rx), EventKind::Accessed).len(), 1);
        cache.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_all_policies_on_one_entry() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"one");
        let cache = MemFileCache::new();
        let mut rx = cache.subscribe();

        let entry = cache
            .set(
                &path,
                text()
                    .on_change(true)
                    .change_interval(Duration::from_millis(20))
                    .update_interval(Duration::from_millis(20))
                    .expire_interval(Duration::from_millis(150)),
            )
            .await
            .unwrap();
        assert_eq!(entry.policies.len(), 3);

        sleep(Duration::from_millis(40)).await;
        replace_file(&path, b"second");
        sleep(Duration::from_millis(180)).await;

        let events = drain(&mut rx);
        let ok_updates: Vec<_> = of_kind(&events, EventKind::Update)
            .into_iter()
            .filter(|e| !e.is_error())
            .collect();
        assert!(!ok_updates.is_empty());
        assert!(ok_updates.iter().any(|e| e.size() == Some(6)));

        let expired = of_kind(&events, EventKind::Expire);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].path(), Some(path.as_path()));
        assert!(of_kind(&events, EventKind::Delete).is_empty());
        assert_eq!(events.last().map(|e| e.kind), Some(EventKind::Expire));

        assert!(cache.get(&path).is_none());
        drain(&mut rx);
        sleep(Duration::from_millis(60)).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_update_refreshes_content() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"one");
        let cache = MemFileCache::new();
        let mut rx = cache.subscribe();

        cache
            .set(&path, text().update_interval(Duration::from_millis(10)))
            .await
            .unwrap();

        sleep(Duration::from_millis(20)).await;
        replace_file(&path, b"two!");
        sleep(Duration::from_millis(30)).await;
        replace_file(&path, b"three");
        sleep(Duration::from_millis(100)).await;

        let updates = of_kind(&drain(&mut rx), EventKind::Update);
        let ok: Vec<_> = updates.iter().filter(|e| !e.is_error()).collect();
        assert!(ok.len() >= 2);
        for pair in ok.windows(2) {
            assert!(pair[1].time() > pair[0].time());
        }

        let entry = cache.get(&path).unwrap();
        assert_eq!(entry.content.as_text(), Some("three"));
        assert_eq!(entry.size, 5);
        assert_eq!(ok.last().unwrap().size(), Some(5));
        assert!(entry.modified_at > entry.created_at);
    }

    #[tokio::test]
    async fn test_update_failure_keeps_last_good_copy() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"keep me");
        let cache = MemFileCache::new();
        cache
            .set_sync(&path, text().update_interval(Duration::from_millis(20)))
            .unwrap();
        let mut rx = cache.subscribe();

        std::fs::remove_file(&path).unwrap();
        sleep(Duration::from_millis(80)).await;

        let updates = of_kind(&drain(&mut rx), EventKind::Update);
        assert!(!updates.is_empty());
        assert!(updates.iter().all(CacheEvent::is_error));
        assert_eq!(updates[0].path(), Some(path.as_path()));

        let entry = cache.get(&path).unwrap();
        assert_eq!(entry.content.as_text(), Some("keep me"));
    }

    #[tokio::test]
    async fn test_on_change_detects_modification() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"before");
        let cache = MemFileCache::new();
        cache
            .set_sync(
                &path,
                text()
                    .on_change(true)
                    .change_interval(Duration::from_millis(20)),
            )
            .unwrap();
        let mut rx = cache.subscribe();

        sleep(Duration::from_millis(60)).await;
        assert!(of_kind(&drain(&mut rx), EventKind::Update).is_empty());

        replace_file(&path, b"after!");
        sleep(Duration::from_millis(150)).await;

        let updates = of_kind(&drain(&mut rx), EventKind::Update);
        assert!(!updates.is_empty());
        assert!(updates.iter().all(|e| !e.is_error()));

        let entry = cache.get(&path).unwrap();
        assert_eq!(entry.content.as_text(), Some("after!"));
        assert_eq!(entry.size, 6);
    }

    #[tokio::test]
    async fn test_on_change_stat_failure_removes_silently() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"a");
        let cache = MemFileCache::new();
        cache
            .set_sync(
                &path,
                text()
                    .on_change(true)
                    .change_interval(Duration::from_millis(20)),
            )
            .unwrap();
        let mut rx = cache.subscribe();

        std::fs::remove_file(&path).unwrap();
        sleep(Duration::from_millis(80)).await;

        assert!(!cache.contains(&path));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_replace_retires_old_timers() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"a");
        let cache = MemFileCache::new();
        cache
            .set_sync(
                &path,
                text()
                    .update_interval(Duration::from_millis(10))
                    .expire_interval(Duration::from_millis(40)),
            )
            .unwrap();
        let replacement = cache.set_sync(&path, text()).unwrap();
        assert!(replacement.policies.is_empty());
        let mut rx = cache.subscribe();

        sleep(Duration::from_millis(100)).await;
        assert!(drain(&mut rx).is_empty());
        assert!(cache.contains(&path));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_refresh_is_discarded() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"new");
        let cache = MemFileCache::new();
        cache.set_sync(&path, text()).unwrap();
        let stale_generation = 0;
        cache.set_sync(&path, text()).unwrap();
        let mut rx = cache.subscribe();

        cache
            .shared
            .apply_refresh(&path, stale_generation, Ok(b"stale".to_vec()));
        cache.shared.expire(&path, stale_generation);

        assert!(drain(&mut rx).is_empty());
        let entry = cache.get(&path).unwrap();
        assert_eq!(entry.content.as_text(), Some("new"));
    }

    #[tokio::test]
    async fn test_refresh_after_delete_is_noop() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"a");
        let cache = MemFileCache::new();
        cache.set_sync(&path, text()).unwrap();
        cache.del(&path, false);
        let mut rx = cache.subscribe();

        cache.shared.apply_refresh(&path, 0, Ok(b"late".to_vec()));
        cache.shared.apply_refresh(
            &path,
            0,
            Err(io::Error::new(io::ErrorKind::Other, "late failure")),
        );

        assert!(!cache.contains(&path));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_close_retires_everything() {
        let dir = tempdir().unwrap();
        let a = write_file(&dir, "a.txt", b"a");
        let b = write_file(&dir, "b.txt", b"b");
        let c = write_file(&dir, "c.txt", b"c");
        let cache = MemFileCache::new();
        cache
            .set_sync(&a, text().update_interval(Duration::from_millis(10)))
            .unwrap();
        cache
            .set_sync(
                &b,
                text()
                    .on_change(true)
                    .change_interval(Duration::from_millis(10)),
            )
            .unwrap();
        cache
            .set_sync(&c, text().expire_interval(Duration::from_millis(30)))
            .unwrap();
        let mut rx = cache.subscribe();

        cache.close();
        assert!(cache.is_empty());

        replace_file(&b, b"changed");
        sleep(Duration::from_millis(100)).await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Close);

        cache.set_sync(&a, text()).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_setup_changes_defaults_for_new_entries() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"abc");
        let cache = MemFileCache::new();

        let before = cache.set_sync(&path, PartialOptions::new()).unwrap();
        assert!(!before.content.is_text());

        cache.setup(PartialOptions::new().content_type("text/plain"));
        cache.setup(PartialOptions::new().expire_interval(Duration::from_secs(60)));
        assert_eq!(cache.defaults().content_type, "text/plain");

        let after = cache.set_sync(&path, PartialOptions::new()).unwrap();
        assert!(after.content.is_text());
        assert_eq!(
            after.policies,
            vec![Policy::OnExpire {
                ttl: Duration::from_secs(60)
            }]
        );

        let overridden = cache
            .set_sync(
                &path,
                PartialOptions::new()
                    .content_type("application/octet-stream")
                    .expire_interval(Duration::ZERO),
            )
            .unwrap();
        assert!(!overridden.content.is_text());
        assert!(overridden.policies.is_empty());
    }

    #[tokio::test]
    async fn test_on_handler_receives_matching_events() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"a");
        let cache = MemFileCache::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        cache.on(EventKind::Expire, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        cache
            .set(&path, text().expire_interval(Duration::from_millis(20)))
            .await
            .unwrap();
        sleep(Duration::from_millis(80)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stats() {
        let dir = tempdir().unwrap();
        let a = write_file(&dir, "a.bin", b"0123456789");
        let b = write_file(&dir, "b.bin", b"abc");
        let cache = MemFileCache::new();
        cache.set_sync(&a, PartialOptions::new()).unwrap();
        cache.set_sync(&b, PartialOptions::new()).unwrap();

        cache.get(&a);
        cache.get(dir.path().join("missing"));

        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.total_size, 13);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);

        let mut paths = cache.paths();
        paths.sort();
        assert_eq!(paths, vec![a, b]);
    }
}
