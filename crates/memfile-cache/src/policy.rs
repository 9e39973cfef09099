//! Timer-driven entry policies
//!
//! Each armed policy runs as its own task holding a `Weak` handle to the
//! cache state and the generation of the entry it was armed for. A task never
//! mutates a slot whose generation differs, so a timer that outlives its
//! entry (replaced, deleted, expired) cannot touch the replacement.

use crate::accessor::{FileAccessor, FileStat};
use crate::cache::Shared;
use crate::error::CacheError;
use crate::types::Policy;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::task::AbortHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Spawn the timer task for one policy. `created` is the entry's creation
/// instant; intervals and the TTL are measured from it.
///
/// Returns `None` when the first deadline lies beyond what `Instant` can
/// represent; such a policy would never fire, so no task is spawned.
pub(crate) fn arm<A: FileAccessor>(
    shared: &Arc<Shared<A>>,
    path: &Path,
    generation: u64,
    policy: Policy,
    created: Instant,
) -> Option<AbortHandle> {
    let delay = match policy {
        Policy::OnChange { interval } | Policy::OnUpdate { interval } => interval,
        Policy::OnExpire { ttl } => ttl,
    };
    let Some(first) = created.checked_add(delay) else {
        debug!(path = %path.display(), ?policy, "Policy deadline out of range, not arming");
        return None;
    };

    let state = Arc::downgrade(shared);
    let path = path.to_path_buf();

    let task = match policy {
        Policy::OnChange { interval } => shared.runtime.spawn(poll_changes(
            state,
            path,
            generation,
            interval,
            first,
            SystemTime::now(),
        )),
        Policy::OnUpdate { interval } => shared
            .runtime
            .spawn(refresh_periodically(state, path, generation, interval, first)),
        Policy::OnExpire { .. } => shared.runtime.spawn(expire_at(state, path, generation, first)),
    };

    Some(task.abort_handle())
}

/// Tracks the last observed timestamps of a polled file
#[derive(Debug)]
struct ChangeWatch {
    seed: SystemTime,
    last: Option<FileStat>,
}

impl ChangeWatch {
    fn new(seed: SystemTime) -> Self {
        Self { seed, last: None }
    }

    /// Record `stat` and report whether it counts as a change. Until the
    /// first observation only timestamps newer than the seed count.
    fn observe(&mut self, stat: FileStat) -> bool {
        let changed = match self.last {
            None => stat.modified > self.seed || stat.changed > self.seed,
            Some(prev) => prev != stat,
        };
        self.last = Some(stat);
        changed
    }
}

async fn poll_changes<A: FileAccessor>(
    state: Weak<Shared<A>>,
    path: PathBuf,
    generation: u64,
    every: Duration,
    first: Instant,
    seed: SystemTime,
) {
    let mut ticker = interval_at(first, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut watch = ChangeWatch::new(seed);

    loop {
        ticker.tick().await;
        let Some(shared) = state.upgrade() else {
            return;
        };

        match shared.accessor.stat(&path).await {
            Ok(stat) => {
                if watch.observe(stat) {
                    debug!(path = %path.display(), "Change detected");
                    refresh(&shared, &path, generation).await;
                }
            }
            Err(e) => {
                if shared.drop_vanished(&path, generation) {
                    let err = CacheError::stat(&path, e);
                    info!(path = %path.display(), error = %err, "Entry removed");
                }
                return;
            }
        }

        if !shared.is_current(&path, generation) {
            return;
        }
    }
}

async fn refresh_periodically<A: FileAccessor>(
    state: Weak<Shared<A>>,
    path: PathBuf,
    generation: u64,
    every: Duration,
    first: Instant,
) {
    let mut ticker = interval_at(first, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(shared) = state.upgrade() else {
            return;
        };
        if !shared.is_current(&path, generation) {
            return;
        }
        refresh(&shared, &path, generation).await;
    }
}

async fn expire_at<A: FileAccessor>(
    state: Weak<Shared<A>>,
    path: PathBuf,
    generation: u64,
    deadline: Instant,
) {
    sleep_until(deadline).await;
    if let Some(shared) = state.upgrade() {
        shared.expire(&path, generation);
    }
}

/// Re-read the file and apply the result to the entry if it is still the
/// same generation
pub(crate) async fn refresh<A: FileAccessor>(shared: &Shared<A>, path: &Path, generation: u64) {
    let result = shared.accessor.read(path).await;
    shared.apply_refresh(path, generation, result);
}
