//! Path-keyed entry storage

use crate::types::CacheEntry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::task::AbortHandle;

/// A stored entry together with its armed timers.
///
/// `generation` is unique per created entry; timer tasks and in-flight reads
/// carry the generation they were started for and only touch a slot that
/// still has it.
#[derive(Debug)]
pub(crate) struct Slot {
    pub entry: CacheEntry,
    pub generation: u64,
    pub timers: Vec<AbortHandle>,
}

impl Slot {
    /// Cancel every armed timer. Aborting a finished task is a no-op.
    pub fn retire(self) -> CacheEntry {
        for timer in &self.timers {
            timer.abort();
        }
        self.entry
    }
}

#[derive(Debug, Default)]
pub(crate) struct EntryStore {
    slots: HashMap<PathBuf, Slot>,
}

impl EntryStore {
    /// Insert a slot, retiring whatever was stored under the same path
    pub fn replace(&mut self, slot: Slot) -> Option<CacheEntry> {
        let path = slot.entry.path.clone();
        self.slots.insert(path, slot).map(Slot::retire)
    }

    pub fn remove(&mut self, path: &Path) -> Option<CacheEntry> {
        self.slots.remove(path).map(Slot::retire)
    }

    /// Remove the slot only if it still belongs to `generation`
    pub fn remove_current(&mut self, path: &Path, generation: u64) -> Option<CacheEntry> {
        if self.is_current(path, generation) {
            self.remove(path)
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, path: &Path) -> Option<&mut Slot> {
        self.slots.get_mut(path)
    }

    pub fn current_mut(&mut self, path: &Path, generation: u64) -> Option<&mut Slot> {
        self.slots
            .get_mut(path)
            .filter(|slot| slot.generation == generation)
    }

    pub fn is_current(&self, path: &Path, generation: u64) -> bool {
        self.slots
            .get(path)
            .is_some_and(|slot| slot.generation == generation)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.slots.contains_key(path)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.slots.values().map(|slot| &slot.entry)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Retire every slot, returning how many there were
    pub fn clear(&mut self) -> usize {
        let count = self.slots.len();
        for (_, slot) in self.slots.drain() {
            slot.retire();
        }
        count
    }
}
