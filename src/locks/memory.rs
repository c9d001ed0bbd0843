use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{LockEntry, LockKey, LockStore, LockStoreError, LockToken};
use crate::model::Ms;

/// Process-local lock store. Each key's shard lock makes the entry API
/// a single atomic step.
#[derive(Default)]
pub struct MemoryLockStore {
    entries: DashMap<LockKey, LockEntry>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn set_if_absent(&self, key: &LockKey, entry: LockEntry, now: Ms) -> Result<bool, LockStoreError> {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut held) => {
                if held.get().is_live(now) {
                    return Ok(false);
                }
                held.insert(entry);
                Ok(true)
            }
            Entry::Vacant(free) => {
                free.insert(entry);
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &LockKey, now: Ms) -> Result<Option<LockEntry>, LockStoreError> {
        Ok(self
            .entries
            .get(key)
            .map(|e| *e.value())
            .filter(|e| e.is_live(now)))
    }

    async fn compare_and_delete(&self, key: &LockKey, token: LockToken) -> Result<bool, LockStoreError> {
        Ok(self.entries.remove_if(key, |_, e| e.token == token).is_some())
    }

    async fn purge_expired(&self, now: Ms) -> Result<usize, LockStoreError> {
        let mut purged = 0;
        self.entries.retain(|_, e| {
            let live = e.is_live(now);
            if !live {
                purged += 1;
            }
            live
        });
        Ok(purged)
    }
}
