// ─── Keyed locks ───
// One async mutex per key (catalog id, asset identity). A key's mutex is
// dropped from the map once the last holder releases it with nobody waiting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Exclusive hold on one key; released on drop.
pub struct KeyedGuard<'a> {
    owner: &'a KeyedLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyedGuard<'_> {
        let slot = self
            .slots()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let guard = slot.lock_owned().await;
        KeyedGuard {
            owner: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = self.owner.slots();
        // only the map's own reference left: nobody holds or waits
        if slots
            .get(&self.key)
            .map(|slot| Arc::strong_count(slot) == 1)
            .unwrap_or(false)
        {
            slots.remove(&self.key);
        }
    }
}
